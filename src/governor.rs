//! Rate Governor
//!
//! Adaptive inter-chunk delay for one mutation stream. Throughput errors
//! multiply the delay up to a ceiling; successful chunks decay it towards a
//! floor. Every other error kind leaves it untouched.

use std::sync::Mutex;
use std::time::Duration;

use metrics::gauge;
use tokio::time::sleep;
use tracing::debug;

use crate::config::GovernorConfig;
use crate::retry::ErrorKind;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GovernorStats {
    pub delay_seconds: f64,
    pub successes: u64,
    pub throughput_errors: u64,
    pub other_errors: u64,
}

/// Injected per stream; never shared as a global.
#[derive(Debug)]
pub struct RateGovernor {
    config: GovernorConfig,
    state: Mutex<GovernorStats>,
}

impl RateGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        let start = config
            .initial_delay_seconds
            .clamp(config.min_delay_seconds, config.max_delay_seconds);
        Self {
            config,
            state: Mutex::new(GovernorStats {
                delay_seconds: start,
                ..GovernorStats::default()
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut GovernorStats) -> T) -> T {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        f(&mut guard)
    }

    pub fn current_delay(&self) -> Duration {
        Duration::from_secs_f64(self.with_state(|s| s.delay_seconds))
    }

    pub fn stats(&self) -> GovernorStats {
        self.with_state(|s| *s)
    }

    /// Sleeps for the current delay.
    pub async fn wait(&self) {
        let delay = self.current_delay();
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }

    pub fn on_success(&self) {
        let delay = self.with_state(|s| {
            s.successes += 1;
            s.delay_seconds =
                (s.delay_seconds * self.config.decrease_factor).max(self.config.min_delay_seconds);
            s.delay_seconds
        });
        gauge!("rate_governor_delay_seconds").set(delay);
    }

    pub fn on_error(&self, kind: ErrorKind) {
        let delay = self.with_state(|s| {
            if kind == ErrorKind::Throughput {
                s.throughput_errors += 1;
                s.delay_seconds = (s.delay_seconds * self.config.increase_factor)
                    .min(self.config.max_delay_seconds);
            } else {
                s.other_errors += 1;
            }
            s.delay_seconds
        });
        debug!(kind = kind.as_str(), delay_seconds = delay, "Rate governor error signal");
        gauge!("rate_governor_delay_seconds").set(delay);
    }
}
