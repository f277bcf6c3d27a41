//! Retry Classifier
//!
//! Maps a remote failure to one of five error kinds and, given the attempt
//! number, to the policy that should follow: fail, back off (three shapes),
//! or split the chunk.

use std::future::Future;
use std::time::Duration;

use rand::{Rng, thread_rng};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::warn;

use crate::config::RetryPolicyConfig;
use crate::remote::RemoteError;

/// Error taxonomy driving retry policy and throttle feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input or content rejection; retrying cannot help
    Permanent,
    /// Generic failure under load; the caller should slow down
    Throughput,
    /// Service-wide outage; recovers in minutes
    Unavailable,
    /// Concurrent modification of the same resource
    Conflict,
    /// Request payload exceeded a size limit
    Oversized,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Permanent => "permanent",
            ErrorKind::Throughput => "throughput",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Oversized => "oversized",
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    FailNow,
    Backoff(Duration),
    LongBackoff(Duration),
    JitteredBackoff(Duration),
    ShrinkAndRetry,
}

impl RetryDecision {
    /// Time to sleep before the next attempt, if the decision is time-based.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            RetryDecision::Backoff(d)
            | RetryDecision::LongBackoff(d)
            | RetryDecision::JitteredBackoff(d) => Some(*d),
            RetryDecision::FailNow | RetryDecision::ShrinkAndRetry => None,
        }
    }
}

const CONFLICT_CODES: &[&str] = &["CONCURRENT_MODIFICATION", "DATABASE_ERROR_CONCURRENT"];
const OVERSIZED_CODES: &[&str] = &[
    "REQUEST_TOO_LARGE",
    "TOO_MANY_MUTATE_OPERATIONS",
    "REQUEST_SIZE_LIMIT_EXCEEDED",
];
const UNAVAILABLE_CODES: &[&str] = &["UNAVAILABLE", "SERVICE_UNAVAILABLE"];
const THROUGHPUT_CODES: &[&str] = &[
    "RESOURCE_EXHAUSTED",
    "RESOURCE_TEMPORARILY_EXHAUSTED",
    "INTERNAL_ERROR",
    "DEADLINE_EXCEEDED",
    "TRANSIENT_ERROR",
];

/// Classifies a failure by its remote code, then by transport status.
///
/// A failure with neither (connection reset, timeout in the transport) is
/// treated as throughput pressure; an unrecognised code is permanent.
pub fn classify(error: &RemoteError) -> ErrorKind {
    if let Some(code) = error.code.as_deref() {
        if CONFLICT_CODES.contains(&code) {
            return ErrorKind::Conflict;
        }
        if OVERSIZED_CODES.contains(&code) {
            return ErrorKind::Oversized;
        }
        if UNAVAILABLE_CODES.contains(&code) {
            return ErrorKind::Unavailable;
        }
        if THROUGHPUT_CODES.contains(&code) {
            return ErrorKind::Throughput;
        }
        return ErrorKind::Permanent;
    }

    match error.status {
        Some(409) => ErrorKind::Conflict,
        Some(413) => ErrorKind::Oversized,
        Some(503) => ErrorKind::Unavailable,
        Some(429) | Some(500) | Some(502) | Some(504) => ErrorKind::Throughput,
        Some(_) => ErrorKind::Permanent,
        None => ErrorKind::Throughput,
    }
}

/// Stateless policy table; cheap to clone into each mutation stream.
#[derive(Debug, Clone)]
pub struct RetryClassifier {
    policy: RetryPolicyConfig,
    shrink_floor: usize,
}

impl RetryClassifier {
    pub fn new(policy: RetryPolicyConfig, shrink_floor: usize) -> Self {
        Self {
            policy,
            shrink_floor,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Decision for failed attempt `attempt` (1-based) of a call covering
    /// `chunk_len` operations. Reads pass `chunk_len = 0`; they cannot shrink.
    pub fn decide(&self, error: &RemoteError, attempt: u32, chunk_len: usize) -> RetryDecision {
        self.decide_with_rng(error, attempt, chunk_len, &mut thread_rng())
    }

    pub fn decide_with_rng<R: Rng + ?Sized>(
        &self,
        error: &RemoteError,
        attempt: u32,
        chunk_len: usize,
        rng: &mut R,
    ) -> RetryDecision {
        let kind = classify(error);

        if kind == ErrorKind::Oversized {
            // Bounded by the floor rather than the attempt budget.
            return if chunk_len > self.shrink_floor {
                RetryDecision::ShrinkAndRetry
            } else {
                RetryDecision::FailNow
            };
        }

        if kind == ErrorKind::Permanent || attempt >= self.policy.max_attempts {
            return RetryDecision::FailNow;
        }

        let exponent = attempt.saturating_sub(1) as i32;
        match kind {
            ErrorKind::Throughput => RetryDecision::Backoff(seconds(
                self.policy.base_delay_seconds * self.policy.backoff_factor.powi(exponent),
            )),
            ErrorKind::Unavailable => RetryDecision::LongBackoff(seconds(
                self.policy.unavailable_base_seconds
                    * self.policy.unavailable_factor.powi(exponent),
            )),
            ErrorKind::Conflict => {
                let nominal =
                    self.policy.conflict_base_seconds * self.policy.conflict_factor.powi(exponent);
                let jitter = self.policy.conflict_jitter;
                let scale = if jitter > 0.0 {
                    rng.gen_range((1.0 - jitter)..=(1.0 + jitter))
                } else {
                    1.0
                };
                RetryDecision::JitteredBackoff(seconds(nominal * scale))
            }
            ErrorKind::Permanent | ErrorKind::Oversized => RetryDecision::FailNow,
        }
    }
}

fn seconds(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

/// Runs a read call under the classifier's policy, sleeping between attempts.
/// Returns the last error verbatim once the policy gives up.
pub async fn retry_read<T, F, Fut>(
    classifier: &RetryClassifier,
    what: &'static str,
    mut call: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => match classifier.decide(&err, attempt, 0).delay() {
                Some(delay) => {
                    warn!(
                        call = what,
                        attempt,
                        kind = classify(&err).as_str(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Remote read failed; retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(err),
            },
        }
    }
}
