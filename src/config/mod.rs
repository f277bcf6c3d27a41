//! Configuration loading for the bulk mutation engine.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `LABELOPS_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "LABELOPS_";

/// Application configuration derived from `LABELOPS_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// File listing the account ids the engine may touch, one per line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accounts_file: Option<PathBuf>,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub retry: RetryPolicyConfig,
    #[serde(default)]
    pub mutator: MutatorConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub auto_queue: AutoQueueConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub templates: TemplateLimitsConfig,
}

/// Adaptive throttle applied between mutation chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct GovernorConfig {
    /// Delay before the first chunk, in seconds (default: 1.0)
    ///
    /// Environment variable: `LABELOPS_GOVERNOR_INITIAL_DELAY_SECONDS`
    #[serde(default = "default_governor_initial_delay")]
    pub initial_delay_seconds: f64,

    /// Floor the delay decays towards on success (default: 0.5)
    ///
    /// Environment variable: `LABELOPS_GOVERNOR_MIN_DELAY_SECONDS`
    #[serde(default = "default_governor_min_delay")]
    pub min_delay_seconds: f64,

    /// Ceiling reached under sustained throttling (default: 10.0)
    ///
    /// Environment variable: `LABELOPS_GOVERNOR_MAX_DELAY_SECONDS`
    #[serde(default = "default_governor_max_delay")]
    pub max_delay_seconds: f64,

    /// Multiplier applied on a throughput error (default: 2.0)
    #[serde(default = "default_governor_increase_factor")]
    pub increase_factor: f64,

    /// Multiplier applied after a successful chunk (default: 0.95)
    #[serde(default = "default_governor_decrease_factor")]
    pub decrease_factor: f64,
}

/// Backoff parameters for each retryable error class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RetryPolicyConfig {
    /// Attempts per chunk before its items are failed (default: 5)
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,

    /// Throughput errors: `base * factor^(n-1)` (defaults: 2.0s, 2.0)
    #[serde(default = "default_retry_base_delay")]
    pub base_delay_seconds: f64,
    #[serde(default = "default_retry_backoff_factor")]
    pub backoff_factor: f64,

    /// Service unavailable: `base * factor^(n-1)` (defaults: 60s, 3.0)
    #[serde(default = "default_retry_unavailable_base")]
    pub unavailable_base_seconds: f64,
    #[serde(default = "default_retry_unavailable_factor")]
    pub unavailable_factor: f64,

    /// Concurrent modification: `base * factor^(n-1)` with +/- jitter
    /// (defaults: 5s, 2.0, 0.2)
    #[serde(default = "default_retry_conflict_base")]
    pub conflict_base_seconds: f64,
    #[serde(default = "default_retry_conflict_factor")]
    pub conflict_factor: f64,
    #[serde(default = "default_retry_conflict_jitter")]
    pub conflict_jitter: f64,
}

/// Chunking limits for remote mutate calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct MutatorConfig {
    /// Target operations per chunk (default: 5000)
    #[serde(default = "default_mutator_chunk_size")]
    pub chunk_size: usize,

    /// Hard protocol maximum operations per request (default: 10000)
    #[serde(default = "default_mutator_max_operations")]
    pub max_operations_per_request: usize,

    /// Serialized payload ceiling per request in bytes (default: 4 MiB)
    #[serde(default = "default_mutator_max_request_bytes")]
    pub max_request_bytes: usize,

    /// Smallest chunk an oversized request is halved down to (default: 100)
    #[serde(default = "default_mutator_shrink_floor")]
    pub shrink_floor: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct LedgerConfig {
    /// Item results buffered before one batched write (default: 1000)
    #[serde(default = "default_ledger_write_batch_size")]
    pub write_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct OrchestratorConfig {
    /// Accounts processed in parallel per job (default: 5)
    #[serde(default = "default_orchestrator_account_concurrency")]
    pub account_concurrency: usize,

    /// Delay between starting successive accounts, in milliseconds (default: 500)
    #[serde(default = "default_orchestrator_account_pacing_ms")]
    pub account_pacing_ms: u64,

    /// Ids per bulk read for jobs created without an explicit size (default: 7500)
    #[serde(default = "default_orchestrator_query_chunk_size")]
    pub default_query_chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AutoQueueConfig {
    /// Pause after a job finishes before the next one is dequeued (default: 30)
    #[serde(default = "default_auto_queue_cooldown_seconds")]
    pub cooldown_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DiscoveryConfig {
    /// Maximum items per emitted job; larger results are split (default: 50000)
    #[serde(default = "default_discovery_job_chunk_size")]
    pub job_chunk_size: usize,

    /// Ids per bulk tag/child lookup (default: 5000)
    #[serde(default = "default_discovery_query_batch_size")]
    pub query_batch_size: usize,

    /// Audit-tag and unlink operations per mutator call (default: 5000)
    #[serde(default = "default_discovery_mutation_batch_size")]
    pub mutation_batch_size: usize,
}

/// Static field limits enforced on rendered content before submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TemplateLimitsConfig {
    #[serde(default = "default_template_headline_max_chars")]
    pub headline_max_chars: usize,
    #[serde(default = "default_template_max_headlines")]
    pub max_headlines: usize,
    #[serde(default = "default_template_description_max_chars")]
    pub description_max_chars: usize,
    #[serde(default = "default_template_max_descriptions")]
    pub max_descriptions: usize,
    #[serde(default = "default_template_path_max_chars")]
    pub path_max_chars: usize,
    /// Longest text a COUNTDOWN function can render to
    #[serde(default = "default_template_countdown_worst_case_chars")]
    pub countdown_worst_case_chars: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            accounts_file: None,
            governor: GovernorConfig::default(),
            retry: RetryPolicyConfig::default(),
            mutator: MutatorConfig::default(),
            ledger: LedgerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            auto_queue: AutoQueueConfig::default(),
            discovery: DiscoveryConfig::default(),
            templates: TemplateLimitsConfig::default(),
        }
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            initial_delay_seconds: default_governor_initial_delay(),
            min_delay_seconds: default_governor_min_delay(),
            max_delay_seconds: default_governor_max_delay(),
            increase_factor: default_governor_increase_factor(),
            decrease_factor: default_governor_decrease_factor(),
        }
    }
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_seconds: default_retry_base_delay(),
            backoff_factor: default_retry_backoff_factor(),
            unavailable_base_seconds: default_retry_unavailable_base(),
            unavailable_factor: default_retry_unavailable_factor(),
            conflict_base_seconds: default_retry_conflict_base(),
            conflict_factor: default_retry_conflict_factor(),
            conflict_jitter: default_retry_conflict_jitter(),
        }
    }
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_mutator_chunk_size(),
            max_operations_per_request: default_mutator_max_operations(),
            max_request_bytes: default_mutator_max_request_bytes(),
            shrink_floor: default_mutator_shrink_floor(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            write_batch_size: default_ledger_write_batch_size(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            account_concurrency: default_orchestrator_account_concurrency(),
            account_pacing_ms: default_orchestrator_account_pacing_ms(),
            default_query_chunk_size: default_orchestrator_query_chunk_size(),
        }
    }
}

impl Default for AutoQueueConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_auto_queue_cooldown_seconds(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            job_chunk_size: default_discovery_job_chunk_size(),
            query_batch_size: default_discovery_query_batch_size(),
            mutation_batch_size: default_discovery_mutation_batch_size(),
        }
    }
}

impl Default for TemplateLimitsConfig {
    fn default() -> Self {
        Self {
            headline_max_chars: default_template_headline_max_chars(),
            max_headlines: default_template_max_headlines(),
            description_max_chars: default_template_description_max_chars(),
            max_descriptions: default_template_max_descriptions(),
            path_max_chars: default_template_path_max_chars(),
            countdown_worst_case_chars: default_template_countdown_worst_case_chars(),
        }
    }
}

impl GovernorConfig {
    /// Validate throttle bounds and factors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_delay_seconds < 0.0
            || self.min_delay_seconds > self.max_delay_seconds
            || !(self.min_delay_seconds..=self.max_delay_seconds)
                .contains(&self.initial_delay_seconds)
        {
            return Err(ConfigError::InvalidGovernorBounds {
                min: self.min_delay_seconds,
                initial: self.initial_delay_seconds,
                max: self.max_delay_seconds,
            });
        }

        if self.increase_factor < 1.0 {
            return Err(ConfigError::InvalidGovernorFactor {
                field: "increase factor",
                value: self.increase_factor,
            });
        }

        if !(0.0..=1.0).contains(&self.decrease_factor) || self.decrease_factor == 0.0 {
            return Err(ConfigError::InvalidGovernorFactor {
                field: "decrease factor",
                value: self.decrease_factor,
            });
        }

        Ok(())
    }
}

impl RetryPolicyConfig {
    /// Validate attempt counts and backoff parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 || self.max_attempts > 20 {
            return Err(ConfigError::InvalidRetryAttempts {
                value: self.max_attempts,
            });
        }

        for (field, value) in [
            ("base delay", self.base_delay_seconds),
            ("unavailable base", self.unavailable_base_seconds),
            ("conflict base", self.conflict_base_seconds),
        ] {
            if value < 0.0 {
                return Err(ConfigError::InvalidRetryDelay { field, value });
            }
        }

        for (field, value) in [
            ("backoff factor", self.backoff_factor),
            ("unavailable factor", self.unavailable_factor),
            ("conflict factor", self.conflict_factor),
        ] {
            if value < 1.0 {
                return Err(ConfigError::InvalidRetryDelay { field, value });
            }
        }

        if !(0.0..1.0).contains(&self.conflict_jitter) {
            return Err(ConfigError::InvalidRetryJitter {
                value: self.conflict_jitter,
            });
        }

        Ok(())
    }
}

impl MutatorConfig {
    /// Validate chunk sizing against the protocol maximum.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_operations_per_request == 0 || self.max_operations_per_request > 10_000 {
            return Err(ConfigError::InvalidProtocolMaximum {
                value: self.max_operations_per_request,
            });
        }

        if self.chunk_size == 0 || self.chunk_size > self.max_operations_per_request {
            return Err(ConfigError::InvalidChunkSize {
                value: self.chunk_size,
                max: self.max_operations_per_request,
            });
        }

        if self.shrink_floor == 0 || self.shrink_floor > self.chunk_size {
            return Err(ConfigError::InvalidShrinkFloor {
                floor: self.shrink_floor,
                chunk_size: self.chunk_size,
            });
        }

        if self.max_request_bytes < 1024 {
            return Err(ConfigError::InvalidRequestBytes {
                value: self.max_request_bytes,
            });
        }

        Ok(())
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.account_concurrency == 0 || self.account_concurrency > 50 {
            return Err(ConfigError::InvalidAccountConcurrency {
                value: self.account_concurrency,
            });
        }

        if self.default_query_chunk_size == 0 {
            return Err(ConfigError::InvalidBatchSize {
                field: "default query chunk size",
                value: 0,
            });
        }

        Ok(())
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("discovery job chunk size", self.job_chunk_size),
            ("discovery query batch size", self.query_batch_size),
            ("discovery mutation batch size", self.mutation_batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidBatchSize { field, value });
            }
        }
        Ok(())
    }
}

impl TemplateLimitsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("headline max chars", self.headline_max_chars),
            ("max headlines", self.max_headlines),
            ("description max chars", self.description_max_chars),
            ("max descriptions", self.max_descriptions),
            ("path max chars", self.path_max_chars),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidTemplateLimit { field, value });
            }
        }
        Ok(())
    }
}

impl AppConfig {
    /// Returns a redacted JSON representation (database credentials are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if let Ok(mut parsed) = url::Url::parse(&config.database_url) {
            if parsed.password().is_some() && parsed.set_password(Some("[REDACTED]")).is_ok() {
                config.database_url = parsed.to_string();
            }
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates every configuration section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        self.governor.validate()?;
        self.retry.validate()?;
        self.mutator.validate()?;

        if self.ledger.write_batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize {
                field: "ledger write batch size",
                value: 0,
            });
        }

        self.orchestrator.validate()?;
        self.discovery.validate()?;
        self.templates.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "postgresql://localhost:5432/labelops".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_governor_initial_delay() -> f64 {
    1.0
}

fn default_governor_min_delay() -> f64 {
    0.5
}

fn default_governor_max_delay() -> f64 {
    10.0
}

fn default_governor_increase_factor() -> f64 {
    2.0
}

fn default_governor_decrease_factor() -> f64 {
    0.95
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay() -> f64 {
    2.0
}

fn default_retry_backoff_factor() -> f64 {
    2.0
}

fn default_retry_unavailable_base() -> f64 {
    60.0
}

fn default_retry_unavailable_factor() -> f64 {
    3.0
}

fn default_retry_conflict_base() -> f64 {
    5.0
}

fn default_retry_conflict_factor() -> f64 {
    2.0
}

fn default_retry_conflict_jitter() -> f64 {
    0.2 // +/- 20%
}

fn default_mutator_chunk_size() -> usize {
    5000
}

fn default_mutator_max_operations() -> usize {
    10_000
}

fn default_mutator_max_request_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_mutator_shrink_floor() -> usize {
    100
}

fn default_ledger_write_batch_size() -> usize {
    1000
}

fn default_orchestrator_account_concurrency() -> usize {
    5
}

fn default_orchestrator_account_pacing_ms() -> u64 {
    500
}

fn default_orchestrator_query_chunk_size() -> usize {
    7500
}

fn default_auto_queue_cooldown_seconds() -> u64 {
    30
}

fn default_discovery_job_chunk_size() -> usize {
    50_000
}

fn default_discovery_query_batch_size() -> usize {
    5000
}

fn default_discovery_mutation_batch_size() -> usize {
    5000
}

fn default_template_headline_max_chars() -> usize {
    30
}

fn default_template_max_headlines() -> usize {
    15
}

fn default_template_description_max_chars() -> usize {
    90
}

fn default_template_max_descriptions() -> usize {
    4
}

fn default_template_path_max_chars() -> usize {
    15
}

fn default_template_countdown_worst_case_chars() -> usize {
    10
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error(
        "governor delays must satisfy 0 <= min ({min}) <= initial ({initial}) <= max ({max})"
    )]
    InvalidGovernorBounds { min: f64, initial: f64, max: f64 },
    #[error("governor {field} is out of range: {value}")]
    InvalidGovernorFactor { field: &'static str, value: f64 },
    #[error("retry max attempts must be between 1 and 20, got {value}")]
    InvalidRetryAttempts { value: u32 },
    #[error("retry {field} is out of range: {value}")]
    InvalidRetryDelay { field: &'static str, value: f64 },
    #[error("conflict jitter must be in [0.0, 1.0), got {value}")]
    InvalidRetryJitter { value: f64 },
    #[error("protocol maximum operations per request must be between 1 and 10000, got {value}")]
    InvalidProtocolMaximum { value: usize },
    #[error("mutator chunk size must be between 1 and {max}, got {value}")]
    InvalidChunkSize { value: usize, max: usize },
    #[error("shrink floor ({floor}) must be between 1 and the chunk size ({chunk_size})")]
    InvalidShrinkFloor { floor: usize, chunk_size: usize },
    #[error("request byte ceiling must be at least 1024, got {value}")]
    InvalidRequestBytes { value: usize },
    #[error("account concurrency must be between 1 and 50, got {value}")]
    InvalidAccountConcurrency { value: usize },
    #[error("{field} must be positive, got {value}")]
    InvalidBatchSize { field: &'static str, value: usize },
    #[error("template limit {field} must be positive, got {value}")]
    InvalidTemplateLimit { field: &'static str, value: usize },
}

/// Loads configuration using layered `.env` files and `LABELOPS_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads `.env`, `.env.local`, `.env.{profile}`, `.env.{profile}.local`,
    /// then the process environment, and validates the result.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let log_level = take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format =
            take_string(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url =
            take_string(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = take_parsed(&mut layered, "DB_MAX_CONNECTIONS")
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")
            .unwrap_or_else(default_db_acquire_timeout_ms);
        let accounts_file = take_string(&mut layered, "ACCOUNTS_FILE").map(PathBuf::from);

        let governor = GovernorConfig {
            initial_delay_seconds: take_parsed(&mut layered, "GOVERNOR_INITIAL_DELAY_SECONDS")
                .unwrap_or_else(default_governor_initial_delay),
            min_delay_seconds: take_parsed(&mut layered, "GOVERNOR_MIN_DELAY_SECONDS")
                .unwrap_or_else(default_governor_min_delay),
            max_delay_seconds: take_parsed(&mut layered, "GOVERNOR_MAX_DELAY_SECONDS")
                .unwrap_or_else(default_governor_max_delay),
            increase_factor: take_parsed(&mut layered, "GOVERNOR_INCREASE_FACTOR")
                .unwrap_or_else(default_governor_increase_factor),
            decrease_factor: take_parsed(&mut layered, "GOVERNOR_DECREASE_FACTOR")
                .unwrap_or_else(default_governor_decrease_factor),
        };

        let retry = RetryPolicyConfig {
            max_attempts: take_parsed(&mut layered, "RETRY_MAX_ATTEMPTS")
                .unwrap_or_else(default_retry_max_attempts),
            base_delay_seconds: take_parsed(&mut layered, "RETRY_BASE_DELAY_SECONDS")
                .unwrap_or_else(default_retry_base_delay),
            backoff_factor: take_parsed(&mut layered, "RETRY_BACKOFF_FACTOR")
                .unwrap_or_else(default_retry_backoff_factor),
            unavailable_base_seconds: take_parsed(&mut layered, "RETRY_UNAVAILABLE_BASE_SECONDS")
                .unwrap_or_else(default_retry_unavailable_base),
            unavailable_factor: take_parsed(&mut layered, "RETRY_UNAVAILABLE_FACTOR")
                .unwrap_or_else(default_retry_unavailable_factor),
            conflict_base_seconds: take_parsed(&mut layered, "RETRY_CONFLICT_BASE_SECONDS")
                .unwrap_or_else(default_retry_conflict_base),
            conflict_factor: take_parsed(&mut layered, "RETRY_CONFLICT_FACTOR")
                .unwrap_or_else(default_retry_conflict_factor),
            conflict_jitter: take_parsed(&mut layered, "RETRY_CONFLICT_JITTER")
                .unwrap_or_else(default_retry_conflict_jitter),
        };

        let mutator = MutatorConfig {
            chunk_size: take_parsed(&mut layered, "MUTATOR_CHUNK_SIZE")
                .unwrap_or_else(default_mutator_chunk_size),
            max_operations_per_request: take_parsed(
                &mut layered,
                "MUTATOR_MAX_OPERATIONS_PER_REQUEST",
            )
            .unwrap_or_else(default_mutator_max_operations),
            max_request_bytes: take_parsed(&mut layered, "MUTATOR_MAX_REQUEST_BYTES")
                .unwrap_or_else(default_mutator_max_request_bytes),
            shrink_floor: take_parsed(&mut layered, "MUTATOR_SHRINK_FLOOR")
                .unwrap_or_else(default_mutator_shrink_floor),
        };

        let ledger = LedgerConfig {
            write_batch_size: take_parsed(&mut layered, "LEDGER_WRITE_BATCH_SIZE")
                .unwrap_or_else(default_ledger_write_batch_size),
        };

        let orchestrator = OrchestratorConfig {
            account_concurrency: take_parsed(&mut layered, "ORCHESTRATOR_ACCOUNT_CONCURRENCY")
                .unwrap_or_else(default_orchestrator_account_concurrency),
            account_pacing_ms: take_parsed(&mut layered, "ORCHESTRATOR_ACCOUNT_PACING_MS")
                .unwrap_or_else(default_orchestrator_account_pacing_ms),
            default_query_chunk_size: take_parsed(
                &mut layered,
                "ORCHESTRATOR_DEFAULT_QUERY_CHUNK_SIZE",
            )
            .unwrap_or_else(default_orchestrator_query_chunk_size),
        };

        let auto_queue = AutoQueueConfig {
            cooldown_seconds: take_parsed(&mut layered, "AUTO_QUEUE_COOLDOWN_SECONDS")
                .unwrap_or_else(default_auto_queue_cooldown_seconds),
        };

        let discovery = DiscoveryConfig {
            job_chunk_size: take_parsed(&mut layered, "DISCOVERY_JOB_CHUNK_SIZE")
                .unwrap_or_else(default_discovery_job_chunk_size),
            query_batch_size: take_parsed(&mut layered, "DISCOVERY_QUERY_BATCH_SIZE")
                .unwrap_or_else(default_discovery_query_batch_size),
            mutation_batch_size: take_parsed(&mut layered, "DISCOVERY_MUTATION_BATCH_SIZE")
                .unwrap_or_else(default_discovery_mutation_batch_size),
        };

        let templates = TemplateLimitsConfig {
            headline_max_chars: take_parsed(&mut layered, "TEMPLATE_HEADLINE_MAX_CHARS")
                .unwrap_or_else(default_template_headline_max_chars),
            max_headlines: take_parsed(&mut layered, "TEMPLATE_MAX_HEADLINES")
                .unwrap_or_else(default_template_max_headlines),
            description_max_chars: take_parsed(&mut layered, "TEMPLATE_DESCRIPTION_MAX_CHARS")
                .unwrap_or_else(default_template_description_max_chars),
            max_descriptions: take_parsed(&mut layered, "TEMPLATE_MAX_DESCRIPTIONS")
                .unwrap_or_else(default_template_max_descriptions),
            path_max_chars: take_parsed(&mut layered, "TEMPLATE_PATH_MAX_CHARS")
                .unwrap_or_else(default_template_path_max_chars),
            countdown_worst_case_chars: take_parsed(
                &mut layered,
                "TEMPLATE_COUNTDOWN_WORST_CASE_CHARS",
            )
            .unwrap_or_else(default_template_countdown_worst_case_chars),
        };

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            accounts_file,
            governor,
            retry,
            mutator,
            ledger,
            orchestrator,
            auto_queue,
            discovery,
            templates,
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// Unparseable values fall back to the default rather than failing the load.
fn take_parsed<T: FromStr>(layered: &mut BTreeMap<String, String>, key: &str) -> Option<T> {
    layered.remove(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.governor.initial_delay_seconds, 1.0);
        assert_eq!(config.mutator.max_operations_per_request, 10_000);
        assert_eq!(config.ledger.write_batch_size, 1000);
        assert_eq!(config.auto_queue.cooldown_seconds, 30);
    }

    #[test]
    fn governor_bounds_validation() {
        let inverted = GovernorConfig {
            min_delay_seconds: 5.0,
            max_delay_seconds: 1.0,
            ..GovernorConfig::default()
        };
        assert!(matches!(
            inverted.validate(),
            Err(ConfigError::InvalidGovernorBounds { .. })
        ));

        let start_below_min = GovernorConfig {
            initial_delay_seconds: 0.1,
            ..GovernorConfig::default()
        };
        assert!(start_below_min.validate().is_err());

        let shrinking_increase = GovernorConfig {
            increase_factor: 0.5,
            ..GovernorConfig::default()
        };
        assert!(shrinking_increase.validate().is_err());
    }

    #[test]
    fn mutator_chunk_cannot_exceed_protocol_maximum() {
        let config = MutatorConfig {
            chunk_size: 20_000,
            ..MutatorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidChunkSize { max: 10_000, .. })
        ));

        let floor_above_chunk = MutatorConfig {
            chunk_size: 50,
            shrink_floor: 100,
            ..MutatorConfig::default()
        };
        assert!(floor_above_chunk.validate().is_err());
    }

    #[test]
    fn retry_jitter_must_stay_below_one() {
        let config = RetryPolicyConfig {
            conflict_jitter: 1.0,
            ..RetryPolicyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn redacted_json_hides_database_password() {
        let config = AppConfig {
            database_url: "postgresql://ops:hunter2@db:5432/labelops".to_string(),
            ..AppConfig::default()
        };
        let json = config.redacted_json().unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("REDACTED"));
    }
}
