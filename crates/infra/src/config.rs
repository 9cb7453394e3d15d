//! Engine configuration.
//!
//! Defaults suit a single-threaded runner. Every field can be overridden from
//! the environment:
//!
//! | variable | field |
//! |---|---|
//! | `FORGEBATCH_COMMIT_INTERVAL` | `commit_interval` |
//! | `FORGEBATCH_THROTTLE_LIMIT` | `throttle_limit` |
//! | `FORGEBATCH_RETRY_MAX_ATTEMPTS` | `retry_max_attempts` |
//! | `FORGEBATCH_BACKOFF_INITIAL_MS` | `backoff_initial_interval` |
//! | `FORGEBATCH_BACKOFF_MAX_MS` | `backoff_max_interval` |
//! | `FORGEBATCH_BACKOFF_MULTIPLIER` | `backoff_multiplier` |
//! | `FORGEBATCH_CHUNK_TIMEOUT_MS` | `chunk_timeout` |
//! | `FORGEBATCH_RETRYABLE_KINDS` | `retryable_kinds` (comma separated) |

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use forgebatch_core::{BatchError, BatchResult};
use forgebatch_repeat::{
    BinaryFailureClassifier, Classification, CompletionPolicy, CompositeCompletionPolicy,
    ExponentialBackoffPolicy, RetryTemplate, SimpleCompletionPolicy, SimpleRetryPolicy,
    TimeoutCompletionPolicy,
};

pub const COMMIT_INTERVAL_VAR: &str = "FORGEBATCH_COMMIT_INTERVAL";
pub const THROTTLE_LIMIT_VAR: &str = "FORGEBATCH_THROTTLE_LIMIT";
pub const RETRY_MAX_ATTEMPTS_VAR: &str = "FORGEBATCH_RETRY_MAX_ATTEMPTS";
pub const BACKOFF_INITIAL_MS_VAR: &str = "FORGEBATCH_BACKOFF_INITIAL_MS";
pub const BACKOFF_MAX_MS_VAR: &str = "FORGEBATCH_BACKOFF_MAX_MS";
pub const BACKOFF_MULTIPLIER_VAR: &str = "FORGEBATCH_BACKOFF_MULTIPLIER";
pub const CHUNK_TIMEOUT_MS_VAR: &str = "FORGEBATCH_CHUNK_TIMEOUT_MS";
pub const RETRYABLE_KINDS_VAR: &str = "FORGEBATCH_RETRYABLE_KINDS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Items per chunk.
    pub commit_interval: usize,
    /// Chunks in flight at once; 1 runs chunks sequentially.
    pub throttle_limit: usize,
    /// Attempts per retried write, first attempt included.
    pub retry_max_attempts: u64,
    pub backoff_initial_interval: Duration,
    pub backoff_max_interval: Duration,
    pub backoff_multiplier: f64,
    /// Closes a chunk early once reading has taken this long.
    pub chunk_timeout: Option<Duration>,
    /// Failure kinds worth retrying. Everything else is fatal to the retry.
    pub retryable_kinds: Vec<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            commit_interval: 5,
            throttle_limit: 1,
            retry_max_attempts: 3,
            backoff_initial_interval: Duration::from_millis(100),
            backoff_max_interval: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            chunk_timeout: None,
            retryable_kinds: Vec::new(),
        }
    }
}

impl BatchConfig {
    pub fn with_commit_interval(mut self, commit_interval: usize) -> Self {
        self.commit_interval = commit_interval;
        self
    }

    pub fn with_throttle_limit(mut self, throttle_limit: usize) -> Self {
        self.throttle_limit = throttle_limit;
        self
    }

    pub fn with_retry_max_attempts(mut self, attempts: u64) -> Self {
        self.retry_max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration, multiplier: f64) -> Self {
        self.backoff_initial_interval = initial;
        self.backoff_max_interval = max;
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = Some(timeout);
        self
    }

    pub fn with_retryable_kind(mut self, kind: impl Into<String>) -> Self {
        self.retryable_kinds.push(kind.into());
        self
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> BatchResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> BatchResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = parse(&lookup, COMMIT_INTERVAL_VAR)? {
            config.commit_interval = v;
        }
        if let Some(v) = parse(&lookup, THROTTLE_LIMIT_VAR)? {
            config.throttle_limit = v;
        }
        if let Some(v) = parse(&lookup, RETRY_MAX_ATTEMPTS_VAR)? {
            config.retry_max_attempts = v;
        }
        if let Some(ms) = parse(&lookup, BACKOFF_INITIAL_MS_VAR)? {
            config.backoff_initial_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, BACKOFF_MAX_MS_VAR)? {
            config.backoff_max_interval = Duration::from_millis(ms);
        }
        if let Some(v) = parse(&lookup, BACKOFF_MULTIPLIER_VAR)? {
            config.backoff_multiplier = v;
        }
        if let Some(ms) = parse(&lookup, CHUNK_TIMEOUT_MS_VAR)? {
            config.chunk_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(kinds) = lookup(RETRYABLE_KINDS_VAR) {
            config.retryable_kinds = kinds
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
        }

        config.validate()?;
        debug!(?config, "batch configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> BatchResult<()> {
        if self.commit_interval == 0 {
            return Err(BatchError::validation("commit_interval must be at least 1"));
        }
        if self.throttle_limit == 0 {
            return Err(BatchError::validation("throttle_limit must be at least 1"));
        }
        if self.retry_max_attempts == 0 {
            return Err(BatchError::validation("retry_max_attempts must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(BatchError::validation(format!(
                "backoff_multiplier must be a finite number >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        if self.backoff_max_interval < self.backoff_initial_interval {
            return Err(BatchError::validation(
                "backoff_max_interval must not be shorter than backoff_initial_interval",
            ));
        }
        if self.chunk_timeout == Some(Duration::ZERO) {
            return Err(BatchError::validation("chunk_timeout must be positive"));
        }
        Ok(())
    }

    /// Chunk size, optionally bounded by the chunk timeout as well.
    pub fn chunk_completion_policy(&self) -> Arc<dyn CompletionPolicy> {
        let size = SimpleCompletionPolicy::new(self.commit_interval);
        match self.chunk_timeout {
            Some(timeout) => Arc::new(
                CompositeCompletionPolicy::new()
                    .with_policy(size)
                    .with_policy(TimeoutCompletionPolicy::new(timeout)),
            ),
            None => Arc::new(size),
        }
    }

    pub fn backoff_policy(&self) -> ExponentialBackoffPolicy {
        ExponentialBackoffPolicy::new()
            .with_initial_interval(self.backoff_initial_interval)
            .with_max_interval(self.backoff_max_interval)
            .with_multiplier(self.backoff_multiplier)
    }

    pub fn retry_template(&self) -> RetryTemplate {
        let classifier = BinaryFailureClassifier::new(Classification::Fatal);
        let classifier = self
            .retryable_kinds
            .iter()
            .fold(classifier, |c, kind| c.retry_on(kind.clone()));
        RetryTemplate::new(
            SimpleRetryPolicy::new(self.retry_max_attempts, classifier),
            self.backoff_policy(),
        )
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> BatchResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| BatchError::validation(format!("{key}={raw:?}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn missing_variables_fall_back_to_defaults() {
        let config = BatchConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, BatchConfig::default());
    }

    #[test]
    fn variables_override_defaults() {
        let config = BatchConfig::from_lookup(lookup(&[
            (COMMIT_INTERVAL_VAR, "50"),
            (THROTTLE_LIMIT_VAR, "4"),
            (BACKOFF_INITIAL_MS_VAR, "250"),
            (BACKOFF_MULTIPLIER_VAR, "1.5"),
            (CHUNK_TIMEOUT_MS_VAR, "2000"),
            (RETRYABLE_KINDS_VAR, "deadlock, timeout,,"),
        ]))
        .unwrap();

        assert_eq!(config.commit_interval, 50);
        assert_eq!(config.throttle_limit, 4);
        assert_eq!(config.backoff_initial_interval, Duration::from_millis(250));
        assert_eq!(config.backoff_multiplier, 1.5);
        assert_eq!(config.chunk_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.retryable_kinds, vec!["deadlock", "timeout"]);
    }

    #[test]
    fn unparsable_value_is_a_validation_error() {
        let result = BatchConfig::from_lookup(lookup(&[(COMMIT_INTERVAL_VAR, "lots")]));
        assert!(matches!(result, Err(BatchError::Validation(msg)) if msg.contains(COMMIT_INTERVAL_VAR)));
    }

    #[test]
    fn zero_commit_interval_is_rejected() {
        let result = BatchConfig::from_lookup(lookup(&[(COMMIT_INTERVAL_VAR, "0")]));
        assert!(matches!(result, Err(BatchError::Validation(_))));
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let config = BatchConfig::default().with_backoff(
            Duration::from_secs(5),
            Duration::from_secs(1),
            2.0,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn chunk_timeout_adds_a_timeout_member() {
        let plain = BatchConfig::default().with_commit_interval(2);
        let policy = plain.chunk_completion_policy();
        let context = policy.start(None);
        policy.update(&context);
        assert!(!policy.is_complete(&context));
        policy.update(&context);
        assert!(policy.is_complete(&context));

        let bounded = plain.with_chunk_timeout(Duration::from_millis(1));
        let policy = bounded.chunk_completion_policy();
        let context = policy.start(None);
        std::thread::sleep(Duration::from_millis(5));
        assert!(policy.is_complete(&context));
    }

    #[test]
    fn serde_round_trip_keeps_defaults_for_missing_fields() {
        let config: BatchConfig = serde_json::from_str(r#"{"commit_interval": 10}"#).unwrap();
        assert_eq!(config.commit_interval, 10);
        assert_eq!(config.throttle_limit, 1);
    }
}
