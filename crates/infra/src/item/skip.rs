//! Skip decisions for item failures inside a chunk.

use std::collections::HashSet;

use forgebatch_core::{BatchError, BatchResult};

/// Decides whether a failed read, process or write may be skipped.
///
/// `skip_count` is the number of items the step has already skipped, this
/// chunk included. Returning an error fails the chunk with that error.
pub trait SkipPolicy: Send + Sync {
    fn should_skip(&self, error: &BatchError, skip_count: u64) -> BatchResult<bool>;
}

impl<F> SkipPolicy for F
where
    F: Fn(&BatchError, u64) -> BatchResult<bool> + Send + Sync,
{
    fn should_skip(&self, error: &BatchError, skip_count: u64) -> BatchResult<bool> {
        self(error, skip_count)
    }
}

/// Never skips. Every item failure fails the chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSkipItemPolicy;

impl SkipPolicy for NeverSkipItemPolicy {
    fn should_skip(&self, _error: &BatchError, _skip_count: u64) -> BatchResult<bool> {
        Ok(false)
    }
}

/// Skips the listed [`BatchError::kind`]s until `limit` items were skipped.
///
/// A skippable failure past the limit becomes
/// [`BatchError::SkipLimitExceeded`]. Fatal and interruption failures are
/// never skipped.
#[derive(Debug, Clone)]
pub struct LimitCheckingSkipPolicy {
    kinds: HashSet<String>,
    limit: u64,
}

impl LimitCheckingSkipPolicy {
    pub fn new(limit: u64) -> Self {
        Self {
            kinds: HashSet::new(),
            limit,
        }
    }

    pub fn skipping(mut self, kind: impl Into<String>) -> Self {
        self.kinds.insert(kind.into());
        self
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

impl SkipPolicy for LimitCheckingSkipPolicy {
    fn should_skip(&self, error: &BatchError, skip_count: u64) -> BatchResult<bool> {
        if error.is_fatal() || error.is_interruption() || !self.kinds.contains(error.kind()) {
            return Ok(false);
        }
        if skip_count < self.limit {
            Ok(true)
        } else {
            Err(BatchError::skip_limit_exceeded(self.limit, error.clone()))
        }
    }
}
