//! Exception handlers: what the repeat template does with a failed iteration.

use std::collections::HashSet;

use forgebatch_core::{BatchError, BatchResult};
use tracing::warn;

use crate::context::IterationContext;

const TOLERATED_KEY: &str = "exception.tolerated.count";

/// Either absorbs a failure (`Ok`) or rethrows it.
pub trait ExceptionHandler: Send + Sync {
    fn handle_exception(&self, context: &IterationContext, error: BatchError) -> BatchResult<()>;
}

/// Rethrows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct RethrowExceptionHandler;

impl ExceptionHandler for RethrowExceptionHandler {
    fn handle_exception(&self, _context: &IterationContext, error: BatchError) -> BatchResult<()> {
        Err(error)
    }
}

/// Tolerates up to `limit` failures of the listed kinds (any kind when none
/// are listed), then rethrows.
///
/// The tally is kept on the parent scope by default so it spans every loop
/// started under the same parent. Fatal and interruption failures are always
/// rethrown.
#[derive(Debug, Clone)]
pub struct LimitExceptionHandler {
    limit: u64,
    kinds: HashSet<String>,
    use_parent: bool,
}

impl Default for LimitExceptionHandler {
    fn default() -> Self {
        Self::new(0)
    }
}

impl LimitExceptionHandler {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            kinds: HashSet::new(),
            use_parent: true,
        }
    }

    pub fn tolerating(mut self, kind: impl Into<String>) -> Self {
        self.kinds.insert(kind.into());
        self
    }

    pub fn with_use_parent(mut self, use_parent: bool) -> Self {
        self.use_parent = use_parent;
        self
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn is_tolerable(&self, error: &BatchError) -> bool {
        if error.is_fatal() || error.is_interruption() {
            return false;
        }
        self.kinds.is_empty() || self.kinds.contains(error.kind())
    }
}

impl ExceptionHandler for LimitExceptionHandler {
    fn handle_exception(&self, context: &IterationContext, error: BatchError) -> BatchResult<()> {
        if !self.is_tolerable(&error) {
            return Err(error);
        }
        let count = context.counter(TOLERATED_KEY, self.use_parent).increment();
        if count > self.limit {
            return Err(error);
        }
        warn!(
            tolerated = count,
            limit = self.limit,
            error = %error,
            "tolerating iteration failure"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bad_row() -> BatchError {
        BatchError::item("parse", "bad row")
    }

    #[test]
    fn rethrow_handler_rethrows() {
        let ctx = IterationContext::root();
        assert_eq!(
            RethrowExceptionHandler.handle_exception(&ctx, bad_row()),
            Err(bad_row())
        );
    }

    #[test]
    fn limit_handler_tolerates_up_to_limit() {
        let handler = LimitExceptionHandler::new(2);
        let ctx = IterationContext::root();

        assert!(handler.handle_exception(&ctx, bad_row()).is_ok());
        assert!(handler.handle_exception(&ctx, bad_row()).is_ok());
        assert_eq!(handler.handle_exception(&ctx, bad_row()), Err(bad_row()));
    }

    #[test]
    fn default_limit_tolerates_nothing() {
        let ctx = IterationContext::root();
        assert!(
            LimitExceptionHandler::default()
                .handle_exception(&ctx, bad_row())
                .is_err()
        );
    }

    #[test]
    fn limit_is_shared_through_parent() {
        let handler = LimitExceptionHandler::new(1);
        let parent = IterationContext::root();
        let first = IterationContext::start(Some(&parent));
        let second = IterationContext::start(Some(&parent));

        assert!(handler.handle_exception(&first, bad_row()).is_ok());
        assert!(handler.handle_exception(&second, bad_row()).is_err());
    }

    #[test]
    fn only_listed_kinds_are_tolerated() {
        let handler = LimitExceptionHandler::new(5).tolerating("parse");
        let ctx = IterationContext::root();

        assert!(handler.handle_exception(&ctx, bad_row()).is_ok());
        assert!(
            handler
                .handle_exception(&ctx, BatchError::item("io", "disk full"))
                .is_err()
        );
    }

    #[test]
    fn fatal_and_interruption_are_never_tolerated() {
        let handler = LimitExceptionHandler::new(100);
        let ctx = IterationContext::root();

        assert!(
            handler
                .handle_exception(&ctx, BatchError::interrupted("stop"))
                .is_err()
        );
        assert!(
            handler
                .handle_exception(&ctx, BatchError::fatal(BatchError::repository("down")))
                .is_err()
        );
    }
}
