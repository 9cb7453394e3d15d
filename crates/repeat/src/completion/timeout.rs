use std::sync::Arc;
use std::time::{Duration, Instant};

use super::CompletionPolicy;
use crate::context::IterationContext;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const STARTED_AT_KEY: &str = "completion.timeout.started_at";

/// Completes once the wall-clock time since `start` reaches the timeout.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutCompletionPolicy {
    timeout: Duration,
}

impl Default for TimeoutCompletionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl TimeoutCompletionPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl CompletionPolicy for TimeoutCompletionPolicy {
    fn start(&self, parent: Option<&Arc<IterationContext>>) -> Arc<IterationContext> {
        let context = IterationContext::start(parent);
        context.set_attribute(STARTED_AT_KEY, Instant::now());
        context
    }

    fn is_complete(&self, context: &IterationContext) -> bool {
        match context.attribute::<Instant>(STARTED_AT_KEY) {
            Some(started_at) => started_at.elapsed() >= self.timeout,
            // Not started by this policy: nothing to measure against.
            None => false,
        }
    }

    fn update(&self, _context: &IterationContext) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgebatch_core::RepeatStatus;
    use std::thread;

    #[test]
    fn completes_after_timeout_elapses() {
        let policy = TimeoutCompletionPolicy::new(Duration::from_millis(20));
        let ctx = policy.start(None);
        assert!(!policy.is_complete(&ctx));

        thread::sleep(Duration::from_millis(30));
        assert!(policy.is_complete(&ctx));
    }

    #[test]
    fn finished_result_completes_before_timeout() {
        let policy = TimeoutCompletionPolicy::default();
        let ctx = policy.start(None);
        assert!(policy.is_complete_with(&ctx, RepeatStatus::Finished));
        assert!(!policy.is_complete_with(&ctx, RepeatStatus::Continuable));
    }
}
