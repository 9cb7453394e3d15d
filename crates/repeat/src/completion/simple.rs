use std::sync::Arc;

use super::CompletionPolicy;
use crate::context::{IterationContext, SharedCounter};

/// Chunk size used when none is configured.
pub const DEFAULT_CHUNK_SIZE: usize = 5;

const COUNT_KEY: &str = "completion.simple.count";

/// Completes after a fixed number of iterations, or as soon as a unit of work
/// reports that no more input is available.
#[derive(Debug, Clone, Copy)]
pub struct SimpleCompletionPolicy {
    chunk_size: usize,
}

impl Default for SimpleCompletionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl SimpleCompletionPolicy {
    /// A chunk size of zero is raised to one.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn count(&self, context: &IterationContext) -> u64 {
        context
            .attribute::<SharedCounter>(COUNT_KEY)
            .map(|c| c.get())
            .unwrap_or(0)
    }
}

impl CompletionPolicy for SimpleCompletionPolicy {
    fn start(&self, parent: Option<&Arc<IterationContext>>) -> Arc<IterationContext> {
        let context = IterationContext::start(parent);
        context.set_attribute(COUNT_KEY, SharedCounter::new());
        context
    }

    fn is_complete(&self, context: &IterationContext) -> bool {
        self.count(context) >= self.chunk_size as u64
    }

    fn update(&self, context: &IterationContext) {
        context.counter(COUNT_KEY, false).increment();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgebatch_core::RepeatStatus;

    #[test]
    fn completes_after_chunk_size_updates() {
        let policy = SimpleCompletionPolicy::new(2);
        let ctx = policy.start(None);

        assert!(!policy.is_complete(&ctx));
        policy.update(&ctx);
        assert!(!policy.is_complete(&ctx));
        policy.update(&ctx);
        assert!(policy.is_complete(&ctx));
    }

    #[test]
    fn finished_result_completes_immediately() {
        let policy = SimpleCompletionPolicy::new(10);
        let ctx = policy.start(None);
        assert!(policy.is_complete_with(&ctx, RepeatStatus::Finished));
        assert!(!policy.is_complete_with(&ctx, RepeatStatus::Continuable));
    }

    #[test]
    fn each_start_counts_from_zero() {
        let policy = SimpleCompletionPolicy::new(1);
        let parent = IterationContext::root();

        let first = policy.start(Some(&parent));
        policy.update(&first);
        assert!(policy.is_complete(&first));

        let second = policy.start(Some(&parent));
        assert!(!policy.is_complete(&second));
    }

    #[test]
    fn zero_chunk_size_is_raised_to_one() {
        let policy = SimpleCompletionPolicy::new(0);
        assert_eq!(policy.chunk_size(), 1);

        let ctx = policy.start(None);
        assert!(!policy.is_complete(&ctx));
        policy.update(&ctx);
        assert!(policy.is_complete(&ctx));
    }

    #[test]
    fn default_chunk_size() {
        assert_eq!(SimpleCompletionPolicy::default().chunk_size(), DEFAULT_CHUNK_SIZE);
    }
}
