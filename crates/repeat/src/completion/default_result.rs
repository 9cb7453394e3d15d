use std::sync::Arc;

use forgebatch_core::RepeatStatus;

use super::CompletionPolicy;
use crate::context::IterationContext;

/// Keeps going until a unit of work reports `Finished` or the scope is
/// explicitly marked complete.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResultCompletionPolicy;

impl CompletionPolicy for DefaultResultCompletionPolicy {
    fn start(&self, parent: Option<&Arc<IterationContext>>) -> Arc<IterationContext> {
        IterationContext::start(parent)
    }

    fn is_complete(&self, context: &IterationContext) -> bool {
        context.is_complete_only()
    }

    fn is_complete_with(&self, _context: &IterationContext, result: RepeatStatus) -> bool {
        !result.is_continuable()
    }

    fn update(&self, _context: &IterationContext) {}
}
