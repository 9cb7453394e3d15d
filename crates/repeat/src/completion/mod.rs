//! Completion policies: when should an iteration loop stop?
//!
//! A policy is shared configuration; everything that changes during one loop
//! (counts, start instants, member contexts) lives in the [`IterationContext`]
//! returned by [`CompletionPolicy::start`], so one policy can drive any number
//! of concurrent loops.

use std::sync::Arc;

use forgebatch_core::RepeatStatus;

use crate::context::IterationContext;

mod composite;
mod count;
mod default_result;
mod simple;
mod timeout;

pub use composite::CompositeCompletionPolicy;
pub use count::CountingCompletionPolicy;
pub use default_result::DefaultResultCompletionPolicy;
pub use simple::{DEFAULT_CHUNK_SIZE, SimpleCompletionPolicy};
pub use timeout::{DEFAULT_TIMEOUT, TimeoutCompletionPolicy};

/// Decision function for when an iteration should stop.
pub trait CompletionPolicy: Send + Sync {
    /// Open the scope for one loop, nested inside `parent`.
    fn start(&self, parent: Option<&Arc<IterationContext>>) -> Arc<IterationContext>;

    /// Checked before each iteration.
    fn is_complete(&self, context: &IterationContext) -> bool;

    /// Checked after an iteration produced `result`.
    ///
    /// By default a `Finished` result ends the loop, as does anything that
    /// would end it before the next iteration.
    fn is_complete_with(&self, context: &IterationContext, result: RepeatStatus) -> bool {
        !result.is_continuable() || self.is_complete(context)
    }

    /// Record that one more iteration finished.
    fn update(&self, context: &IterationContext);
}

impl<P: CompletionPolicy + ?Sized> CompletionPolicy for Arc<P> {
    fn start(&self, parent: Option<&Arc<IterationContext>>) -> Arc<IterationContext> {
        (**self).start(parent)
    }

    fn is_complete(&self, context: &IterationContext) -> bool {
        (**self).is_complete(context)
    }

    fn is_complete_with(&self, context: &IterationContext, result: RepeatStatus) -> bool {
        (**self).is_complete_with(context, result)
    }

    fn update(&self, context: &IterationContext) {
        (**self).update(context)
    }
}
