use std::fmt;
use std::sync::Arc;

use super::CompletionPolicy;
use crate::context::{IterationContext, SharedCounter};

const COUNTER_KEY: &str = "completion.counting.counter";
const DEFAULT_COUNTER_NAME: &str = "completion.counting.count";

type Increment = Arc<dyn Fn(&IterationContext) -> u64 + Send + Sync>;

/// Completes once a counter reaches `max_count`.
///
/// The counter is resolved when a loop starts:
///
/// - an explicit [`SharedCounter`] handle, if one was supplied, so several
///   loops can accumulate one tally;
/// - otherwise a named counter on the parent scope when `use_parent` is set,
///   so the count survives across sibling loops (e.g. chunk boundaries);
/// - otherwise a counter private to the loop.
///
/// Each `update` adds the result of the increment function (1 by default).
#[derive(Clone)]
pub struct CountingCompletionPolicy {
    max_count: u64,
    use_parent: bool,
    counter_name: String,
    shared: Option<SharedCounter>,
    increment: Increment,
}

impl fmt::Debug for CountingCompletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingCompletionPolicy")
            .field("max_count", &self.max_count)
            .field("use_parent", &self.use_parent)
            .field("counter_name", &self.counter_name)
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

impl CountingCompletionPolicy {
    pub fn new(max_count: u64) -> Self {
        Self {
            max_count,
            use_parent: false,
            counter_name: DEFAULT_COUNTER_NAME.to_string(),
            shared: None,
            increment: Arc::new(|_| 1),
        }
    }

    pub fn with_use_parent(mut self, use_parent: bool) -> Self {
        self.use_parent = use_parent;
        self
    }

    pub fn with_counter_name(mut self, name: impl Into<String>) -> Self {
        self.counter_name = name.into();
        self
    }

    pub fn with_shared_counter(mut self, counter: SharedCounter) -> Self {
        self.shared = Some(counter);
        self
    }

    pub fn with_increment<F>(mut self, increment: F) -> Self
    where
        F: Fn(&IterationContext) -> u64 + Send + Sync + 'static,
    {
        self.increment = Arc::new(increment);
        self
    }

    pub fn max_count(&self) -> u64 {
        self.max_count
    }

    /// Current tally for a loop started by this policy.
    pub fn count(&self, context: &IterationContext) -> u64 {
        context
            .attribute::<SharedCounter>(COUNTER_KEY)
            .map(|c| c.get())
            .unwrap_or(0)
    }
}

impl CompletionPolicy for CountingCompletionPolicy {
    fn start(&self, parent: Option<&Arc<IterationContext>>) -> Arc<IterationContext> {
        let context = IterationContext::start(parent);
        let counter = match &self.shared {
            Some(shared) => shared.clone(),
            None => context.counter(&self.counter_name, self.use_parent),
        };
        context.set_attribute(COUNTER_KEY, counter);
        context
    }

    fn is_complete(&self, context: &IterationContext) -> bool {
        self.count(context) >= self.max_count
    }

    fn update(&self, context: &IterationContext) {
        let delta = (self.increment)(context);
        if let Some(counter) = context.attribute::<SharedCounter>(COUNTER_KEY) {
            counter.add(delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_counter_resets_per_loop() {
        let policy = CountingCompletionPolicy::new(2);
        let parent = IterationContext::root();

        let first = policy.start(Some(&parent));
        policy.update(&first);
        policy.update(&first);
        assert!(policy.is_complete(&first));

        let second = policy.start(Some(&parent));
        assert_eq!(policy.count(&second), 0);
    }

    #[test]
    fn parent_counter_persists_across_loops() {
        let policy = CountingCompletionPolicy::new(3).with_use_parent(true);
        let parent = IterationContext::root();

        let first = policy.start(Some(&parent));
        policy.update(&first);
        policy.update(&first);
        first.close().unwrap();
        assert!(!policy.is_complete(&first));

        let second = policy.start(Some(&parent));
        assert_eq!(policy.count(&second), 2);
        policy.update(&second);
        assert!(policy.is_complete(&second));
    }

    #[test]
    fn explicit_shared_counter_is_used() {
        let shared = SharedCounter::new();
        let policy = CountingCompletionPolicy::new(4).with_shared_counter(shared.clone());

        let a = policy.start(None);
        let b = policy.start(None);
        policy.update(&a);
        policy.update(&b);

        assert_eq!(shared.get(), 2);
        shared.add(2);
        assert!(policy.is_complete(&a));
        assert!(policy.is_complete(&b));
    }

    #[test]
    fn custom_increment() {
        let policy = CountingCompletionPolicy::new(10).with_increment(|_| 5);
        let ctx = policy.start(None);
        policy.update(&ctx);
        assert!(!policy.is_complete(&ctx));
        policy.update(&ctx);
        assert!(policy.is_complete(&ctx));
    }
}
