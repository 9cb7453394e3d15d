//! `forgebatch-repeat`: the iteration machinery.
//!
//! - [`context`]: scoped iteration contexts with attributes, counters and
//!   cleanup actions.
//! - [`completion`]: policies deciding when a loop stops.
//! - [`backoff`], [`classifier`], [`retry`]: retry sessions.
//! - [`interrupt`]: cooperative interruption checks.
//! - [`template`]: the repeat template that ties them together.

pub mod backoff;
pub mod classifier;
pub mod completion;
pub mod context;
pub mod exception;
pub mod interrupt;
pub mod listener;
pub mod retry;
pub mod template;

pub use backoff::{
    BackoffContext, BackoffPolicy, ExponentialBackoffPolicy, FixedBackoffPolicy, NoBackoffPolicy,
    RecordingSleeper, Sleeper, TokenSleeper,
};
pub use classifier::{BinaryFailureClassifier, Classification, FailureClassifier};
pub use completion::{
    CompletionPolicy, CompositeCompletionPolicy, CountingCompletionPolicy,
    DefaultResultCompletionPolicy, SimpleCompletionPolicy, TimeoutCompletionPolicy,
};
pub use context::{IterationContext, SharedCounter};
pub use exception::{ExceptionHandler, LimitExceptionHandler, RethrowExceptionHandler};
pub use interrupt::{InterruptionPolicy, TokenInterruptionPolicy};
pub use listener::RepeatListener;
pub use retry::{NeverRetryPolicy, RetryContext, RetryPolicy, RetryTemplate, SimpleRetryPolicy};
pub use template::RepeatTemplate;
