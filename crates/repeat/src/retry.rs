//! Retry policies and the retry template.
//!
//! A retry session re-runs the same logical unit of work while the policy
//! allows it, pausing between attempts according to a [`BackoffPolicy`].
//! Fatal and interruption failures end the session immediately.

use std::fmt;
use std::sync::Arc;

use forgebatch_core::{BatchError, BatchResult, CancellationToken};
use tracing::{debug, warn};

use crate::backoff::{BackoffPolicy, NoBackoffPolicy};
use crate::classifier::{BinaryFailureClassifier, Classification, FailureClassifier};
use crate::context::{IterationContext, SharedCounter};

const ATTEMPTS_KEY: &str = "retry.attempts";

/// State of one retry session.
#[derive(Debug)]
pub struct RetryContext {
    iteration: Arc<IterationContext>,
    attempts: SharedCounter,
    last_error: Option<BatchError>,
    token: CancellationToken,
}

impl RetryContext {
    /// Open a session scope under `parent`.
    ///
    /// With `share_with_parent` the failed-attempt counter lives on the parent
    /// scope, so nested sessions draw from one budget.
    pub fn open(
        parent: Option<&Arc<IterationContext>>,
        token: CancellationToken,
        share_with_parent: bool,
    ) -> Self {
        let iteration = IterationContext::start(parent);
        let attempts = iteration.counter(ATTEMPTS_KEY, share_with_parent);
        Self {
            iteration,
            attempts,
            last_error: None,
            token,
        }
    }

    pub fn iteration(&self) -> &Arc<IterationContext> {
        &self.iteration
    }

    /// Failed attempts so far.
    pub fn attempt_count(&self) -> u64 {
        self.attempts.get()
    }

    pub fn last_error(&self) -> Option<&BatchError> {
        self.last_error.as_ref()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn record_failure(&mut self, error: BatchError) {
        self.attempts.increment();
        self.last_error = Some(error);
    }

    fn close(&self) -> BatchResult<()> {
        self.iteration.close()
    }
}

pub trait RetryPolicy: Send + Sync {
    fn open(&self, parent: Option<&Arc<IterationContext>>, token: CancellationToken)
    -> RetryContext;

    /// May the unit of work be (re)attempted?
    fn can_retry(&self, context: &RetryContext) -> bool;

    fn register_failure(&self, context: &mut RetryContext, error: BatchError) {
        context.record_failure(error);
    }
}

/// Retries classified-retryable failures up to `max_attempts` attempts in
/// total.
#[derive(Clone)]
pub struct SimpleRetryPolicy {
    max_attempts: u64,
    classifier: Arc<dyn FailureClassifier>,
    share_with_parent: bool,
}

impl fmt::Debug for SimpleRetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleRetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("share_with_parent", &self.share_with_parent)
            .finish_non_exhaustive()
    }
}

impl Default for SimpleRetryPolicy {
    fn default() -> Self {
        Self::new(3, BinaryFailureClassifier::default())
    }
}

impl SimpleRetryPolicy {
    pub fn new<C: FailureClassifier + 'static>(max_attempts: u64, classifier: C) -> Self {
        Self {
            max_attempts,
            classifier: Arc::new(classifier),
            share_with_parent: false,
        }
    }

    pub fn with_share_with_parent(mut self, share: bool) -> Self {
        self.share_with_parent = share;
        self
    }

    pub fn max_attempts(&self) -> u64 {
        self.max_attempts
    }
}

impl RetryPolicy for SimpleRetryPolicy {
    fn open(
        &self,
        parent: Option<&Arc<IterationContext>>,
        token: CancellationToken,
    ) -> RetryContext {
        RetryContext::open(parent, token, self.share_with_parent)
    }

    fn can_retry(&self, context: &RetryContext) -> bool {
        let retryable = match context.last_error() {
            Some(error) => self.classifier.classify(error) == Classification::Retryable,
            None => true,
        };
        retryable && context.attempt_count() < self.max_attempts
    }
}

/// Allows the first attempt only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetryPolicy;

impl RetryPolicy for NeverRetryPolicy {
    fn open(
        &self,
        parent: Option<&Arc<IterationContext>>,
        token: CancellationToken,
    ) -> RetryContext {
        RetryContext::open(parent, token, false)
    }

    fn can_retry(&self, context: &RetryContext) -> bool {
        context.last_error().is_none()
    }
}

enum Outcome<T> {
    Success(T),
    Exhausted(BatchError),
    Aborted(BatchError),
}

/// Runs a unit of work under a retry policy and a backoff policy.
#[derive(Clone)]
pub struct RetryTemplate {
    policy: Arc<dyn RetryPolicy>,
    backoff: Arc<dyn BackoffPolicy>,
}

impl fmt::Debug for RetryTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryTemplate").finish_non_exhaustive()
    }
}

impl Default for RetryTemplate {
    fn default() -> Self {
        Self::new(SimpleRetryPolicy::default(), NoBackoffPolicy)
    }
}

impl RetryTemplate {
    pub fn new<P, B>(policy: P, backoff: B) -> Self
    where
        P: RetryPolicy + 'static,
        B: BackoffPolicy + 'static,
    {
        Self {
            policy: Arc::new(policy),
            backoff: Arc::new(backoff),
        }
    }

    pub fn with_retry_policy<P: RetryPolicy + 'static>(mut self, policy: P) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_backoff_policy<B: BackoffPolicy + 'static>(mut self, backoff: B) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Run `callback` until it succeeds or the policy gives up; the last
    /// failure is returned when retries are exhausted.
    pub fn execute<T, F>(
        &self,
        parent: Option<&Arc<IterationContext>>,
        token: &CancellationToken,
        callback: F,
    ) -> BatchResult<T>
    where
        F: FnMut(&RetryContext) -> BatchResult<T>,
    {
        self.execute_with_recovery(parent, token, callback, |context| {
            Err(context
                .last_error()
                .cloned()
                .unwrap_or_else(exhausted_before_first_attempt))
        })
    }

    /// Like [`execute`](Self::execute), but hands exhausted sessions to
    /// `recover`. Fatal and interruption failures are never recovered.
    pub fn execute_with_recovery<T, F, R>(
        &self,
        parent: Option<&Arc<IterationContext>>,
        token: &CancellationToken,
        mut callback: F,
        recover: R,
    ) -> BatchResult<T>
    where
        F: FnMut(&RetryContext) -> BatchResult<T>,
        R: FnOnce(&RetryContext) -> BatchResult<T>,
    {
        let mut context = self.policy.open(parent, token.clone());
        let result = match self.run(&mut context, &mut callback) {
            Outcome::Success(value) => Ok(value),
            Outcome::Aborted(error) => Err(error),
            Outcome::Exhausted(error) => {
                warn!(
                    attempts = context.attempt_count(),
                    error = %error,
                    "retries exhausted"
                );
                recover(&context)
            }
        };

        match (result, context.close()) {
            (result, Ok(())) => result,
            (Ok(_), Err(cleanup)) => Err(cleanup),
            (Err(error), Err(cleanup)) => Err(error.prefer(cleanup)),
        }
    }

    fn run<T, F>(&self, context: &mut RetryContext, callback: &mut F) -> Outcome<T>
    where
        F: FnMut(&RetryContext) -> BatchResult<T>,
    {
        let mut backoff = self.backoff.start(&*context);
        loop {
            if !self.policy.can_retry(context) {
                return Outcome::Exhausted(
                    context
                        .last_error()
                        .cloned()
                        .unwrap_or_else(exhausted_before_first_attempt),
                );
            }

            let error = match callback(&*context) {
                Ok(value) => return Outcome::Success(value),
                Err(error) => error,
            };

            let abort = error.is_fatal() || error.is_interruption();
            self.policy.register_failure(context, error.clone());
            if abort {
                return Outcome::Aborted(error);
            }
            if !self.policy.can_retry(context) {
                return Outcome::Exhausted(error);
            }

            debug!(
                attempt = context.attempt_count(),
                error = %error,
                "attempt failed; backing off before retry"
            );
            if let Err(interrupted) = self.backoff.back_off(&mut backoff) {
                return Outcome::Aborted(interrupted);
            }
        }
    }
}

fn exhausted_before_first_attempt() -> BatchError {
    BatchError::item("retry_exhausted", "no attempts left in the shared retry budget")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::{FixedBackoffPolicy, RecordingSleeper};
    use std::time::Duration;

    fn transient() -> BatchError {
        BatchError::item("deadlock", "row locked")
    }

    fn retrying_template(max_attempts: u64) -> RetryTemplate {
        RetryTemplate::new(
            SimpleRetryPolicy::new(max_attempts, BinaryFailureClassifier::retrying(["deadlock"])),
            NoBackoffPolicy,
        )
    }

    #[test]
    fn retries_until_success() {
        let template = retrying_template(3);
        let token = CancellationToken::new();
        let mut calls = 0;

        let result = template.execute(None, &token, |ctx| {
            calls += 1;
            if ctx.attempt_count() < 2 {
                Err(transient())
            } else {
                Ok("done")
            }
        });

        assert_eq!(result, Ok("done"));
        assert_eq!(calls, 3);
    }

    #[test]
    fn exhausted_retries_return_last_failure() {
        let template = retrying_template(3);
        let token = CancellationToken::new();
        let mut calls = 0;

        let result: BatchResult<()> = template.execute(None, &token, |_| {
            calls += 1;
            Err(BatchError::item("deadlock", format!("attempt {calls}")))
        });

        assert_eq!(result, Err(BatchError::item("deadlock", "attempt 3")));
        assert_eq!(calls, 3);
    }

    #[test]
    fn unclassified_failure_is_not_retried() {
        let template = retrying_template(5);
        let token = CancellationToken::new();
        let mut calls = 0;

        let result: BatchResult<()> = template.execute(None, &token, |_| {
            calls += 1;
            Err(BatchError::item("parse", "bad row"))
        });

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn interruption_is_never_retried() {
        let template = RetryTemplate::new(
            SimpleRetryPolicy::new(5, |_: &BatchError| Classification::Retryable),
            NoBackoffPolicy,
        );
        let token = CancellationToken::new();
        let mut calls = 0;

        let result: BatchResult<()> = template.execute(None, &token, |_| {
            calls += 1;
            Err(BatchError::interrupted("stop"))
        });

        assert_eq!(result, Err(BatchError::interrupted("stop")));
        assert_eq!(calls, 1);
    }

    #[test]
    fn backs_off_between_attempts() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let template = retrying_template(3).with_backoff_policy(
            FixedBackoffPolicy::new(Duration::from_millis(50)).with_sleeper(sleeper.clone()),
        );
        let token = CancellationToken::new();

        let _: BatchResult<()> = template.execute(None, &token, |_| Err(transient()));

        // Three attempts, two pauses.
        assert_eq!(sleeper.pauses().len(), 2);
    }

    #[test]
    fn cancellation_during_backoff_surfaces_backoff_interrupted() {
        let template = retrying_template(3)
            .with_backoff_policy(FixedBackoffPolicy::new(Duration::from_secs(60)));
        let token = CancellationToken::new();
        let canceller = token.clone();

        let result: BatchResult<()> = template.execute(None, &token, |_| {
            canceller.cancel("shutdown");
            Err(transient())
        });

        assert_eq!(result, Err(BatchError::backoff_interrupted("shutdown")));
    }

    #[test]
    fn recovery_runs_when_exhausted() {
        let template = retrying_template(2);
        let token = CancellationToken::new();

        let result = template.execute_with_recovery(
            None,
            &token,
            |_| Err::<u32, _>(transient()),
            |ctx| {
                assert_eq!(ctx.attempt_count(), 2);
                Ok(0)
            },
        );

        assert_eq!(result, Ok(0));
    }

    #[test]
    fn recovery_is_skipped_for_fatal_failures() {
        let template = retrying_template(2);
        let token = CancellationToken::new();
        let fatal = BatchError::fatal(BatchError::repository("down"));
        let expected = fatal.clone();

        let result =
            template.execute_with_recovery(None, &token, |_| Err::<u32, _>(fatal.clone()), |_| Ok(0));

        assert_eq!(result, Err(expected));
    }

    #[test]
    fn shared_budget_spans_sessions() {
        let template = RetryTemplate::new(
            SimpleRetryPolicy::new(3, BinaryFailureClassifier::retrying(["deadlock"]))
                .with_share_with_parent(true),
            NoBackoffPolicy,
        );
        let parent = IterationContext::root();
        let token = CancellationToken::new();
        let mut calls = 0;

        let _: BatchResult<()> = template.execute(Some(&parent), &token, |ctx| {
            calls += 1;
            if ctx.attempt_count() < 2 {
                Err(transient())
            } else {
                Ok(())
            }
        });
        let second: BatchResult<()> = template.execute(Some(&parent), &token, |_| {
            calls += 1;
            Err(transient())
        });

        assert_eq!(calls, 4);
        assert_eq!(second, Err(transient()));
    }

    #[test]
    fn never_retry_policy_attempts_once() {
        let template = RetryTemplate::new(NeverRetryPolicy, NoBackoffPolicy);
        let token = CancellationToken::new();
        let mut calls = 0;

        let _: BatchResult<()> = template.execute(None, &token, |_| {
            calls += 1;
            Err(transient())
        });

        assert_eq!(calls, 1);
    }
}
