//! The repeat template: the chunk iteration engine.
//!
//! `RepeatTemplate::iterate` keeps invoking a unit of work until its
//! completion policy says stop. The same loop drives chunks within a step and
//! items within a chunk; only the policy and the unit of work change.
//!
//! Per iteration:
//!
//! 1. stop if the scope (or an enclosing one) is marked complete, or the
//!    policy is complete;
//! 2. invoke the unit of work, through the retry template when configured;
//! 3. hand failures to listeners and the exception handler;
//! 4. update the policy and the started counter;
//! 5. poll the interruption policy, then stop on a finished result.
//!
//! With a throttle limit above one, iterations fan out over scoped worker
//! threads with at most `throttle_limit` in flight. Waiting for a worker polls
//! the interruption policy, and iterations already in flight always finish
//! before `iterate` returns.

use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use forgebatch_core::{BatchError, BatchResult, CancellationToken, RepeatStatus};
use tracing::{debug, warn};

use crate::completion::{CompletionPolicy, DefaultResultCompletionPolicy};
use crate::context::IterationContext;
use crate::exception::{ExceptionHandler, RethrowExceptionHandler};
use crate::interrupt::InterruptionPolicy;
use crate::listener::RepeatListener;
use crate::retry::RetryTemplate;

const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Loop driver parameterised by a completion policy.
#[derive(Clone)]
pub struct RepeatTemplate {
    completion_policy: Arc<dyn CompletionPolicy>,
    exception_handler: Arc<dyn ExceptionHandler>,
    listeners: Vec<Arc<dyn RepeatListener>>,
    retry: Option<RetryTemplate>,
    interruption_policy: Option<Arc<dyn InterruptionPolicy>>,
    token: CancellationToken,
    throttle_limit: usize,
}

impl fmt::Debug for RepeatTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepeatTemplate")
            .field("listeners", &self.listeners.len())
            .field("retry", &self.retry.is_some())
            .field("interruptible", &self.interruption_policy.is_some())
            .field("throttle_limit", &self.throttle_limit)
            .finish_non_exhaustive()
    }
}

impl Default for RepeatTemplate {
    fn default() -> Self {
        Self {
            completion_policy: Arc::new(DefaultResultCompletionPolicy),
            exception_handler: Arc::new(RethrowExceptionHandler),
            listeners: Vec::new(),
            retry: None,
            interruption_policy: None,
            token: CancellationToken::new(),
            throttle_limit: 1,
        }
    }
}

impl RepeatTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_completion_policy<P: CompletionPolicy + 'static>(mut self, policy: P) -> Self {
        self.completion_policy = Arc::new(policy);
        self
    }

    pub fn with_shared_completion_policy(mut self, policy: Arc<dyn CompletionPolicy>) -> Self {
        self.completion_policy = policy;
        self
    }

    pub fn with_exception_handler<H: ExceptionHandler + 'static>(mut self, handler: H) -> Self {
        self.exception_handler = Arc::new(handler);
        self
    }

    pub fn with_listener<L: RepeatListener + 'static>(mut self, listener: L) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn with_shared_listener(mut self, listener: Arc<dyn RepeatListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Wrap every invocation of the unit of work in a retry session.
    pub fn with_retry(mut self, retry: RetryTemplate) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_interruption_policy<I: InterruptionPolicy + 'static>(mut self, policy: I) -> Self {
        self.interruption_policy = Some(Arc::new(policy));
        self
    }

    /// Token handed to retry sessions, so backoff pauses end on cancellation.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Maximum iterations in flight at once; values below one mean one.
    pub fn with_throttle_limit(mut self, limit: usize) -> Self {
        self.throttle_limit = limit.max(1);
        self
    }

    pub fn throttle_limit(&self) -> usize {
        self.throttle_limit
    }

    /// Run the loop in a fresh scope under `parent`.
    ///
    /// Returns the last iteration's result. The scope is always closed; a
    /// failure from closing it competes with the loop's own failure through
    /// [`BatchError::prefer`].
    pub fn iterate<F>(
        &self,
        parent: Option<&Arc<IterationContext>>,
        callback: F,
    ) -> BatchResult<RepeatStatus>
    where
        F: Fn(&Arc<IterationContext>) -> BatchResult<RepeatStatus> + Sync,
    {
        let context = self.completion_policy.start(parent);
        for listener in &self.listeners {
            listener.open(&context);
        }

        let outcome = if self.throttle_limit > 1 {
            self.run_concurrent(&context, &callback)
        } else {
            self.run_sequential(&context, &callback)
        };

        for listener in self.listeners.iter().rev() {
            listener.close(&context);
        }

        match (outcome, context.close()) {
            (outcome, Ok(())) => outcome,
            (Ok(_), Err(cleanup)) => Err(cleanup),
            (Err(error), Err(cleanup)) => Err(error.prefer(cleanup)),
        }
    }

    fn should_stop(&self, context: &IterationContext) -> bool {
        context.is_complete() || self.completion_policy.is_complete(context)
    }

    fn check_interrupted(&self, context: &IterationContext) -> BatchResult<()> {
        match &self.interruption_policy {
            Some(policy) => policy.check_interrupted(context),
            None => Ok(()),
        }
    }

    fn invoke<F>(&self, context: &Arc<IterationContext>, callback: &F) -> BatchResult<RepeatStatus>
    where
        F: Fn(&Arc<IterationContext>) -> BatchResult<RepeatStatus>,
    {
        match &self.retry {
            Some(retry) => retry.execute(Some(context), &self.token, |_| callback(context)),
            None => callback(context),
        }
    }

    /// Listeners, exception handler and policy bookkeeping for one finished
    /// iteration. Returns the result to carry forward, or the failure that
    /// ends the loop.
    fn complete_iteration(
        &self,
        context: &IterationContext,
        outcome: BatchResult<RepeatStatus>,
    ) -> BatchResult<RepeatStatus> {
        let handled = match outcome {
            Ok(status) => {
                for listener in self.listeners.iter().rev() {
                    listener.after(context, status);
                }
                Ok(status)
            }
            Err(error) => {
                for listener in self.listeners.iter().rev() {
                    listener.on_error(context, &error);
                }
                self.exception_handler
                    .handle_exception(context, error)
                    .map(|()| RepeatStatus::Continuable)
            }
        };

        self.completion_policy.update(context);
        context.increment();
        handled
    }

    fn run_sequential<F>(
        &self,
        context: &Arc<IterationContext>,
        callback: &F,
    ) -> BatchResult<RepeatStatus>
    where
        F: Fn(&Arc<IterationContext>) -> BatchResult<RepeatStatus>,
    {
        let mut result = RepeatStatus::Continuable;
        while !self.should_stop(context) {
            for listener in &self.listeners {
                listener.before(context);
            }

            let outcome = self.invoke(context, callback);
            result = self.complete_iteration(context, outcome)?;

            self.check_interrupted(context)?;
            if self.completion_policy.is_complete_with(context, result) {
                break;
            }
        }
        debug!(iterations = context.started_count(), "iteration loop finished");
        Ok(result)
    }

    fn run_concurrent<F>(
        &self,
        context: &Arc<IterationContext>,
        callback: &F,
    ) -> BatchResult<RepeatStatus>
    where
        F: Fn(&Arc<IterationContext>) -> BatchResult<RepeatStatus> + Sync,
    {
        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel::<BatchResult<RepeatStatus>>();
            let mut in_flight = 0usize;
            let mut stopping = false;
            let mut failure: Option<BatchError> = None;
            let mut result = RepeatStatus::Continuable;

            loop {
                while !stopping && in_flight < self.throttle_limit {
                    if self.should_stop(context) {
                        stopping = true;
                        break;
                    }
                    for listener in &self.listeners {
                        listener.before(context);
                    }
                    let tx = tx.clone();
                    let worker_context = Arc::clone(context);
                    scope.spawn(move || {
                        let outcome = self.invoke(&worker_context, callback);
                        // The receiver outlives every worker in this scope.
                        let _ = tx.send(outcome);
                    });
                    in_flight += 1;
                }

                if in_flight == 0 {
                    break;
                }

                let outcome = match rx.recv_timeout(WORKER_POLL_INTERVAL) {
                    Ok(outcome) => outcome,
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(interrupted) = self.check_interrupted(context) {
                            if !stopping {
                                debug!(in_flight, "interrupted; draining in-flight iterations");
                            }
                            failure = Some(merge(failure, interrupted));
                            stopping = true;
                        }
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        warn!(in_flight, "iteration workers disconnected");
                        break;
                    }
                };
                in_flight -= 1;

                match self.complete_iteration(context, outcome) {
                    Ok(status) => {
                        // A finished result sticks even if stragglers report later.
                        if result.is_continuable() {
                            result = status;
                        }
                        if self.completion_policy.is_complete_with(context, status) {
                            stopping = true;
                        }
                    }
                    Err(error) => {
                        failure = Some(merge(failure, error));
                        stopping = true;
                    }
                }

                if let Err(interrupted) = self.check_interrupted(context) {
                    failure = Some(merge(failure, interrupted));
                    stopping = true;
                }
            }

            debug!(
                iterations = context.started_count(),
                throttle_limit = self.throttle_limit,
                "concurrent iteration loop finished"
            );
            match failure {
                Some(error) => Err(error),
                None => Ok(result),
            }
        })
    }
}

fn merge(earlier: Option<BatchError>, later: BatchError) -> BatchError {
    match earlier {
        Some(earlier) => earlier.prefer(later),
        None => later,
    }
}
