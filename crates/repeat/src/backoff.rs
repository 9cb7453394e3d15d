//! Backoff policies: how long to pause between retry attempts.
//!
//! Policies hold configuration only. Per-attempt state (the growing interval
//! of the exponential policy) lives in the [`BackoffContext`] returned by
//! [`BackoffPolicy::start`], so one policy can serve any number of concurrent
//! retry sessions.
//!
//! Pauses go through a [`Sleeper`]. The default sleeper waits on the session's
//! cancellation token, so a stop request cuts the pause short and surfaces as
//! [`BatchError::BackoffInterrupted`].

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use forgebatch_core::{BatchError, BatchResult, CancellationToken};
use tracing::debug;

use crate::retry::RetryContext;

const MIN_PAUSE: Duration = Duration::from_millis(1);

/// Performs (or simulates) a pause.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, pause: Duration, token: &CancellationToken) -> BatchResult<()>;
}

/// Sleeps on the cancellation token.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenSleeper;

impl Sleeper for TokenSleeper {
    fn sleep(&self, pause: Duration, token: &CancellationToken) -> BatchResult<()> {
        token.sleep(pause).map_err(BatchError::backoff_interrupted)
    }
}

/// Records requested pauses without sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    pauses: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pauses(&self) -> Vec<Duration> {
        self.pauses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, pause: Duration, token: &CancellationToken) -> BatchResult<()> {
        if let Some(reason) = token.reason() {
            return Err(BatchError::backoff_interrupted(reason));
        }
        self.pauses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pause);
        Ok(())
    }
}

/// Per-session backoff state.
pub struct BackoffContext {
    state: Option<Box<dyn Any + Send>>,
    token: CancellationToken,
}

impl fmt::Debug for BackoffContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackoffContext")
            .field("stateful", &self.state.is_some())
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl BackoffContext {
    pub fn stateless(token: CancellationToken) -> Self {
        Self { state: None, token }
    }

    pub fn with_state<S: Any + Send>(token: CancellationToken, state: S) -> Self {
        Self {
            state: Some(Box::new(state)),
            token,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn state_mut<S: Any + Send>(&mut self) -> Option<&mut S> {
        self.state.as_mut()?.downcast_mut::<S>()
    }
}

pub trait BackoffPolicy: Send + Sync {
    /// Open the backoff state for one retry session.
    fn start(&self, context: &RetryContext) -> BackoffContext;

    /// Pause before the next attempt; returns the pause that was taken.
    fn back_off(&self, backoff: &mut BackoffContext) -> BatchResult<Duration>;
}

/// Retries immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoffPolicy;

impl BackoffPolicy for NoBackoffPolicy {
    fn start(&self, context: &RetryContext) -> BackoffContext {
        BackoffContext::stateless(context.token().clone())
    }

    fn back_off(&self, _backoff: &mut BackoffContext) -> BatchResult<Duration> {
        Ok(Duration::ZERO)
    }
}

/// Pauses for the same period before every retry.
#[derive(Clone)]
pub struct FixedBackoffPolicy {
    period: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for FixedBackoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedBackoffPolicy")
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

impl Default for FixedBackoffPolicy {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(1000),
            sleeper: Arc::new(TokenSleeper),
        }
    }
}

impl FixedBackoffPolicy {
    pub fn new(period: Duration) -> Self {
        Self::default().with_period(period)
    }

    /// Periods below one millisecond are raised to one millisecond.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period.max(MIN_PAUSE);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl BackoffPolicy for FixedBackoffPolicy {
    fn start(&self, context: &RetryContext) -> BackoffContext {
        BackoffContext::stateless(context.token().clone())
    }

    fn back_off(&self, backoff: &mut BackoffContext) -> BatchResult<Duration> {
        debug!(pause_ms = self.period.as_millis() as u64, "fixed backoff");
        self.sleeper.sleep(self.period, backoff.token())?;
        Ok(self.period)
    }
}

#[derive(Debug)]
struct ExponentialState {
    interval: Duration,
}

/// Pauses that grow geometrically per retry session, capped at a maximum.
#[derive(Clone)]
pub struct ExponentialBackoffPolicy {
    initial_interval: Duration,
    max_interval: Duration,
    multiplier: f64,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for ExponentialBackoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExponentialBackoffPolicy")
            .field("initial_interval", &self.initial_interval)
            .field("max_interval", &self.max_interval)
            .field("multiplier", &self.multiplier)
            .finish_non_exhaustive()
    }
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(30_000),
            multiplier: 2.0,
            sleeper: Arc::new(TokenSleeper),
        }
    }
}

impl ExponentialBackoffPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intervals below one millisecond are raised to one millisecond.
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval.max(MIN_PAUSE);
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval.max(MIN_PAUSE);
        self
    }

    /// Multipliers below 1.0 (or NaN) are raised to 1.0.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier >= 1.0 { multiplier } else { 1.0 };
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Current pause for the session; grows the interval unless the cap has
    /// already been reached.
    fn next_pause(&self, state: &mut ExponentialState) -> Duration {
        if state.interval >= self.max_interval {
            return self.max_interval;
        }
        let pause = state.interval;
        let next_nanos = (pause.as_nanos() as f64 * self.multiplier).round();
        state.interval = if next_nanos >= u64::MAX as f64 {
            Duration::MAX
        } else {
            Duration::from_nanos(next_nanos as u64)
        };
        pause
    }
}

impl BackoffPolicy for ExponentialBackoffPolicy {
    fn start(&self, context: &RetryContext) -> BackoffContext {
        BackoffContext::with_state(
            context.token().clone(),
            ExponentialState {
                interval: self.initial_interval,
            },
        )
    }

    fn back_off(&self, backoff: &mut BackoffContext) -> BatchResult<Duration> {
        let pause = match backoff.state_mut::<ExponentialState>() {
            Some(state) => self.next_pause(state),
            None => {
                return Err(BatchError::invariant(
                    "backoff context was not started by an exponential policy",
                ));
            }
        };
        debug!(pause_ms = pause.as_millis() as u64, "exponential backoff");
        self.sleeper.sleep(pause, backoff.token())?;
        Ok(pause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{NeverRetryPolicy, RetryPolicy};
    use proptest::prelude::*;
    use std::thread;
    use std::time::Instant;

    fn retry_context(token: &CancellationToken) -> RetryContext {
        NeverRetryPolicy.open(None, token.clone())
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn fixed_backoff_floors_period() {
        assert_eq!(FixedBackoffPolicy::new(Duration::ZERO).period(), ms(1));
        assert_eq!(FixedBackoffPolicy::default().period(), ms(1000));
    }

    #[test]
    fn fixed_backoff_pauses_for_period() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let policy = FixedBackoffPolicy::new(ms(250)).with_sleeper(sleeper.clone());
        let token = CancellationToken::new();
        let mut backoff = policy.start(&retry_context(&token));

        policy.back_off(&mut backoff).unwrap();
        policy.back_off(&mut backoff).unwrap();

        assert_eq!(sleeper.pauses(), vec![ms(250), ms(250)]);
    }

    #[test]
    fn exponential_defaults_and_floors() {
        let policy = ExponentialBackoffPolicy::default();
        assert_eq!(policy.initial_interval(), ms(100));
        assert_eq!(policy.max_interval(), ms(30_000));
        assert_eq!(policy.multiplier(), 2.0);

        let floored = ExponentialBackoffPolicy::new()
            .with_initial_interval(Duration::ZERO)
            .with_multiplier(0.5);
        assert_eq!(floored.initial_interval(), ms(1));
        assert_eq!(floored.multiplier(), 1.0);
    }

    #[test]
    fn exponential_grows_until_cap() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let policy = ExponentialBackoffPolicy::new()
            .with_initial_interval(ms(100))
            .with_max_interval(ms(500))
            .with_sleeper(sleeper.clone());
        let token = CancellationToken::new();
        let mut backoff = policy.start(&retry_context(&token));

        for _ in 0..6 {
            policy.back_off(&mut backoff).unwrap();
        }

        assert_eq!(
            sleeper.pauses(),
            vec![ms(100), ms(200), ms(400), ms(500), ms(500), ms(500)]
        );
    }

    #[test]
    fn sessions_do_not_share_state() {
        let policy = ExponentialBackoffPolicy::new().with_sleeper(Arc::new(RecordingSleeper::new()));
        let token = CancellationToken::new();
        let mut first = policy.start(&retry_context(&token));
        let mut second = policy.start(&retry_context(&token));

        policy.back_off(&mut first).unwrap();
        policy.back_off(&mut first).unwrap();

        assert_eq!(policy.back_off(&mut second).unwrap(), ms(100));
    }

    #[test]
    fn cancellation_interrupts_backoff() {
        let policy = FixedBackoffPolicy::new(Duration::from_secs(10));
        let token = CancellationToken::new();
        let mut backoff = policy.start(&retry_context(&token));

        let remote = token.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(ms(20));
            remote.cancel("operator stop");
        });

        let started = Instant::now();
        let result = policy.back_off(&mut backoff);
        stopper.join().unwrap();

        assert_eq!(result, Err(BatchError::backoff_interrupted("operator stop")));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn saturated_interval_is_still_interruptible() {
        let policy = ExponentialBackoffPolicy::new()
            .with_initial_interval(Duration::MAX)
            .with_max_interval(Duration::MAX);
        let token = CancellationToken::new();
        let mut backoff = policy.start(&retry_context(&token));

        let remote = token.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(ms(20));
            remote.cancel("shutdown");
        });

        let result = policy.back_off(&mut backoff);
        stopper.join().unwrap();

        assert_eq!(result, Err(BatchError::backoff_interrupted("shutdown")));
    }

    #[test]
    fn backoff_context_from_other_policy_is_rejected() {
        let token = CancellationToken::new();
        let mut backoff = FixedBackoffPolicy::default().start(&retry_context(&token));
        let result = ExponentialBackoffPolicy::new().back_off(&mut backoff);
        assert!(matches!(result, Err(BatchError::InvariantViolation(_))));
    }

    proptest! {
        #[test]
        fn exponential_sequence_is_non_decreasing_and_capped(
            initial in 1u64..2_000,
            cap in 1u64..60_000,
            multiplier in 1.0f64..4.0,
            calls in 1usize..40,
        ) {
            let policy = ExponentialBackoffPolicy::new()
                .with_initial_interval(ms(initial))
                .with_max_interval(ms(cap))
                .with_multiplier(multiplier)
                .with_sleeper(Arc::new(RecordingSleeper::new()));
            let token = CancellationToken::new();
            let mut backoff = policy.start(&retry_context(&token));

            let mut previous = Duration::ZERO;
            for _ in 0..calls {
                let pause = policy.back_off(&mut backoff).unwrap();
                prop_assert!(pause >= previous);
                prop_assert!(pause <= ms(cap));
                previous = pause;
            }
        }

        #[test]
        fn unit_multiplier_is_constant(initial in 1u64..10_000, calls in 1usize..20) {
            let policy = ExponentialBackoffPolicy::new()
                .with_initial_interval(ms(initial))
                .with_max_interval(ms(10_000))
                .with_multiplier(1.0)
                .with_sleeper(Arc::new(RecordingSleeper::new()));
            let token = CancellationToken::new();
            let mut backoff = policy.start(&retry_context(&token));

            for _ in 0..calls {
                prop_assert_eq!(policy.back_off(&mut backoff).unwrap(), ms(initial));
            }
        }
    }
}
