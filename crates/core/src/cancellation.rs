//! Cooperative cancellation token.
//!
//! A token is handed down to every loop that can block or iterate on behalf of
//! an execution. Nothing is ever preempted: loops poll the token at their
//! boundaries, and blocking waits (backoff pauses, worker results) wake up
//! early when the token is cancelled.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{BatchError, BatchResult};

#[derive(Debug, Default)]
struct TokenState {
    reason: Mutex<Option<String>>,
    signal: Condvar,
}

/// Cloneable handle; all clones observe the same cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The first reason wins; later calls are no-ops.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut slot = self
            .state
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(reason.into());
        }
        self.state.signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.state
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fail with [`BatchError::Interrupted`] if cancellation was requested.
    pub fn check(&self) -> BatchResult<()> {
        match self.reason() {
            Some(reason) => Err(BatchError::interrupted(reason)),
            None => Ok(()),
        }
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns the cancellation reason if the pause was cut short. A pause too
    /// long to express as a deadline waits for cancellation alone.
    pub fn sleep(&self, duration: Duration) -> Result<(), String> {
        let deadline = Instant::now().checked_add(duration);
        let mut slot = self
            .state
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(reason) = slot.as_ref() {
                return Err(reason.clone());
            }
            slot = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    self.state
                        .signal
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .state
                    .signal
                    .wait(slot)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}
