//! Interruption policies, polled at loop boundaries.

use forgebatch_core::{BatchResult, CancellationToken};
use tracing::info;

use crate::context::IterationContext;

/// Raises [`forgebatch_core::BatchError::Interrupted`] when an external stop
/// has been requested.
///
/// Polled, never preemptive: a policy only looks at state, it does not stop
/// running work.
pub trait InterruptionPolicy: Send + Sync {
    fn check_interrupted(&self, context: &IterationContext) -> BatchResult<()>;
}

impl<F> InterruptionPolicy for F
where
    F: Fn(&IterationContext) -> BatchResult<()> + Send + Sync,
{
    fn check_interrupted(&self, context: &IterationContext) -> BatchResult<()> {
        self(context)
    }
}

/// Interrupts once the execution's cancellation token is cancelled, marking
/// the iteration scope terminate-only.
#[derive(Debug, Clone)]
pub struct TokenInterruptionPolicy {
    token: CancellationToken,
}

impl TokenInterruptionPolicy {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl InterruptionPolicy for TokenInterruptionPolicy {
    fn check_interrupted(&self, context: &IterationContext) -> BatchResult<()> {
        if let Err(interrupted) = self.token.check() {
            info!(error = %interrupted, "interruption detected");
            context.set_terminate_only();
            return Err(interrupted);
        }
        Ok(())
    }
}
