//! Steps and the chunk executor.
//!
//! A [`Step`] advances one [`StepExecution`]. [`ChunkStep`] does so chunk by
//! chunk: every chunk runs a [`ChunkHandler`] inside its own transaction and
//! folds the handler's [`StepContribution`] into the step execution only once
//! the chunk is durable.

mod chunk_step;

pub use chunk_step::ChunkStep;

use std::fmt;
use std::sync::Arc;

use forgebatch_core::{
    BatchResult, CancellationToken, ExecutionContext, ExitStatus, RepeatStatus, StepContribution,
    StepExecution, StepExecutionId,
};
use forgebatch_repeat::IterationContext;

use crate::transaction::TransactionHandle;

/// One unit of a job.
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Run again even when a previous execution of this step completed.
    fn allow_start_if_complete(&self) -> bool {
        false
    }

    /// Maximum number of executions per job instance.
    fn start_limit(&self) -> u64 {
        u64::MAX
    }

    /// Advance `step_execution` to a terminal status.
    ///
    /// Every outcome is recorded on the execution (status, exit status,
    /// failures). Only interruption and fatal failures are also returned, so
    /// the caller can stop the surrounding job.
    fn execute(
        &self,
        step_execution: &mut StepExecution,
        parent: Option<&Arc<IterationContext>>,
        token: &CancellationToken,
    ) -> BatchResult<()>;
}

/// Caller-supplied unit of work for one chunk.
///
/// Records what it did on the contribution and signals whether more input
/// remains. It must not manage transactions itself.
pub trait ChunkHandler: Send + Sync {
    fn handle(
        &self,
        contribution: &mut StepContribution,
        chunk: &ChunkContext,
    ) -> BatchResult<RepeatStatus>;

    fn open(&self, _context: &ExecutionContext) -> BatchResult<()> {
        Ok(())
    }

    fn update(&self, _context: &mut ExecutionContext) -> BatchResult<()> {
        Ok(())
    }

    fn close(&self) -> BatchResult<()> {
        Ok(())
    }
}

impl<F> ChunkHandler for F
where
    F: Fn(&mut StepContribution, &ChunkContext) -> BatchResult<RepeatStatus> + Send + Sync,
{
    fn handle(
        &self,
        contribution: &mut StepContribution,
        chunk: &ChunkContext,
    ) -> BatchResult<RepeatStatus> {
        self(contribution, chunk)
    }
}

/// What a chunk handler can see of the chunk it is running.
#[derive(Clone)]
pub struct ChunkContext {
    chunk_number: u64,
    step_name: String,
    step_execution_id: StepExecutionId,
    iteration: Arc<IterationContext>,
    transaction: TransactionHandle,
    token: CancellationToken,
    skip_count: u64,
}

impl fmt::Debug for ChunkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkContext")
            .field("chunk_number", &self.chunk_number)
            .field("step_name", &self.step_name)
            .field("step_execution_id", &self.step_execution_id)
            .field("transaction", &self.transaction)
            .finish_non_exhaustive()
    }
}

impl ChunkContext {
    pub fn new(
        chunk_number: u64,
        step_name: impl Into<String>,
        step_execution_id: StepExecutionId,
        iteration: Arc<IterationContext>,
        transaction: TransactionHandle,
        token: CancellationToken,
    ) -> Self {
        Self {
            chunk_number,
            step_name: step_name.into(),
            step_execution_id,
            iteration,
            transaction,
            token,
            skip_count: 0,
        }
    }

    pub fn with_skip_count(mut self, skip_count: u64) -> Self {
        self.skip_count = skip_count;
        self
    }

    /// 1-based position of this chunk within the step execution.
    pub fn chunk_number(&self) -> u64 {
        self.chunk_number
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn step_execution_id(&self) -> StepExecutionId {
        self.step_execution_id
    }

    /// Iteration scope of this chunk; nested loops hang off it.
    pub fn iteration(&self) -> &Arc<IterationContext> {
        &self.iteration
    }

    pub fn transaction(&self) -> &TransactionHandle {
        &self.transaction
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Items skipped by chunks the step execution already committed.
    pub fn skip_count(&self) -> u64 {
        self.skip_count
    }
}

/// Lifecycle of one chunk inside the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkPhase {
    Ready,
    Running,
    Completing,
    RollingBack,
    Completed,
    Failed,
    Stopped,
    Unknown,
}

impl ChunkPhase {
    pub fn can_transition_to(self, next: ChunkPhase) -> bool {
        use ChunkPhase::*;
        matches!(
            (self, next),
            (Ready, Running)
                | (Ready, Stopped)
                | (Running, Completing)
                | (Running, RollingBack)
                | (Completing, Completed)
                | (Completing, RollingBack)
                | (Completing, Unknown)
                | (RollingBack, Failed)
                | (RollingBack, Stopped)
                | (RollingBack, Unknown)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChunkPhase::Completed | ChunkPhase::Failed | ChunkPhase::Stopped | ChunkPhase::Unknown
        )
    }
}

impl fmt::Display for ChunkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChunkPhase::Ready => "READY",
            ChunkPhase::Running => "RUNNING",
            ChunkPhase::Completing => "COMPLETING",
            ChunkPhase::RollingBack => "ROLLING_BACK",
            ChunkPhase::Completed => "COMPLETED",
            ChunkPhase::Failed => "FAILED",
            ChunkPhase::Stopped => "STOPPED",
            ChunkPhase::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

/// Callbacks around a whole step execution.
pub trait StepListener: Send + Sync {
    fn before_step(&self, _step_execution: &StepExecution) {}

    /// May amend the exit status; the result is merged with
    /// [`ExitStatus::and`].
    fn after_step(&self, _step_execution: &StepExecution) -> Option<ExitStatus> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_phases_only_move_forward() {
        use ChunkPhase::*;
        assert!(Ready.can_transition_to(Running));
        assert!(Running.can_transition_to(RollingBack));
        assert!(Completing.can_transition_to(Unknown));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Completed));
        assert!(!RollingBack.can_transition_to(Completed));
        for phase in [Completed, Failed, Stopped, Unknown] {
            assert!(phase.is_terminal());
        }
    }
}
