use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use forgebatch_core::{
    BatchError, BatchResult, BatchStatus, CancellationToken, ExitStatus, RepeatStatus,
    StepContribution, StepExecution, StepExecutionId,
};
use forgebatch_repeat::{
    CompletionPolicy, ExceptionHandler, InterruptionPolicy, IterationContext, RepeatTemplate,
    TokenInterruptionPolicy,
};

use super::{ChunkContext, ChunkHandler, ChunkPhase, Step, StepListener};
use crate::config::BatchConfig;
use crate::repository::JobRepository;
use crate::synchronizer::{ExecutionKey, ExecutionSynchronizer};
use crate::transaction::{TransactionAttributes, TransactionManager, TransactionScope};

/// The step execution, shared between chunk iterations.
///
/// Counters and context are only mutated while the synchronizer gate for the
/// step execution is held; the gate is always taken before this mutex.
type SharedExecution<'a> = Mutex<&'a mut StepExecution>;

/// Step that advances chunk by chunk, one transaction per chunk.
///
/// Per chunk:
///
/// 1. check for interruption;
/// 2. begin a transaction;
/// 3. acquire the synchronizer gate for the step execution;
/// 4. run the handler against a fresh contribution;
/// 5. roll back on a rollback-triggering failure, or record a tolerated one;
/// 6. apply the contribution and let the handler save its stream state;
/// 7. persist the execution context and the step execution;
/// 8. commit;
/// 9. persist the step execution again;
/// 10. release the gate;
/// 11. check for interruption again.
///
/// Failures in 7 and 8 are fatal: the contribution is backed out of the
/// in-memory execution, the transaction rolled back and the step ends
/// UNKNOWN.
pub struct ChunkStep {
    name: String,
    handler: Arc<dyn ChunkHandler>,
    repository: Arc<dyn JobRepository>,
    transaction_manager: Arc<dyn TransactionManager>,
    synchronizer: Arc<ExecutionSynchronizer>,
    transaction_attributes: TransactionAttributes,
    chunk_loop: RepeatTemplate,
    listeners: Vec<Arc<dyn StepListener>>,
    allow_start_if_complete: bool,
    start_limit: u64,
}

impl fmt::Debug for ChunkStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkStep")
            .field("name", &self.name)
            .field("transaction_attributes", &self.transaction_attributes)
            .field("chunk_loop", &self.chunk_loop)
            .field("listeners", &self.listeners.len())
            .field("allow_start_if_complete", &self.allow_start_if_complete)
            .field("start_limit", &self.start_limit)
            .finish_non_exhaustive()
    }
}

impl ChunkStep {
    pub fn new<H: ChunkHandler + 'static>(
        name: impl Into<String>,
        handler: H,
        repository: Arc<dyn JobRepository>,
        transaction_manager: Arc<dyn TransactionManager>,
    ) -> Self {
        let name = name.into();
        Self {
            transaction_attributes: TransactionAttributes::new(name.clone()),
            name,
            handler: Arc::new(handler),
            repository,
            transaction_manager,
            synchronizer: ExecutionSynchronizer::arc(),
            chunk_loop: RepeatTemplate::new(),
            listeners: Vec::new(),
            allow_start_if_complete: false,
            start_limit: u64::MAX,
        }
    }

    /// Share a synchronizer with other steps (or jobs) of the same process.
    pub fn with_synchronizer(mut self, synchronizer: Arc<ExecutionSynchronizer>) -> Self {
        self.synchronizer = synchronizer;
        self
    }

    pub fn with_transaction_attributes(mut self, attributes: TransactionAttributes) -> Self {
        self.transaction_attributes = attributes;
        self
    }

    /// Decides when the step stops starting chunks. Defaults to "when the
    /// handler reports no more input".
    pub fn with_completion_policy<P: CompletionPolicy + 'static>(mut self, policy: P) -> Self {
        self.chunk_loop = self.chunk_loop.with_completion_policy(policy);
        self
    }

    /// Decides whether a rolled-back chunk ends the step. By default it does.
    pub fn with_exception_handler<H: ExceptionHandler + 'static>(mut self, handler: H) -> Self {
        self.chunk_loop = self.chunk_loop.with_exception_handler(handler);
        self
    }

    pub fn with_throttle_limit(mut self, limit: usize) -> Self {
        self.chunk_loop = self.chunk_loop.with_throttle_limit(limit);
        self
    }

    pub fn with_config(self, config: &BatchConfig) -> Self {
        self.with_throttle_limit(config.throttle_limit)
    }

    pub fn with_listener<L: StepListener + 'static>(mut self, listener: L) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn with_allow_start_if_complete(mut self, allow: bool) -> Self {
        self.allow_start_if_complete = allow;
        self
    }

    pub fn with_start_limit(mut self, limit: u64) -> Self {
        self.start_limit = limit;
        self
    }

    fn iterate_chunks(
        &self,
        step_execution: &mut StepExecution,
        parent: Option<&Arc<IterationContext>>,
        token: &CancellationToken,
    ) -> BatchResult<()> {
        let step_id = step_execution.id();
        let chunks = AtomicU64::new(0);
        let shared: SharedExecution<'_> = Mutex::new(step_execution);

        let chunk_loop = self
            .chunk_loop
            .clone()
            .with_cancellation_token(token.clone())
            .with_interruption_policy(TokenInterruptionPolicy::new(token.clone()));

        chunk_loop
            .iterate(parent, |iteration| {
                let chunk_number = chunks.fetch_add(1, Ordering::SeqCst) + 1;
                self.run_chunk(&shared, step_id, chunk_number, iteration, token)
            })
            .map(|_| ())
    }

    fn run_chunk(
        &self,
        shared: &SharedExecution<'_>,
        step_id: StepExecutionId,
        chunk_number: u64,
        iteration: &Arc<IterationContext>,
        token: &CancellationToken,
    ) -> BatchResult<RepeatStatus> {
        let mut phase = ChunkPhase::Ready;
        if let Err(interrupted) = self.check_interrupted(shared, iteration, token) {
            self.advance(&mut phase, ChunkPhase::Stopped, chunk_number);
            return Err(interrupted);
        }

        let mut transaction = TransactionScope::begin(
            self.transaction_manager.as_ref(),
            &self.transaction_attributes,
        )?;

        let gate = match self.synchronizer.acquire_cancellable(step_id, token) {
            Ok(gate) => gate,
            Err(interrupted) => {
                // Nothing ran in this chunk, so the step execution is left alone.
                let error = self.discard(&mut transaction, interrupted);
                self.advance(&mut phase, ChunkPhase::Stopped, chunk_number);
                return Err(error);
            }
        };

        self.advance(&mut phase, ChunkPhase::Running, chunk_number);
        let prior_skips = lock(shared).skip_count();
        let chunk = ChunkContext::new(
            chunk_number,
            self.name.clone(),
            step_id,
            Arc::clone(iteration),
            transaction.handle().clone(),
            token.clone(),
        )
        .with_skip_count(prior_skips);
        let mut contribution = StepContribution::new(step_id);

        let status = match self.handler.handle(&mut contribution, &chunk) {
            Ok(status) => status,
            Err(error) if self.transaction_attributes.rollback_on(&error) => {
                self.advance(&mut phase, ChunkPhase::RollingBack, chunk_number);
                let mut guard = lock(shared);
                let error = self.roll_back(&mut guard, &mut transaction, error);
                self.advance(&mut phase, phase_after_rollback(&error), chunk_number);
                return Err(error);
            }
            Err(error) => {
                warn!(
                    step = %self.name,
                    chunk = chunk_number,
                    error = %error,
                    "chunk failure tolerated without rollback"
                );
                let exit = contribution
                    .exit_status()
                    .cloned()
                    .unwrap_or_else(ExitStatus::executing)
                    .add_exit_description(error.to_string());
                contribution.set_exit_status(exit);
                RepeatStatus::Continuable
            }
        };

        self.advance(&mut phase, ChunkPhase::Completing, chunk_number);
        let mut guard = lock(shared);
        let execution: &mut StepExecution = &mut guard;
        let snapshot = execution.clone();

        execution.apply(&contribution);
        if let Err(error) = self.handler.update(&mut execution.execution_context) {
            execution.restore_from(&snapshot);
            self.advance(&mut phase, ChunkPhase::RollingBack, chunk_number);
            let error = self.roll_back(execution, &mut transaction, error);
            self.advance(&mut phase, phase_after_rollback(&error), chunk_number);
            return Err(error);
        }

        if let Err(cause) = self.persist_chunk(execution) {
            execution.restore_from(&snapshot);
            self.advance(&mut phase, ChunkPhase::Unknown, chunk_number);
            return Err(self.fail_fatally(execution, &mut transaction, cause, "persisting chunk"));
        }

        if let Err(cause) = transaction.commit() {
            execution.restore_from(&snapshot);
            self.advance(&mut phase, ChunkPhase::Unknown, chunk_number);
            return Err(self.fail_fatally(execution, &mut transaction, cause, "commit"));
        }

        if let Err(cause) = self.repository.update_step_execution(execution) {
            let cause = BatchError::from(cause);
            error!(
                step = %self.name,
                chunk = chunk_number,
                error = %cause,
                "recording committed chunk failed"
            );
            execution.upgrade_status(BatchStatus::Unknown);
            execution.set_terminate_only();
            self.advance(&mut phase, ChunkPhase::Unknown, chunk_number);
            return Err(BatchError::fatal(cause));
        }

        self.advance(&mut phase, ChunkPhase::Completed, chunk_number);
        debug!(
            step = %self.name,
            chunk = chunk_number,
            read = contribution.read_count(),
            written = contribution.write_count(),
            commits = execution.commit_count(),
            "chunk committed"
        );
        drop(guard);
        gate.release();

        self.check_interrupted(shared, iteration, token)?;
        Ok(status)
    }

    fn check_interrupted(
        &self,
        shared: &SharedExecution<'_>,
        iteration: &IterationContext,
        token: &CancellationToken,
    ) -> BatchResult<()> {
        TokenInterruptionPolicy::new(token.clone()).check_interrupted(iteration)?;
        if lock(shared).is_terminate_only() {
            iteration.set_terminate_only();
            return Err(BatchError::interrupted(format!(
                "step {} was asked to terminate",
                self.name
            )));
        }
        Ok(())
    }

    fn persist_chunk(&self, execution: &mut StepExecution) -> BatchResult<()> {
        self.repository.update_step_execution_context(execution)?;
        execution.increment_commit_count();
        self.repository.update_step_execution(execution)?;
        Ok(())
    }

    /// Roll back and record the rollback. A rollback failure never replaces a
    /// more severe (or earlier) cause.
    fn roll_back(
        &self,
        execution: &mut StepExecution,
        transaction: &mut TransactionScope<'_>,
        cause: BatchError,
    ) -> BatchError {
        execution.increment_rollback_count();
        self.discard(transaction, cause)
    }

    /// Roll back `transaction`, keeping the more severe of the two failures.
    fn discard(&self, transaction: &mut TransactionScope<'_>, cause: BatchError) -> BatchError {
        match transaction.rollback() {
            Ok(()) => {
                debug!(step = %self.name, error = %cause, "chunk rolled back");
                cause
            }
            Err(rollback) => {
                error!(
                    step = %self.name,
                    error = %cause,
                    rollback_error = %rollback,
                    "chunk rollback failed"
                );
                cause.prefer(rollback)
            }
        }
    }

    fn fail_fatally(
        &self,
        execution: &mut StepExecution,
        transaction: &mut TransactionScope<'_>,
        cause: BatchError,
        during: &str,
    ) -> BatchError {
        error!(
            step = %self.name,
            execution = %execution.id(),
            error = %cause,
            "{during} failed; execution state can no longer be trusted"
        );
        execution.upgrade_status(BatchStatus::Unknown);
        execution.set_terminate_only();
        self.roll_back(execution, transaction, BatchError::fatal(cause))
    }

    fn advance(&self, phase: &mut ChunkPhase, next: ChunkPhase, chunk_number: u64) {
        debug_assert!(
            phase.can_transition_to(next),
            "illegal chunk transition {phase} -> {next}"
        );
        if next.is_terminal() && next != ChunkPhase::Completed {
            debug!(step = %self.name, chunk = chunk_number, from = %phase, to = %next, "chunk ended");
        }
        *phase = next;
    }

    fn open_and_iterate(
        &self,
        step_execution: &mut StepExecution,
        parent: Option<&Arc<IterationContext>>,
        token: &CancellationToken,
    ) -> (bool, BatchResult<()>) {
        if let Err(e) = self.handler.open(&step_execution.execution_context) {
            return (false, Err(e));
        }
        (true, self.iterate_chunks(step_execution, parent, token))
    }

    fn persist_final(&self, step_execution: &mut StepExecution) -> BatchResult<()> {
        self.repository.update_step_execution_context(step_execution)?;
        self.repository.update_step_execution(step_execution)?;
        Ok(())
    }
}

impl Step for ChunkStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn allow_start_if_complete(&self) -> bool {
        self.allow_start_if_complete
    }

    fn start_limit(&self) -> u64 {
        self.start_limit
    }

    fn execute(
        &self,
        step_execution: &mut StepExecution,
        parent: Option<&Arc<IterationContext>>,
        token: &CancellationToken,
    ) -> BatchResult<()> {
        info!(step = %self.name, execution = %step_execution.id(), "step started");
        step_execution.start_time = Some(Utc::now());
        step_execution.upgrade_status(BatchStatus::Started);

        let mut started = false;
        let mut opened = false;
        let mut failure = match self.repository.update_step_execution(step_execution) {
            Ok(()) => {
                started = true;
                for listener in &self.listeners {
                    listener.before_step(step_execution);
                }
                let (was_opened, outcome) = self.open_and_iterate(step_execution, parent, token);
                opened = was_opened;
                outcome.err()
            }
            Err(e) => Some(BatchError::fatal(e.into())),
        };

        let (status, exit) = match &failure {
            None => (BatchStatus::Completed, ExitStatus::completed()),
            Some(e) if e.is_fatal() => (BatchStatus::Unknown, ExitStatus::unknown().with_failure(e)),
            Some(e) if e.is_interruption() => {
                (BatchStatus::Stopped, ExitStatus::stopped().with_failure(e))
            }
            Some(e) => (BatchStatus::Failed, ExitStatus::failed().with_failure(e)),
        };
        if let Some(e) = &failure {
            warn!(step = %self.name, error = %e, status = ?status, "step did not complete");
            step_execution.add_failure(e.clone());
        }
        step_execution.upgrade_status(status);
        step_execution.set_exit_status(step_execution.exit_status().clone().and(exit));

        if started {
            for listener in self.listeners.iter().rev() {
                if let Some(exit) = listener.after_step(step_execution) {
                    step_execution.set_exit_status(step_execution.exit_status().clone().and(exit));
                }
            }
        }

        if opened {
            if let Err(e) = self.handler.close() {
                warn!(step = %self.name, error = %e, "closing step streams failed");
                step_execution.add_failure(e.clone());
                if step_execution.status() == BatchStatus::Completed {
                    step_execution.upgrade_status(BatchStatus::Failed);
                    step_execution.set_exit_status(
                        step_execution
                            .exit_status()
                            .clone()
                            .and(ExitStatus::failed().with_failure(&e)),
                    );
                }
            }
        }

        step_execution.end_time = Some(Utc::now());
        if let Err(e) = self.persist_final(step_execution) {
            let fatal = BatchError::fatal(e);
            error!(step = %self.name, error = %fatal, "final step update failed");
            step_execution.upgrade_status(BatchStatus::Unknown);
            step_execution.set_exit_status(
                step_execution
                    .exit_status()
                    .clone()
                    .and(ExitStatus::unknown().with_failure(&fatal)),
            );
            step_execution.add_failure(fatal.clone());
            failure = Some(match failure {
                Some(earlier) => earlier.prefer(fatal),
                None => fatal,
            });
        }
        self.synchronizer
            .remove(ExecutionKey::Step(step_execution.id()));

        info!(
            step = %self.name,
            status = ?step_execution.status(),
            exit_code = %step_execution.exit_status().exit_code(),
            read = step_execution.read_count(),
            written = step_execution.write_count(),
            commits = step_execution.commit_count(),
            rollbacks = step_execution.rollback_count(),
            "step finished"
        );

        match failure {
            Some(e) if e.is_fatal() || e.is_interruption() => Err(e),
            _ => Ok(()),
        }
    }
}

fn phase_after_rollback(error: &BatchError) -> ChunkPhase {
    if error.is_fatal() {
        ChunkPhase::Unknown
    } else if error.is_interruption() {
        ChunkPhase::Stopped
    } else {
        ChunkPhase::Failed
    }
}

fn lock<'m, 'a>(shared: &'m SharedExecution<'a>) -> MutexGuard<'m, &'a mut StepExecution> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}
