//! Jobs and the launcher that runs them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use tracing::{error, info, warn};

use forgebatch_core::{
    BatchError, BatchResult, BatchStatus, CancellationToken, ExecutionContext, ExitStatus,
    JobExecution, JobExecutionId, JobParameters,
};
use forgebatch_repeat::IterationContext;

use crate::repository::JobRepository;
use crate::step::Step;
use crate::synchronizer::{ExecutionKey, ExecutionSynchronizer};

/// A named sequence of work run against one [`JobExecution`].
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    /// Run the execution to a terminal status. Every outcome, including
    /// failures, is recorded on the execution.
    fn execute(&self, execution: &mut JobExecution, token: &CancellationToken);
}

/// What the job does with one configured step.
enum StepDecision {
    /// Run, restoring the context of an unfinished earlier execution.
    Run(Option<ExecutionContext>),
    Skip,
}

/// Runs its steps in order, stopping at the first one that does not complete.
pub struct SimpleJob {
    name: String,
    steps: Vec<Arc<dyn Step>>,
    repository: Arc<dyn JobRepository>,
    synchronizer: Arc<ExecutionSynchronizer>,
}

impl fmt::Debug for SimpleJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleJob")
            .field("name", &self.name)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name().to_string()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl SimpleJob {
    pub fn new(name: impl Into<String>, repository: Arc<dyn JobRepository>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            repository,
            synchronizer: ExecutionSynchronizer::arc(),
        }
    }

    pub fn with_step<S: Step + 'static>(mut self, step: S) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn with_shared_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_synchronizer(mut self, synchronizer: Arc<ExecutionSynchronizer>) -> Self {
        self.synchronizer = synchronizer;
        self
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    fn decide(&self, step: &dyn Step, execution: &JobExecution) -> BatchResult<StepDecision> {
        let instance = execution.job_instance();
        let Some(last) = self.repository.last_step_execution(instance, step.name())? else {
            return Ok(StepDecision::Run(None));
        };

        match last.status() {
            BatchStatus::Completed if !step.allow_start_if_complete() => {
                return Ok(StepDecision::Skip);
            }
            BatchStatus::Unknown => {
                return Err(BatchError::JobRestart(format!(
                    "step {} of job {} ended UNKNOWN in execution {} and needs manual inspection",
                    step.name(),
                    self.name,
                    last.job_execution_id()
                )));
            }
            _ => {}
        }

        let count = self.repository.step_execution_count(instance, step.name())?;
        if count as u64 >= step.start_limit() {
            return Err(BatchError::JobRestart(format!(
                "step {} reached its start limit of {}",
                step.name(),
                step.start_limit()
            )));
        }
        let restored = (last.status() != BatchStatus::Completed).then_some(last.execution_context);
        Ok(StepDecision::Run(restored))
    }

    /// Run one step. Returns the step's final status.
    fn run_step(
        &self,
        step: &dyn Step,
        execution: &mut JobExecution,
        restored: Option<ExecutionContext>,
        scope: &Arc<IterationContext>,
        token: &CancellationToken,
    ) -> BatchResult<BatchStatus> {
        let step_execution = execution.create_step_execution(step.name());
        if let Some(context) = restored {
            step_execution.execution_context = context;
        }
        self.repository.add_step_execution(step_execution)?;

        let outcome = step.execute(step_execution, Some(scope), token);
        let status = step_execution.status();
        let exit = step_execution.exit_status().clone();
        execution.set_exit_status(execution.exit_status().clone().and(exit));
        outcome.map(|()| status)
    }

    /// Save the execution under the job's gate. Picks up a STOPPING status
    /// recorded by an operator.
    fn save(&self, execution: &mut JobExecution) -> BatchResult<()> {
        let _gate = self.synchronizer.acquire(ExecutionKey::Job(execution.id()));
        self.repository.update_job_execution_context(execution)?;
        self.repository.update_job_execution(execution)?;
        Ok(())
    }

    fn run_steps(
        &self,
        execution: &mut JobExecution,
        scope: &Arc<IterationContext>,
        token: &CancellationToken,
    ) -> BatchResult<(BatchStatus, usize)> {
        let mut ran = 0;
        let mut status = BatchStatus::Completed;

        for step in &self.steps {
            if execution.is_stopping() {
                token.cancel(format!("job execution {} is stopping", execution.id()));
            }
            token.check()?;

            let restored = match self.decide(step.as_ref(), execution)? {
                StepDecision::Skip => {
                    info!(job = %self.name, step = %step.name(), "step already complete; skipping");
                    continue;
                }
                StepDecision::Run(restored) => restored,
            };

            ran += 1;
            status = self.run_step(step.as_ref(), execution, restored, scope, token)?;
            self.save(execution)?;
            if status != BatchStatus::Completed {
                break;
            }
        }
        Ok((status, ran))
    }
}

impl Job for SimpleJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, execution: &mut JobExecution, token: &CancellationToken) {
        info!(job = %self.name, execution = %execution.id(), "job started");
        execution.start_time = Some(Utc::now());
        execution.upgrade_status(BatchStatus::Started);

        let scope = IterationContext::root();
        let outcome = self
            .save(execution)
            .and_then(|()| self.run_steps(execution, &scope, token));
        if let Err(e) = scope.close() {
            warn!(job = %self.name, error = %e, "closing job scope failed");
        }

        let (status, exit) = match &outcome {
            Ok((BatchStatus::Completed, 0)) => (BatchStatus::Completed, ExitStatus::noop()),
            Ok((BatchStatus::Completed, _)) => (BatchStatus::Completed, ExitStatus::completed()),
            Ok((BatchStatus::Stopped, _)) => (BatchStatus::Stopped, ExitStatus::stopped()),
            Ok((BatchStatus::Unknown, _)) => (BatchStatus::Unknown, ExitStatus::unknown()),
            Ok((_, _)) => (BatchStatus::Failed, ExitStatus::failed()),
            Err(e) if e.is_fatal() => (BatchStatus::Unknown, ExitStatus::unknown().with_failure(e)),
            Err(e) if e.is_interruption() => {
                (BatchStatus::Stopped, ExitStatus::stopped().with_failure(e))
            }
            Err(e) => (BatchStatus::Failed, ExitStatus::failed().with_failure(e)),
        };
        if let Err(e) = &outcome {
            warn!(job = %self.name, error = %e, "job did not complete");
            if !execution.all_failures().contains(e) {
                execution.add_failure(e.clone());
            }
        }

        let status = if execution.is_stopping() && status == BatchStatus::Completed {
            BatchStatus::Stopped
        } else {
            status
        };
        execution.upgrade_status(status);
        execution.set_exit_status(execution.exit_status().clone().and(exit));
        execution.end_time = Some(Utc::now());

        if let Err(e) = self.save(execution) {
            let fatal = BatchError::fatal(e);
            error!(job = %self.name, error = %fatal, "final job update failed");
            execution.upgrade_status(BatchStatus::Unknown);
            execution.set_exit_status(
                execution
                    .exit_status()
                    .clone()
                    .and(ExitStatus::unknown().with_failure(&fatal)),
            );
            execution.add_failure(fatal);
        }
        self.synchronizer.remove(ExecutionKey::Job(execution.id()));

        info!(
            job = %self.name,
            execution = %execution.id(),
            status = ?execution.status(),
            exit_code = %execution.exit_status().exit_code(),
            "job finished"
        );
    }
}

/// Handle to a job running on its own thread.
#[derive(Debug)]
pub struct JobRunHandle {
    execution_id: JobExecutionId,
    handle: JoinHandle<JobExecution>,
}

impl JobRunHandle {
    pub fn execution_id(&self) -> JobExecutionId {
        self.execution_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> BatchResult<JobExecution> {
        self.handle.join().map_err(|_| {
            BatchError::invariant(format!("job thread for {} panicked", self.execution_id))
        })
    }
}

/// Creates executions through the repository and runs them.
pub struct JobLauncher {
    repository: Arc<dyn JobRepository>,
    running: Mutex<HashMap<JobExecutionId, CancellationToken>>,
}

impl fmt::Debug for JobLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobLauncher")
            .field("running", &self.running().len())
            .finish_non_exhaustive()
    }
}

impl JobLauncher {
    pub fn new(repository: Arc<dyn JobRepository>) -> Self {
        Self {
            repository,
            running: Mutex::new(HashMap::new()),
        }
    }

    fn running(&self) -> MutexGuard<'_, HashMap<JobExecutionId, CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: JobExecutionId) -> CancellationToken {
        let token = CancellationToken::new();
        self.running().insert(id, token.clone());
        token
    }

    fn unregister(&self, id: JobExecutionId) {
        self.running().remove(&id);
    }

    /// Run on the calling thread.
    pub fn run(&self, job: &dyn Job, parameters: &JobParameters) -> BatchResult<JobExecution> {
        let mut execution = self.repository.create_job_execution(job.name(), parameters)?;
        let token = self.register(execution.id());
        info!(job = %job.name(), execution = %execution.id(), "launching job");
        job.execute(&mut execution, &token);
        self.unregister(execution.id());
        Ok(execution)
    }

    /// Run on a dedicated thread.
    pub fn spawn(
        self: &Arc<Self>,
        job: Arc<dyn Job>,
        parameters: JobParameters,
    ) -> BatchResult<JobRunHandle> {
        let mut execution = self.repository.create_job_execution(job.name(), &parameters)?;
        let execution_id = execution.id();
        let token = self.register(execution_id);
        let launcher = Arc::clone(self);

        let spawned = thread::Builder::new()
            .name(format!("job-{}", job.name()))
            .spawn(move || {
                job.execute(&mut execution, &token);
                launcher.unregister(execution_id);
                execution
            });

        match spawned {
            Ok(handle) => {
                info!(execution = %execution_id, "job launched on worker thread");
                Ok(JobRunHandle {
                    execution_id,
                    handle,
                })
            }
            Err(e) => {
                self.unregister(execution_id);
                // The stored execution would otherwise block every relaunch.
                if let Ok(Some(mut stored)) = self.repository.job_execution(execution_id) {
                    stored.upgrade_status(BatchStatus::Failed);
                    stored.end_time = Some(Utc::now());
                    if let Err(update) = self.repository.update_job_execution(&mut stored) {
                        error!(execution = %execution_id, error = %update, "could not mark unlaunched execution failed");
                    }
                }
                Err(BatchError::invariant(format!(
                    "failed to spawn job thread: {e}"
                )))
            }
        }
    }

    /// Ask a running execution to stop at its next chunk boundary.
    pub fn stop(&self, execution_id: JobExecutionId) -> BatchResult<()> {
        let mut stored = self
            .repository
            .job_execution(execution_id)?
            .ok_or_else(|| BatchError::not_found(format!("job execution {execution_id}")))?;
        if !stored.is_running() {
            return Err(BatchError::validation(format!(
                "job execution {execution_id} is not running ({:?})",
                stored.status()
            )));
        }

        stored.upgrade_status(BatchStatus::Stopping);
        self.repository.update_job_execution(&mut stored)?;
        if let Some(token) = self.running().get(&execution_id) {
            token.cancel(format!("stop requested for job execution {execution_id}"));
        }
        info!(execution = %execution_id, "stop requested");
        Ok(())
    }

    pub fn running_executions(&self) -> Vec<JobExecutionId> {
        self.running().keys().copied().collect()
    }
}
