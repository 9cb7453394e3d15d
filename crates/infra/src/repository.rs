//! Job repository: the system of record for executions.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use forgebatch_core::{
    BatchError, BatchStatus, ExecutionContext, JobExecution, JobExecutionId, JobInstance,
    JobInstanceId, JobParameters, StepExecution, StepExecutionId,
};

/// Repository abstraction.
///
/// Every update is idempotent by primary identity: saving the same execution
/// twice leaves one record holding the latest state.
pub trait JobRepository: Send + Sync {
    /// Create an execution for the instance addressed by `job_name` and the
    /// identifying `parameters`, creating the instance on first launch.
    ///
    /// A restart inherits the execution context of the previous execution.
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobExecution, RepositoryError>;

    /// Save the execution. A running execution picks up a STOPPING status
    /// recorded by an operator in the meantime.
    fn update_job_execution(&self, execution: &mut JobExecution) -> Result<(), RepositoryError>;

    /// Register a new step execution.
    fn add_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError>;

    /// Save the step execution (without its context). If the owning job
    /// execution is STOPPING, the step is flagged terminate-only.
    fn update_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError>;

    fn update_step_execution_context(&self, step: &StepExecution) -> Result<(), RepositoryError>;

    fn update_job_execution_context(&self, execution: &JobExecution)
    -> Result<(), RepositoryError>;

    /// Latest step execution of `step_name` across every execution of the
    /// instance, with its persisted context.
    fn last_step_execution(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>, RepositoryError>;

    fn step_execution_count(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<usize, RepositoryError>;

    fn last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, RepositoryError>;

    fn job_instance_exists(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<bool, RepositoryError>;

    fn job_execution(&self, id: JobExecutionId) -> Result<Option<JobExecution>, RepositoryError>;

    fn step_execution(&self, id: StepExecutionId)
    -> Result<Option<StepExecution>, RepositoryError>;
}

/// Repository error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("job execution not found: {0}")]
    JobExecutionNotFound(JobExecutionId),
    #[error("step execution not found: {0}")]
    StepExecutionNotFound(StepExecutionId),
    #[error("job instance already complete: {0}")]
    InstanceAlreadyComplete(String),
    #[error("job execution already running: {0}")]
    ExecutionAlreadyRunning(String),
    #[error("job restart refused: {0}")]
    RestartRefused(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<RepositoryError> for BatchError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::JobExecutionNotFound(_) | RepositoryError::StepExecutionNotFound(_) => {
                BatchError::not_found(e.to_string())
            }
            RepositoryError::InstanceAlreadyComplete(msg) => {
                BatchError::JobInstanceAlreadyComplete(msg)
            }
            RepositoryError::ExecutionAlreadyRunning(msg) => {
                BatchError::JobExecutionAlreadyRunning(msg)
            }
            RepositoryError::RestartRefused(msg) => BatchError::JobRestart(msg),
            RepositoryError::Storage(msg) => BatchError::repository(msg),
        }
    }
}

#[derive(Debug, Default)]
struct RepositoryState {
    instances: HashMap<(String, String), JobInstance>,
    job_executions: HashMap<JobExecutionId, JobExecution>,
    executions_by_instance: HashMap<JobInstanceId, Vec<JobExecutionId>>,
    step_executions: HashMap<StepExecutionId, StepExecution>,
    /// Registration order, for "latest step execution" lookups.
    step_order: Vec<(JobInstanceId, StepExecutionId)>,
    step_contexts: HashMap<StepExecutionId, ExecutionContext>,
    job_contexts: HashMap<JobExecutionId, ExecutionContext>,
}

impl RepositoryState {
    fn instance_key(job_name: &str, parameters: &JobParameters) -> (String, String) {
        (job_name.to_string(), parameters.identity_key())
    }

    fn last_execution_of(&self, instance: JobInstanceId) -> Option<&JobExecution> {
        self.executions_by_instance
            .get(&instance)?
            .iter()
            .rev()
            .find_map(|id| self.job_executions.get(id))
    }

    fn instance_of_step(&self, step: &StepExecution) -> Result<JobInstanceId, RepositoryError> {
        self.job_executions
            .get(&step.job_execution_id())
            .map(|e| e.job_instance().id())
            .ok_or(RepositoryError::JobExecutionNotFound(step.job_execution_id()))
    }

    fn with_persisted_context(&self, mut step: StepExecution) -> StepExecution {
        if let Some(ctx) = self.step_contexts.get(&step.id()) {
            step.execution_context = ctx.clone();
        }
        step
    }
}

/// In-memory repository (for tests and single-process runners).
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    state: RwLock<RepositoryState>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> RwLockReadGuard<'_, RepositoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RepositoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl JobRepository for InMemoryJobRepository {
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobExecution, RepositoryError> {
        let mut state = self.write();
        let key = RepositoryState::instance_key(job_name, parameters);

        let (instance, inherited) = match state.instances.get(&key).cloned() {
            Some(instance) => {
                let executions = state
                    .executions_by_instance
                    .get(&instance.id())
                    .map(|ids| ids.as_slice())
                    .unwrap_or_default();
                for id in executions {
                    let Some(previous) = state.job_executions.get(id) else {
                        continue;
                    };
                    match previous.status() {
                        s if s.is_running() => {
                            return Err(RepositoryError::ExecutionAlreadyRunning(format!(
                                "{job_name} ({})",
                                previous.id()
                            )));
                        }
                        BatchStatus::Completed | BatchStatus::Abandoned => {
                            return Err(RepositoryError::InstanceAlreadyComplete(format!(
                                "{job_name} [{}]",
                                instance.identity_key()
                            )));
                        }
                        BatchStatus::Unknown => {
                            return Err(RepositoryError::RestartRefused(format!(
                                "{job_name} execution {} ended UNKNOWN and needs manual inspection",
                                previous.id()
                            )));
                        }
                        _ => {}
                    }
                }
                let inherited = state
                    .last_execution_of(instance.id())
                    .map(|last| {
                        state
                            .job_contexts
                            .get(&last.id())
                            .cloned()
                            .unwrap_or_else(|| last.execution_context.clone())
                    })
                    .unwrap_or_default();
                (instance, inherited)
            }
            None => {
                let instance = JobInstance::new(job_name, parameters);
                state.instances.insert(key, instance.clone());
                (instance, ExecutionContext::new())
            }
        };

        let mut execution = JobExecution::new(instance.clone(), parameters.clone());
        execution.execution_context = inherited;
        execution.last_updated = Some(Utc::now());

        state
            .executions_by_instance
            .entry(instance.id())
            .or_default()
            .push(execution.id());
        state
            .job_contexts
            .insert(execution.id(), execution.execution_context.clone());
        state.job_executions.insert(execution.id(), execution.clone());
        Ok(execution)
    }

    fn update_job_execution(&self, execution: &mut JobExecution) -> Result<(), RepositoryError> {
        let mut state = self.write();
        let stored = state
            .job_executions
            .get(&execution.id())
            .ok_or(RepositoryError::JobExecutionNotFound(execution.id()))?;

        if execution.status().is_running() {
            execution.upgrade_status(stored.status());
        }
        execution.last_updated = Some(Utc::now());
        state.job_executions.insert(execution.id(), execution.clone());
        Ok(())
    }

    fn add_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        let mut state = self.write();
        let instance = state.instance_of_step(step)?;
        step.last_updated = Some(Utc::now());

        if state
            .step_executions
            .insert(step.id(), step.clone())
            .is_none()
        {
            state.step_order.push((instance, step.id()));
        }
        state
            .step_contexts
            .insert(step.id(), step.execution_context.clone());
        Ok(())
    }

    fn update_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        let mut state = self.write();
        if !state.step_executions.contains_key(&step.id()) {
            return Err(RepositoryError::StepExecutionNotFound(step.id()));
        }

        let stopping = state
            .job_executions
            .get(&step.job_execution_id())
            .is_some_and(|job| job.is_stopping());
        if stopping {
            step.set_terminate_only();
        }

        step.last_updated = Some(Utc::now());
        state.step_executions.insert(step.id(), step.clone());
        Ok(())
    }

    fn update_step_execution_context(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut state = self.write();
        if !state.step_executions.contains_key(&step.id()) {
            return Err(RepositoryError::StepExecutionNotFound(step.id()));
        }
        state
            .step_contexts
            .insert(step.id(), step.execution_context.clone());
        Ok(())
    }

    fn update_job_execution_context(
        &self,
        execution: &JobExecution,
    ) -> Result<(), RepositoryError> {
        let mut state = self.write();
        if !state.job_executions.contains_key(&execution.id()) {
            return Err(RepositoryError::JobExecutionNotFound(execution.id()));
        }
        state
            .job_contexts
            .insert(execution.id(), execution.execution_context.clone());
        Ok(())
    }

    fn last_step_execution(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let state = self.read();
        let last = state
            .step_order
            .iter()
            .rev()
            .filter(|(owner, _)| *owner == instance.id())
            .filter_map(|(_, id)| state.step_executions.get(id))
            .find(|step| step.step_name() == step_name)
            .cloned();
        Ok(last.map(|step| state.with_persisted_context(step)))
    }

    fn step_execution_count(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<usize, RepositoryError> {
        let state = self.read();
        Ok(state
            .step_order
            .iter()
            .filter(|(owner, _)| *owner == instance.id())
            .filter_map(|(_, id)| state.step_executions.get(id))
            .filter(|step| step.step_name() == step_name)
            .count())
    }

    fn last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        let state = self.read();
        let key = RepositoryState::instance_key(job_name, parameters);
        Ok(state
            .instances
            .get(&key)
            .and_then(|instance| state.last_execution_of(instance.id()))
            .cloned())
    }

    fn job_instance_exists(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<bool, RepositoryError> {
        let key = RepositoryState::instance_key(job_name, parameters);
        Ok(self.read().instances.contains_key(&key))
    }

    fn job_execution(&self, id: JobExecutionId) -> Result<Option<JobExecution>, RepositoryError> {
        let state = self.read();
        Ok(state.job_executions.get(&id).cloned().map(|mut execution| {
            if let Some(ctx) = state.job_contexts.get(&id) {
                execution.execution_context = ctx.clone();
            }
            execution
        }))
    }

    fn step_execution(
        &self,
        id: StepExecutionId,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let state = self.read();
        Ok(state
            .step_executions
            .get(&id)
            .cloned()
            .map(|step| state.with_persisted_context(step)))
    }
}

// Allow Arc<R> to be used as a repository.
impl<R: JobRepository + ?Sized> JobRepository for Arc<R> {
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobExecution, RepositoryError> {
        (**self).create_job_execution(job_name, parameters)
    }

    fn update_job_execution(&self, execution: &mut JobExecution) -> Result<(), RepositoryError> {
        (**self).update_job_execution(execution)
    }

    fn add_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        (**self).add_step_execution(step)
    }

    fn update_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        (**self).update_step_execution(step)
    }

    fn update_step_execution_context(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        (**self).update_step_execution_context(step)
    }

    fn update_job_execution_context(
        &self,
        execution: &JobExecution,
    ) -> Result<(), RepositoryError> {
        (**self).update_job_execution_context(execution)
    }

    fn last_step_execution(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        (**self).last_step_execution(instance, step_name)
    }

    fn step_execution_count(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<usize, RepositoryError> {
        (**self).step_execution_count(instance, step_name)
    }

    fn last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        (**self).last_job_execution(job_name, parameters)
    }

    fn job_instance_exists(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<bool, RepositoryError> {
        (**self).job_instance_exists(job_name, parameters)
    }

    fn job_execution(&self, id: JobExecutionId) -> Result<Option<JobExecution>, RepositoryError> {
        (**self).job_execution(id)
    }

    fn step_execution(
        &self,
        id: StepExecutionId,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        (**self).step_execution(id)
    }
}
