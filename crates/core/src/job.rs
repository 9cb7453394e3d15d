//! Job-level metadata: parameters, instances and executions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BatchError;
use crate::execution_context::{ContextValue, ExecutionContext};
use crate::id::{JobExecutionId, JobInstanceId};
use crate::status::{BatchStatus, ExitStatus};
use crate::step::StepExecution;

/// A single job parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    pub value: ContextValue,
    /// Identifying parameters take part in the job instance identity.
    pub identifying: bool,
}

/// Parameters a job is launched with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identifying parameter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.parameters.insert(
            key.into(),
            JobParameter {
                value: value.into(),
                identifying: true,
            },
        );
        self
    }

    /// Add a parameter that does not distinguish job instances.
    pub fn with_non_identifying(
        mut self,
        key: impl Into<String>,
        value: impl Into<ContextValue>,
    ) -> Self {
        self.parameters.insert(
            key.into(),
            JobParameter {
                value: value.into(),
                identifying: false,
            },
        );
        self
    }

    pub fn get(&self, key: &str) -> Option<&JobParameter> {
        self.parameters.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JobParameter)> {
        self.parameters.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Canonical representation of the identifying parameters.
    ///
    /// Two parameter sets with the same identity key address the same job
    /// instance.
    pub fn identity_key(&self) -> String {
        self.parameters
            .iter()
            .filter(|(_, p)| p.identifying)
            .map(|(k, p)| {
                let value = serde_json::to_string(&p.value).unwrap_or_default();
                format!("{k}={value}")
            })
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// "This job, run with these business parameters."
///
/// Immutable once created; shared by every execution (attempt) of the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    id: JobInstanceId,
    job_name: String,
    identity_key: String,
}

impl JobInstance {
    pub fn new(job_name: impl Into<String>, parameters: &JobParameters) -> Self {
        Self {
            id: JobInstanceId::new(),
            job_name: job_name.into(),
            identity_key: parameters.identity_key(),
        }
    }

    pub fn id(&self) -> JobInstanceId {
        self.id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn identity_key(&self) -> &str {
        &self.identity_key
    }
}

/// One attempt to run a [`JobInstance`].
///
/// Owns the step executions created during the attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    id: JobExecutionId,
    job_instance: JobInstance,
    parameters: JobParameters,
    status: BatchStatus,
    exit_status: ExitStatus,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub execution_context: ExecutionContext,
    step_executions: Vec<StepExecution>,
    #[serde(skip)]
    failures: Vec<BatchError>,
}

impl JobExecution {
    pub fn new(job_instance: JobInstance, parameters: JobParameters) -> Self {
        Self {
            id: JobExecutionId::new(),
            job_instance,
            parameters,
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            last_updated: None,
            execution_context: ExecutionContext::new(),
            step_executions: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn id(&self) -> JobExecutionId {
        self.id
    }

    pub fn job_instance(&self) -> &JobInstance {
        &self.job_instance
    }

    pub fn job_name(&self) -> &str {
        self.job_instance.job_name()
    }

    pub fn parameters(&self) -> &JobParameters {
        &self.parameters
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    /// Move the status forward; never regresses past a terminal state.
    pub fn upgrade_status(&mut self, status: BatchStatus) {
        self.status = self.status.upgrade_to(status);
    }

    /// Operator-driven status change (e.g. STOPPING), bypassing the merge rules.
    pub fn force_status(&mut self, status: BatchStatus) {
        self.status = status;
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running() && self.end_time.is_none()
    }

    pub fn is_stopping(&self) -> bool {
        self.status == BatchStatus::Stopping
    }

    pub fn exit_status(&self) -> &ExitStatus {
        &self.exit_status
    }

    pub fn set_exit_status(&mut self, exit_status: ExitStatus) {
        self.exit_status = exit_status;
    }

    /// Create a step execution owned by this job execution and return it.
    pub fn create_step_execution(&mut self, step_name: impl Into<String>) -> &mut StepExecution {
        let step = StepExecution::new(step_name, self.id);
        self.step_executions.push(step);
        let last = self.step_executions.len() - 1;
        &mut self.step_executions[last]
    }

    pub fn step_executions(&self) -> &[StepExecution] {
        &self.step_executions
    }

    pub fn step_execution(&self, step_name: &str) -> Option<&StepExecution> {
        self.step_executions
            .iter()
            .rev()
            .find(|s| s.step_name() == step_name)
    }

    pub fn failures(&self) -> &[BatchError] {
        &self.failures
    }

    pub fn add_failure(&mut self, error: BatchError) {
        self.failures.push(error);
    }

    /// All failures, including those recorded on step executions.
    pub fn all_failures(&self) -> Vec<BatchError> {
        let mut all = self.failures.clone();
        for step in &self.step_executions {
            for f in step.failures() {
                if !all.contains(f) {
                    all.push(f.clone());
                }
            }
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_key_ignores_non_identifying_parameters() {
        let a = JobParameters::new()
            .with("run.date", "2026-01-01")
            .with_non_identifying("chunk.hint", 10);
        let b = JobParameters::new()
            .with("run.date", "2026-01-01")
            .with_non_identifying("chunk.hint", 99);
        let c = JobParameters::new().with("run.date", "2026-01-02");

        assert_eq!(a.identity_key(), b.identity_key());
        assert_ne!(a.identity_key(), c.identity_key());
    }

    #[test]
    fn identity_key_distinguishes_value_types() {
        let text = JobParameters::new().with("n", "1");
        let number = JobParameters::new().with("n", 1);
        assert_ne!(text.identity_key(), number.identity_key());
    }

    #[test]
    fn step_executions_belong_to_the_job_execution() {
        let params = JobParameters::new().with("file", "a.csv");
        let instance = JobInstance::new("import", &params);
        let mut execution = JobExecution::new(instance, params);
        let job_id = execution.id();

        let step = execution.create_step_execution("load");
        assert_eq!(step.job_execution_id(), job_id);
        step.add_failure(BatchError::item("parse", "bad row"));

        assert_eq!(execution.step_executions().len(), 1);
        assert_eq!(execution.all_failures().len(), 1);
        assert!(execution.step_execution("load").is_some());
    }

    #[test]
    fn job_status_does_not_regress() {
        let params = JobParameters::new();
        let mut execution = JobExecution::new(JobInstance::new("job", &params), params);
        execution.upgrade_status(BatchStatus::Started);
        execution.upgrade_status(BatchStatus::Failed);
        execution.upgrade_status(BatchStatus::Completed);
        assert_eq!(execution.status(), BatchStatus::Failed);
    }
}
