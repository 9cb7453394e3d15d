//! Step-level metadata: step executions and the per-chunk contribution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BatchError;
use crate::execution_context::ExecutionContext;
use crate::id::{JobExecutionId, StepExecutionId};
use crate::status::{BatchStatus, ExitStatus};

/// One attempt to run one step inside a job execution.
///
/// Counters only ever increase and the status only moves toward a terminal
/// state; both are mutated exclusively by the step executor while it holds the
/// execution synchronizer gate for this execution's id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    id: StepExecutionId,
    job_execution_id: JobExecutionId,
    step_name: String,
    status: BatchStatus,
    exit_status: ExitStatus,
    read_count: u64,
    write_count: u64,
    commit_count: u64,
    rollback_count: u64,
    read_skip_count: u64,
    process_skip_count: u64,
    write_skip_count: u64,
    filter_count: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub execution_context: ExecutionContext,
    terminate_only: bool,
    #[serde(skip)]
    failures: Vec<BatchError>,
}

impl StepExecution {
    pub fn new(step_name: impl Into<String>, job_execution_id: JobExecutionId) -> Self {
        Self {
            id: StepExecutionId::new(),
            job_execution_id,
            step_name: step_name.into(),
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            read_count: 0,
            write_count: 0,
            commit_count: 0,
            rollback_count: 0,
            read_skip_count: 0,
            process_skip_count: 0,
            write_skip_count: 0,
            filter_count: 0,
            start_time: None,
            end_time: None,
            last_updated: None,
            execution_context: ExecutionContext::new(),
            terminate_only: false,
            failures: Vec::new(),
        }
    }

    pub fn id(&self) -> StepExecutionId {
        self.id
    }

    pub fn job_execution_id(&self) -> JobExecutionId {
        self.job_execution_id
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    /// Move the status forward using [`BatchStatus::upgrade_to`].
    pub fn upgrade_status(&mut self, status: BatchStatus) {
        self.status = self.status.upgrade_to(status);
    }

    pub fn exit_status(&self) -> &ExitStatus {
        &self.exit_status
    }

    pub fn set_exit_status(&mut self, exit_status: ExitStatus) {
        self.exit_status = exit_status;
    }

    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    pub fn commit_count(&self) -> u64 {
        self.commit_count
    }

    pub fn rollback_count(&self) -> u64 {
        self.rollback_count
    }

    pub fn read_skip_count(&self) -> u64 {
        self.read_skip_count
    }

    pub fn process_skip_count(&self) -> u64 {
        self.process_skip_count
    }

    pub fn write_skip_count(&self) -> u64 {
        self.write_skip_count
    }

    pub fn filter_count(&self) -> u64 {
        self.filter_count
    }

    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    pub fn increment_commit_count(&mut self) {
        self.commit_count += 1;
    }

    pub fn increment_rollback_count(&mut self) {
        self.rollback_count += 1;
    }

    /// Ask the step to stop at the next chunk boundary.
    pub fn set_terminate_only(&mut self) {
        self.terminate_only = true;
    }

    pub fn is_terminate_only(&self) -> bool {
        self.terminate_only
    }

    pub fn failures(&self) -> &[BatchError] {
        &self.failures
    }

    pub fn add_failure(&mut self, error: BatchError) {
        self.failures.push(error);
    }

    /// Start a fresh write-ahead delta for one chunk.
    pub fn create_step_contribution(&self) -> StepContribution {
        StepContribution::new(self.id)
    }

    /// Fold a chunk's contribution into the aggregate counters.
    pub fn apply(&mut self, contribution: &StepContribution) {
        self.read_count += contribution.read_count;
        self.write_count += contribution.write_count;
        self.filter_count += contribution.filter_count;
        self.read_skip_count += contribution.read_skip_count;
        self.process_skip_count += contribution.process_skip_count;
        self.write_skip_count += contribution.write_skip_count;
        if let Some(exit) = &contribution.exit_status {
            self.exit_status = self.exit_status.clone().and(exit.clone());
        }
    }

    /// Restore counters, context and exit status from an earlier copy of the
    /// same execution. Identity, failures and the rollback count are kept.
    pub fn restore_from(&mut self, snapshot: &StepExecution) {
        debug_assert_eq!(self.id, snapshot.id);
        self.read_count = snapshot.read_count;
        self.write_count = snapshot.write_count;
        self.commit_count = snapshot.commit_count;
        self.read_skip_count = snapshot.read_skip_count;
        self.process_skip_count = snapshot.process_skip_count;
        self.write_skip_count = snapshot.write_skip_count;
        self.filter_count = snapshot.filter_count;
        self.exit_status = snapshot.exit_status.clone();
        self.execution_context = snapshot.execution_context.clone();
    }
}

/// Write-ahead delta produced by one chunk.
///
/// Applied to the owning [`StepExecution`] by the step executor, never by the
/// chunk handler itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepContribution {
    step_execution_id: StepExecutionId,
    read_count: u64,
    write_count: u64,
    filter_count: u64,
    read_skip_count: u64,
    process_skip_count: u64,
    write_skip_count: u64,
    exit_status: Option<ExitStatus>,
}

impl StepContribution {
    pub fn new(step_execution_id: StepExecutionId) -> Self {
        Self {
            step_execution_id,
            read_count: 0,
            write_count: 0,
            filter_count: 0,
            read_skip_count: 0,
            process_skip_count: 0,
            write_skip_count: 0,
            exit_status: None,
        }
    }

    pub fn step_execution_id(&self) -> StepExecutionId {
        self.step_execution_id
    }

    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    pub fn filter_count(&self) -> u64 {
        self.filter_count
    }

    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    pub fn read_skip_count(&self) -> u64 {
        self.read_skip_count
    }

    pub fn process_skip_count(&self) -> u64 {
        self.process_skip_count
    }

    pub fn write_skip_count(&self) -> u64 {
        self.write_skip_count
    }

    pub fn increment_read_count(&mut self) {
        self.read_count += 1;
    }

    pub fn increment_read_count_by(&mut self, n: u64) {
        self.read_count += n;
    }

    pub fn increment_write_count(&mut self, n: u64) {
        self.write_count += n;
    }

    pub fn increment_filter_count(&mut self) {
        self.filter_count += 1;
    }

    pub fn increment_read_skip_count(&mut self) {
        self.read_skip_count += 1;
    }

    pub fn increment_process_skip_count(&mut self) {
        self.process_skip_count += 1;
    }

    pub fn increment_write_skip_count(&mut self) {
        self.write_skip_count += 1;
    }

    pub fn exit_status(&self) -> Option<&ExitStatus> {
        self.exit_status.as_ref()
    }

    pub fn set_exit_status(&mut self, exit_status: ExitStatus) {
        self.exit_status = Some(exit_status);
    }
}
