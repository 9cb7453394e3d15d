//! `forgebatch-core`: batch metadata and failure model.
//!
//! This crate contains the **data model** shared by every layer (no execution
//! machinery): identifiers, statuses, execution contexts, job/step executions
//! and the failure taxonomy.

pub mod cancellation;
pub mod error;
pub mod execution_context;
pub mod id;
pub mod job;
pub mod status;
pub mod step;

pub use cancellation::CancellationToken;
pub use error::{BatchError, BatchResult, Severity};
pub use execution_context::{ContextValue, ExecutionContext};
pub use id::{JobExecutionId, JobInstanceId, StepExecutionId};
pub use job::{JobExecution, JobInstance, JobParameter, JobParameters};
pub use status::{BatchStatus, ExitStatus, RepeatStatus};
pub use step::{StepContribution, StepExecution};
