//! Failure model shared by every layer of the engine.
//!
//! Failures are plain values (`Clone + PartialEq`) so they can be recorded on
//! executions, carried across worker threads and asserted on in tests.

use thiserror::Error;

/// Result type used across the engine.
pub type BatchResult<T> = Result<T, BatchError>;

/// Engine-level failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// Failure raised by caller-supplied work (readers, writers, chunk handlers).
    ///
    /// `kind` is the stable label classifiers match on.
    #[error("{kind}: {message}")]
    Item { kind: String, message: String },

    /// Cooperative cancellation observed at a loop boundary.
    #[error("job interrupted: {0}")]
    Interrupted(String),

    /// A backoff pause was cut short by a cancellation request.
    #[error("backoff interrupted: {0}")]
    BackoffInterrupted(String),

    /// The system of record could not be read or written.
    #[error("repository failure: {0}")]
    Repository(String),

    /// A transaction could not be started or committed.
    #[error("transaction failure: {0}")]
    Transaction(String),

    /// A transaction could not be rolled back.
    #[error("rollback failure: {0}")]
    Rollback(String),

    /// A cleanup action registered on an iteration context failed.
    #[error("cleanup failure: {0}")]
    Cleanup(String),

    /// Progress can no longer be trusted (persistence or commit failed mid-chunk).
    #[error("fatal: {0}")]
    Fatal(Box<BatchError>),

    #[error("job instance already complete: {0}")]
    JobInstanceAlreadyComplete(String),

    #[error("job execution already running: {0}")]
    JobExecutionAlreadyRunning(String),

    #[error("job restart refused: {0}")]
    JobRestart(String),

    /// A skippable item failure arrived after the skip limit was used up.
    #[error("skip limit of {limit} exceeded: {cause}")]
    SkipLimitExceeded { limit: u64, cause: Box<BatchError> },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Precedence used when two failures compete for the same exit path.
///
/// Fatal outranks interruption, which outranks ordinary (rollback-triggering)
/// failures, which outrank cleanup failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Cleanup,
    Recoverable,
    Interruption,
    Fatal,
}

impl BatchError {
    pub fn item(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Item {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn interrupted(reason: impl Into<String>) -> Self {
        Self::Interrupted(reason.into())
    }

    pub fn backoff_interrupted(reason: impl Into<String>) -> Self {
        Self::BackoffInterrupted(reason.into())
    }

    pub fn repository(msg: impl Into<String>) -> Self {
        Self::Repository(msg.into())
    }

    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    pub fn rollback(msg: impl Into<String>) -> Self {
        Self::Rollback(msg.into())
    }

    pub fn cleanup(msg: impl Into<String>) -> Self {
        Self::Cleanup(msg.into())
    }

    /// Wrap a failure as fatal. Already-fatal failures are not wrapped twice.
    pub fn fatal(cause: BatchError) -> Self {
        match cause {
            fatal @ Self::Fatal(_) => fatal,
            other => Self::Fatal(Box::new(other)),
        }
    }

    pub fn skip_limit_exceeded(limit: u64, cause: BatchError) -> Self {
        Self::SkipLimitExceeded {
            limit,
            cause: Box::new(cause),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Stable label for classification.
    pub fn kind(&self) -> &str {
        match self {
            Self::Item { kind, .. } => kind,
            Self::Interrupted(_) => "interrupted",
            Self::BackoffInterrupted(_) => "backoff_interrupted",
            Self::Repository(_) => "repository",
            Self::Transaction(_) => "transaction",
            Self::Rollback(_) => "rollback",
            Self::Cleanup(_) => "cleanup",
            Self::Fatal(_) => "fatal",
            Self::JobInstanceAlreadyComplete(_) => "job_instance_already_complete",
            Self::JobExecutionAlreadyRunning(_) => "job_execution_already_running",
            Self::JobRestart(_) => "job_restart",
            Self::SkipLimitExceeded { .. } => "skip_limit_exceeded",
            Self::Validation(_) => "validation",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::NotFound(_) => "not_found",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Fatal(_) => Severity::Fatal,
            Self::Interrupted(_) | Self::BackoffInterrupted(_) => Severity::Interruption,
            Self::Cleanup(_) => Severity::Cleanup,
            _ => Severity::Recoverable,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn is_interruption(&self) -> bool {
        self.severity() == Severity::Interruption
    }

    /// Pick the failure to surface when `self` happened first and `later`
    /// followed on the same exit path.
    ///
    /// The more severe failure wins; on a tie the earlier one is kept so the
    /// original cause is never masked by a secondary error.
    pub fn prefer(self, later: BatchError) -> BatchError {
        if later.severity() > self.severity() {
            later
        } else {
            self
        }
    }

    /// The innermost cause of a fatal wrapper (or `self`).
    pub fn root_cause(&self) -> &BatchError {
        match self {
            Self::Fatal(inner) => inner.root_cause(),
            other => other,
        }
    }
}
