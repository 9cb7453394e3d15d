//! Execution status, exit status and the per-iteration completion signal.

use serde::{Deserialize, Serialize};

use crate::error::BatchError;

/// Lifecycle status of a job or step execution.
///
/// Variants are declared in escalation order: merging two statuses with
/// [`BatchStatus::upgrade_to`] never moves an execution back to a less final
/// state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Completed,
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Abandoned,
    Unknown,
}

impl BatchStatus {
    /// Still in flight (no terminal outcome yet).
    pub fn is_running(self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }

    /// Terminal and not a success.
    pub fn is_unsuccessful(self) -> bool {
        self >= BatchStatus::Failed
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed
                | BatchStatus::Stopped
                | BatchStatus::Failed
                | BatchStatus::Abandoned
                | BatchStatus::Unknown
        )
    }

    /// Merge `other` into `self` without regressing.
    ///
    /// Past `STARTED` the more severe status wins. Below it, `COMPLETED` wins
    /// so a running execution can finish normally.
    pub fn upgrade_to(self, other: BatchStatus) -> BatchStatus {
        if self > BatchStatus::Started || other > BatchStatus::Started {
            return self.max(other);
        }
        if self == BatchStatus::Completed || other == BatchStatus::Completed {
            return BatchStatus::Completed;
        }
        self.max(other)
    }
}

impl core::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Abandoned => "ABANDONED",
            BatchStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Exit code plus a free-form description, reported when an execution ends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitStatus {
    exit_code: String,
    exit_description: String,
}

impl ExitStatus {
    pub const EXECUTING: &'static str = "EXECUTING";
    pub const COMPLETED: &'static str = "COMPLETED";
    pub const NOOP: &'static str = "NOOP";
    pub const STOPPED: &'static str = "STOPPED";
    pub const FAILED: &'static str = "FAILED";
    pub const UNKNOWN: &'static str = "UNKNOWN";

    pub fn new(exit_code: impl Into<String>) -> Self {
        Self {
            exit_code: exit_code.into(),
            exit_description: String::new(),
        }
    }

    pub fn executing() -> Self {
        Self::new(Self::EXECUTING)
    }

    pub fn completed() -> Self {
        Self::new(Self::COMPLETED)
    }

    pub fn noop() -> Self {
        Self::new(Self::NOOP)
    }

    pub fn stopped() -> Self {
        Self::new(Self::STOPPED)
    }

    pub fn failed() -> Self {
        Self::new(Self::FAILED)
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    pub fn exit_code(&self) -> &str {
        &self.exit_code
    }

    pub fn exit_description(&self) -> &str {
        &self.exit_description
    }

    pub fn is_running(&self) -> bool {
        self.exit_code == Self::EXECUTING
    }

    fn severity(&self) -> u8 {
        match self.exit_code.as_str() {
            Self::EXECUTING => 1,
            Self::COMPLETED => 2,
            Self::NOOP => 3,
            Self::STOPPED => 4,
            Self::FAILED => 5,
            Self::UNKNOWN => 6,
            _ => 7,
        }
    }

    /// Combine two exit statuses: the more severe code wins and the
    /// descriptions are concatenated.
    pub fn and(self, other: ExitStatus) -> ExitStatus {
        let description = other.exit_description.clone();
        let mut merged = if other.severity() > self.severity() {
            ExitStatus {
                exit_code: other.exit_code,
                exit_description: self.exit_description,
            }
        } else {
            self
        };
        merged.push_description(&description);
        merged
    }

    pub fn replace_exit_code(mut self, code: impl Into<String>) -> Self {
        self.exit_code = code.into();
        self
    }

    pub fn add_exit_description(mut self, description: impl AsRef<str>) -> Self {
        self.push_description(description.as_ref());
        self
    }

    /// Append the failure's message to the description.
    pub fn with_failure(self, error: &BatchError) -> Self {
        self.add_exit_description(error.to_string())
    }

    fn push_description(&mut self, description: &str) {
        if description.is_empty() || self.exit_description.contains(description) {
            return;
        }
        if !self.exit_description.is_empty() {
            self.exit_description.push_str("; ");
        }
        self.exit_description.push_str(description);
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        Self::executing()
    }
}

impl core::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.exit_description.is_empty() {
            write!(f, "{}", self.exit_code)
        } else {
            write!(f, "{} ({})", self.exit_code, self.exit_description)
        }
    }
}

/// Signal returned by one unit of work: more to do, or finished.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatStatus {
    Continuable,
    Finished,
}

impl RepeatStatus {
    pub fn continue_if(continuable: bool) -> Self {
        if continuable {
            RepeatStatus::Continuable
        } else {
            RepeatStatus::Finished
        }
    }

    pub fn is_continuable(self) -> bool {
        self == RepeatStatus::Continuable
    }

    /// Both must be continuable for the combination to be.
    pub fn and(self, continuable: bool) -> Self {
        Self::continue_if(self.is_continuable() && continuable)
    }
}
