//! Error types for the job engine.
//!
//! `EngineError` covers job-level problems that prevent a job from being built
//! or driven. Failures of individual units are never `EngineError`s; they are
//! classified into an `ErrorKind` and appended to the job as `ErrorRecord`s.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{JobState, Operation, TransferUnit};

/// Errors that stop a job from being created or driven.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The job was given nothing to work on
    #[error("job has no root selections")]
    NoRoots,

    #[error("{operation} requires a target directory")]
    MissingTarget { operation: Operation },

    #[error("target is not a directory: {}", path.display())]
    TargetNotDirectory { path: PathBuf },

    /// Restore jobs only accept entries held by the trash backend
    #[error("{operation} cannot use entry {}", path.display())]
    UnsupportedEntry { operation: Operation, path: PathBuf },

    #[error("invalid job state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: JobState,
    },

    #[error("no conflict decision is pending")]
    NoPendingConflict,

    #[error("no error decision is pending")]
    NoPendingError,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("job worker is no longer running")]
    WorkerGone,

    #[error("job worker panicked")]
    WorkerPanicked,

    #[error("failed to start job worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

/// Taxonomy of unit-level failures.
///
/// The display strings are the user-facing wording shown next to a cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    PermissionDenied,
    ActionDenied,
    OpenFailed,
    ReadFailed,
    WriteFailed,
    CreateDirectoryFailed,
    DeleteFailed,
    MoveFailed,
    SourceMissing,
    /// Destination filesystem cannot hold files of 4 GiB or more
    FileTooLarge,
    TargetDiskFull,
    IntegrityDamaged,
    TargetReadOnly,
    TargetInsideSource,
    SymlinkCreateFailed,
}

impl ErrorKind {
    /// Failures detected before any unit work starts.
    pub fn is_preflight(&self) -> bool {
        matches!(self, ErrorKind::TargetInsideSource | ErrorKind::SourceMissing)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::PermissionDenied => "Permission error",
            ErrorKind::ActionDenied => "The action is denied",
            ErrorKind::OpenFailed => "Failed to open the file",
            ErrorKind::ReadFailed => "Failed to read the file",
            ErrorKind::WriteFailed => "Failed to write the file",
            ErrorKind::CreateDirectoryFailed => "Failed to create the directory",
            ErrorKind::DeleteFailed => "Failed to delete the file",
            ErrorKind::MoveFailed => "Failed to move the file",
            ErrorKind::SourceMissing => "Original file does not exist",
            ErrorKind::FileTooLarge => "Failed, file size must be less than 4GB",
            ErrorKind::TargetDiskFull => "Target disk doesn't have enough space",
            ErrorKind::IntegrityDamaged => "File integrity was damaged",
            ErrorKind::TargetReadOnly => "The target device is read only",
            ErrorKind::TargetInsideSource => "Target folder is inside the source folder",
            ErrorKind::SymlinkCreateFailed => "Fail to create symlink",
        };
        f.write_str(text)
    }
}

/// What the engine did about a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Recovery {
    /// Transient failure that succeeded after `attempts` retries
    Retried { attempts: u32 },
    /// The unit was given up and the job continued
    Skipped,
    /// The whole job was aborted
    Aborted,
}

/// Operator answer to a failed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorAction {
    /// Run the unit again from the start
    Retry,
    Skip,
    /// Stop the whole job
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDecision {
    pub action: ErrorAction,
    /// Stop asking: later failures get the same answer. Ignored for Retry.
    pub apply_to_all: bool,
}

impl ErrorDecision {
    pub fn once(action: ErrorAction) -> Self {
        ErrorDecision {
            action,
            apply_to_all: false,
        }
    }

    pub fn for_all(action: ErrorAction) -> Self {
        ErrorDecision {
            action,
            apply_to_all: true,
        }
    }
}

/// A failed unit the job is suspended on, waiting for an `ErrorDecision`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorQuery {
    pub kind: ErrorKind,
    pub unit: TransferUnit,
    pub cause: String,
    /// Attempts made on the unit so far
    pub attempts: u32,
}

impl fmt::Display for ErrorQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, cause: {}", self.kind, self.cause)
    }
}

/// A logged failure tied to one unit. Never mutated once appended.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub unit: TransferUnit,
    /// Underlying cause, kept for display
    pub cause: String,
    pub recovery: Recovery,
    /// Number of attempts made on the unit
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

impl ErrorRecord {
    pub(crate) fn new(
        kind: ErrorKind,
        unit: TransferUnit,
        cause: impl Into<String>,
        recovery: Recovery,
        attempts: u32,
    ) -> Self {
        ErrorRecord {
            kind,
            unit,
            cause: cause.into(),
            recovery,
            attempts,
            at: Utc::now(),
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, cause: {}", self.kind, self.cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UnitKind;

    #[test]
    fn test_record_display_carries_cause() {
        let unit = TransferUnit::new(0, PathBuf::from("/a"), None, UnitKind::File, 0, 0);
        let record = ErrorRecord::new(
            ErrorKind::OpenFailed,
            unit,
            "No such device",
            Recovery::Skipped,
            1,
        );
        assert_eq!(record.to_string(), "Failed to open the file, cause: No such device");
    }

    #[test]
    fn test_preflight_kinds() {
        assert!(ErrorKind::TargetInsideSource.is_preflight());
        assert!(ErrorKind::SourceMissing.is_preflight());
        assert!(!ErrorKind::WriteFailed.is_preflight());
    }

    #[test]
    fn test_engine_error_messages() {
        let err = EngineError::MissingTarget {
            operation: Operation::Copy,
        };
        assert_eq!(err.to_string(), "Copy requires a target directory");
        let err = EngineError::InvalidState {
            expected: "running",
            actual: JobState::Paused,
        };
        assert!(err.to_string().contains("paused"));
    }
}
