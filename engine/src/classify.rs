//! Failure classification.
//!
//! Raw I/O failures are mapped onto the `ErrorKind` taxonomy together with a
//! suggested recovery. The mount layer is consulted to explain generic write
//! failures as a full or read-only target.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::trace;

use crate::config::ErrorPolicy;
use crate::error::ErrorKind;
use crate::external::MountInfo;

/// The filesystem call that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    /// Reading source metadata
    Stat,
    /// Opening the source for reading
    Open,
    /// Creating the destination (or its partial file)
    Create,
    Read,
    Write,
    CreateDirectory,
    Delete,
    Move,
    Symlink,
    Trash,
    Restore,
    Verify,
}

impl IoOp {
    /// Calls whose `NotFound` means the source went away.
    fn touches_source(&self) -> bool {
        matches!(
            self,
            IoOp::Stat | IoOp::Open | IoOp::Delete | IoOp::Move | IoOp::Trash | IoOp::Restore
        )
    }

    /// Calls that write into the destination filesystem.
    fn writes_target(&self) -> bool {
        matches!(
            self,
            IoOp::Create | IoOp::Write | IoOp::CreateDirectory | IoOp::Symlink | IoOp::Restore
        )
    }

    fn default_kind(&self) -> ErrorKind {
        match self {
            IoOp::Stat | IoOp::Open => ErrorKind::OpenFailed,
            IoOp::Create | IoOp::Write => ErrorKind::WriteFailed,
            IoOp::Read => ErrorKind::ReadFailed,
            IoOp::CreateDirectory => ErrorKind::CreateDirectoryFailed,
            IoOp::Delete | IoOp::Trash => ErrorKind::DeleteFailed,
            IoOp::Move | IoOp::Restore => ErrorKind::MoveFailed,
            IoOp::Symlink => ErrorKind::SymlinkCreateFailed,
            IoOp::Verify => ErrorKind::IntegrityDamaged,
        }
    }
}

/// A unit-level failure before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub op: IoOp,
    pub path: PathBuf,
    /// Set when the engine already knows the kind (size ceiling, verification)
    pub kind: Option<ErrorKind>,
    pub cause: String,
    pub raw_os_error: Option<i32>,
    pub io_kind: Option<io::ErrorKind>,
}

impl Failure {
    pub fn io(op: IoOp, path: impl Into<PathBuf>, err: &io::Error) -> Self {
        Failure {
            op,
            path: path.into(),
            kind: None,
            cause: err.to_string(),
            raw_os_error: err.raw_os_error(),
            io_kind: Some(err.kind()),
        }
    }

    pub fn known(op: IoOp, kind: ErrorKind, path: impl Into<PathBuf>, cause: impl Into<String>) -> Self {
        Failure {
            op,
            path: path.into(),
            kind: Some(kind),
            cause: cause.into(),
            raw_os_error: None,
            io_kind: None,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}: {}", self.op, self.path.display(), self.cause)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestedRecovery {
    Retry,
    Skip,
    AbortJob,
    /// Suspend the job until the caller decides
    AskOperator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub transient: bool,
    pub action: SuggestedRecovery,
}

pub struct ErrorClassifier {
    policy: ErrorPolicy,
    mounts: Arc<dyn MountInfo>,
}

impl ErrorClassifier {
    pub fn new(policy: ErrorPolicy, mounts: Arc<dyn MountInfo>) -> Self {
        ErrorClassifier { policy, mounts }
    }

    /// Classify `failure`.
    ///
    /// `destination` is the unit's destination, if any; `remaining` is the
    /// number of bytes the job still has to write.
    pub fn classify(&self, failure: &Failure, destination: Option<&Path>, remaining: u64) -> Classification {
        let mut kind = match failure.kind {
            Some(kind) => kind,
            None => kind_of(failure),
        };

        if failure.kind.is_none() && failure.op.writes_target() {
            if let Some(dest) = destination {
                kind = self.explain(kind, dest, remaining);
            }
        }

        let transient = failure.kind.is_none() && is_transient(failure) && retryable_kind(kind);
        let action = if transient {
            SuggestedRecovery::Retry
        } else {
            self.escalation()
        };

        trace!(op = ?failure.op, path = %failure.path.display(), ?kind, transient, "Classified failure");
        Classification {
            kind,
            transient,
            action,
        }
    }

    /// What happens to a unit once retrying is no longer an option.
    pub fn escalation(&self) -> SuggestedRecovery {
        match self.policy {
            ErrorPolicy::Continue => SuggestedRecovery::Skip,
            ErrorPolicy::AbortOnFirstError => SuggestedRecovery::AbortJob,
            ErrorPolicy::Ask => SuggestedRecovery::AskOperator,
        }
    }

    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    /// Replace the policy for the rest of the job.
    pub fn set_policy(&mut self, policy: ErrorPolicy) {
        self.policy = policy;
    }

    fn explain(&self, kind: ErrorKind, dest: &Path, remaining: u64) -> ErrorKind {
        let generic = matches!(
            kind,
            ErrorKind::WriteFailed
                | ErrorKind::CreateDirectoryFailed
                | ErrorKind::SymlinkCreateFailed
                | ErrorKind::MoveFailed
                | ErrorKind::PermissionDenied
        );
        if !generic {
            return kind;
        }
        if !self.mounts.is_target_writable(dest) {
            return ErrorKind::TargetReadOnly;
        }
        if kind == ErrorKind::PermissionDenied {
            return kind;
        }
        match self.mounts.free_space(dest) {
            Ok(free) if free < remaining => ErrorKind::TargetDiskFull,
            _ => kind,
        }
    }
}

fn retryable_kind(kind: ErrorKind) -> bool {
    !matches!(
        kind,
        ErrorKind::PermissionDenied
            | ErrorKind::ActionDenied
            | ErrorKind::TargetReadOnly
            | ErrorKind::TargetDiskFull
            | ErrorKind::FileTooLarge
            | ErrorKind::SourceMissing
            | ErrorKind::TargetInsideSource
    )
}

fn kind_of(failure: &Failure) -> ErrorKind {
    if let Some(kind) = failure.raw_os_error.and_then(errno_kind) {
        return kind;
    }
    match failure.io_kind {
        Some(io::ErrorKind::PermissionDenied) => ErrorKind::PermissionDenied,
        Some(io::ErrorKind::NotFound) if failure.op.touches_source() => ErrorKind::SourceMissing,
        _ => failure.op.default_kind(),
    }
}

#[cfg(unix)]
fn errno_kind(code: i32) -> Option<ErrorKind> {
    match code {
        libc::EACCES => Some(ErrorKind::PermissionDenied),
        libc::EPERM => Some(ErrorKind::ActionDenied),
        libc::EROFS => Some(ErrorKind::TargetReadOnly),
        libc::ENOSPC | libc::EDQUOT => Some(ErrorKind::TargetDiskFull),
        libc::EFBIG => Some(ErrorKind::FileTooLarge),
        _ => None,
    }
}

#[cfg(not(unix))]
fn errno_kind(_code: i32) -> Option<ErrorKind> {
    None
}

#[cfg(unix)]
fn is_transient(failure: &Failure) -> bool {
    if let Some(code) = failure.raw_os_error {
        if matches!(code, libc::EAGAIN | libc::EBUSY | libc::EINTR | libc::ETIMEDOUT) {
            return true;
        }
    }
    transient_io_kind(failure.io_kind)
}

#[cfg(not(unix))]
fn is_transient(failure: &Failure) -> bool {
    transient_io_kind(failure.io_kind)
}

fn transient_io_kind(kind: Option<io::ErrorKind>) -> bool {
    matches!(
        kind,
        Some(io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut)
    )
}
