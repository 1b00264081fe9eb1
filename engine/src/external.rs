//! Contracts for the collaborators the engine drives but does not own.
//!
//! - TrashBackend: relocates entries into (and back out of) a trash store
//! - MountInfo: answers writability, free space and size-ceiling questions
//!
//! The engine never mounts, unmounts or ejects anything; it only asks.

use std::fmt;
use std::io;
use std::path::Path;

use serde::Serialize;
use uuid::Uuid;

/// Identifier handed out by a trash backend for one trashed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TrashRecordId(Uuid);

impl TrashRecordId {
    pub fn new() -> Self {
        TrashRecordId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TrashRecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TrashRecordId {
    fn from(id: Uuid) -> Self {
        TrashRecordId(id)
    }
}

impl fmt::Display for TrashRecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trash storage. Each call is treated as a single executor operation.
///
/// Errors are plain `io::Error`s; the engine classifies them like any other
/// filesystem failure.
pub trait TrashBackend: Send + Sync {
    /// Move `path` into the trash and return the record that can restore it.
    fn move_to_trash(&self, path: &Path) -> io::Result<TrashRecordId>;

    /// Put a trashed entry back at `destination`, which must not exist.
    fn restore_from_trash(&self, record: TrashRecordId, destination: &Path) -> io::Result<()>;
}

/// Device/mount layer queries used for pre-flight checks and failure explanation.
pub trait MountInfo: Send + Sync {
    /// Whether the filesystem holding `path` accepts writes.
    fn is_target_writable(&self, path: &Path) -> bool;

    /// Bytes available to unprivileged writers on the filesystem holding `path`.
    fn free_space(&self, path: &Path) -> io::Result<u64>;

    /// Exclusive upper bound on file size for the filesystem holding `path`,
    /// or `None` when the filesystem has no practical limit.
    fn size_ceiling(&self, path: &Path) -> Option<u64>;
}

/// Trash backend for jobs that never trash anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTrash;

impl TrashBackend for NoTrash {
    fn move_to_trash(&self, path: &Path) -> io::Result<TrashRecordId> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no trash configured for {}", path.display()),
        ))
    }

    fn restore_from_trash(&self, record: TrashRecordId, _destination: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no trash configured to restore record {}", record),
        ))
    }
}
