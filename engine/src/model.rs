//! Core data model for file jobs.
//!
//! This module defines the main data structures for representing operations:
//! - JobDescriptor: the whole copy/move/trash/delete/restore/link operation
//! - TransferUnit: a single source-to-destination mapping within a job
//! - Entry: one root selection, either a regular path or a trashed item
//! - Operation, UnitKind, UnitStatus, JobState, ConflictPolicy: enums controlling behavior

use std::fmt;
use std::fs::FileType;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::external::TrashRecordId;

/// The operation a job performs on its root selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Copy entries; sources remain unchanged
    Copy,
    /// Move entries; sources are removed once the destination is intact
    Move,
    /// Relocate entries through the trash backend
    Trash,
    /// Unlink entries permanently
    Delete,
    /// Bring trashed entries back
    Restore,
    /// Create symbolic links pointing at the sources
    Symlink,
}

impl Operation {
    /// Operations that cannot run without a target directory.
    pub fn requires_target(&self) -> bool {
        matches!(self, Operation::Copy | Operation::Move | Operation::Symlink)
    }

    /// Operations whose units write under a destination path.
    pub fn writes_destination(&self) -> bool {
        matches!(
            self,
            Operation::Copy | Operation::Move | Operation::Symlink | Operation::Restore
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Copy => write!(f, "Copy"),
            Operation::Move => write!(f, "Move"),
            Operation::Trash => write!(f, "Trash"),
            Operation::Delete => write!(f, "Delete"),
            Operation::Restore => write!(f, "Restore"),
            Operation::Symlink => write!(f, "Link"),
        }
    }
}

/// A root selection handed to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Entry {
    /// A path somewhere on a regular filesystem
    Regular { path: PathBuf },
    /// An entry currently held by the trash backend
    Trashed {
        record: TrashRecordId,
        /// Where the trashed data lives now
        path: PathBuf,
        /// Where it lived before it was trashed
        original_path: PathBuf,
    },
}

impl Entry {
    pub fn regular(path: impl Into<PathBuf>) -> Self {
        Entry::Regular { path: path.into() }
    }

    /// Current location of the entry's data.
    pub fn path(&self) -> &Path {
        match self {
            Entry::Regular { path } | Entry::Trashed { path, .. } => path,
        }
    }

    pub fn trash_record(&self) -> Option<TrashRecordId> {
        match self {
            Entry::Regular { .. } => None,
            Entry::Trashed { record, .. } => Some(*record),
        }
    }
}

/// What a unit's source is on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitKind {
    File,
    Directory,
    Symlink,
}

impl From<FileType> for UnitKind {
    fn from(file_type: FileType) -> Self {
        if file_type.is_symlink() {
            UnitKind::Symlink
        } else if file_type.is_dir() {
            UnitKind::Directory
        } else {
            UnitKind::File
        }
    }
}

/// Where in a directory's lifetime a unit sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitStep {
    /// The regular work for the job's operation
    Transfer,
    /// Post-order cleanup once all children of a directory were handled
    Finalize,
}

/// The state of an individual unit within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitStatus {
    /// Not yet processed
    Pending,
    /// Work finished and verified
    Completed,
    /// Left alone by a conflict decision or because its children were incomplete
    Skipped,
    /// Error recorded; see the job's ErrorRecord list
    Failed,
    /// Interrupted by cancellation before completing
    Cancelled,
}

impl UnitStatus {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UnitStatus::Pending)
    }
}

/// One logical source-to-destination mapping.
///
/// Created by the planner; only its status changes afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct TransferUnit {
    pub id: Uuid,
    /// Index of the root selection this unit descends from
    pub root_index: usize,
    pub source: PathBuf,
    /// `None` for delete and trash units
    pub destination: Option<PathBuf>,
    pub kind: UnitKind,
    pub step: UnitStep,
    /// Size in bytes (0 for directories and symlinks)
    pub size: u64,
    /// 0 for root selections
    pub depth: usize,
    pub trash_record: Option<TrashRecordId>,
    status: UnitStatus,
}

impl TransferUnit {
    pub(crate) fn new(
        root_index: usize,
        source: PathBuf,
        destination: Option<PathBuf>,
        kind: UnitKind,
        size: u64,
        depth: usize,
    ) -> Self {
        TransferUnit {
            id: Uuid::new_v4(),
            root_index,
            source,
            destination,
            kind,
            step: UnitStep::Transfer,
            size,
            depth,
            trash_record: None,
            status: UnitStatus::Pending,
        }
    }

    pub(crate) fn with_step(mut self, step: UnitStep) -> Self {
        self.step = step;
        self
    }

    pub(crate) fn with_trash_record(mut self, record: Option<TrashRecordId>) -> Self {
        self.trash_record = record;
        self
    }

    pub fn status(&self) -> UnitStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: UnitStatus) {
        self.status = status;
    }

    /// Display name of the source entry.
    pub fn name(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source.display().to_string())
    }
}

/// The state of an entire job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// Created; selections not yet being worked on
    Planning,
    Running,
    Paused,
    /// Blocked on a conflict decision from the caller
    AwaitingConflictDecision,
    /// Blocked on the caller deciding what to do about a failed unit
    AwaitingErrorDecision,
    /// Every unit was processed (some may have failed or been skipped)
    Completed,
    Cancelled,
    /// Aborted by the error policy
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JobState::Planning => "planning",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::AwaitingConflictDecision => "awaiting conflict decision",
            JobState::AwaitingErrorDecision => "awaiting error decision",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// Standing policy for destination name collisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// No standing decision yet; the caller is asked
    #[default]
    Ask,
    Skip,
    Replace,
    KeepBoth,
    Merge,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::Ask => write!(f, "Ask"),
            ConflictPolicy::Skip => write!(f, "Skip"),
            ConflictPolicy::Replace => write!(f, "Replace"),
            ConflictPolicy::KeepBoth => write!(f, "KeepBoth"),
            ConflictPolicy::Merge => write!(f, "Merge"),
        }
    }
}

/// Cumulative byte and item counters.
///
/// `done_*` never exceeds `planned_*`: planned totals only grow, and each unit
/// contributes at most its own planned size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobTotals {
    pub planned_bytes: u64,
    pub planned_items: u64,
    /// Bytes accounted for, including those of skipped or failed units
    pub done_bytes: u64,
    pub done_items: u64,
    /// Bytes actually written to destinations
    pub transferred_bytes: u64,
}

impl JobTotals {
    pub(crate) fn plan(&mut self, size: u64) {
        self.planned_bytes = self.planned_bytes.saturating_add(size);
        self.planned_items += 1;
    }

    pub(crate) fn remaining_bytes(&self) -> u64 {
        self.planned_bytes.saturating_sub(self.done_bytes)
    }
}

/// Represents a whole operation.
#[derive(Debug)]
pub struct JobDescriptor {
    /// Unique identifier for this job
    pub id: Uuid,

    pub operation: Operation,

    /// Ordered root selections
    pub roots: Vec<Entry>,

    /// Target directory (absent for delete and trash)
    pub target: Option<PathBuf>,

    /// Standing conflict decision
    pub conflict_policy: ConflictPolicy,

    pub totals: JobTotals,

    /// Sequence number of the unit being processed
    pub current_unit: Option<u64>,

    pub state: JobState,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// End-of-job report.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub operation: Operation,
    pub state: JobState,
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub totals: JobTotals,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub errors: Vec<crate::error::ErrorRecord>,
}

impl JobSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.state == JobState::Failed
    }
}
