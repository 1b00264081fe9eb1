//! Destination name collisions.
//!
//! The resolver never prompts anyone itself. When the job has no standing
//! policy it returns `None` from `standing_action` and the controller suspends
//! the job until a `ConflictDecision` is supplied.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use crate::fs_ops::{shorten_name, NAME_MAX};
use crate::model::{ConflictPolicy, Operation, UnitKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictAction {
    Skip,
    Replace,
    /// Write under a fresh disambiguated name
    KeepBoth,
    /// Descend into an existing directory and resolve children individually
    Merge,
}

impl From<ConflictAction> for ConflictPolicy {
    fn from(action: ConflictAction) -> Self {
        match action {
            ConflictAction::Skip => ConflictPolicy::Skip,
            ConflictAction::Replace => ConflictPolicy::Replace,
            ConflictAction::KeepBoth => ConflictPolicy::KeepBoth,
            ConflictAction::Merge => ConflictPolicy::Merge,
        }
    }
}

/// Answer from whoever handles a suspended conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDecision {
    pub action: ConflictAction,
    /// Make `action` the standing policy for the rest of the job
    pub apply_to_all: bool,
}

impl ConflictDecision {
    pub fn once(action: ConflictAction) -> Self {
        ConflictDecision {
            action,
            apply_to_all: false,
        }
    }

    pub fn for_all(action: ConflictAction) -> Self {
        ConflictDecision {
            action,
            apply_to_all: true,
        }
    }
}

/// What a caller needs to know about one side of a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryMeta {
    pub kind: UnitKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl EntryMeta {
    pub fn of(metadata: &fs::Metadata) -> Self {
        let kind = UnitKind::from(metadata.file_type());
        EntryMeta {
            kind,
            size: if kind == UnitKind::File { metadata.len() } else { 0 },
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        }
    }
}

/// A suspended collision, handed to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictQuery {
    pub unit_id: Uuid,
    pub source_name: String,
    pub dest_name: String,
    pub source: EntryMeta,
    pub dest: EntryMeta,
    /// The existing entry
    pub destination: PathBuf,
}

impl ConflictQuery {
    fn both_directories(&self) -> bool {
        self.source.kind == UnitKind::Directory && self.dest.kind == UnitKind::Directory
    }
}

/// The effective outcome of a conflict for the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub action: ConflictAction,
    /// Where the unit should now be written
    pub destination: PathBuf,
}

pub struct ConflictResolver {
    operation: Operation,
    copy_token: String,
    /// Last counter handed out per base name; `0` stands for the bare token
    issued: HashMap<PathBuf, u64>,
}

impl ConflictResolver {
    pub fn new(operation: Operation, copy_token: impl Into<String>) -> Self {
        ConflictResolver {
            operation,
            copy_token: copy_token.into(),
            issued: HashMap::new(),
        }
    }

    pub fn standing_action(&self, policy: ConflictPolicy) -> Option<ConflictAction> {
        match policy {
            ConflictPolicy::Ask => None,
            ConflictPolicy::Skip => Some(ConflictAction::Skip),
            ConflictPolicy::Replace => Some(ConflictAction::Replace),
            ConflictPolicy::KeepBoth => Some(ConflictAction::KeepBoth),
            ConflictPolicy::Merge => Some(ConflictAction::Merge),
        }
    }

    /// Take a caller decision, promoting it to the standing policy when asked to.
    pub fn apply(&self, policy: &mut ConflictPolicy, decision: ConflictDecision) -> ConflictAction {
        if decision.apply_to_all {
            *policy = decision.action.into();
        }
        decision.action
    }

    /// Turn `action` into what the executor actually does for `query`.
    ///
    /// Fails only when a KeepBoth candidate cannot be checked.
    pub fn directive(&mut self, action: ConflictAction, query: &ConflictQuery) -> io::Result<Directive> {
        let relocates_whole_entry = matches!(self.operation, Operation::Restore | Operation::Symlink);
        let action = match action {
            ConflictAction::Merge if relocates_whole_entry => ConflictAction::KeepBoth,
            ConflictAction::Replace if !relocates_whole_entry && query.both_directories() => {
                ConflictAction::Merge
            }
            ConflictAction::Merge if !query.both_directories() => ConflictAction::Replace,
            other => other,
        };

        let destination = if action == ConflictAction::KeepBoth {
            let is_dir = query.source.kind == UnitKind::Directory;
            self.keep_both_name(&query.destination, is_dir)?
        } else {
            query.destination.clone()
        };
        Ok(Directive { action, destination })
    }

    /// A name next to `dest` that does not exist yet.
    ///
    /// `a.txt` becomes `a (copy).txt`, then `a (copy 1).txt`, `a (copy 2).txt`
    /// and so on. Counters for the same base name only ever increase. The stem
    /// is shortened when the marked name would not fit in `NAME_MAX`.
    pub fn keep_both_name(&mut self, dest: &Path, is_dir: bool) -> io::Result<PathBuf> {
        let parent = dest.parent().map(Path::to_path_buf).unwrap_or_default();
        let (stem, extension) = split_name(dest, is_dir);

        let mut counter = match self.issued.get(dest) {
            Some(last) => last + 1,
            None => 0,
        };
        loop {
            let mut tail = if counter == 0 {
                OsString::from(format!(" ({})", self.copy_token))
            } else {
                OsString::from(format!(" ({} {})", self.copy_token, counter))
            };
            if let Some(ext) = &extension {
                tail.push(".");
                tail.push(ext);
            }
            let budget = NAME_MAX.saturating_sub(tail.as_encoded_bytes().len());
            let mut name = shorten_name(&stem, budget);
            name.push(&tail);

            let candidate = parent.join(&name);
            match fs::symlink_metadata(&candidate) {
                Ok(_) => counter += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    trace!(base = %dest.display(), candidate = %candidate.display(), counter, "Found free name");
                    self.issued.insert(dest.to_path_buf(), counter);
                    return Ok(candidate);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn split_name(path: &Path, is_dir: bool) -> (OsString, Option<OsString>) {
    let full = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    if is_dir {
        return (full, None);
    }
    match (path.file_stem(), path.extension()) {
        // An extension too long to keep beside the marker is treated as part of the stem
        (Some(stem), Some(ext)) if ext.len() < NAME_MAX / 2 => {
            (stem.to_os_string(), Some(ext.to_os_string()))
        }
        _ => (full, None),
    }
}
