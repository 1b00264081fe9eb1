//! Directory-backed trash.
//!
//! Entries are renamed into a single directory and tracked in an in-memory
//! index keyed by `TrashRecordId`. No metadata is written next to them.
//! Entries on another filesystem are copied in and then removed.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::external::{TrashBackend, TrashRecordId};
use crate::fs_ops::{self, RenameFn};
use crate::model::Entry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrashedItem {
    /// Location inside the trash directory
    pub stored: PathBuf,
    pub original: PathBuf,
    pub trashed_at: DateTime<Utc>,
}

pub struct DirectoryTrash {
    root: PathBuf,
    records: Mutex<HashMap<TrashRecordId, TrashedItem>>,
    rename: RenameFn,
}

impl fmt::Debug for DirectoryTrash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryTrash")
            .field("root", &self.root)
            .field("records", &self.len())
            .finish()
    }
}

impl DirectoryTrash {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryTrash {
            root: root.into(),
            records: Mutex::new(HashMap::new()),
            rename: fs_ops::rename_entry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn records(&self) -> MutexGuard<'_, HashMap<TrashRecordId, TrashedItem>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn item(&self, record: TrashRecordId) -> Option<TrashedItem> {
        self.records().get(&record).cloned()
    }

    /// The root selection a restore job needs for `record`.
    pub fn entry(&self, record: TrashRecordId) -> Option<Entry> {
        self.item(record).map(|item| Entry::Trashed {
            record,
            path: item.stored,
            original_path: item.original,
        })
    }

    /// Trashed items, oldest first.
    pub fn items(&self) -> Vec<(TrashRecordId, TrashedItem)> {
        let mut items: Vec<_> = self
            .records()
            .iter()
            .map(|(record, item)| (*record, item.clone()))
            .collect();
        items.sort_by(|a, b| a.1.trashed_at.cmp(&b.1.trashed_at));
        items
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    fn free_slot(&self, name: &OsString) -> PathBuf {
        let mut candidate = self.root.join(name);
        let mut n: u64 = 1;
        while fs::symlink_metadata(&candidate).is_ok() {
            let mut numbered = name.clone();
            numbered.push(format!(".{}", n));
            candidate = self.root.join(numbered);
            n += 1;
        }
        candidate
    }
}

impl TrashBackend for DirectoryTrash {
    fn move_to_trash(&self, path: &Path) -> io::Result<TrashRecordId> {
        let name = path.file_name().map(|n| n.to_os_string()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("cannot trash {}", path.display()))
        })?;
        fs::create_dir_all(&self.root)?;

        let original = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                fs::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf()).join(&name)
            }
            _ => path.to_path_buf(),
        };

        let stored = self.free_slot(&name);
        fs_ops::relocate_entry(path, &stored, self.rename)?;

        let record = TrashRecordId::new();
        debug!(src = %path.display(), stored = %stored.display(), %record, "Moved entry to trash");
        self.records().insert(
            record,
            TrashedItem {
                stored,
                original,
                trashed_at: Utc::now(),
            },
        );
        Ok(record)
    }

    fn restore_from_trash(&self, record: TrashRecordId, destination: &Path) -> io::Result<()> {
        let item = self.item(record).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("unknown trash record {}", record))
        })?;
        if fs::symlink_metadata(destination).is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", destination.display()),
            ));
        }
        fs_ops::relocate_entry(&item.stored, destination, self.rename)?;
        self.records().remove(&record);
        debug!(%record, dest = %destination.display(), "Restored entry from trash");
        Ok(())
    }
}
