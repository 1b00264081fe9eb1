//! Per-unit work.
//!
//! `TransferExecutor::execute` performs exactly one unit: it never walks a
//! directory itself. Directory units report back whether (and where) their
//! children should be planned.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::checksums::StreamHasher;
use crate::classify::{Failure, IoOp};
use crate::config::EngineConfig;
use crate::conflict::{ConflictAction, ConflictQuery, Directive, EntryMeta};
use crate::error::ErrorKind;
use crate::external::{MountInfo, TrashBackend};
use crate::fs_ops::{self, Flow, RenameFn};
use crate::model::{Operation, TransferUnit, UnitKind, UnitStep};

/// Children of a completed directory unit that still need planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descend {
    /// Directory the children are written into
    pub destination: Option<PathBuf>,
    /// Whether a post-order step follows the children
    pub finalize: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Bytes written to the destination
    pub bytes: u64,
    pub descend: Option<Descend>,
}

impl Completion {
    fn done(bytes: u64) -> Self {
        Completion { bytes, descend: None }
    }

    fn descend(destination: Option<PathBuf>, finalize: bool) -> Self {
        Completion {
            bytes: 0,
            descend: Some(Descend {
                destination,
                finalize,
            }),
        }
    }
}

#[derive(Debug)]
pub enum UnitOutcome {
    Completed(Completion),
    Skipped,
    Failed(Failure),
    NeedsConflictDecision(ConflictQuery),
    /// Stopped at a chunk boundary by a cancel request
    Interrupted,
}

enum Halt {
    Failed(Failure),
    Interrupted,
}

impl From<Failure> for Halt {
    fn from(failure: Failure) -> Self {
        Halt::Failed(failure)
    }
}

impl From<Result<Completion, Halt>> for UnitOutcome {
    fn from(result: Result<Completion, Halt>) -> Self {
        match result {
            Ok(completion) => UnitOutcome::Completed(completion),
            Err(Halt::Failed(failure)) => UnitOutcome::Failed(failure),
            Err(Halt::Interrupted) => UnitOutcome::Interrupted,
        }
    }
}

pub struct TransferExecutor {
    operation: Operation,
    config: EngineConfig,
    trash: Arc<dyn TrashBackend>,
    mounts: Arc<dyn MountInfo>,
    rename: RenameFn,
}

impl TransferExecutor {
    pub fn new(
        operation: Operation,
        config: EngineConfig,
        trash: Arc<dyn TrashBackend>,
        mounts: Arc<dyn MountInfo>,
    ) -> Self {
        TransferExecutor {
            operation,
            config,
            trash,
            mounts,
            rename: fs_ops::rename_entry,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_rename(&mut self, rename: RenameFn) {
        self.rename = rename;
    }

    /// Perform one unit.
    ///
    /// `directive` is the resolved conflict outcome for this unit, if its
    /// destination was found occupied earlier. `gate` is called between
    /// chunks with the bytes just written.
    pub fn execute(
        &self,
        unit: &TransferUnit,
        directive: Option<&Directive>,
        gate: &mut dyn FnMut(u64) -> Flow,
    ) -> UnitOutcome {
        if unit.step == UnitStep::Finalize {
            return self.finalize(unit).into();
        }
        match self.operation {
            Operation::Delete => return self.delete(unit).into(),
            Operation::Trash => return self.trash(unit).into(),
            _ => {}
        }

        let Some(planned) = &unit.destination else {
            return UnitOutcome::Failed(Failure::known(
                IoOp::Create,
                ErrorKind::OpenFailed,
                &unit.source,
                "unit has no destination",
            ));
        };
        let (dest, action) = match directive {
            Some(directive) => (directive.destination.clone(), Some(directive.action)),
            None => (planned.clone(), None),
        };

        match action {
            Some(ConflictAction::Skip) => return UnitOutcome::Skipped,
            Some(ConflictAction::Merge) => {
                if let Ok(existing) = fs::symlink_metadata(&dest) {
                    if existing.is_dir() {
                        let finalize = self.operation == Operation::Move;
                        return UnitOutcome::Completed(Completion::descend(Some(dest), finalize));
                    }
                }
            }
            Some(ConflictAction::Replace) => {
                if let Ok(existing) = fs::symlink_metadata(&dest) {
                    if same_entry(&unit.source, &dest) {
                        return UnitOutcome::Skipped;
                    }
                    if !self.replaces_atomically(unit, &existing) {
                        if let Err(e) = fs_ops::remove_entry(&dest) {
                            return UnitOutcome::Failed(Failure::io(IoOp::Delete, &dest, &e));
                        }
                        debug!(dest = %dest.display(), "Removed entry being replaced");
                    }
                }
            }
            Some(ConflictAction::KeepBoth) => {}
            None => {
                if let Ok(existing) = fs::symlink_metadata(&dest) {
                    if self.operation == Operation::Move && same_entry(&unit.source, &dest) {
                        return UnitOutcome::Skipped;
                    }
                    return UnitOutcome::NeedsConflictDecision(self.query(unit, &dest, &existing));
                }
            }
        }

        let result = match self.operation {
            Operation::Copy => self.copy(unit, &dest, gate),
            Operation::Move => self.relocate(unit, &dest, gate),
            Operation::Restore => self.restore(unit, &dest),
            Operation::Symlink => self.link(unit, &dest),
            Operation::Delete | Operation::Trash => no_destination_step(unit),
        };
        result.into()
    }

    fn replaces_atomically(&self, unit: &TransferUnit, existing: &fs::Metadata) -> bool {
        matches!(self.operation, Operation::Copy | Operation::Move)
            && unit.kind == UnitKind::File
            && existing.is_file()
    }

    fn query(&self, unit: &TransferUnit, dest: &Path, existing: &fs::Metadata) -> ConflictQuery {
        let source = match self.operation {
            Operation::Symlink => EntryMeta {
                kind: UnitKind::Symlink,
                size: 0,
                modified: None,
            },
            _ => fs::symlink_metadata(&unit.source)
                .map(|m| EntryMeta::of(&m))
                .unwrap_or(EntryMeta {
                    kind: unit.kind,
                    size: unit.size,
                    modified: None,
                }),
        };
        ConflictQuery {
            unit_id: unit.id,
            source_name: unit.name(),
            dest_name: dest
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            source,
            dest: EntryMeta::of(existing),
            destination: dest.to_path_buf(),
        }
    }

    fn copy(
        &self,
        unit: &TransferUnit,
        dest: &Path,
        gate: &mut dyn FnMut(u64) -> Flow,
    ) -> Result<Completion, Halt> {
        match unit.kind {
            UnitKind::File => self.copy_file(unit, dest, gate).map(Completion::done),
            UnitKind::Directory => {
                create_directory(dest)?;
                Ok(Completion::descend(Some(dest.to_path_buf()), false))
            }
            UnitKind::Symlink => {
                self.copy_link(unit, dest)?;
                Ok(Completion::done(0))
            }
        }
    }

    /// Copy a regular file through its `.part` sibling.
    ///
    /// The destination name only ever holds a verified file.
    fn copy_file(
        &self,
        unit: &TransferUnit,
        dest: &Path,
        gate: &mut dyn FnMut(u64) -> Flow,
    ) -> Result<u64, Halt> {
        let source_meta =
            fs::metadata(&unit.source).map_err(|e| Failure::io(IoOp::Stat, &unit.source, &e))?;
        let size = source_meta.len();

        let parent = dest.parent().unwrap_or(Path::new("."));
        if let Some(ceiling) = self.mounts.size_ceiling(parent) {
            if size >= ceiling {
                return Err(Failure::known(
                    IoOp::Create,
                    ErrorKind::FileTooLarge,
                    dest,
                    format!(
                        "{} is {} bytes, the target filesystem only holds files below {} bytes",
                        unit.name(),
                        size,
                        ceiling
                    ),
                )
                .into());
            }
        }

        fs_ops::ensure_parent_dir_exists(dest)
            .map_err(|e| Failure::io(IoOp::CreateDirectory, parent, &e))?;
        let mut reader =
            File::open(&unit.source).map_err(|e| Failure::io(IoOp::Open, &unit.source, &e))?;
        let part = fs_ops::partial_path(dest);
        let mut writer = File::create(&part).map_err(|e| Failure::io(IoOp::Create, dest, &e))?;

        let mut hasher = self.config.verify.map(StreamHasher::new);
        let copied = fs_ops::copy_chunks(
            &mut reader,
            &unit.source,
            &mut writer,
            dest,
            self.config.chunk_size,
            hasher.as_mut(),
            gate,
        );
        drop(writer);

        let outcome = match copied {
            Ok(outcome) => outcome,
            Err(failure) => {
                self.discard_partial(&part, self.config.keep_partial_on_failure);
                return Err(failure.into());
            }
        };
        if outcome.interrupted {
            self.discard_partial(&part, self.config.keep_partial_on_cancel);
            return Err(Halt::Interrupted);
        }

        let source_size = reader.metadata().map(|m| m.len()).unwrap_or(size);
        let expected = hasher.map(StreamHasher::finalize);
        if let Err(failure) = fs_ops::verify_written(
            &part,
            outcome.bytes,
            source_size,
            expected.as_ref(),
            self.config.chunk_size,
        ) {
            self.discard_partial(&part, self.config.keep_partial_on_failure);
            return Err(failure.into());
        }

        if let Err(e) = fs_ops::preserve_metadata(&source_meta, &part, self.config.preserve_mtime) {
            warn!(dest = %dest.display(), error = %e, "Failed to carry metadata over");
        }
        fs::rename(&part, dest).map_err(|e| Failure::io(IoOp::Create, dest, &e))?;
        debug!(src = %unit.source.display(), dest = %dest.display(), bytes = outcome.bytes, "Copied file");
        Ok(outcome.bytes)
    }

    fn discard_partial(&self, part: &Path, keep: bool) {
        if keep {
            debug!(part = %part.display(), "Leaving partial file in place");
            return;
        }
        if let Err(e) = fs::remove_file(part) {
            warn!(part = %part.display(), error = %e, "Failed to remove partial file");
        }
    }

    fn copy_link(&self, unit: &TransferUnit, dest: &Path) -> Result<(), Failure> {
        let target =
            fs::read_link(&unit.source).map_err(|e| Failure::io(IoOp::Open, &unit.source, &e))?;
        ensure_parent(dest)?;
        fs_ops::create_symlink(&target, dest).map_err(|e| Failure::io(IoOp::Symlink, dest, &e))
    }

    /// Move by rename, falling back to copy, verify, delete across filesystems.
    fn relocate(
        &self,
        unit: &TransferUnit,
        dest: &Path,
        gate: &mut dyn FnMut(u64) -> Flow,
    ) -> Result<Completion, Halt> {
        ensure_parent(dest)?;
        let err = match (self.rename)(&unit.source, dest) {
            Ok(()) => {
                debug!(src = %unit.source.display(), dest = %dest.display(), "Renamed entry");
                return Ok(Completion::done(0));
            }
            Err(e) => e,
        };
        if !fs_ops::is_cross_device(&err) {
            return Err(Failure::io(IoOp::Move, &unit.source, &err).into());
        }

        debug!(src = %unit.source.display(), "Crossing filesystems, copying instead of renaming");
        match unit.kind {
            UnitKind::Directory => {
                create_directory(dest)?;
                Ok(Completion::descend(Some(dest.to_path_buf()), true))
            }
            UnitKind::File => {
                let bytes = self.copy_file(unit, dest, gate)?;
                remove_source(&unit.source)?;
                Ok(Completion::done(bytes))
            }
            UnitKind::Symlink => {
                self.copy_link(unit, dest)?;
                remove_source(&unit.source)?;
                Ok(Completion::done(0))
            }
        }
    }

    fn restore(&self, unit: &TransferUnit, dest: &Path) -> Result<Completion, Halt> {
        let Some(record) = unit.trash_record else {
            return Err(Failure::known(
                IoOp::Restore,
                ErrorKind::MoveFailed,
                &unit.source,
                "entry is not held by the trash",
            )
            .into());
        };
        ensure_parent(dest)?;
        self.trash
            .restore_from_trash(record, dest)
            .map_err(|e| Failure::io(IoOp::Restore, dest, &e))?;
        debug!(%record, dest = %dest.display(), "Restored entry");
        Ok(Completion::done(0))
    }

    fn link(&self, unit: &TransferUnit, dest: &Path) -> Result<Completion, Halt> {
        let original = fs::canonicalize(&unit.source).unwrap_or_else(|_| unit.source.clone());
        ensure_parent(dest)?;
        fs_ops::create_symlink(&original, dest).map_err(|e| Failure::io(IoOp::Symlink, dest, &e))?;
        Ok(Completion::done(0))
    }

    fn delete(&self, unit: &TransferUnit) -> Result<Completion, Halt> {
        if unit.kind == UnitKind::Directory {
            return Ok(Completion::descend(None, true));
        }
        remove_source(&unit.source)?;
        Ok(Completion::done(0))
    }

    fn trash(&self, unit: &TransferUnit) -> Result<Completion, Halt> {
        let record = self
            .trash
            .move_to_trash(&unit.source)
            .map_err(|e| Failure::io(IoOp::Trash, &unit.source, &e))?;
        debug!(src = %unit.source.display(), %record, "Trashed entry");
        Ok(Completion::done(0))
    }

    /// Post-order step: remove a directory whose children are all gone.
    fn finalize(&self, unit: &TransferUnit) -> Result<Completion, Halt> {
        if matches!(self.operation, Operation::Delete | Operation::Move) {
            fs::remove_dir(&unit.source).map_err(|e| Failure::io(IoOp::Delete, &unit.source, &e))?;
            debug!(dir = %unit.source.display(), "Removed emptied directory");
        }
        Ok(Completion::done(0))
    }
}

fn no_destination_step(unit: &TransferUnit) -> Result<Completion, Halt> {
    Err(Failure::known(
        IoOp::Stat,
        ErrorKind::ActionDenied,
        &unit.source,
        "operation has no destination step",
    )
    .into())
}

fn ensure_parent(dest: &Path) -> Result<(), Failure> {
    fs_ops::ensure_parent_dir_exists(dest).map_err(|e| {
        Failure::io(IoOp::CreateDirectory, dest.parent().unwrap_or(dest), &e)
    })
}

fn create_directory(dest: &Path) -> Result<(), Failure> {
    match fs::create_dir_all(dest) {
        Ok(()) => Ok(()),
        Err(e) => Err(Failure::io(IoOp::CreateDirectory, dest, &e)),
    }
}

fn remove_source(source: &Path) -> Result<(), Failure> {
    fs::remove_file(source).map_err(|e| Failure::io(IoOp::Delete, source, &e))
}

/// Whether two paths name the same directory entry.
fn same_entry(a: &Path, b: &Path) -> bool {
    let canonical_parent = |p: &Path| p.parent().and_then(|parent| fs::canonicalize(parent).ok());
    match (canonical_parent(a), canonical_parent(b)) {
        (Some(pa), Some(pb)) => pa == pb && a.file_name() == b.file_name(),
        _ => false,
    }
}
