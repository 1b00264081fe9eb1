//! Task planning.
//!
//! Root selections are turned into a stream of `TransferUnit`s. Directories
//! are expanded depth-first and only when the controller asks for it, one
//! directory listing at a time, so planned totals grow while the job runs.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::classify::{Failure, IoOp};
use crate::error::ErrorKind;
use crate::external::MountInfo;
use crate::fs_ops;
use crate::model::{Entry, JobTotals, Operation, TransferUnit, UnitKind, UnitStep};

/// The next piece of work handed to the controller.
#[derive(Debug)]
pub enum Planned {
    Unit(TransferUnit),
    /// Post-order unit whose subtree was not fully handled; it must not run
    Blocked(TransferUnit),
    /// Root selection refused during pre-flight
    Rejected { unit: TransferUnit, failure: Failure },
    Exhausted,
}

struct Frame {
    root_index: usize,
    /// Depth of the children in this frame
    depth: usize,
    children: VecDeque<(PathBuf, fs::Metadata)>,
    dest_dir: Option<PathBuf>,
    finalize: Option<TransferUnit>,
    incomplete: bool,
}

pub struct TaskPlanner {
    operation: Operation,
    roots: Vec<Entry>,
    target: Option<PathBuf>,
    mounts: Arc<dyn MountInfo>,
    check_free_space: bool,
    next_root: usize,
    stack: Vec<Frame>,
}

impl TaskPlanner {
    pub fn new(
        operation: Operation,
        roots: Vec<Entry>,
        target: Option<PathBuf>,
        mounts: Arc<dyn MountInfo>,
    ) -> Self {
        TaskPlanner {
            operation,
            roots,
            target,
            mounts,
            check_free_space: false,
            next_root: 0,
            stack: Vec::new(),
        }
    }

    /// Refuse copied file roots that are larger than the target's free space.
    pub fn with_space_check(mut self, enabled: bool) -> Self {
        self.check_free_space = enabled;
        self
    }

    /// Produce the next unit, adding it to `totals.planned_*`.
    pub fn next_unit(&mut self, totals: &mut JobTotals) -> Planned {
        loop {
            if let Some(frame) = self.stack.last_mut() {
                if let Some((path, metadata)) = frame.children.pop_front() {
                    let kind = UnitKind::from(metadata.file_type());
                    let size = if kind == UnitKind::File { metadata.len() } else { 0 };
                    let destination = match (&frame.dest_dir, path.file_name()) {
                        (Some(dir), Some(name)) => Some(dir.join(name)),
                        _ => None,
                    };
                    totals.plan(size);
                    return Planned::Unit(TransferUnit::new(
                        frame.root_index,
                        path,
                        destination,
                        kind,
                        size,
                        frame.depth,
                    ));
                }

                let Some(frame) = self.stack.pop() else {
                    continue;
                };
                if frame.incomplete {
                    self.mark_incomplete();
                }
                match frame.finalize {
                    Some(unit) if frame.incomplete => return Planned::Blocked(unit),
                    Some(unit) => return Planned::Unit(unit),
                    None => continue,
                }
            }

            if self.next_root >= self.roots.len() {
                return Planned::Exhausted;
            }
            let index = self.next_root;
            self.next_root += 1;
            return self.plan_root(index, totals);
        }
    }

    /// Expand a directory unit whose own step completed.
    ///
    /// Children are written below `destination` (which may differ from the
    /// unit's own destination after KeepBoth). With `finalize`, a post-order
    /// unit for the directory follows its last child.
    pub fn descend(
        &mut self,
        unit: &TransferUnit,
        destination: Option<PathBuf>,
        finalize: bool,
    ) -> Result<(), Failure> {
        let children = fs_ops::list_children(&unit.source)
            .map_err(|e| Failure::io(IoOp::Open, &unit.source, &e))?;
        debug!(dir = %unit.source.display(), children = children.len(), "Expanded directory");

        let finalize = finalize.then(|| {
            let mut post = unit.clone().with_step(UnitStep::Finalize);
            post.destination = destination.clone();
            post
        });
        self.stack.push(Frame {
            root_index: unit.root_index,
            depth: unit.depth + 1,
            children: children.into(),
            dest_dir: destination,
            finalize,
            incomplete: false,
        });
        Ok(())
    }

    /// Record that the unit just handed out did not complete, so the
    /// enclosing directories must not be finalized.
    pub fn mark_incomplete(&mut self) {
        if let Some(frame) = self.stack.last_mut() {
            frame.incomplete = true;
        }
    }

    fn plan_root(&mut self, index: usize, totals: &mut JobTotals) -> Planned {
        let entry = self.roots[index].clone();
        let source = entry.path().to_path_buf();
        let destination = self.root_destination(&entry);

        let metadata = match fs::symlink_metadata(&source) {
            Ok(metadata) => metadata,
            Err(e) => {
                let failure = if e.kind() == io::ErrorKind::NotFound {
                    Failure::known(IoOp::Stat, ErrorKind::SourceMissing, &source, e.to_string())
                } else {
                    Failure::io(IoOp::Stat, &source, &e)
                };
                let unit = TransferUnit::new(index, source, destination, UnitKind::File, 0, 0)
                    .with_trash_record(entry.trash_record());
                totals.plan(0);
                return Planned::Rejected { unit, failure };
            }
        };

        let kind = UnitKind::from(metadata.file_type());
        let size = if kind == UnitKind::File { metadata.len() } else { 0 };
        let unit = TransferUnit::new(index, source, destination, kind, size, 0)
            .with_trash_record(entry.trash_record());
        totals.plan(size);

        match self.preflight(&unit) {
            Some(failure) => Planned::Rejected { unit, failure },
            None => Planned::Unit(unit),
        }
    }

    fn root_destination(&self, entry: &Entry) -> Option<PathBuf> {
        match (self.operation, entry) {
            (Operation::Restore, Entry::Trashed { original_path, .. }) => {
                match (&self.target, original_path.file_name()) {
                    (Some(target), Some(name)) => Some(target.join(name)),
                    _ => Some(original_path.clone()),
                }
            }
            (op, _) if op.requires_target() => {
                let name = entry.path().file_name()?;
                self.target.as_ref().map(|target| target.join(name))
            }
            _ => None,
        }
    }

    fn preflight(&self, unit: &TransferUnit) -> Option<Failure> {
        if !self.operation.writes_destination() {
            return None;
        }
        let Some(destination) = &unit.destination else {
            return Some(Failure::known(
                IoOp::Stat,
                ErrorKind::OpenFailed,
                &unit.source,
                "entry has no usable name",
            ));
        };

        let copies_tree = matches!(self.operation, Operation::Copy | Operation::Move);
        if copies_tree && unit.kind == UnitKind::Directory {
            let parent = destination.parent().unwrap_or(Path::new(""));
            if fs_ops::is_inside(parent, &unit.source) {
                return Some(Failure::known(
                    IoOp::Stat,
                    ErrorKind::TargetInsideSource,
                    &unit.source,
                    format!("{} is inside {}", parent.display(), unit.source.display()),
                ));
            }
        }

        let parent = destination.parent().unwrap_or(Path::new("."));
        if !self.mounts.is_target_writable(parent) {
            return Some(Failure::known(
                IoOp::Create,
                ErrorKind::TargetReadOnly,
                destination,
                format!("{} is on a read-only filesystem", parent.display()),
            ));
        }

        if self.check_free_space && self.operation == Operation::Copy && unit.kind == UnitKind::File {
            if let Ok(free) = self.mounts.free_space(parent) {
                if free < unit.size {
                    return Some(Failure::known(
                        IoOp::Create,
                        ErrorKind::TargetDiskFull,
                        destination,
                        format!("{} needs {} bytes, {} bytes free", unit.name(), unit.size, free),
                    ));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounts::SystemMounts;

    fn planner(op: Operation, roots: Vec<Entry>, target: Option<PathBuf>) -> TaskPlanner {
        TaskPlanner::new(op, roots, target, Arc::new(SystemMounts::new()))
    }

    fn expect_unit(planned: Planned) -> TransferUnit {
        match planned {
            Planned::Unit(unit) => unit,
            other => panic!("expected a unit, got {:?}", other),
        }
    }

    #[test]
    fn test_depth_first_with_lazy_totals() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        fs::create_dir_all(src.join("sub")).expect("Failed to create dirs");
        fs::write(src.join("a.txt"), "aaa").expect("Failed to write a");
        fs::write(src.join("sub").join("b.txt"), "bb").expect("Failed to write b");
        let dst = temp_dir.path().join("dst");

        let mut planner = planner(Operation::Copy, vec![Entry::regular(&src)], Some(dst.clone()));
        let mut totals = JobTotals::default();

        let root = expect_unit(planner.next_unit(&mut totals));
        assert_eq!(root.kind, UnitKind::Directory);
        assert_eq!(root.destination, Some(dst.join("src")));
        assert_eq!(totals.planned_bytes, 0);

        planner
            .descend(&root, root.destination.clone(), false)
            .expect("Failed to descend");
        let a = expect_unit(planner.next_unit(&mut totals));
        assert_eq!(a.destination, Some(dst.join("src").join("a.txt")));
        assert_eq!(a.depth, 1);
        assert_eq!(totals.planned_bytes, 3);

        let sub = expect_unit(planner.next_unit(&mut totals));
        assert_eq!(sub.kind, UnitKind::Directory);
        planner
            .descend(&sub, sub.destination.clone(), false)
            .expect("Failed to descend");
        let b = expect_unit(planner.next_unit(&mut totals));
        assert_eq!(b.size, 2);
        assert_eq!(totals.planned_bytes, 5);
        assert_eq!(totals.planned_items, 4);

        assert!(matches!(planner.next_unit(&mut totals), Planned::Exhausted));
    }

    #[test]
    fn test_target_inside_source_rejected() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        fs::create_dir_all(src.join("inner")).expect("Failed to create dirs");

        let mut planner = planner(Operation::Copy, vec![Entry::regular(&src)], Some(src.join("inner")));
        let mut totals = JobTotals::default();
        match planner.next_unit(&mut totals) {
            Planned::Rejected { failure, .. } => {
                assert_eq!(failure.kind, Some(ErrorKind::TargetInsideSource))
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    struct TightMounts {
        free: u64,
    }

    impl MountInfo for TightMounts {
        fn is_target_writable(&self, _path: &Path) -> bool {
            true
        }

        fn free_space(&self, _path: &Path) -> io::Result<u64> {
            Ok(self.free)
        }

        fn size_ceiling(&self, _path: &Path) -> Option<u64> {
            None
        }
    }

    #[test]
    fn test_free_space_checked_before_copy() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let big = temp_dir.path().join("big.bin");
        fs::write(&big, vec![0u8; 100]).expect("Failed to write");
        let dst = temp_dir.path().join("dst");
        let mounts: Arc<dyn MountInfo> = Arc::new(TightMounts { free: 10 });

        let mut planner = TaskPlanner::new(
            Operation::Copy,
            vec![Entry::regular(&big)],
            Some(dst.clone()),
            mounts.clone(),
        )
        .with_space_check(true);
        let mut totals = JobTotals::default();
        match planner.next_unit(&mut totals) {
            Planned::Rejected { failure, .. } => {
                assert_eq!(failure.kind, Some(ErrorKind::TargetDiskFull))
            }
            other => panic!("expected rejection, got {:?}", other),
        }

        let mut unchecked = TaskPlanner::new(Operation::Copy, vec![Entry::regular(&big)], Some(dst), mounts);
        expect_unit(unchecked.next_unit(&mut totals));
    }

    #[test]
    fn test_missing_root_does_not_stop_siblings() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let present = temp_dir.path().join("present.txt");
        fs::write(&present, "here").expect("Failed to write");
        let dst = temp_dir.path().join("dst");

        let mut planner = planner(
            Operation::Copy,
            vec![Entry::regular(temp_dir.path().join("gone.txt")), Entry::regular(&present)],
            Some(dst),
        );
        let mut totals = JobTotals::default();
        match planner.next_unit(&mut totals) {
            Planned::Rejected { failure, .. } => assert_eq!(failure.kind, Some(ErrorKind::SourceMissing)),
            other => panic!("expected rejection, got {:?}", other),
        }
        let unit = expect_unit(planner.next_unit(&mut totals));
        assert_eq!(unit.source, present);
    }

    #[test]
    fn test_finalize_blocked_by_incomplete_child() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dir = temp_dir.path().join("doomed");
        fs::create_dir_all(&dir).expect("Failed to create dir");
        fs::write(dir.join("keep.txt"), "k").expect("Failed to write");

        let mut planner = planner(Operation::Delete, vec![Entry::regular(&dir)], None);
        let mut totals = JobTotals::default();

        let root = expect_unit(planner.next_unit(&mut totals));
        assert_eq!(root.destination, None);
        planner.descend(&root, None, true).expect("Failed to descend");

        let child = expect_unit(planner.next_unit(&mut totals));
        assert_eq!(child.source, dir.join("keep.txt"));
        planner.mark_incomplete();

        match planner.next_unit(&mut totals) {
            Planned::Blocked(unit) => assert_eq!(unit.step, UnitStep::Finalize),
            other => panic!("expected a blocked finalize unit, got {:?}", other),
        }
        assert!(matches!(planner.next_unit(&mut totals), Planned::Exhausted));
    }

    #[test]
    fn test_finalize_follows_children() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dir = temp_dir.path().join("d");
        fs::create_dir_all(&dir).expect("Failed to create dir");
        fs::write(dir.join("x"), "x").expect("Failed to write");

        let mut planner = planner(Operation::Delete, vec![Entry::regular(&dir)], None);
        let mut totals = JobTotals::default();
        let root = expect_unit(planner.next_unit(&mut totals));
        planner.descend(&root, None, true).expect("Failed to descend");
        let _child = expect_unit(planner.next_unit(&mut totals));
        let post = expect_unit(planner.next_unit(&mut totals));
        assert_eq!(post.step, UnitStep::Finalize);
        assert_eq!(post.source, dir);
    }
}
