//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Listing a directory's children, one directory at a time
//! - Streaming file contents in chunks with a pause/cancel gate
//! - Verifying written output and carrying metadata over
//! - Creating parent directories and symbolic links
//! - Relocating whole entries across filesystems

use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use crate::checksums::{compute_file_checksum, ChecksumValue, StreamHasher};
use crate::classify::{Failure, IoOp};
use crate::error::ErrorKind;
use crate::mounts::nearest_existing;

/// Whether the chunk loop may go on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOutcome {
    pub bytes: u64,
    /// The gate asked to stop before the end of the source
    pub interrupted: bool,
}

/// List the direct children of `dir`, sorted by name.
///
/// Metadata is read without following symlinks.
pub fn list_children(dir: &Path) -> io::Result<Vec<(PathBuf, fs::Metadata)>> {
    let mut children = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = fs::symlink_metadata(&path)?;
        children.push((path, metadata));
    }
    children.sort_by(|a, b| a.0.file_name().cmp(&b.0.file_name()));
    Ok(children)
}

/// Longest file name, in bytes, the common filesystems accept.
pub const NAME_MAX: usize = 255;

const PART_SUFFIX: &str = ".part";

/// Signature of the rename step used for moves and the trash.
pub type RenameFn = fn(&Path, &Path) -> io::Result<()>;

pub fn rename_entry(from: &Path, to: &Path) -> io::Result<()> {
    fs::rename(from, to)
}

/// Hidden sibling that receives a file's bytes until it is verified.
///
/// Names that leave no room for the extra dot and suffix are replaced by a
/// digest of the name, so the partial always fits in `NAME_MAX`.
pub fn partial_path(dest: &Path) -> PathBuf {
    let file_name = dest.file_name().unwrap_or_default();
    let bytes = file_name.as_encoded_bytes();
    let mut name = OsString::from(".");
    if 1 + bytes.len() + PART_SUFFIX.len() <= NAME_MAX {
        name.push(file_name);
    } else {
        let digest = blake3::hash(bytes).to_hex();
        name.push("filejob-");
        name.push(&digest.as_str()[..32]);
    }
    name.push(PART_SUFFIX);
    dest.with_file_name(name)
}

/// Cut `name` down to at most `budget` bytes on a character boundary.
pub fn shorten_name(name: &OsStr, budget: usize) -> OsString {
    if name.as_encoded_bytes().len() <= budget {
        return name.to_os_string();
    }
    let lossy = name.to_string_lossy();
    let mut end = budget.min(lossy.len());
    while !lossy.is_char_boundary(end) {
        end -= 1;
    }
    OsString::from(&lossy[..end])
}

/// Stream `reader` into `writer` in `chunk_size` pieces.
///
/// `gate` is consulted before the first chunk and after every written chunk
/// with the number of bytes just written; returning `Flow::Stop` ends the
/// loop at that chunk boundary.
#[allow(clippy::too_many_arguments)]
pub fn copy_chunks<R: Read, W: Write>(
    reader: &mut R,
    src: &Path,
    writer: &mut W,
    dst: &Path,
    chunk_size: usize,
    mut hasher: Option<&mut StreamHasher>,
    gate: &mut dyn FnMut(u64) -> Flow,
) -> Result<CopyOutcome, Failure> {
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut bytes = 0u64;

    if gate(0) == Flow::Stop {
        return Ok(CopyOutcome {
            bytes,
            interrupted: true,
        });
    }

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Failure::io(IoOp::Read, src, &e)),
        };
        writer
            .write_all(&buffer[..n])
            .map_err(|e| Failure::io(IoOp::Write, dst, &e))?;
        if let Some(hasher) = hasher.as_deref_mut() {
            hasher.update(&buffer[..n]);
        }
        bytes += n as u64;

        if gate(n as u64) == Flow::Stop {
            writer.flush().map_err(|e| Failure::io(IoOp::Write, dst, &e))?;
            return Ok(CopyOutcome {
                bytes,
                interrupted: true,
            });
        }
    }

    writer.flush().map_err(|e| Failure::io(IoOp::Write, dst, &e))?;
    Ok(CopyOutcome {
        bytes,
        interrupted: false,
    })
}

/// Check a written file against what was read.
///
/// The size check always runs. When `expected` is given the written file is
/// hashed again and compared.
pub fn verify_written(
    written: &Path,
    copied: u64,
    source_size: u64,
    expected: Option<&ChecksumValue>,
    chunk_size: usize,
) -> Result<(), Failure> {
    let written_size = fs::metadata(written)
        .map_err(|e| Failure::io(IoOp::Verify, written, &e))?
        .len();
    if written_size != copied || copied != source_size {
        return Err(Failure::known(
            IoOp::Verify,
            ErrorKind::IntegrityDamaged,
            written,
            format!(
                "size mismatch: source has {} bytes, {} copied, {} on disk",
                source_size, copied, written_size
            ),
        ));
    }

    if let Some(expected) = expected {
        let actual = compute_file_checksum(written, expected.algorithm(), chunk_size)
            .map_err(|e| Failure::io(IoOp::Verify, written, &e))?;
        if &actual != expected {
            return Err(Failure::known(
                IoOp::Verify,
                ErrorKind::IntegrityDamaged,
                written,
                format!("checksum mismatch: expected {}, found {}", expected, actual),
            ));
        }
    }
    Ok(())
}

/// Carry modification time and permission bits from `source` onto `dst`.
pub fn preserve_metadata(source: &fs::Metadata, dst: &Path, mtime: bool) -> io::Result<()> {
    if mtime {
        filetime::set_file_mtime(dst, filetime::FileTime::from_last_modification_time(source))?;
    }
    fs::set_permissions(dst, source.permissions())
}

/// Ensure the parent directory of a path exists, creating it if necessary.
pub fn ensure_parent_dir_exists(path: &Path) -> io::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    // Skip if parent is empty path (relative root)
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} exists but is not a directory", parent.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(parent),
        Err(e) => Err(e),
    }
}

/// Remove a file, a symlink or a whole directory tree.
pub fn remove_entry(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copy a file, symlink or directory tree to `dst`, which must not exist.
///
/// Modification times are carried over; a half-copied `dst` is removed
/// again before the error is returned.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let result = copy_tree_inner(src, dst);
    if result.is_err() && fs::symlink_metadata(dst).is_ok() {
        let _ = remove_entry(dst);
    }
    result
}

fn copy_tree_inner(src: &Path, dst: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(src)?;
    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        return create_symlink(&fs::read_link(src)?, dst);
    }
    if file_type.is_dir() {
        fs::create_dir(dst)?;
        for (child, _) in list_children(src)? {
            if let Some(name) = child.file_name() {
                copy_tree_inner(&child, &dst.join(name))?;
            }
        }
        return fs::set_permissions(dst, metadata.permissions());
    }
    fs::copy(src, dst)?;
    filetime::set_file_mtime(dst, filetime::FileTime::from_last_modification_time(&metadata))
}

/// Rename `src` to `dst`, copying and then removing `src` when the two
/// are on different filesystems.
pub fn relocate_entry(src: &Path, dst: &Path, rename: RenameFn) -> io::Result<()> {
    match rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            copy_tree(src, dst)?;
            remove_entry(src)
        }
        Err(e) => Err(e),
    }
}

/// Whether `target` is `source` itself or lies somewhere below it.
///
/// Both paths are resolved through symlinks; a target that does not exist
/// yet is resolved through its nearest existing ancestor.
pub fn is_inside(target: &Path, source: &Path) -> bool {
    let Ok(source) = fs::canonicalize(source) else {
        return false;
    };
    let Some(target) = resolve(target) else {
        return false;
    };
    target.starts_with(&source)
}

fn resolve(path: &Path) -> Option<PathBuf> {
    let existing = nearest_existing(path)?;
    let mut resolved = fs::canonicalize(&existing).ok()?;
    let rest = path.strip_prefix(&existing).ok()?;
    for component in rest.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::ParentDir => {
                resolved.pop();
            }
            _ => {}
        }
    }
    Some(resolved)
}

/// Whether a rename failed only because it crossed filesystems.
#[cfg(unix)]
pub fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(windows)]
pub fn is_cross_device(err: &io::Error) -> bool {
    // ERROR_NOT_SAME_DEVICE
    err.raw_os_error() == Some(17)
}

#[cfg(not(any(unix, windows)))]
pub fn is_cross_device(_err: &io::Error) -> bool {
    false
}

/// Create a symbolic link at `link` pointing at `original`.
#[cfg(unix)]
pub fn create_symlink(original: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
pub fn create_symlink(original: &Path, link: &Path) -> io::Result<()> {
    if original.is_dir() {
        std::os::windows::fs::symlink_dir(original, link)
    } else {
        std::os::windows::fs::symlink_file(original, link)
    }
}

#[cfg(not(any(unix, windows)))]
pub fn create_symlink(_original: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks are not supported"))
}
