//! `MountInfo` backed by the operating system.
//!
//! Paths that do not exist yet (a target directory about to be created) are
//! answered for their nearest existing ancestor.

use std::io;
use std::path::{Path, PathBuf};

use crate::external::MountInfo;

/// FAT filesystems cannot hold files of 4 GiB or more.
pub const LEGACY_SIZE_CEILING: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounts;

impl SystemMounts {
    pub fn new() -> Self {
        SystemMounts
    }
}

/// Walk up from `path` until something exists on disk.
pub(crate) fn nearest_existing(path: &Path) -> Option<PathBuf> {
    let mut current = Some(path);
    while let Some(candidate) = current {
        if candidate.as_os_str().is_empty() {
            return Some(PathBuf::from("."));
        }
        if std::fs::symlink_metadata(candidate).is_ok() {
            return Some(candidate.to_path_buf());
        }
        current = candidate.parent();
    }
    None
}

#[cfg(unix)]
fn statvfs(path: &Path) -> io::Result<libc::statvfs> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))?;
    let mut stat: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();
    // SAFETY: c_path is NUL-terminated and stat points to writable storage.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: statvfs succeeded, so the struct is initialized.
    Ok(unsafe { stat.assume_init() })
}

#[cfg(target_os = "linux")]
fn filesystem_magic(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))?;
    let mut stat: MaybeUninit<libc::statfs> = MaybeUninit::uninit();
    // SAFETY: c_path is NUL-terminated and stat points to writable storage.
    let rc = unsafe { libc::statfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: statfs succeeded, so the struct is initialized.
    let stat = unsafe { stat.assume_init() };
    Ok(stat.f_type as u64)
}

#[cfg(target_os = "linux")]
const MSDOS_SUPER_MAGIC: u64 = 0x4d44;

impl MountInfo for SystemMounts {
    #[cfg(unix)]
    fn is_target_writable(&self, path: &Path) -> bool {
        let Some(existing) = nearest_existing(path) else {
            return false;
        };
        match statvfs(&existing) {
            Ok(stat) => (stat.f_flag as u64) & (libc::ST_RDONLY as u64) == 0,
            // Unknown: let the write itself report the real error.
            Err(_) => true,
        }
    }

    #[cfg(not(unix))]
    fn is_target_writable(&self, path: &Path) -> bool {
        nearest_existing(path)
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| !m.permissions().readonly())
            .unwrap_or(false)
    }

    #[cfg(unix)]
    fn free_space(&self, path: &Path) -> io::Result<u64> {
        let existing = nearest_existing(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no existing ancestor"))?;
        let stat = statvfs(&existing)?;
        Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
    }

    #[cfg(not(unix))]
    fn free_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(u64::MAX)
    }

    #[cfg(target_os = "linux")]
    fn size_ceiling(&self, path: &Path) -> Option<u64> {
        let existing = nearest_existing(path)?;
        match filesystem_magic(&existing) {
            Ok(MSDOS_SUPER_MAGIC) => Some(LEGACY_SIZE_CEILING),
            _ => None,
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn size_ceiling(&self, _path: &Path) -> Option<u64> {
        None
    }
}
