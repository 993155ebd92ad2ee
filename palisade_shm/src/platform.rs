//! File-backed memory mappings.
//!
//! The arena lives in one file so external tools can attach it read-only
//! without any handshake with the running process. The writer maps it
//! shared-writable; readers map the same file shared-readonly.

use crate::error::{ShmError, ShmResult};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Minimum arena size, one page.
pub const MAP_MIN_SIZE: usize = 4096;

/// Create (or replace) the arena file and map it shared-writable.
pub fn create_map(path: &Path, size: usize) -> ShmResult<MmapMut> {
    if size < MAP_MIN_SIZE {
        return Err(ShmError::BadSize { size });
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)?;
    file.set_len(size as u64)?;

    let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
    Ok(mmap)
}

/// Attach an existing arena file read-only.
pub fn attach_map(path: &Path) -> ShmResult<Mmap> {
    if !path.exists() {
        return Err(ShmError::NotFound {
            path: path.display().to_string(),
        });
    }
    let file = OpenOptions::new().read(true).open(path)?;
    let len = file.metadata()?.len() as usize;
    if len < MAP_MIN_SIZE {
        return Err(ShmError::BadSize { size: len });
    }
    let mmap = unsafe { MmapOptions::new().len(len).map(&file)? };
    Ok(mmap)
}

/// Current process ID.
pub fn current_pid() -> u32 {
    nix::unistd::getpid().as_raw() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_attach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.map");

        let mut map = create_map(&path, 8192).unwrap();
        map[0] = 0xAB;
        map.flush().unwrap();

        let ro = attach_map(&path).unwrap();
        assert_eq!(ro[0], 0xAB);
        assert_eq!(ro.len(), 8192);
    }

    #[test]
    fn test_attach_missing() {
        let dir = tempfile::tempdir().unwrap();
        let r = attach_map(&dir.path().join("nope"));
        assert!(matches!(r, Err(ShmError::NotFound { .. })));
    }

    #[test]
    fn test_size_validation() {
        let dir = tempfile::tempdir().unwrap();
        let r = create_map(&dir.path().join("small"), 16);
        assert!(matches!(r, Err(ShmError::BadSize { .. })));
    }
}
