// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host that refuses to delete or rename files while they are open
//!
//! Wraps [`StdHostFs`] and counts live file objects per path. Removing or
//! renaming a path with a non-zero count fails with `EACCES`, the way a
//! Windows host answers a delete of a file another process holds open.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::host::{HostDirEntry, HostFile, HostFs, HostMetadata, StdHostFs};
use crate::OpenOptions;

type OpenCounts = Arc<Mutex<HashMap<PathBuf, usize>>>;

#[derive(Clone, Debug, Default)]
pub struct ExclusiveHostFs {
    inner: StdHostFs,
    open: OpenCounts,
    refuse_renames: Arc<Mutex<bool>>,
}

impl ExclusiveHostFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_count(&self, path: &Path) -> usize {
        self.open.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    /// Make every rename fail with `EACCES`, even of closed files
    pub fn refuse_all_renames(&self, refuse: bool) {
        *self.refuse_renames.lock().unwrap() = refuse;
    }

    fn check_not_open(&self, path: &Path) -> io::Result<()> {
        if self.open_count(path) > 0 {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }
        Ok(())
    }
}

struct TrackedFile {
    inner: Box<dyn HostFile>,
    path: PathBuf,
    open: OpenCounts,
}

impl fmt::Debug for TrackedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedFile").field("path", &self.path).finish()
    }
}

impl Read for TrackedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for TrackedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for TrackedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl Drop for TrackedFile {
    fn drop(&mut self) {
        let mut open = self.open.lock().unwrap();
        if let Some(count) = open.get_mut(&self.path) {
            *count -= 1;
            if *count == 0 {
                open.remove(&self.path);
            }
        }
    }
}

impl HostFs for ExclusiveHostFs {
    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn metadata(&self, path: &Path) -> io::Result<HostMetadata> {
        self.inner.metadata(path)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        self.inner.read_link(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<HostDirEntry>> {
        self.inner.read_dir(path)
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.check_not_open(path)?;
        self.inner.remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_dir(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if *self.refuse_renames.lock().unwrap() {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }
        self.check_not_open(from)?;
        self.check_not_open(to)?;
        self.inner.rename(from, to)
    }

    fn open(&self, path: &Path, opts: &OpenOptions) -> io::Result<Box<dyn HostFile>> {
        let inner = self.inner.open(path, opts)?;
        *self.open.lock().unwrap().entry(path.to_path_buf()).or_insert(0) += 1;
        Ok(Box::new(TrackedFile {
            inner,
            path: path.to_path_buf(),
            open: self.open.clone(),
        }))
    }

    fn set_times(
        &self,
        path: &Path,
        accessed: Option<SystemTime>,
        modified: Option<SystemTime>,
    ) -> io::Result<()> {
        self.inner.set_times(path, accessed, modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{K_O_CREAT, K_O_RDWR};
    use tempfile::TempDir;

    #[test]
    fn refuses_delete_while_open() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f");
        let host = ExclusiveHostFs::new();

        let file = host.open(&path, &OpenOptions::from_guest_flags(K_O_RDWR | K_O_CREAT)).unwrap();
        assert_eq!(host.open_count(&path), 1);
        let err = host.remove_file(&path).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EACCES));

        drop(file);
        assert_eq!(host.open_count(&path), 0);
        host.remove_file(&path).unwrap();
    }
}
