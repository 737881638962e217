// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host filesystem seam
//!
//! The native OS API consumed by the filesystem layer. [`StdHostFs`] is the
//! real implementation; tests substitute hosts with stricter semantics
//! (refusing to delete or rename files that are open).

use std::fmt;
use std::fs;
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::OpenOptions;

/// An open host file
pub trait HostFile: Read + Write + Seek + Send + fmt::Debug {}

impl<T: Read + Write + Seek + Send + fmt::Debug> HostFile for T {}

/// Host metadata subset the layer cares about
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostMetadata {
    pub len: u64,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub modified: Option<SystemTime>,
}

impl HostMetadata {
    pub fn file(len: u64) -> Self {
        Self {
            len,
            is_dir: false,
            is_symlink: false,
            modified: None,
        }
    }

    pub fn dir() -> Self {
        Self {
            len: 0,
            is_dir: true,
            is_symlink: false,
            modified: None,
        }
    }
}

/// Host directory entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostDirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Native filesystem operations
#[cfg_attr(test, mockall::automock)]
pub trait HostFs: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    /// Metadata without following a trailing symlink
    fn metadata(&self, path: &Path) -> io::Result<HostMetadata>;

    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    fn read_dir(&self, path: &Path) -> io::Result<Vec<HostDirEntry>>;

    fn create_dir(&self, path: &Path) -> io::Result<()>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn open(&self, path: &Path, opts: &OpenOptions) -> io::Result<Box<dyn HostFile>>;

    fn set_times(
        &self,
        path: &Path,
        accessed: Option<SystemTime>,
        modified: Option<SystemTime>,
    ) -> io::Result<()>;
}

/// `std::fs` backed host
#[derive(Clone, Copy, Debug, Default)]
pub struct StdHostFs;

impl HostFs for StdHostFs {
    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn metadata(&self, path: &Path) -> io::Result<HostMetadata> {
        let meta = fs::symlink_metadata(path)?;
        Ok(HostMetadata {
            len: meta.len(),
            is_dir: meta.is_dir(),
            is_symlink: meta.file_type().is_symlink(),
            modified: meta.modified().ok(),
        })
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<HostDirEntry>> {
        let mut result = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            result.push(HostDirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        Ok(result)
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn open(&self, path: &Path, opts: &OpenOptions) -> io::Result<Box<dyn HostFile>> {
        let mut std_opts = fs::OpenOptions::new();
        std_opts
            .read(opts.read)
            .write(opts.write && !opts.append)
            .append(opts.append)
            .truncate(opts.truncate);
        if opts.exclusive && opts.create {
            std_opts.create_new(true);
        } else {
            std_opts.create(opts.create);
        }
        let file = std_opts.open(path)?;
        Ok(Box::new(file))
    }

    fn set_times(
        &self,
        path: &Path,
        accessed: Option<SystemTime>,
        modified: Option<SystemTime>,
    ) -> io::Result<()> {
        let file = fs::File::open(path)?;
        let mut times = fs::FileTimes::new();
        if let Some(accessed) = accessed {
            times = times.set_accessed(accessed);
        }
        if let Some(modified) = modified {
            times = times.set_modified(modified);
        }
        file.set_times(times)
    }
}
