// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Read-only zip archives overlaid on the guest namespace
//!
//! Archive content serves reads directly and is copied onto the native
//! filesystem the first time a node needs a real native presence. Paths
//! removed or renamed away are recorded as whiteouts so lazy discovery does
//! not bring them back.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io::{Read, Seek, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::Context;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::error::{Errno, FsResult};
use crate::host::HostFs;
use crate::tree::{join_path, normalize_path, parent_path};
use crate::types::{K_O_CREAT, K_O_TRUNC, K_O_WRONLY};
use crate::OpenOptions;

/// Seekable byte source an archive is read from
pub trait ArchiveSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> ArchiveSource for T {}

/// Non-owning reference to one archive member
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArchiveEntryRef {
    pub archive: usize,
    pub index: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// `None` for directories only implied by member paths
    pub member: Option<ArchiveEntryRef>,
    pub is_dir: bool,
    pub size: u64,
    pub mtime_ms: u64,
}

struct MountedArchive {
    mount: String,
    zip: ZipArchive<Box<dyn ArchiveSource>>,
}

#[derive(Default)]
pub struct ArchiveOverlay {
    archives: Vec<MountedArchive>,
    entries: HashMap<String, ArchiveEntry>,
    members: HashMap<ArchiveEntryRef, String>,
    children: HashMap<String, BTreeMap<String, bool>>,
    hidden: HashSet<String>,
    cache: HashMap<ArchiveEntryRef, Arc<[u8]>>,
}

impl fmt::Debug for ArchiveOverlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveOverlay")
            .field("archives", &self.archives.iter().map(|a| &a.mount).collect::<Vec<_>>())
            .field("entries", &self.entries.len())
            .field("hidden", &self.hidden)
            .finish()
    }
}

impl ArchiveOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }

    /// Index every member of `source` under the guest directory `mount`.
    /// Members already provided by an earlier archive are shadowed.
    pub fn mount(&mut self, mount: &str, source: Box<dyn ArchiveSource>) -> anyhow::Result<usize> {
        let mount = normalize_path(mount)
            .map_err(|_| anyhow::anyhow!("archive mount point must be absolute: {}", mount))?;
        let mut zip = ZipArchive::new(source).context("reading zip central directory")?;
        let archive = self.archives.len();

        self.add_dir_chain(&mount);
        let mut indexed = 0;
        for index in 0..zip.len() {
            let member = zip
                .by_index(index)
                .with_context(|| format!("reading zip member #{}", index))?;
            let Some(relative) = member.enclosed_name() else {
                warn!(name = member.name(), "skipping archive member with unsafe path");
                continue;
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            if relative.is_empty() {
                continue;
            }
            let Ok(path) = normalize_path(&join_path(&mount, &relative)) else {
                continue;
            };
            if path == "/" {
                continue;
            }
            let entry = ArchiveEntry {
                member: Some(ArchiveEntryRef { archive, index }),
                is_dir: member.is_dir(),
                size: if member.is_dir() { 0 } else { member.size() },
                mtime_ms: member.last_modified().map(zip_time_to_millis).unwrap_or(0),
            };
            self.add_dir_chain(parent_path(&path));
            self.link_child(&path, entry.is_dir);
            self.members.insert(ArchiveEntryRef { archive, index }, path.clone());
            self.entries.insert(path, entry);
            indexed += 1;
        }

        debug!(mount = %mount, members = indexed, "mounted archive");
        self.archives.push(MountedArchive { mount, zip });
        Ok(indexed)
    }

    fn add_dir_chain(&mut self, dir: &str) {
        let mut current = dir.to_string();
        loop {
            if !self.entries.contains_key(&current) {
                self.entries.insert(
                    current.clone(),
                    ArchiveEntry {
                        member: None,
                        is_dir: true,
                        size: 0,
                        mtime_ms: 0,
                    },
                );
            }
            if current == "/" {
                break;
            }
            self.link_child(&current, true);
            current = parent_path(&current).to_string();
        }
    }

    fn link_child(&mut self, path: &str, is_dir: bool) {
        let name = crate::tree::file_name(path).to_string();
        self.children.entry(parent_path(path).to_string()).or_default().insert(name, is_dir);
    }

    /// Whether `path` or one of its ancestors has been whited out
    pub fn is_hidden(&self, path: &str) -> bool {
        if self.hidden.is_empty() {
            return false;
        }
        let mut current = path;
        loop {
            if self.hidden.contains(current) {
                return true;
            }
            if current == "/" {
                return false;
            }
            current = parent_path(current);
        }
    }

    pub fn hide(&mut self, path: &str) {
        if self.entries.contains_key(path) {
            debug!(path, "hiding archive entry");
            self.hidden.insert(path.to_string());
        }
    }

    pub fn lookup(&self, path: &str) -> Option<&ArchiveEntry> {
        if self.is_hidden(path) {
            return None;
        }
        self.entries.get(path)
    }

    /// Visible children of an archive directory, as `(name, is_dir)`
    pub fn children(&self, path: &str) -> Vec<(String, bool)> {
        let Some(children) = self.children.get(path) else {
            return Vec::new();
        };
        children
            .iter()
            .filter(|(name, _)| !self.is_hidden(&join_path(path, name)))
            .map(|(name, is_dir)| (name.clone(), *is_dir))
            .collect()
    }

    pub fn entry_for(&self, member: ArchiveEntryRef) -> Option<&ArchiveEntry> {
        self.members.get(&member).and_then(|path| self.entries.get(path))
    }

    pub fn length(&self, member: ArchiveEntryRef) -> u64 {
        self.entry_for(member).map(|entry| entry.size).unwrap_or(0)
    }

    pub fn last_modified(&self, member: ArchiveEntryRef) -> u64 {
        self.entry_for(member).map(|entry| entry.mtime_ms).unwrap_or(0)
    }

    /// Decompressed member content, cached after the first read
    pub fn read_entry(&mut self, member: ArchiveEntryRef) -> FsResult<Arc<[u8]>> {
        if let Some(data) = self.cache.get(&member) {
            return Ok(data.clone());
        }
        let archive = self.archives.get_mut(member.archive).ok_or(Errno::NotFound)?;
        let mut file = archive.zip.by_index(member.index).map_err(|err| {
            warn!(?member, %err, "archive member unreadable");
            Errno::Io
        })?;
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)?;
        let data: Arc<[u8]> = data.into();
        self.cache.insert(member, data.clone());
        Ok(data)
    }

    /// Copy an archive member to `native`, creating parent directories first
    pub fn move_to_file_system(
        &mut self,
        host: &dyn HostFs,
        member: ArchiveEntryRef,
        native: &Path,
    ) -> FsResult<()> {
        if let Some(parent) = native.parent() {
            host.create_dir_all(parent)?;
        }
        let entry = self.entry_for(member).cloned().ok_or(Errno::NotFound)?;
        if entry.is_dir {
            host.create_dir_all(native)?;
            return Ok(());
        }

        let data = self.read_entry(member)?;
        let mut file =
            host.open(native, &OpenOptions::from_guest_flags(K_O_WRONLY | K_O_CREAT | K_O_TRUNC))?;
        file.write_all(&data)?;
        file.flush()?;
        drop(file);

        if entry.mtime_ms != 0 {
            let mtime = UNIX_EPOCH + Duration::from_millis(entry.mtime_ms);
            if let Err(err) = host.set_times(native, None, Some(mtime)) {
                debug!(?native, %err, "could not carry archive mtime over");
            }
        }
        debug!(?native, bytes = data.len(), "materialized archive member");
        Ok(())
    }
}

fn zip_time_to_millis(time: zip::DateTime) -> u64 {
    chrono::NaiveDate::from_ymd_opt(time.year() as i32, time.month() as u32, time.day() as u32)
        .and_then(|date| {
            date.and_hms_opt(time.hour() as u32, time.minute() as u32, time.second() as u32)
        })
        .map(|dt| dt.and_utc().timestamp_millis().max(0) as u64)
        .unwrap_or(0)
}
