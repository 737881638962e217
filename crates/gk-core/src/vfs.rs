// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Guest filesystem over a native directory with archive fallback
//!
//! Nodes are discovered lazily as paths resolve. Every mutation runs under
//! the single state lock, so one logical filesystem operation completes
//! before the next begins.

use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveOverlay, ArchiveSource};
use crate::config::KernelConfig;
use crate::error::{Errno, FsResult};
use crate::fault::FaultyHostFs;
use crate::host::{HostFile, HostFs, StdHostFs};
use crate::migration;
use crate::tree::{components, file_name, join_path, normalize_path, parent_path, NodeSpec, VirtualFsTree, VirtualNode};
use crate::types::{DT_DIR, DT_LNK, DT_REG, K_S_IEXEC, K_S_IREAD, K_S_IWRITE};
use crate::{DirEntry, HandleId, NodeAttributes, NodeId, OpenOptions};

/// What an open handle reads from
#[derive(Debug)]
pub(crate) enum HandleKind {
    /// Host file; `None` while parked for migration or after a failed reopen
    Native { file: Option<Box<dyn HostFile>> },
    /// Archive member served without touching the native filesystem
    Archive { data: Arc<[u8]>, position: u64 },
    Directory { entries: Vec<DirEntry>, cursor: usize },
}

#[derive(Debug)]
pub(crate) struct OpenHandle {
    pub(crate) node: NodeId,
    pub(crate) options: OpenOptions,
    pub(crate) kind: HandleKind,
}

#[derive(Debug)]
pub(crate) struct FsState {
    pub(crate) tree: VirtualFsTree,
    pub(crate) handles: HashMap<HandleId, OpenHandle>,
    pub(crate) archive: ArchiveOverlay,
    next_handle_id: u64,
}

impl FsState {
    fn allocate_handle_id(&mut self) -> HandleId {
        let id = HandleId::new(self.next_handle_id);
        self.next_handle_id += 1;
        id
    }
}

/// Map a guest path onto the native directory backing `/`
fn native_under(root: &Path, guest: &str) -> PathBuf {
    let relative = guest.trim_start_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

fn millis_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

pub struct KernelFs {
    config: KernelConfig,
    host: Arc<dyn HostFs>,
    state: Mutex<FsState>,
}

impl KernelFs {
    pub fn new(config: KernelConfig, host: Arc<dyn HostFs>) -> Self {
        let root = config.root.clone();
        Self {
            config,
            host,
            state: Mutex::new(FsState {
                tree: VirtualFsTree::new(root),
                handles: HashMap::new(),
                archive: ArchiveOverlay::new(),
                next_handle_id: 1,
            }),
        }
    }

    /// Build the filesystem described by `config`: std host (with fault
    /// injection when enabled) and every configured archive mounted.
    pub fn from_config(config: KernelConfig) -> anyhow::Result<Self> {
        let host: Arc<dyn HostFs> = match &config.faults {
            Some(policy) if policy.enabled => {
                info!(rules = policy.rules.len(), "host fault injection enabled");
                Arc::new(FaultyHostFs::new(StdHostFs, policy.clone()))
            }
            _ => Arc::new(StdHostFs),
        };
        host.create_dir_all(&config.root)
            .with_context(|| format!("creating guest root {:?}", config.root))?;

        let archives = config.archives.clone();
        let fs = Self::new(config, host);
        for archive in &archives {
            let file = std::fs::File::open(&archive.path)
                .with_context(|| format!("opening archive {:?}", archive.path))?;
            fs.add_archive(&archive.mount, Box::new(std::io::BufReader::new(file)))
                .with_context(|| format!("mounting archive {:?} at {}", archive.path, archive.mount))?;
        }
        info!(root = ?fs.config.root, archives = archives.len(), "guest filesystem ready");
        Ok(fs)
    }

    pub fn add_archive(&self, mount: &str, source: Box<dyn ArchiveSource>) -> anyhow::Result<()> {
        self.lock().archive.mount(mount, source)?;
        Ok(())
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, FsState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn native_path(&self, guest: &str) -> PathBuf {
        native_under(&self.config.root, guest)
    }

    // Resolution

    fn resolve_locked(&self, state: &mut FsState, path: &str) -> FsResult<NodeId> {
        let path = normalize_path(path)?;
        let mut current = state.tree.root();
        for name in components(&path) {
            current = self.child_locked(state, current, name)?;
        }
        Ok(current)
    }

    /// Child lookup that discovers the node from the host, then the archive
    fn child_locked(&self, state: &mut FsState, parent: NodeId, name: &str) -> FsResult<NodeId> {
        if let Some(id) = state.tree.child(parent, name) {
            return Ok(id);
        }
        let parent_node = state.tree.node(parent)?;
        if !parent_node.is_dir {
            return Err(Errno::NotADirectory);
        }
        let path = join_path(&parent_node.path, name);
        let native = parent_node.native_path.join(name);
        let archived = state.archive.lookup(&path).cloned();

        let spec = match self.host.metadata(&native) {
            Ok(meta) => NodeSpec {
                is_dir: meta.is_dir,
                link: if meta.is_symlink {
                    self.host
                        .read_link(&native)
                        .ok()
                        .map(|target| target.to_string_lossy().to_string())
                } else {
                    None
                },
                rdev: 0,
                native_path: native,
                archive: archived.and_then(|entry| entry.member),
            },
            Err(err) => match archived {
                Some(entry) => NodeSpec {
                    is_dir: entry.is_dir,
                    link: None,
                    rdev: 0,
                    native_path: native,
                    archive: entry.member,
                },
                None if err.kind() == std::io::ErrorKind::NotFound => return Err(Errno::NotFound),
                None => return Err(Errno::from(err)),
            },
        };
        debug!(path = %path, dir = spec.is_dir, archived = spec.archive.is_some(), "discovered node");
        state.tree.insert_child(parent, name, spec)
    }

    /// Merged host and archive listing; every entry is resolved into a node
    fn list_dir_locked(&self, state: &mut FsState, id: NodeId) -> FsResult<Vec<DirEntry>> {
        let node = state.tree.node(id)?;
        if !node.is_dir {
            return Err(Errno::NotADirectory);
        }
        let path = node.path.clone();
        let native = node.native_path.clone();

        let mut names: BTreeSet<String> = node.children.keys().cloned().collect();
        if let Ok(entries) = self.host.read_dir(&native) {
            names.extend(entries.into_iter().map(|entry| entry.name));
        }
        names.extend(state.archive.children(&path).into_iter().map(|(name, _)| name));

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let Ok(child) = self.child_locked(state, id, &name) else {
                continue;
            };
            let entry_type = node_type_of(state.tree.node(child)?, true);
            entries.push(DirEntry {
                name,
                node: child,
                entry_type,
            });
        }
        Ok(entries)
    }

    // Attributes

    /// Synthesized permission bits. Always readable and executable; writable
    /// for the superuser or under one of the configured writable prefixes.
    /// An approximation, not a permission model.
    fn mode_of(&self, node: &VirtualNode, uid: u32) -> u32 {
        let mut mode = K_S_IREAD | K_S_IEXEC | (node_type_of(node, false) << 12);
        if uid == 0
            || self
                .config
                .writable_prefixes
                .iter()
                .any(|prefix| node.path.starts_with(prefix.as_str()))
        {
            mode |= K_S_IWRITE;
        }
        mode
    }

    fn length_locked(&self, state: &FsState, id: NodeId) -> FsResult<u64> {
        let node = state.tree.node(id)?;
        if let Ok(meta) = self.host.metadata(&node.native_path) {
            return Ok(meta.len);
        }
        Ok(node.archive.map(|member| state.archive.length(member)).unwrap_or(0))
    }

    fn last_modified_locked(&self, state: &FsState, id: NodeId) -> FsResult<u64> {
        let node = state.tree.node(id)?;
        if let Ok(meta) = self.host.metadata(&node.native_path) {
            return Ok(meta.modified.map(millis_since_epoch).unwrap_or(0));
        }
        Ok(node.archive.map(|member| state.archive.last_modified(member)).unwrap_or(0))
    }

    pub fn stat(&self, path: &str, uid: u32) -> FsResult<NodeAttributes> {
        let mut state = self.lock();
        let id = self.resolve_locked(&mut state, path)?;
        let len = self.length_locked(&state, id)?;
        let mtime_ms = self.last_modified_locked(&state, id)?;
        let node = state.tree.node(id)?;
        Ok(NodeAttributes {
            id,
            rdev: node.rdev,
            is_dir: node.is_dir,
            is_link: node.is_link(),
            mode: self.mode_of(node, uid),
            len,
            mtime_ms,
        })
    }

    pub fn mode(&self, path: &str, uid: u32) -> FsResult<u32> {
        let mut state = self.lock();
        let id = self.resolve_locked(&mut state, path)?;
        Ok(self.mode_of(state.tree.node(id)?, uid))
    }

    pub fn length(&self, path: &str) -> FsResult<u64> {
        let mut state = self.lock();
        let id = self.resolve_locked(&mut state, path)?;
        self.length_locked(&state, id)
    }

    /// Modification time in milliseconds since the epoch, 0 when unknown
    pub fn last_modified(&self, path: &str) -> FsResult<u64> {
        let mut state = self.lock();
        let id = self.resolve_locked(&mut state, path)?;
        self.last_modified_locked(&state, id)
    }

    pub fn node_type(&self, path: &str, check_link: bool) -> FsResult<u32> {
        let mut state = self.lock();
        let id = self.resolve_locked(&mut state, path)?;
        Ok(node_type_of(state.tree.node(id)?, check_link))
    }

    pub fn list_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let mut state = self.lock();
        let id = self.resolve_locked(&mut state, path)?;
        self.list_dir_locked(&mut state, id)
    }

    pub fn native_path_of(&self, path: &str) -> FsResult<PathBuf> {
        let mut state = self.lock();
        let id = self.resolve_locked(&mut state, path)?;
        Ok(state.tree.node(id)?.native_path.clone())
    }

    pub fn open_handle_count(&self, path: &str) -> FsResult<usize> {
        let mut state = self.lock();
        let id = self.resolve_locked(&mut state, path)?;
        Ok(state.tree.node(id)?.open_handles.len())
    }

    // Materialization

    /// Give an archive-backed node a native presence. Directories are created
    /// (with their archived contents when `recursive`); files are extracted
    /// after their parent directories.
    fn ensure_local_locked(&self, state: &mut FsState, id: NodeId, recursive: bool) -> FsResult<()> {
        let node = state.tree.node(id)?;
        let path = node.path.clone();
        let native = node.native_path.clone();
        if node.is_dir {
            return self.materialize_dir(state, &path, &native, recursive);
        }
        if self.host.exists(&native) {
            return Ok(());
        }
        match node.archive {
            Some(member) => state.archive.move_to_file_system(self.host.as_ref(), member, &native),
            None => Ok(()),
        }
    }

    fn materialize_dir(&self, state: &mut FsState, path: &str, native: &Path, recursive: bool) -> FsResult<()> {
        if state.archive.lookup(path).is_none() {
            return Ok(());
        }
        if !self.host.exists(native) {
            debug!(path, "creating archived directory natively");
            self.host.create_dir_all(native)?;
        }
        if !recursive {
            return Ok(());
        }
        for (name, is_dir) in state.archive.children(path) {
            let child_path = join_path(path, &name);
            let child_native = native.join(&name);
            if is_dir {
                self.materialize_dir(state, &child_path, &child_native, true)?;
            } else if !self.host.exists(&child_native) {
                if let Some(member) = state.archive.lookup(&child_path).and_then(|entry| entry.member) {
                    state.archive.move_to_file_system(self.host.as_ref(), member, &child_native)?;
                }
            }
        }
        Ok(())
    }

    pub fn ensure_local(&self, path: &str) -> FsResult<()> {
        let mut state = self.lock();
        let id = self.resolve_locked(&mut state, path)?;
        self.ensure_local_locked(&mut state, id, false)
    }

    // Open / handle I/O

    pub fn open(&self, path: &str, flags: u32) -> FsResult<HandleId> {
        let options = OpenOptions::from_guest_flags(flags);
        let mut state = self.lock();
        match self.resolve_locked(&mut state, path) {
            Ok(_) if options.create && options.exclusive => Err(Errno::AlreadyExists),
            Ok(id) => self.open_node_locked(&mut state, id, options),
            Err(Errno::NotFound) if options.create => {
                let id = self.create_file_node(&mut state, path)?;
                let opened = self.open_node_locked(&mut state, id, options);
                if opened.is_err() {
                    state.tree.detach(id);
                }
                opened
            }
            Err(err) => Err(err),
        }
    }

    fn create_file_node(&self, state: &mut FsState, path: &str) -> FsResult<NodeId> {
        let path = normalize_path(path)?;
        let parent = self.resolve_locked(state, parent_path(&path))?;
        let parent_node = state.tree.node(parent)?;
        if !parent_node.is_dir {
            return Err(Errno::NotADirectory);
        }
        let name = file_name(&path);
        let native = parent_node.native_path.join(name);
        state.tree.insert_child(
            parent,
            name,
            NodeSpec {
                native_path: native,
                ..NodeSpec::default()
            },
        )
    }

    fn open_node_locked(&self, state: &mut FsState, id: NodeId, options: OpenOptions) -> FsResult<HandleId> {
        let node = state.tree.node(id)?;
        if node.is_dir {
            let entries = self.list_dir_locked(state, id)?;
            return Ok(register_handle(state, id, options, HandleKind::Directory { entries, cursor: 0 }));
        }

        let native = node.native_path.clone();
        let member = node.archive;
        if !options.is_read_only() {
            if member.is_some() && !self.host.exists(&native) {
                self.ensure_local_locked(state, id, false)?;
            } else if let Some(parent) = native.parent() {
                if !self.host.exists(parent) {
                    self.host.create_dir_all(parent)?;
                }
            }
        }

        match self.host.open(&native, &options) {
            Ok(file) => Ok(register_handle(state, id, options, HandleKind::Native { file: Some(file) })),
            Err(err) => match member {
                Some(member) if options.is_read_only() => {
                    let data = state.archive.read_entry(member)?;
                    Ok(register_handle(state, id, options, HandleKind::Archive { data, position: 0 }))
                }
                _ => Err(Errno::from(err)),
            },
        }
    }

    pub fn read(&self, handle: HandleId, buf: &mut [u8]) -> FsResult<usize> {
        let mut state = self.lock();
        let handle = state.handles.get_mut(&handle).ok_or(Errno::BadDescriptor)?;
        if !handle.options.read {
            return Err(Errno::BadDescriptor);
        }
        match &mut handle.kind {
            HandleKind::Native { file: Some(file) } => Ok(file.read(buf)?),
            HandleKind::Native { file: None } => Err(Errno::Io),
            HandleKind::Archive { data, position } => {
                let start = (*position as usize).min(data.len());
                let count = buf.len().min(data.len() - start);
                buf[..count].copy_from_slice(&data[start..start + count]);
                *position += count as u64;
                Ok(count)
            }
            HandleKind::Directory { .. } => Err(Errno::IsADirectory),
        }
    }

    pub fn write(&self, handle: HandleId, buf: &[u8]) -> FsResult<usize> {
        let mut state = self.lock();
        let handle = state.handles.get_mut(&handle).ok_or(Errno::BadDescriptor)?;
        if !handle.options.write {
            return Err(Errno::BadDescriptor);
        }
        match &mut handle.kind {
            HandleKind::Native { file: Some(file) } => Ok(file.write(buf)?),
            HandleKind::Native { file: None } => Err(Errno::Io),
            HandleKind::Archive { .. } => Err(Errno::BadDescriptor),
            HandleKind::Directory { .. } => Err(Errno::IsADirectory),
        }
    }

    pub fn seek(&self, handle: HandleId, pos: SeekFrom) -> FsResult<u64> {
        let mut state = self.lock();
        let handle = state.handles.get_mut(&handle).ok_or(Errno::BadDescriptor)?;
        match &mut handle.kind {
            HandleKind::Native { file: Some(file) } => Ok(file.seek(pos)?),
            HandleKind::Native { file: None } => Err(Errno::Io),
            HandleKind::Archive { data, position } => {
                let target = match pos {
                    SeekFrom::Start(offset) => Some(offset),
                    SeekFrom::Current(delta) => position.checked_add_signed(delta),
                    SeekFrom::End(delta) => (data.len() as u64).checked_add_signed(delta),
                };
                *position = target.ok_or(Errno::IllegalSeek)?;
                Ok(*position)
            }
            HandleKind::Directory { cursor, .. } => match pos {
                SeekFrom::Start(offset) => {
                    *cursor = offset as usize;
                    Ok(offset)
                }
                _ => Err(Errno::IllegalSeek),
            },
        }
    }

    pub fn file_pointer(&self, handle: HandleId) -> FsResult<u64> {
        let mut state = self.lock();
        let handle = state.handles.get_mut(&handle).ok_or(Errno::BadDescriptor)?;
        match &mut handle.kind {
            HandleKind::Native { file: Some(file) } => Ok(file.stream_position()?),
            HandleKind::Native { file: None } => Err(Errno::Io),
            HandleKind::Archive { position, .. } => Ok(*position),
            HandleKind::Directory { cursor, .. } => Ok(*cursor as u64),
        }
    }

    /// Next entry of a directory handle, `None` at the end
    pub fn read_dir_entry(&self, handle: HandleId) -> FsResult<Option<DirEntry>> {
        let mut state = self.lock();
        let handle = state.handles.get_mut(&handle).ok_or(Errno::BadDescriptor)?;
        match &mut handle.kind {
            HandleKind::Directory { entries, cursor } => {
                let entry = entries.get(*cursor).cloned();
                if entry.is_some() {
                    *cursor += 1;
                }
                Ok(entry)
            }
            _ => Err(Errno::NotADirectory),
        }
    }

    pub fn close(&self, handle: HandleId) -> FsResult<()> {
        let mut state = self.lock();
        let removed = state.handles.remove(&handle).ok_or(Errno::BadDescriptor)?;
        let node_id = removed.node;
        drop(removed);

        let Ok(node) = state.tree.node_mut(node_id) else {
            return Ok(());
        };
        node.open_handles.retain(|h| *h != handle);
        if !node.detached || !node.open_handles.is_empty() {
            return Ok(());
        }

        // Last handle on a node that was removed while open
        let native = node.native_path.clone();
        if node.relocated {
            match self.host.remove_file(&native) {
                Ok(()) => debug!(?native, "removed relocated file"),
                Err(err) => debug!(?native, %err, "relocated file left behind"),
            }
        }
        state.tree.release(node_id);
        Ok(())
    }

    // Namespace mutation

    pub fn remove(&self, path: &str) -> FsResult<()> {
        let mut state = self.lock();
        let id = self.resolve_locked(&mut state, path)?;
        self.remove_locked(&mut state, id)
    }

    fn remove_locked(&self, state: &mut FsState, id: NodeId) -> FsResult<()> {
        if id == state.tree.root() {
            return Err(Errno::Busy);
        }
        let node = state.tree.node(id)?;
        if node.is_dir && !node.is_link() {
            return Err(Errno::IsADirectory);
        }
        let guest = node.path.clone();
        let native = node.native_path.clone();
        let open_handles = node.open_handles.len();

        if !self.host.exists(&native) {
            if state.archive.lookup(&guest).is_some() {
                debug!(path = %guest, "removing archive-only file");
                state.archive.hide(&guest);
                state.tree.detach(id);
                return Ok(());
            }
            state.tree.detach(id);
            return Err(Errno::NotFound);
        }

        if let Err(err) = self.host.remove_file(&native) {
            if open_handles == 0 {
                return Err(Errno::from(err));
            }
            debug!(path = %guest, %err, open_handles, "host kept open file, relocating");
            self.relocate_open_file(state, id, &native);
        }
        state.archive.hide(&guest);
        state.tree.detach(id);
        Ok(())
    }

    /// Move a file the host will not delete out of the way, keeping its
    /// handles usable. Failures here are logged and otherwise ignored.
    fn relocate_open_file(&self, state: &mut FsState, id: NodeId, native: &Path) {
        let relocation_dir = self.native_path(&self.config.relocation_dir);
        let mut txn = migration::migrate(state, self.host.as_ref(), id);

        if let Err(err) = self.host.create_dir_all(&relocation_dir) {
            warn!(?relocation_dir, %err, "could not create relocation directory");
        }
        let Some(target) = migration::probe_relocation_slot(
            self.host.as_ref(),
            &relocation_dir,
            self.config.relocation_probe_limit,
        ) else {
            warn!(?native, "no free relocation slot");
            return;
        };
        match self.host.rename(native, &target) {
            Ok(()) => {
                debug!(from = ?native, to = ?target, "relocated open file");
                if let Ok(node) = txn.tree.node_mut(id) {
                    node.native_path = target;
                    node.relocated = true;
                }
            }
            Err(err) => warn!(?native, %err, "could not move open file out of the way"),
        }
    }

    pub fn remove_dir(&self, path: &str) -> FsResult<()> {
        let mut state = self.lock();
        let id = self.resolve_locked(&mut state, path)?;
        self.remove_dir_locked(&mut state, id)
    }

    fn remove_dir_locked(&self, state: &mut FsState, id: NodeId) -> FsResult<()> {
        if id == state.tree.root() {
            return Err(Errno::Busy);
        }
        let node = state.tree.node(id)?;
        if !node.is_dir || node.is_link() {
            return Err(Errno::NotADirectory);
        }
        if !self.list_dir_locked(state, id)?.is_empty() {
            return Err(Errno::DirectoryNotEmpty);
        }
        let node = state.tree.node(id)?;
        let guest = node.path.clone();
        let native = node.native_path.clone();
        if self.host.exists(&native) {
            self.host.remove_dir(&native)?;
        }
        state.archive.hide(&guest);
        state.tree.detach(id);
        Ok(())
    }

    pub fn mkdir(&self, path: &str) -> FsResult<()> {
        let path = normalize_path(path)?;
        let mut state = self.lock();
        match self.resolve_locked(&mut state, &path) {
            Ok(_) => return Err(Errno::AlreadyExists),
            Err(Errno::NotFound) => {}
            Err(err) => return Err(err),
        }
        let parent = self.resolve_locked(&mut state, parent_path(&path))?;
        let parent_node = state.tree.node(parent)?;
        if !parent_node.is_dir {
            return Err(Errno::NotADirectory);
        }
        let parent_native = parent_node.native_path.clone();
        if !self.host.exists(&parent_native) {
            self.host.create_dir_all(&parent_native)?;
        }

        let name = file_name(&path);
        let native = parent_native.join(name);
        self.host.create_dir(&native)?;
        state.tree.insert_child(
            parent,
            name,
            NodeSpec {
                is_dir: true,
                native_path: native,
                ..NodeSpec::default()
            },
        )?;
        Ok(())
    }

    pub fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let mut state = self.lock();
        let id = self.resolve_locked(&mut state, from)?;
        self.rename_locked(&mut state, id, to)
    }

    fn rename_locked(&self, state: &mut FsState, id: NodeId, to: &str) -> FsResult<()> {
        let to = normalize_path(to)?;
        if id == state.tree.root() || to == "/" {
            return Err(Errno::Busy);
        }
        let node = state.tree.node(id)?;
        let old_path = node.path.clone();
        let is_dir = node.is_dir;
        if to == old_path {
            return Ok(());
        }
        // A directory cannot move beneath itself; the host would refuse with EINVAL
        if is_dir && to.starts_with(&old_path) && to.as_bytes().get(old_path.len()) == Some(&b'/') {
            return Err(Errno::from_host(libc::EINVAL));
        }

        let parent = self.resolve_locked(state, parent_path(&to))?;
        let parent_node = state.tree.node(parent)?;
        if !parent_node.is_dir {
            return Err(Errno::NotADirectory);
        }
        let name = file_name(&to).to_string();
        let dest_native = parent_node.native_path.join(&name);

        // Overwrite rules are checked before anything is touched
        match self.child_locked(state, parent, &name) {
            Ok(existing) if existing == id => return Ok(()),
            Ok(existing) => {
                let existing_is_dir = state.tree.node(existing)?.is_dir;
                if existing_is_dir != is_dir {
                    return Err(if existing_is_dir {
                        Errno::IsADirectory
                    } else {
                        Errno::NotADirectory
                    });
                }
                if existing_is_dir {
                    self.remove_dir_locked(state, existing)?;
                } else {
                    self.remove_locked(state, existing)?;
                }
            }
            Err(Errno::NotFound) => {}
            Err(err) => return Err(err),
        }

        self.ensure_local_locked(state, id, true)?;
        let native = state.tree.node(id)?.native_path.clone();

        let mut txn = migration::migrate(state, self.host.as_ref(), id);
        if let Err(err) = self.host.rename(&native, &dest_native) {
            debug!(from = ?native, to = ?dest_native, %err, "native rename failed");
            return Err(Errno::from(err));
        }
        txn.archive.hide(&old_path);
        let root = self.config.root.clone();
        txn.tree.reparent(id, parent, &name, &|guest: &str| native_under(&root, guest))?;
        txn.tree.node_mut(id)?.native_path = dest_native;
        debug!(from = %old_path, to = %to, "renamed");
        Ok(())
    }

    /// Update access/modification times, in seconds since the epoch. Zero
    /// leaves the timestamp unchanged; host failures are ignored.
    pub fn set_times(&self, path: &str, accessed: u64, modified: u64) -> FsResult<()> {
        let mut state = self.lock();
        let id = self.resolve_locked(&mut state, path)?;
        self.ensure_local_locked(&mut state, id, false)?;
        if accessed == 0 && modified == 0 {
            return Ok(());
        }
        let native = state.tree.node(id)?.native_path.clone();
        let to_time = |secs: u64| (secs != 0).then(|| UNIX_EPOCH + Duration::from_secs(secs));
        if let Err(err) = self.host.set_times(&native, to_time(accessed), to_time(modified)) {
            warn!(?native, %err, "could not update file times");
        }
        Ok(())
    }
}

fn register_handle(state: &mut FsState, node: NodeId, options: OpenOptions, kind: HandleKind) -> HandleId {
    let id = state.allocate_handle_id();
    state.handles.insert(id, OpenHandle { node, options, kind });
    if let Ok(node) = state.tree.node_mut(node) {
        node.open_handles.push(id);
    }
    id
}

fn node_type_of(node: &VirtualNode, check_link: bool) -> u32 {
    if node.is_dir {
        DT_DIR
    } else if check_link && node.is_link() {
        DT_LNK
    } else {
        DT_REG
    }
}
