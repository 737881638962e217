// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Handle migration around native deletes and renames
//!
//! Hosts that refuse to delete or rename a file while it is open get the
//! file's handles closed first. Offsets are recorded, the native mutation
//! runs, and every handle is reopened at its recorded offset against
//! whatever native path the node has when the scope ends.

use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use scopeguard::ScopeGuard;
use tracing::{debug, warn};

use crate::host::HostFs;
use crate::vfs::{FsState, HandleKind};
use crate::{HandleId, NodeId};

#[derive(Debug)]
pub(crate) struct ParkedHandle {
    handle: HandleId,
    position: u64,
}

/// Close the host file behind every native handle on `node`, in registration order
pub(crate) fn park_handles(state: &mut FsState, node: NodeId) -> Vec<ParkedHandle> {
    let handle_ids = match state.tree.node(node) {
        Ok(node) => node.open_handles.clone(),
        Err(_) => return Vec::new(),
    };

    let mut parked = Vec::with_capacity(handle_ids.len());
    for id in handle_ids {
        let Some(handle) = state.handles.get_mut(&id) else {
            continue;
        };
        let HandleKind::Native { file } = &mut handle.kind else {
            continue;
        };
        let Some(mut open) = file.take() else {
            continue;
        };
        let position = match open.stream_position() {
            Ok(position) => position,
            Err(err) => {
                warn!(handle = id.0, %err, "could not read file pointer before parking");
                0
            }
        };
        drop(open);
        parked.push(ParkedHandle {
            handle: id,
            position,
        });
    }
    parked
}

/// Reopen parked handles against the node's current native path
pub(crate) fn restore_handles(
    state: &mut FsState,
    host: &dyn HostFs,
    node: NodeId,
    parked: Vec<ParkedHandle>,
) {
    let native = match state.tree.node(node) {
        Ok(node) => node.native_path.clone(),
        Err(_) => return,
    };

    for entry in parked {
        let Some(handle) = state.handles.get_mut(&entry.handle) else {
            continue;
        };
        let reopened = host.open(&native, &handle.options.for_reopen()).and_then(|mut file| {
            file.seek(SeekFrom::Start(entry.position))?;
            Ok(file)
        });
        match reopened {
            Ok(file) => {
                if let HandleKind::Native { file: slot } = &mut handle.kind {
                    *slot = Some(file);
                }
            }
            Err(err) => {
                warn!(handle = entry.handle.0, ?native, %err, "could not reopen handle after migration");
            }
        }
    }
}

/// Park the handles of `node` now and restore them when the returned guard
/// drops, on every exit path.
pub(crate) fn migrate<'a>(
    state: &'a mut FsState,
    host: &'a dyn HostFs,
    node: NodeId,
) -> ScopeGuard<&'a mut FsState, impl FnOnce(&'a mut FsState) + 'a> {
    let parked = park_handles(state, node);
    if !parked.is_empty() {
        debug!(node = node.0, handles = parked.len(), "parked open handles");
    }
    scopeguard::guard(state, move |state| restore_handles(state, host, node, parked))
}

/// Lowest-numbered `del<N>.tmp` under `dir` that does not exist yet
pub(crate) fn probe_relocation_slot(host: &dyn HostFs, dir: &Path, limit: u32) -> Option<PathBuf> {
    (0..limit)
        .map(|i| dir.join(format!("del{}.tmp", i)))
        .find(|candidate| !host.exists(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockHostFs;

    #[test]
    fn test_probe_picks_lowest_free_slot() {
        let mut host = MockHostFs::new();
        host.expect_exists().returning(|path| {
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            matches!(name.as_str(), "del0.tmp" | "del1.tmp" | "del3.tmp")
        });
        let slot = probe_relocation_slot(&host, Path::new("/r/tmp/del"), 10).unwrap();
        assert_eq!(slot, PathBuf::from("/r/tmp/del/del2.tmp"));
    }

    #[test]
    fn test_probe_respects_limit() {
        let mut host = MockHostFs::new();
        host.expect_exists().times(3).return_const(true);
        assert_eq!(probe_relocation_slot(&host, Path::new("/d"), 3), None);
    }
}
