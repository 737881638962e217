// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory guest namespace
//!
//! Nodes live in an arena keyed by [`NodeId`]. A directory owns its children
//! through its name map; children point back at their parent by id only.
//! A node detached from the tree stays in the arena while open handles
//! still reference it and is released once the last one closes.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::archive::ArchiveEntryRef;
use crate::error::{Errno, FsResult};
use crate::{HandleId, NodeId};

/// One filesystem entry in the guest namespace
#[derive(Debug)]
pub struct VirtualNode {
    pub id: NodeId,
    pub rdev: u32,
    /// Absolute guest path; always the concatenation of ancestor names
    pub path: String,
    pub name: String,
    pub link: Option<String>,
    pub is_dir: bool,
    pub parent: Option<NodeId>,
    pub children: BTreeMap<String, NodeId>,
    /// Current on-disk location backing this node
    pub native_path: PathBuf,
    /// Read-only fallback content
    pub archive: Option<ArchiveEntryRef>,
    /// Live handles in registration order
    pub open_handles: Vec<HandleId>,
    pub detached: bool,
    /// Set once the backing file was moved into the relocation directory
    pub relocated: bool,
}

impl VirtualNode {
    pub fn is_link(&self) -> bool {
        self.link.is_some()
    }
}

/// Parameters for a node about to be inserted
#[derive(Debug, Default)]
pub struct NodeSpec {
    pub is_dir: bool,
    pub link: Option<String>,
    pub rdev: u32,
    pub native_path: PathBuf,
    pub archive: Option<ArchiveEntryRef>,
}

#[derive(Debug)]
pub struct VirtualFsTree {
    nodes: HashMap<NodeId, VirtualNode>,
    root: NodeId,
    next_id: u64,
}

impl VirtualFsTree {
    pub fn new(root_native: PathBuf) -> Self {
        let root = NodeId(1);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            VirtualNode {
                id: root,
                rdev: 0,
                path: "/".to_string(),
                name: String::new(),
                link: None,
                is_dir: true,
                parent: None,
                children: BTreeMap::new(),
                native_path: root_native,
                archive: None,
                open_handles: Vec::new(),
                detached: false,
                relocated: false,
            },
        );
        Self {
            nodes,
            root,
            next_id: 2,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> FsResult<&VirtualNode> {
        self.nodes.get(&id).ok_or(Errno::NotFound)
    }

    pub fn node_mut(&mut self, id: NodeId) -> FsResult<&mut VirtualNode> {
        self.nodes.get_mut(&id).ok_or(Errno::NotFound)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes.get(&parent)?.children.get(name).copied()
    }

    /// Insert a new child node. An existing child of the same name is detached.
    pub fn insert_child(&mut self, parent: NodeId, name: &str, spec: NodeSpec) -> FsResult<NodeId> {
        let parent_path = {
            let parent_node = self.node(parent)?;
            if !parent_node.is_dir {
                return Err(Errno::NotADirectory);
            }
            parent_node.path.clone()
        };
        if let Some(previous) = self.child(parent, name) {
            self.detach(previous);
        }

        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            VirtualNode {
                id,
                rdev: spec.rdev,
                path: join_path(&parent_path, name),
                name: name.to_string(),
                link: spec.link,
                is_dir: spec.is_dir,
                parent: Some(parent),
                children: BTreeMap::new(),
                native_path: spec.native_path,
                archive: spec.archive,
                open_handles: Vec::new(),
                detached: false,
                relocated: false,
            },
        );
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.insert(name.to_string(), id);
        }
        Ok(id)
    }

    /// Remove the node from its parent's child map
    pub fn detach(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.detached = true;
        let Some(parent) = node.parent.take() else {
            return;
        };
        let name = node.name.clone();
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            if parent_node.children.get(&name) == Some(&id) {
                parent_node.children.remove(&name);
            }
        }
        self.release(id);
    }

    /// Drop a detached node (and its detached subtree) once nothing references it
    pub fn release(&mut self, id: NodeId) {
        let releasable = match self.nodes.get(&id) {
            Some(node) => node.detached && node.open_handles.is_empty(),
            None => false,
        };
        if !releasable {
            return;
        }
        if let Some(node) = self.nodes.remove(&id) {
            for child in node.children.into_values() {
                if let Some(child_node) = self.nodes.get_mut(&child) {
                    child_node.parent = None;
                    child_node.detached = true;
                }
                self.release(child);
            }
        }
    }

    /// Move `id` under `new_parent` as `new_name`, rewriting the guest path of
    /// the whole subtree and its native path through `to_native`.
    pub fn reparent(
        &mut self,
        id: NodeId,
        new_parent: NodeId,
        new_name: &str,
        to_native: &dyn Fn(&str) -> PathBuf,
    ) -> FsResult<()> {
        let parent_path = self.node(new_parent)?.path.clone();
        if let Some(previous) = self.child(new_parent, new_name) {
            if previous != id {
                self.detach(previous);
            }
        }

        let old_parent = self.node(id)?.parent;
        let old_name = self.node(id)?.name.clone();
        if let Some(old_parent) = old_parent {
            if let Some(parent_node) = self.nodes.get_mut(&old_parent) {
                if parent_node.children.get(&old_name) == Some(&id) {
                    parent_node.children.remove(&old_name);
                }
            }
        }

        {
            let node = self.node_mut(id)?;
            node.name = new_name.to_string();
            node.parent = Some(new_parent);
            node.detached = false;
        }
        self.node_mut(new_parent)?.children.insert(new_name.to_string(), id);
        self.repath(id, join_path(&parent_path, new_name), to_native);
        Ok(())
    }

    fn repath(&mut self, id: NodeId, path: String, to_native: &dyn Fn(&str) -> PathBuf) {
        let children: Vec<(String, NodeId)> = match self.nodes.get_mut(&id) {
            Some(node) => {
                node.native_path = to_native(&path);
                node.path = path.clone();
                node.children.iter().map(|(name, child)| (name.clone(), *child)).collect()
            }
            None => return,
        };
        for (name, child) in children {
            self.repath(child, join_path(&path, &name), to_native);
        }
    }

    /// Rebuild a node's path by walking parent links
    pub fn reconstruct_path(&self, id: NodeId) -> Option<String> {
        let mut names = Vec::new();
        let mut current = self.nodes.get(&id)?;
        while let Some(parent) = current.parent {
            names.push(current.name.as_str());
            current = self.nodes.get(&parent)?;
        }
        if current.id != self.root {
            return None;
        }
        names.reverse();
        Some(format!("/{}", names.join("/")))
    }
}

/// Normalize an absolute guest path: collapse `.`, `..` and repeated slashes
pub fn normalize_path(path: &str) -> FsResult<String> {
    if !path.starts_with('/') {
        return Err(Errno::NotFound);
    }
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}
