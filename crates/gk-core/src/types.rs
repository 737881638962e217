// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions shared by the filesystem and readiness layers

/// Stable identity of a virtual node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// Opaque open-handle identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl HandleId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Guest thread identifier
pub type ThreadId = u32;

// Guest open(2) flags (i386 Linux values)
pub const K_O_RDONLY: u32 = 0o0;
pub const K_O_WRONLY: u32 = 0o1;
pub const K_O_RDWR: u32 = 0o2;
pub const K_O_ACCMODE: u32 = 0o3;
pub const K_O_CREAT: u32 = 0o100;
pub const K_O_EXCL: u32 = 0o200;
pub const K_O_TRUNC: u32 = 0o1000;
pub const K_O_APPEND: u32 = 0o2000;

// Directory entry types as reported by getdents
pub const DT_DIR: u32 = 4;
pub const DT_REG: u32 = 8;
pub const DT_LNK: u32 = 10;

pub const K_S_IREAD: u32 = 0o400;
pub const K_S_IWRITE: u32 = 0o200;
pub const K_S_IEXEC: u32 = 0o100;

/// File open options decoded from guest flags
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub exclusive: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenOptions {
    pub fn from_guest_flags(flags: u32) -> Self {
        let (read, write) = match flags & K_O_ACCMODE {
            K_O_RDONLY => (true, false),
            K_O_WRONLY => (false, true),
            _ => (true, true),
        };
        Self {
            read,
            write,
            create: flags & K_O_CREAT != 0,
            exclusive: flags & K_O_EXCL != 0,
            truncate: flags & K_O_TRUNC != 0,
            append: flags & K_O_APPEND != 0,
        }
    }

    /// Read-only in the guest sense: no write access requested
    pub fn is_read_only(&self) -> bool {
        !self.write
    }

    /// Options for re-opening an already existing file after handle migration.
    /// Creation and truncation already happened on the first open.
    pub fn for_reopen(&self) -> Self {
        Self {
            create: false,
            exclusive: false,
            truncate: false,
            ..self.clone()
        }
    }
}

/// Directory entry information
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub node: NodeId,
    pub entry_type: u32,
}

/// Node attributes as reported to stat-like callers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAttributes {
    pub id: NodeId,
    pub rdev: u32,
    pub is_dir: bool,
    pub is_link: bool,
    pub mode: u32,
    pub len: u64,
    /// Milliseconds since the Unix epoch
    pub mtime_ms: u64,
}
