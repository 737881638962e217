// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Guest-kernel filesystem and readiness layer
//!
//! This crate makes a host filesystem look like a Linux kernel to guest
//! programs: POSIX delete/rename semantics on hosts that refuse to touch open
//! files, lazy materialization of archive-backed files, and poll/select that
//! suspend guest threads instead of blocking the scheduler.

pub mod archive;
pub mod config;
pub mod error;
pub mod fault;
pub mod host;
pub mod memory;
pub(crate) mod migration;
pub mod poll;
pub mod tree;
pub mod types;
pub mod vfs;
pub mod wait;

#[cfg(test)]
pub mod testing;

#[cfg(test)]
mod test_handle_migration;

pub use archive::{ArchiveOverlay, ArchiveSource};
pub use config::{ArchiveMount, KernelConfig};
pub use error::{to_syscall_return, Errno, FsResult, Progress, K_WAIT};
pub use fault::{FaultErrno, FaultInjector, FaultOp, FaultPolicy, FaultRule, FaultyHostFs};
pub use host::{HostDirEntry, HostFile, HostFs, HostMetadata, StdHostFs};
pub use memory::{GuestMemory, VecMemory};
pub use poll::{DescriptorTable, Multiplexer, PollRequest, Pollable};
pub use types::*;
pub use vfs::KernelFs;
pub use wait::{Clock, GuestThread, ManualClock, MonotonicClock, TimerQueue, WaitList, WaitPhase, WaitState};
