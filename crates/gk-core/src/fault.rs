// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fault injection policy + host wrapper for the native filesystem seam

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::host::{HostDirEntry, HostFile, HostFs, HostMetadata};
use crate::OpenOptions;

/// Host operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOp {
    Open,
    Remove,
    RemoveDir,
    Rename,
    CreateDir,
    SetTimes,
}

/// Supported errno values for synthetic failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultErrno {
    Eio,
    Eacces,
    Ebusy,
    Exdev,
    Enospc,
    Erofs,
}

impl FaultErrno {
    fn to_error(self) -> io::Error {
        let code = match self {
            FaultErrno::Eio => libc::EIO,
            FaultErrno::Eacces => libc::EACCES,
            FaultErrno::Ebusy => libc::EBUSY,
            FaultErrno::Exdev => libc::EXDEV,
            FaultErrno::Enospc => libc::ENOSPC,
            FaultErrno::Erofs => libc::EROFS,
        };
        io::Error::from_raw_os_error(code)
    }
}

/// Individual rule describing which op should fail and how often.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FaultRule {
    pub op: FaultOp,
    pub errno: FaultErrno,
    /// Number of leading invocations to let through before injecting faults.
    #[serde(default)]
    pub start_after: u64,
    #[serde(default)]
    pub max_faults: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct FaultPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<FaultRule>,
}

impl FaultPolicy {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Clone, Debug, Default)]
struct RuleCounters {
    hits: u64,
    invocations: u64,
}

#[derive(Clone, Debug, Default)]
struct FaultState {
    policy: FaultPolicy,
    counters: Vec<RuleCounters>,
}

/// Runtime controller that tracks policy + hit counts.
#[derive(Debug, Default)]
pub struct FaultInjector {
    state: Mutex<FaultState>,
}

impl FaultInjector {
    pub fn new(policy: FaultPolicy) -> Self {
        let injector = Self::default();
        injector.set_policy(policy);
        injector
    }

    pub fn set_policy(&self, policy: FaultPolicy) {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        guard.counters = vec![RuleCounters::default(); policy.rules.len()];
        guard.policy = policy;
    }

    pub fn clear(&self) {
        self.set_policy(FaultPolicy::default());
    }

    pub fn should_fault(&self, op: FaultOp) -> Option<io::Error> {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if !guard.policy.enabled {
            return None;
        }
        let state = &mut *guard;
        for (rule, counters) in state.policy.rules.iter().zip(state.counters.iter_mut()) {
            if rule.op != op {
                continue;
            }
            counters.invocations = counters.invocations.saturating_add(1);
            if counters.invocations <= rule.start_after {
                continue;
            }
            if let Some(max) = rule.max_faults {
                if counters.hits >= max {
                    continue;
                }
            }
            counters.hits = counters.hits.saturating_add(1);
            return Some(rule.errno.to_error());
        }
        None
    }
}

/// Wraps any host and fails the operations the policy selects
#[derive(Debug)]
pub struct FaultyHostFs<H> {
    inner: H,
    injector: FaultInjector,
}

impl<H: HostFs> FaultyHostFs<H> {
    pub fn new(inner: H, policy: FaultPolicy) -> Self {
        Self {
            inner,
            injector: FaultInjector::new(policy),
        }
    }

    pub fn injector(&self) -> &FaultInjector {
        &self.injector
    }

    fn check(&self, op: FaultOp) -> io::Result<()> {
        match self.injector.should_fault(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<H: HostFs> HostFs for FaultyHostFs<H> {
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
        self.check(FaultOp::CreateDir)?;
        self.inner.create_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.check(FaultOp::CreateDir)?;
        self.inner.create_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.check(FaultOp::Remove)?;
        self.inner.remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        self.check(FaultOp::RemoveDir)?;
        self.inner.remove_dir(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.check(FaultOp::Rename)?;
        self.inner.rename(from, to)
    }

    fn open(&self, path: &Path, opts: &OpenOptions) -> io::Result<Box<dyn HostFile>> {
        self.check(FaultOp::Open)?;
        self.inner.open(path, opts)
    }

    fn set_times(
        &self,
        path: &Path,
        accessed: Option<SystemTime>,
        modified: Option<SystemTime>,
    ) -> io::Result<()> {
        self.check(FaultOp::SetTimes)?;
        self.inner.set_times(path, accessed, modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::StdHostFs;
    use crate::Errno;
    use tempfile::TempDir;

    #[test]
    fn parses_fault_policy_json() {
        let json = br#"{ "enabled": true, "rules": [ { "op": "rename", "errno": "exdev", "max-faults": 2 } ] }"#;
        let policy = FaultPolicy::from_json_bytes(json).expect("policy");
        assert!(policy.enabled);
        assert_eq!(policy.rules.len(), 1);
        assert_eq!(policy.rules[0].op, FaultOp::Rename);
        assert_eq!(policy.rules[0].max_faults, Some(2));
    }

    #[test]
    fn injector_respects_start_and_max_hits() {
        let injector = FaultInjector::new(FaultPolicy {
            enabled: true,
            rules: vec![FaultRule {
                op: FaultOp::Remove,
                errno: FaultErrno::Eio,
                start_after: 1,
                max_faults: Some(2),
            }],
        });

        // First call skipped due to start_after
        assert!(injector.should_fault(FaultOp::Remove).is_none());
        assert!(injector.should_fault(FaultOp::Remove).is_some());
        assert!(injector.should_fault(FaultOp::Remove).is_some());
        // Max hits reached
        assert!(injector.should_fault(FaultOp::Remove).is_none());
        // Other ops never fault
        assert!(injector.should_fault(FaultOp::Rename).is_none());
    }

    #[test]
    fn faulty_host_injects_translatable_errors() {
        let tmp = TempDir::new().unwrap();
        let from = tmp.path().join("a");
        std::fs::write(&from, b"x").unwrap();

        let host = FaultyHostFs::new(
            StdHostFs,
            FaultPolicy {
                enabled: true,
                rules: vec![FaultRule {
                    op: FaultOp::Rename,
                    errno: FaultErrno::Exdev,
                    start_after: 0,
                    max_faults: Some(1),
                }],
            },
        );

        let err = host.rename(&from, &tmp.path().join("b")).unwrap_err();
        assert_eq!(Errno::from(err), Errno::CrossDevice);
        host.rename(&from, &tmp.path().join("b")).expect("second rename passes");
        assert!(host.exists(&tmp.path().join("b")));
    }
}
