// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel filesystem configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::fault::FaultPolicy;

/// Read-only zip archive overlaid on the guest namespace
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMount {
    pub path: PathBuf,
    /// Guest directory the archive root appears under
    #[serde(default = "default_mount")]
    pub mount: String,
}

fn default_mount() -> String {
    "/".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct KernelConfig {
    /// Native directory backing the guest root
    pub root: PathBuf,
    /// Guest directory receiving files relocated while still open
    pub relocation_dir: String,
    /// Upper bound on `del<N>.tmp` candidates probed per relocation
    pub relocation_probe_limit: u32,
    /// Guest prefixes reported writable to non-root users
    pub writable_prefixes: Vec<String>,
    pub archives: Vec<ArchiveMount>,
    pub faults: Option<FaultPolicy>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("root"),
            relocation_dir: "/tmp/del".to_string(),
            relocation_probe_limit: 100_000_000,
            writable_prefixes: vec!["/tmp".to_string(), "/var".to_string(), "/home".to_string()],
            archives: Vec::new(),
            faults: None,
        }
    }
}

impl KernelConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: KernelConfig = toml::from_str(s).context("parsing kernel config")?;
        if !config.relocation_dir.starts_with('/') {
            anyhow::bail!("relocation-dir must be an absolute guest path: {}", config.relocation_dir);
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {:?}", path))?;
        Self::from_toml_str(&content).with_context(|| format!("loading {:?}", path))
    }
}
