// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `[logging]` table of a config file

use serde::{Deserialize, Serialize};

use crate::{CliLogLevel, LogFormat};

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging verbosity level
    #[serde(rename = "log-level")]
    pub level: Option<CliLogLevel>,

    #[serde(rename = "log-format")]
    pub format: Option<LogFormat>,

    /// Directory for log files; setting it switches output from the console to a file
    #[serde(rename = "log-dir")]
    pub dir: Option<String>,
}
