// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test-only host doubles
//!
//! Hosts with stricter semantics than POSIX, used to drive the handle
//! migration paths without needing such a host at hand.

#[cfg(test)]
pub mod exclusive_host;
