// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error type of the event building network.

use thiserror::Error;

/// Errors of framing, schedules, wire records and the fabric.
#[derive(Debug, Error)]
pub enum BnetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Malformed buffer, event or subevent framing.
    #[error("Format error: {0}")]
    Format(String),

    /// Malformed or unexpected wire record.
    #[error("Wire error: {0}")]
    Wire(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Fabric error: {0}")]
    Fabric(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] hdaq::Error),
}

/// Result alias of this crate.
pub type Result<T> = core::result::Result<T, BnetError>;
