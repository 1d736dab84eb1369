// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event building network configuration.
//!
//! Loaded from TOML; every field has a default so a minimal file only names
//! what differs.
//!
//! ```toml
//! nodes = 4
//! controller = true
//! pattern = 0
//! turn_period_us = 2000
//! ```

use crate::error::{BnetError, Result};
use crate::schedule::Pattern;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration of one cluster run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BnetConfig {
    /// Number of nodes, controller included.
    #[serde(default = "default_nodes")]
    pub nodes: usize,

    /// Node 0 coordinates turns and does not contribute data.
    #[serde(default)]
    pub controller: bool,

    /// Schedule pattern number (0 round-robin, 1 shift 1, 2 shift N/2,
    /// 3 one-to-all, 4 all-to-one, 5 even-to-odd, 7 file).
    #[serde(default)]
    pub pattern: u32,

    /// Schedule file for pattern 7.
    #[serde(default)]
    pub schedule_file: Option<PathBuf>,

    /// Number of logical channels (lids) per link.
    #[serde(default = "default_channels")]
    pub channels: usize,

    /// Duration of one schedule slot.
    #[serde(default = "default_turn_period_us")]
    pub turn_period_us: u64,

    /// Outstanding send operations per channel and target.
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,

    /// Outstanding receive operations per channel and source. Also bounds
    /// the parts a worker holds before they are assigned to a turn.
    #[serde(default = "default_recv_queue")]
    pub recv_queue: usize,

    /// Posted receive buffers kept by each node.
    #[serde(default = "default_recv_depth")]
    pub recv_depth: usize,

    /// Block size of the transport pool.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Number of blocks of the transport pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Age after which incomplete event bundles are dropped.
    #[serde(default = "default_event_lifetime_ms")]
    pub event_lifetime_ms: u64,

    /// How far ahead of time the controller submits turns.
    #[serde(default = "default_presubmit_ms")]
    pub presubmit_ms: u64,

    /// TEST rounds before an unresponsive node is declared inactive.
    #[serde(default = "default_test_attempts")]
    pub test_attempts: u32,

    /// Timeout of a single TEST round.
    #[serde(default = "default_test_timeout_ms")]
    pub test_timeout_ms: u64,

    /// Events merged per builder output cycle.
    #[serde(default = "default_events_combine")]
    pub events_combine: usize,

    /// Output buffer size of the builder.
    #[serde(default = "default_builder_buffer_size")]
    pub builder_buffer_size: usize,
}

fn default_nodes() -> usize {
    4
}

fn default_channels() -> usize {
    1
}

fn default_turn_period_us() -> u64 {
    2000
}

fn default_send_queue() -> usize {
    5
}

fn default_recv_queue() -> usize {
    10
}

fn default_recv_depth() -> usize {
    16
}

fn default_buffer_size() -> usize {
    64 * 1024
}

fn default_pool_size() -> usize {
    256
}

fn default_event_lifetime_ms() -> u64 {
    2000
}

fn default_presubmit_ms() -> u64 {
    10
}

fn default_test_attempts() -> u32 {
    3
}

fn default_test_timeout_ms() -> u64 {
    500
}

fn default_events_combine() -> usize {
    1
}

fn default_builder_buffer_size() -> usize {
    256 * 1024
}

impl Default for BnetConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            controller: false,
            pattern: 0,
            schedule_file: None,
            channels: default_channels(),
            turn_period_us: default_turn_period_us(),
            send_queue: default_send_queue(),
            recv_queue: default_recv_queue(),
            recv_depth: default_recv_depth(),
            buffer_size: default_buffer_size(),
            pool_size: default_pool_size(),
            event_lifetime_ms: default_event_lifetime_ms(),
            presubmit_ms: default_presubmit_ms(),
            test_attempts: default_test_attempts(),
            test_timeout_ms: default_test_timeout_ms(),
            events_combine: default_events_combine(),
            builder_buffer_size: default_builder_buffer_size(),
        }
    }
}

impl BnetConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let min_nodes = if self.controller { 3 } else { 2 };
        if self.nodes < min_nodes {
            return Err(BnetError::Config(format!(
                "{} nodes configured, at least {} required",
                self.nodes, min_nodes
            )));
        }
        let pattern = Pattern::from_number(self.pattern)
            .ok_or_else(|| BnetError::Config(format!("Unknown schedule pattern {}", self.pattern)))?;
        if pattern == Pattern::File && self.schedule_file.is_none() {
            return Err(BnetError::Config("Pattern 7 requires schedule_file".into()));
        }
        if self.channels == 0 {
            return Err(BnetError::Config("At least one channel required".into()));
        }
        if self.turn_period_us == 0 {
            return Err(BnetError::Config("turn_period_us must be positive".into()));
        }
        if self.send_queue == 0 || self.recv_queue == 0 || self.recv_depth == 0 {
            return Err(BnetError::Config("Queue limits must be positive".into()));
        }
        if self.buffer_size < crate::wire::TransportHeader::SIZE + crate::format::BufferHeader::SIZE {
            return Err(BnetError::Config(format!(
                "buffer_size {} cannot hold transport and buffer headers",
                self.buffer_size
            )));
        }
        if self.pool_size < self.recv_depth * 2 {
            return Err(BnetError::Config(format!(
                "pool_size {} smaller than twice recv_depth {}",
                self.pool_size, self.recv_depth
            )));
        }
        if self.events_combine == 0 {
            return Err(BnetError::Config("events_combine must be positive".into()));
        }
        if self.test_attempts == 0 {
            return Err(BnetError::Config("test_attempts must be positive".into()));
        }
        Ok(())
    }

    /// Schedule pattern. Valid after [`BnetConfig::validate`].
    pub fn schedule_pattern(&self) -> Pattern {
        Pattern::from_number(self.pattern).unwrap_or(Pattern::RoundRobin)
    }

    /// Nodes contributing data.
    pub fn data_nodes(&self) -> Vec<usize> {
        let first = usize::from(self.controller);
        (first..self.nodes).collect()
    }

    pub fn turn_period(&self) -> Duration {
        Duration::from_micros(self.turn_period_us)
    }

    pub fn event_lifetime(&self) -> Duration {
        Duration::from_millis(self.event_lifetime_ms)
    }

    pub fn presubmit(&self) -> Duration {
        Duration::from_millis(self.presubmit_ms)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // test scaffolding
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BnetConfig::default();
        assert_eq!(config.nodes, 4);
        assert!(!config.controller);
        assert_eq!(config.schedule_pattern(), Pattern::RoundRobin);
        assert!(config.validate().is_ok());
        assert_eq!(config.data_nodes(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = BnetConfig::from_toml_str("nodes = 5\ncontroller = true\npattern = 1\n").unwrap();
        assert_eq!(config.nodes, 5);
        assert_eq!(config.schedule_pattern(), Pattern::ShiftOne);
        assert_eq!(config.data_nodes(), vec![1, 2, 3, 4]);
        assert_eq!(config.turn_period(), Duration::from_micros(2000));
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(
            BnetConfig::from_toml_str("nodes = 2\ncontroller = true\n"),
            Err(BnetError::Config(_))
        ));
        assert!(matches!(
            BnetConfig::from_toml_str("pattern = 6\n"),
            Err(BnetError::Config(_))
        ));
        assert!(matches!(
            BnetConfig::from_toml_str("pattern = 7\n"),
            Err(BnetError::Config(_))
        ));
        assert!(matches!(
            BnetConfig::from_toml_str("nodes = \"four\"\n"),
            Err(BnetError::Toml(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "nodes = 3\nevents_combine = 4\nrecv_depth = 4\npool_size = 32").unwrap();
        let config = BnetConfig::from_file(file.path()).unwrap();
        assert_eq!(config.nodes, 3);
        assert_eq!(config.events_combine, 4);
        assert_eq!(config.pool_size, 32);

        assert!(matches!(
            BnetConfig::from_file("/nonexistent/bnet.toml"),
            Err(BnetError::Io(_))
        ));
    }
}
