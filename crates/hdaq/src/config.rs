// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime configuration.
//!
//! - **Level 1 (Static)**: defaults as named constants
//! - **Level 2 (Dynamic)**: [`RuntimeConfig`] with a lock-free parameter store
//!   filled by the configuration layer (`"Builder.EventsCombine" = "4"`), and
//!   per-item [`PortConfig`] values passed at module construction.

use crate::error::{Error, Result};
use dashmap::DashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

// =======================================================================
// Defaults
// =======================================================================

/// Default input queue capacity of a port.
pub const DEFAULT_INPUT_CAPACITY: usize = 10;

/// Default output queue capacity of a port.
pub const DEFAULT_OUTPUT_CAPACITY: usize = 10;

/// Default reconnect period for the `reconnect` on-error policy.
pub const DEFAULT_RECONNECT_PERIOD: Duration = Duration::from_secs(1);

/// Default number of reconnect attempts before the module is stopped.
pub const DEFAULT_RECONNECT_LIMIT: u32 = 10;

/// Default deadline of commands submitted without an explicit timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Name of the thread hosting deferred work and command set timeouts.
pub const MANAGER_THREAD: &str = "Manager";

// =======================================================================
// On-error policy
// =======================================================================

/// Reaction of a port to a disconnect-with-error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnErrorPolicy {
    /// Ignore; the module only sees a disconnect event.
    #[default]
    None,
    /// Stop the owning module.
    Stop,
    /// Request application shutdown.
    Exit,
    /// Abort the process.
    Abort,
    /// Re-establish the connection every reconnect period, up to the limit.
    Reconnect,
}

impl FromStr for OnErrorPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "stop" => Ok(Self::Stop),
            "exit" => Ok(Self::Exit),
            "abort" => Ok(Self::Abort),
            "reconnect" => Ok(Self::Reconnect),
            other => Err(Error::InvalidPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for OnErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Stop => "stop",
            Self::Exit => "exit",
            Self::Abort => "abort",
            Self::Reconnect => "reconnect",
        };
        f.write_str(s)
    }
}

// =======================================================================
// Port configuration
// =======================================================================

/// Configuration of one port, fixed at module construction.
#[derive(Debug, Clone, PartialEq)]
pub struct PortConfig {
    pub input_capacity: usize,
    pub output_capacity: usize,
    /// User header bytes carried by every buffer passing the port.
    pub inline_data_size: usize,
    pub on_error: OnErrorPolicy,
    pub reconnect_period: Duration,
    pub reconnect_limit: u32,
    /// Pool the receiving side allocates from when data must be copied.
    pub pool: Option<String>,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            input_capacity: DEFAULT_INPUT_CAPACITY,
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
            inline_data_size: 0,
            on_error: OnErrorPolicy::None,
            reconnect_period: DEFAULT_RECONNECT_PERIOD,
            reconnect_limit: DEFAULT_RECONNECT_LIMIT,
            pool: None,
        }
    }
}

impl PortConfig {
    /// Input-only port.
    pub fn input(capacity: usize) -> Self {
        Self {
            input_capacity: capacity,
            output_capacity: 0,
            ..Self::default()
        }
    }

    /// Output-only port.
    pub fn output(capacity: usize) -> Self {
        Self {
            input_capacity: 0,
            output_capacity: capacity,
            ..Self::default()
        }
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    pub fn with_inline_data(mut self, size: usize) -> Self {
        self.inline_data_size = size;
        self
    }

    pub fn with_on_error(mut self, policy: OnErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn with_reconnect(mut self, period: Duration, limit: u32) -> Self {
        self.on_error = OnErrorPolicy::Reconnect;
        self.reconnect_period = period;
        self.reconnect_limit = limit;
        self
    }
}

// =======================================================================
// Pool configuration
// =======================================================================

/// One allocation class of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub block_size: usize,
    pub count: usize,
    /// Allocate every block up front instead of on first use.
    pub prealloc: bool,
}

impl PoolConfig {
    pub fn new(block_size: usize, count: usize) -> Self {
        Self {
            block_size,
            count,
            prealloc: true,
        }
    }

    /// Blocks are allocated when first taken.
    pub fn lazy(mut self) -> Self {
        self.prealloc = false;
        self
    }
}

// =======================================================================
// Runtime configuration
// =======================================================================

/// Process-wide runtime settings plus a string parameter store.
#[derive(Clone)]
pub struct RuntimeConfig {
    pub command_timeout: Duration,
    /// Bound on the wait of start/stop/destroy acknowledgements.
    pub control_timeout: Duration,
    params: Arc<DashMap<Arc<str>, Arc<str>>>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            control_timeout: DEFAULT_COMMAND_TIMEOUT,
            params: Arc::new(DashMap::new()),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_param(&self, key: &str, value: impl Into<String>) {
        let value: String = value.into();
        self.params.insert(Arc::from(key), Arc::from(value.as_str()));
    }

    pub fn param(&self, key: &str) -> Option<Arc<str>> {
        self.params.get(key).map(|v| Arc::clone(v.value()))
    }

    /// Typed parameter with fallback; a malformed value is a config error.
    pub fn param_or<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.param(key) {
            Some(raw) => raw
                .parse::<T>()
                .map_err(|_| Error::Config(format!("parameter {} = {:?} is malformed", key, raw))),
            None => Ok(default),
        }
    }

    /// All parameters whose key starts with `prefix`, sorted by key.
    pub fn search_prefix(&self, prefix: &str) -> Vec<(Arc<str>, Arc<str>)> {
        let mut out: Vec<_> = self
            .params
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (Arc::clone(e.key()), Arc::clone(e.value())))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("command_timeout", &self.command_timeout)
            .field("control_timeout", &self.control_timeout)
            .field("params", &self.params.len())
            .finish()
    }
}
