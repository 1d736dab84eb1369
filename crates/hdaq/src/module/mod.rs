// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Modules: units of data processing owning ports, pool handles and timers.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──attach──▶ Configured ──Start──▶ Running ⇄ Stopped ──Destroy──▶ Destroyed
//! ```
//!
//! # Flavours
//!
//! - **Async** ([`ModuleCallbacks`]): one callback per event kind, called on
//!   the module thread for the oldest pending event. Callbacks never block;
//!   an operation that would block requests a notification instead
//!   ([`ModuleContext::request_buffer`]) and returns.
//! - **Sync** ([`SyncModule`]): a user loop with blocking calls
//!   ([`SyncContext::recv`], [`SyncContext::send`], ...) that keep draining
//!   the thread mailbox while waiting. Stopping the module makes the next
//!   wait fail with [`WaitError::Stopped`].
//!
//! Items are declared on a [`ModuleSpec`] before creation; the returned ids
//! are the handles a module uses at runtime.

mod context;
mod core;
mod items;
mod port;
mod runner;

#[cfg(test)]
mod tests;

pub use context::{ModuleContext, SyncContext};
pub use port::{Port, PortStats};

pub(crate) use self::core::{ModuleCore, ModuleShared};
pub(crate) use runner::{Body, ModuleRunner};

use crate::command::{Command, CommandResult};
use crate::config::PortConfig;
use crate::error::WaitError;
use std::fmt;
use std::time::Duration;

/// Index of a port within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub(crate) u16);

impl PortId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Index of a pool handle within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolHandleId(pub(crate) u16);

impl PoolHandleId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Index of a timer within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u16);

impl TimerId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Module lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Created,
    Configured,
    Running,
    Stopped,
    Destroyed,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleState::Created => "Created",
            ModuleState::Configured => "Configured",
            ModuleState::Running => "Running",
            ModuleState::Stopped => "Stopped",
            ModuleState::Destroyed => "Destroyed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PortSpec {
    pub(crate) name: String,
    pub(crate) config: PortConfig,
}

#[derive(Debug, Clone)]
pub(crate) struct PoolSpec {
    pub(crate) name: String,
    pub(crate) pool: String,
}

#[derive(Debug, Clone)]
pub(crate) struct TimerSpec {
    pub(crate) name: String,
    pub(crate) period: Option<Duration>,
}

/// Declaration of a module and its items.
#[derive(Debug, Clone)]
pub struct ModuleSpec {
    pub(crate) name: String,
    pub(crate) ports: Vec<PortSpec>,
    pub(crate) pools: Vec<PoolSpec>,
    pub(crate) timers: Vec<TimerSpec>,
}

impl ModuleSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ports: Vec::new(),
            pools: Vec::new(),
            timers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_port(&mut self, name: impl Into<String>, config: PortConfig) -> PortId {
        self.ports.push(PortSpec {
            name: name.into(),
            config,
        });
        PortId((self.ports.len() - 1) as u16)
    }

    /// Input-only port with the given queue capacity.
    pub fn add_input(&mut self, name: impl Into<String>, capacity: usize) -> PortId {
        self.add_port(name, PortConfig::input(capacity))
    }

    /// Output-only port with the given queue capacity.
    pub fn add_output(&mut self, name: impl Into<String>, capacity: usize) -> PortId {
        self.add_port(name, PortConfig::output(capacity))
    }

    /// Handle on a pool registered in the context under `pool`.
    pub fn add_pool_handle(&mut self, name: impl Into<String>, pool: impl Into<String>) -> PoolHandleId {
        self.pools.push(PoolSpec {
            name: name.into(),
            pool: pool.into(),
        });
        PoolHandleId((self.pools.len() - 1) as u16)
    }

    /// Timer; periodic ones are armed on start, others via
    /// [`ModuleContext::activate_timer`].
    pub fn add_timer(&mut self, name: impl Into<String>, period: Option<Duration>) -> TimerId {
        self.timers.push(TimerSpec {
            name: name.into(),
            period,
        });
        TimerId((self.timers.len() - 1) as u16)
    }
}

/// Event callbacks of an Async module.
///
/// Every callback runs on the module thread and must return promptly.
pub trait ModuleCallbacks: Send + 'static {
    fn before_start(&mut self, _ctx: &mut ModuleContext<'_>) {}

    fn after_stop(&mut self, _ctx: &mut ModuleContext<'_>) {}

    fn process_input_event(&mut self, _ctx: &mut ModuleContext<'_>, _port: PortId) {}

    fn process_output_event(&mut self, _ctx: &mut ModuleContext<'_>, _port: PortId) {}

    fn process_pool_event(&mut self, _ctx: &mut ModuleContext<'_>, _pool: PoolHandleId) {}

    fn process_timer_event(&mut self, _ctx: &mut ModuleContext<'_>, _timer: TimerId) {}

    fn process_connect_event(&mut self, _ctx: &mut ModuleContext<'_>, _port: PortId) {}

    fn process_disconnect_event(&mut self, _ctx: &mut ModuleContext<'_>, _port: PortId) {}

    fn process_user_event(&mut self, _ctx: &mut ModuleContext<'_>, _code: u32) {}

    /// Module-specific commands. Returning [`CommandResult::Postponed`]
    /// keeps the command for a later [`ModuleContext::reply_postponed`].
    fn execute_command(&mut self, _ctx: &mut ModuleContext<'_>, _cmd: &mut Command) -> CommandResult {
        CommandResult::Unknown
    }
}

/// Blocking main loop of a Sync module.
pub trait SyncModule: Send + 'static {
    /// Runs from start until it returns or a wait fails. Returning
    /// `Err(WaitError::Stopped)` is the normal way out after a stop.
    fn main_loop(&mut self, ctx: &mut SyncContext<'_>) -> Result<(), WaitError>;

    /// Called after the main loop returned.
    fn after_stop(&mut self, _ctx: &mut SyncContext<'_>) {}

    /// Commands received while the main loop is not running. Commands that
    /// arrive during a wait are queued, see [`SyncContext::take_command`].
    fn execute_command(&mut self, _cmd: &mut Command) -> CommandResult {
        CommandResult::Unknown
    }
}
