// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # HDAQ - data-acquisition runtime
//!
//! Event-driven runtime moving reference-counted binary buffers through a
//! statically wired graph of processing modules.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hdaq::{ModuleCallbacks, ModuleContext, ModuleSpec, PortId, RuntimeConfig, RuntimeContext};
//!
//! struct Printer;
//!
//! impl ModuleCallbacks for Printer {
//!     fn process_input_event(&mut self, ctx: &mut ModuleContext<'_>, port: PortId) {
//!         while let Some(buf) = ctx.recv(port) {
//!             println!("{} bytes", buf.data_len());
//!         }
//!     }
//! }
//!
//! fn main() -> hdaq::Result<()> {
//!     let ctx = RuntimeContext::new(RuntimeConfig::default())?;
//!     ctx.create_pool("Pool", &[(4096, 16)])?;
//!
//!     let mut spec = ModuleSpec::new("Printer");
//!     spec.add_input("Input", 8);
//!     ctx.create_module(spec, Printer, "Thread1")?;
//!     ctx.start_all()?;
//!
//!     ctx.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                         RuntimeContext                              |
//! |   threads | pools | modules | connections | commands | fatal/exit   |
//! +---------------------------------------------------------------------+
//! |                           Modules                                   |
//! |   Async (ModuleCallbacks)      |   Sync (SyncModule main loop)      |
//! |   Port | PoolHandle | Timer    |   blocking waits on single_loop    |
//! +---------------------------------------------------------------------+
//! |                          Transports                                 |
//! |   LocalTransport (bounded queues, copy on pool change) | Null       |
//! +---------------------------------------------------------------------+
//! |                           Memory                                    |
//! |   MemoryPool size classes -> Buffer (refcounted segments)           |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`RuntimeContext`] | Registry of threads, pools and modules; connects ports and routes commands |
//! | [`MemoryPool`] | Fixed size classes producing [`Buffer`]s, with blocking and async takes |
//! | [`ModuleCallbacks`] | Event callbacks of an Async module |
//! | [`SyncModule`] | Blocking main loop of a Sync module |
//! | [`Command`] | Named request replied exactly once |
//! | [`CommandsSet`] | Fan-out of commands with one aggregate result and a timeout |
//!
//! ## Threading
//!
//! Every module is pinned to one named thread. Work for a module always
//! runs on that thread; modules sharing a thread never run concurrently.
//! A [`RuntimeContext`] must be released with [`RuntimeContext::shutdown`],
//! which stops and destroys every module and joins the threads.

/// Commands, command queues and command sets.
pub mod command;
/// Runtime, port and pool configuration.
pub mod config;
/// Error types (runtime errors, fatal errors, wait outcomes).
pub mod error;
/// Memory pools and reference-counted buffers.
pub mod memory;
/// Modules, ports, pool handles and timers.
pub mod module;
/// Threads, mailboxes and the runtime context.
pub mod runtime;
/// Transports between two ports.
pub mod transport;

pub use command::{
    ChildOutcome, Command, CommandHandle, CommandReply, CommandResult, CommandValue,
    CommandsQueue, CommandsSet, SetHandle, SetOutcome,
};
pub use config::{OnErrorPolicy, PoolConfig, PortConfig, RuntimeConfig};
pub use error::{Error, FatalError, Result, WaitError};
pub use memory::{AsyncTake, Buffer, MemoryPool, PoolRequester, PoolStats, RequestId};
pub use module::{
    ModuleCallbacks, ModuleContext, ModuleSpec, ModuleState, PoolHandleId, Port, PortId,
    PortStats, SyncContext, SyncModule, TimerId,
};
pub use runtime::{ModuleInfo, RuntimeContext};
pub use transport::{LocalTransport, NullTransport, Transport};

/// HDAQ version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
