// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # HDAQ-BNET - event building network
//!
//! Modules on top of the [`hdaq`] runtime that merge readout streams of
//! several nodes into complete events: MBS-like framing, a stream merging
//! builder and a scheduled all-to-all transport over a packet [`fabric`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hdaq::{RuntimeConfig, RuntimeContext};
//! use hdaq_bnet::{BnetConfig, Cluster, ClusterOptions};
//! use std::time::Duration;
//!
//! fn main() -> hdaq_bnet::Result<()> {
//!     let ctx = RuntimeContext::new(RuntimeConfig::default())?;
//!     let config = BnetConfig { nodes: 3, ..BnetConfig::default() };
//!     let cluster = Cluster::deploy(&ctx, &config, &ClusterOptions::default(), None)?;
//!     ctx.start_all()?;
//!     std::thread::sleep(Duration::from_secs(1));
//!     println!("built {} events", cluster.built_events());
//!     ctx.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Data Path
//!
//! ```text
//! Generator -> Combiner -> Transport ==(Fabric)==> Transport -> Builder
//!  (readout)   (event id)  (turns, parts)          (bundles)    (merge)
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`EventIterator`] / [`EventWriter`] | Read and write framed buffers |
//! | [`BuilderModule`] | Merges N aligned readout streams into one |
//! | [`TransportModule`] | Moves event parts to their builder node per schedule |
//! | [`Schedule`] | Slot table of who sends to whom |
//! | [`Fabric`] | Packet device with posted receives; [`LoopbackCluster`] in process |
//! | [`Cluster`] | Wires a whole in-process cluster |

/// Event builder merging aligned streams.
pub mod builder;
/// Cluster time base.
pub mod clock;
/// In-process cluster wiring.
pub mod cluster;
/// Event id assignment and packing of readout events.
pub mod combiner;
/// TOML configuration of a cluster run.
pub mod config;
/// Error type.
pub mod error;
/// Packet devices.
pub mod fabric;
/// Buffer, event and subevent framing.
pub mod format;
/// Test event source.
pub mod generator;
/// Parts, master, bundle and turn queues.
pub mod queues;
/// Transfer schedules and their file format.
pub mod schedule;
/// Scheduled all-to-all transport.
pub mod transport;
/// Wire records: transport header, commands and control records.
pub mod wire;

pub use builder::{BuilderModule, BuilderStats, EventBuilder};
pub use clock::{ClusterClock, EpochClock};
pub use cluster::{Cluster, ClusterOptions};
pub use combiner::{Combiner, CombinerModule, CombinerStats};
pub use config::BnetConfig;
pub use error::{BnetError, Result};
pub use fabric::{Completion, Fabric, LoopbackCluster, LoopbackFabric, PacketInfo};
pub use format::{EventIterator, EventWriter};
pub use generator::{GeneratorConfig, GeneratorModule, GeneratorStats};
pub use schedule::{Pattern, Schedule};
pub use transport::{TransportModule, TransportStats};
pub use wire::EventId;

/// HDAQ-BNET version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
