// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process cluster wiring.
//!
//! Every live data node gets the chain
//!
//! ```text
//! Generator{n} -> Combiner{n} -> Transport{n} =(fabric)=> Transport{b}/Output{n} -> Builder{b}/Input{i}
//! ```
//!
//! on threads `Node{n}` (generator, transport), `Combiner{n}` and
//! `Builder{n}`. Node 0 runs only its transport when it is the controller.
//! Dead nodes get no modules at all, which is how lost nodes are emulated.

use crate::builder::{BuilderModule, BuilderStats};
use crate::clock::{ClusterClock, EpochClock};
use crate::combiner::{CombinerModule, CombinerStats, EVENT_ID_HEADER};
use crate::config::BnetConfig;
use crate::error::{BnetError, Result};
use crate::fabric::LoopbackCluster;
use crate::generator::{GeneratorConfig, GeneratorModule, GeneratorStats};
use crate::schedule::Schedule;
use crate::transport::{TransportModule, TransportStats};
use crate::wire::TransportHeader;
use hdaq::{Command, CommandReply, RuntimeContext};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Output buffers per builder pool.
const BUILDER_POOL_BLOCKS: usize = 16;

/// `module/port` path.
pub fn port_path(module: &str, port: &str) -> String {
    format!("{}/{}", module, port)
}

pub fn generator_name(node: usize) -> String {
    format!("Generator{}", node)
}

pub fn combiner_name(node: usize) -> String {
    format!("Combiner{}", node)
}

pub fn builder_name(node: usize) -> String {
    format!("Builder{}", node)
}

/// What to run besides the configuration.
#[derive(Debug, Clone, Default)]
pub struct ClusterOptions {
    /// Event source template; `proc_id` is replaced by the node number.
    pub generator: GeneratorConfig,
    /// Nodes left without modules.
    pub dead_nodes: Vec<usize>,
}

/// Counters of one node.
#[derive(Default)]
struct NodeHandles {
    transport: Option<Arc<Mutex<TransportStats>>>,
    generator: Option<Arc<Mutex<GeneratorStats>>>,
    combiner: Option<Arc<Mutex<CombinerStats>>>,
    builder: Option<Arc<Mutex<BuilderStats>>>,
}

/// Modules of a cluster registered in one [`RuntimeContext`].
pub struct Cluster {
    config: BnetConfig,
    fabric: LoopbackCluster,
    nodes: Vec<NodeHandles>,
    builders: Vec<usize>,
}

impl Cluster {
    /// Create pools, threads and modules of every live node and connect
    /// them. Modules are not started.
    pub fn deploy(
        ctx: &RuntimeContext,
        config: &BnetConfig,
        options: &ClusterOptions,
        prepared: Option<Schedule>,
    ) -> Result<Self> {
        config.validate()?;
        if let Some(bad) = options.dead_nodes.iter().find(|n| **n >= config.nodes) {
            return Err(BnetError::Config(format!("dead node {} out of {}", bad, config.nodes)));
        }
        if config.controller && options.dead_nodes.contains(&0) {
            return Err(BnetError::Config("the controller cannot be dead".into()));
        }
        let live = |n: usize| !options.dead_nodes.contains(&n);
        let fabric = LoopbackCluster::new(config.nodes);
        let epoch = EpochClock::new();
        let builders = TransportModule::planned_builders(config, prepared.as_ref());
        let data_nodes = config.data_nodes();
        let mut nodes: Vec<NodeHandles> = (0..config.nodes).map(|_| NodeHandles::default()).collect();

        let packet_room = config.buffer_size - TransportHeader::SIZE;
        for node in (0..config.nodes).filter(|n| live(*n)) {
            let thread = format!("Node{}", node);
            let pool = format!("Pool{}", node);
            ctx.create_thread(&thread)?;
            ctx.create_pool(&pool, &[(config.buffer_size, config.pool_size)])?;

            let clock: Arc<dyn ClusterClock> = Arc::new(epoch.sibling());
            let (spec, transport) = TransportModule::new(
                config,
                node,
                Box::new(fabric.endpoint(node)?),
                clock,
                prepared.clone(),
            )?;
            nodes[node].transport = Some(transport.stats_handle());
            ctx.create_module(spec, transport, &thread)?;

            if config.controller && node == 0 {
                continue;
            }

            let gen_config = GeneratorConfig {
                proc_id: node as u16,
                buffer_size: options.generator.buffer_size.min(config.buffer_size),
                ..options.generator.clone()
            };
            let (spec, generator) = GeneratorModule::new(&generator_name(node), &pool, gen_config);
            nodes[node].generator = Some(generator.stats_handle());
            ctx.create_module(spec, generator, &thread)?;

            let combiner_thread = combiner_name(node);
            ctx.create_thread(&combiner_thread)?;
            let (spec, combiner) = CombinerModule::new(
                &combiner_name(node),
                &pool,
                config.events_combine,
                packet_room,
                packet_room - EVENT_ID_HEADER,
            );
            nodes[node].combiner = Some(combiner.stats_handle());
            ctx.create_sync_module(spec, combiner, &combiner_thread)?;

            ctx.connect(
                &port_path(&generator_name(node), "Output"),
                &port_path(&combiner_name(node), "Input"),
            )?;
            ctx.connect(
                &port_path(&combiner_name(node), "Output"),
                &port_path(&TransportModule::module_name(node), "Input"),
            )?;
        }

        for &b in builders.iter().filter(|b| live(**b)) {
            let contributors: Vec<usize> = data_nodes.iter().copied().filter(|n| live(*n)).collect();
            let pool = format!("BuilderPool{}", b);
            ctx.create_pool(&pool, &[(config.builder_buffer_size, BUILDER_POOL_BLOCKS)])?;
            let thread = builder_name(b);
            ctx.create_thread(&thread)?;
            let (spec, builder) = BuilderModule::new(
                &builder_name(b),
                &pool,
                contributors.len(),
                config.events_combine,
                config.builder_buffer_size,
            );
            nodes[b].builder = Some(builder.stats_handle());
            ctx.create_sync_module(spec, builder, &thread)?;

            let transport = TransportModule::module_name(b);
            let mut input = 0;
            for src in &data_nodes {
                let out = port_path(&transport, &TransportModule::output_name(*src));
                if live(*src) {
                    ctx.connect(&out, &port_path(&builder_name(b), &format!("Input{}", input)))?;
                    input += 1;
                } else {
                    ctx.connect_null(&out)?;
                }
            }
            ctx.connect_null(&port_path(&builder_name(b), "Output"))?;
        }

        log::info!(
            "[Cluster::deploy] {} nodes, {} dead, builders {:?}",
            config.nodes,
            options.dead_nodes.len(),
            builders
        );
        Ok(Self {
            config: config.clone(),
            fabric,
            nodes,
            builders,
        })
    }

    pub fn config(&self) -> &BnetConfig {
        &self.config
    }

    /// Shared medium, for loss injection.
    pub fn fabric(&self) -> &LoopbackCluster {
        &self.fabric
    }

    /// Builders planned for the full cluster.
    pub fn builders(&self) -> &[usize] {
        &self.builders
    }

    pub fn transport_stats(&self, node: usize) -> Option<TransportStats> {
        let handle = self.nodes.get(node)?.transport.as_ref()?;
        Some(handle.lock().clone())
    }

    pub fn generator_stats(&self, node: usize) -> Option<GeneratorStats> {
        let handle = self.nodes.get(node)?.generator.as_ref()?;
        Some(handle.lock().clone())
    }

    pub fn combiner_stats(&self, node: usize) -> Option<CombinerStats> {
        let handle = self.nodes.get(node)?.combiner.as_ref()?;
        Some(handle.lock().clone())
    }

    pub fn builder_stats(&self, node: usize) -> Option<BuilderStats> {
        let handle = self.nodes.get(node)?.builder.as_ref()?;
        Some(handle.lock().clone())
    }

    /// Events merged by all builders.
    pub fn built_events(&self) -> u64 {
        (0..self.nodes.len())
            .filter_map(|n| self.builder_stats(n))
            .map(|s| s.built_events)
            .sum()
    }

    /// Counters of every live transport added up.
    pub fn transport_totals(&self) -> TransportStats {
        let mut total = TransportStats::default();
        for stats in (0..self.nodes.len()).filter_map(|n| self.transport_stats(n)) {
            total.merge(&stats);
        }
        total
    }

    /// Ask the controller to gather the counters of every worker over the
    /// network. The reply carries the merged counters and `nodes`.
    pub fn collect_results(&self, ctx: &RuntimeContext, timeout: Duration) -> CommandReply {
        let cmd = Command::new("CollectResults").with_receiver(TransportModule::module_name(0));
        ctx.execute(cmd, timeout)
    }
}
