// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Scheduled all-to-all event transport.
//!
//! One [`TransportModule`] runs per node. Data nodes take combined buffers
//! on `Input`, send every part to the node building that event according
//! to the turn schedule, and hand complete bundles to the local builder on
//! `Output{src}`, one port per contributing node. With a controller, node 0
//! carries no data: it tests the workers, assigns events to builders and
//! collects run results.
//!
//! Without a controller every data node derives the same turns from its
//! own input: turn `T` sends event `T*k + j + 1` to the `j`-th of the `k`
//! builders. When the schedule leaves no node able to build, the transport
//! runs as a link benchmark and sends header-only packets.

mod master;
mod node;
mod stats;


pub use stats::TransportStats;

use crate::clock::ClusterClock;
use crate::config::BnetConfig;
use crate::error::{BnetError, Result};
use crate::fabric::{Completion, Fabric};
use crate::format::BUFFER_TYPE_EOF;
use crate::schedule::{Pattern, Schedule};
use crate::wire::{
    rd_f64, CommandId, CommandMessage, ControlIter, ControlKind, EventId, SendKind, TransportHeader,
};
use hdaq::{
    Buffer, Command, CommandResult, MemoryPool, ModuleCallbacks, ModuleContext, ModuleSpec,
    PoolHandleId, PortId, TimerId,
};
use master::Master;
use node::{NextOp, Worker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Completions handled per poll.
const POLL_BATCH: usize = 64;

/// Seconds between start and the first turn, so that every node has its
/// receive buffers posted.
const START_GRACE: f64 = 0.05;

/// Schedule of the active data nodes for the configured pattern.
pub(crate) fn build_schedule(config: &BnetConfig, active: &[bool], prepared: Option<&Schedule>) -> Schedule {
    let step = config.turn_period().as_secs_f64();
    let live: Vec<usize> = config
        .data_nodes()
        .into_iter()
        .filter(|n| active.get(*n).copied().unwrap_or(false))
        .collect();
    match config.schedule_pattern() {
        Pattern::RoundRobin => {
            let mut sch = Schedule::new(0, config.nodes);
            sch.fill_round_robin(Some(&live), step);
            sch
        }
        pattern => {
            let mut sch = Schedule::for_pattern(pattern, config.nodes, config.channels, step, prepared);
            for node in 0..config.nodes {
                if !live.contains(&node) {
                    sch.exclude_inactive_node(node);
                }
            }
            sch
        }
    }
}

/// Active data nodes that receive from every other active data node within
/// one turn, in node order. Only those can build complete events.
pub(crate) fn builder_nodes(schedule: &Schedule, active_data: &[usize]) -> Vec<usize> {
    active_data
        .iter()
        .copied()
        .filter(|&b| {
            active_data.iter().filter(|&&a| a != b).all(|&a| {
                (0..schedule.num_slots()).any(|slot| schedule.item(slot, a).node == Some(b))
            })
        })
        .collect()
}

/// Packet queued by a role, sent on lid 0.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Outgoing {
    pub target: usize,
    pub kind: SendKind,
    pub evid: EventId,
    pub payload: Vec<u8>,
}

impl Outgoing {
    pub(crate) fn command(target: usize, msg: CommandMessage, data: &[u8]) -> Self {
        Self {
            target,
            kind: SendKind::Command,
            evid: EventId::control(u64::from(msg.cmdid)),
            payload: msg.encode_with(data),
        }
    }

    pub(crate) fn control(target: usize, payload: Vec<u8>) -> Self {
        Self {
            target,
            kind: SendKind::Control,
            evid: EventId::control(0),
            payload,
        }
    }
}

struct InFlight {
    target: usize,
    lid: usize,
}

/// Packet layer over the fabric: headers, sequence numbers and the send
/// window per channel and target.
struct Link {
    node: usize,
    num_nodes: usize,
    fabric: Box<dyn Fabric>,
    clock: Arc<dyn ClusterClock>,
    seq_out: Vec<u32>,
    seq_in: Vec<u32>,
    /// `[lid][target]` sends not yet completed.
    outstanding: Vec<Vec<usize>>,
    in_flight: HashMap<u64, InFlight>,
    next_token: u64,
    stats: TransportStats,
}

impl Link {
    fn can_post(&self, target: usize, lid: usize, limit: usize) -> bool {
        self.outstanding
            .get(lid)
            .and_then(|l| l.get(target))
            .is_some_and(|n| *n < limit)
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    /// Frame and post one packet. False when no buffer was available or the
    /// fabric refused it; refused packets count as lost.
    fn post(&mut self, pool: &MemoryPool, target: usize, lid: usize, kind: SendKind, evid: EventId, payload: &[u8]) -> bool {
        let mut packet = pool.take(payload.len(), TransportHeader::SIZE);
        if packet.is_null() {
            return false;
        }
        let seq = &mut self.seq_out[target];
        *seq += 1;
        let header = TransportHeader {
            srcnode: self.node as u32,
            tgtnode: target as u32,
            evid,
            send_tm: self.clock.now(),
            seqid: *seq,
            kind,
            sendlen: payload.len() as u32,
        };
        let framed = packet
            .header_mut()
            .map(|h| header.encode(h))
            .and_then(|()| packet.data_mut().map(|d| d[..payload.len()].copy_from_slice(payload)));
        if let Err(e) = framed {
            log::warn!("[Link::post] cannot frame packet for node {}: {}", target, e);
            return false;
        }
        let token = self.token();
        match self.fabric.post_send(target, lid, packet, token) {
            Ok(()) => {
                self.in_flight.insert(token, InFlight { target, lid });
                if let Some(n) = self.outstanding.get_mut(lid).and_then(|l| l.get_mut(target)) {
                    *n += 1;
                }
                self.stats.sent_packets += 1;
                self.stats.sent_bytes += (TransportHeader::SIZE + payload.len()) as u64;
                true
            }
            Err(e) => {
                log::warn!("[Link::post] send to node {} failed: {}", target, e);
                self.stats.lost += 1;
                false
            }
        }
    }

    /// Settle send completions and return the filled receive buffers.
    fn poll(&mut self) -> Vec<Buffer> {
        let mut completions = Vec::new();
        let mut received = Vec::new();
        while self.fabric.poll(&mut completions, POLL_BATCH) > 0 {
            for c in completions.drain(..) {
                match c {
                    Completion::Send { token, ok } => {
                        if let Some(f) = self.in_flight.remove(&token) {
                            if let Some(n) = self.outstanding.get_mut(f.lid).and_then(|l| l.get_mut(f.target)) {
                                *n = n.saturating_sub(1);
                            }
                        }
                        if !ok {
                            self.stats.lost += 1;
                        }
                    }
                    Completion::Recv { buffer, .. } => received.push(buffer),
                }
            }
        }
        received
    }

    /// Keep `depth` receive buffers posted.
    fn repost(&mut self, ctx: &mut ModuleContext<'_>, pool: PoolHandleId, size: usize, depth: usize) {
        while self.fabric.posted_recvs() < depth {
            let Some(buffer) = ctx.request_buffer(pool, size) else {
                break;
            };
            let token = self.token();
            if let Err(e) = self.fabric.post_recv(buffer, token) {
                log::warn!("[Link::repost] node {}: {}", self.node, e);
                break;
            }
        }
    }

    /// Decode and check a received packet; counts it and any sequence gap.
    fn accept(&mut self, buffer: &Buffer) -> Option<TransportHeader> {
        let data = buffer.data();
        let header = match TransportHeader::decode(data)
            .and_then(|h| h.validate(self.node, self.num_nodes, data.len()).map(|()| h))
        {
            Ok(h) => h,
            Err(e) => {
                log::debug!("[Link::accept] node {} dropped packet: {}", self.node, e);
                self.stats.lost += 1;
                return None;
            }
        };
        let src = header.srcnode as usize;
        self.stats.recv_packets += 1;
        self.stats.recv_bytes += data.len() as u64;
        let expected = self.seq_in[src] + 1;
        if header.seqid > expected {
            self.stats.lost += u64::from(header.seqid - expected);
        }
        self.seq_in[src] = self.seq_in[src].max(header.seqid);
        Some(header)
    }
}

enum Role {
    Controller(Box<Master>),
    Worker(Box<Worker>),
}

/// Transport of one node.
pub struct TransportModule {
    node: usize,
    config: BnetConfig,
    link: Link,
    role: Role,
    input: Option<PortId>,
    /// Output per contributor slot, on builder nodes.
    outputs: Vec<Option<PortId>>,
    pool: PoolHandleId,
    timer: TimerId,
    outbox: Vec<Outgoing>,
    eof_seen: u64,
    shared: Arc<Mutex<TransportStats>>,
}

impl TransportModule {
    /// Name of the module of `node`.
    pub fn module_name(node: usize) -> String {
        format!("Transport{}", node)
    }

    /// Name of the output carrying the parts contributed by `src`.
    pub fn output_name(src: usize) -> String {
        format!("Output{}", src)
    }

    /// Nodes that build events when every configured node is alive.
    pub fn planned_builders(config: &BnetConfig, prepared: Option<&Schedule>) -> Vec<usize> {
        let active = vec![true; config.nodes];
        let schedule = build_schedule(config, &active, prepared);
        builder_nodes(&schedule, &config.data_nodes())
    }

    /// Declare the transport of `node`, taking packets from pool `Pool{node}`.
    pub fn new(
        config: &BnetConfig,
        node: usize,
        fabric: Box<dyn Fabric>,
        clock: Arc<dyn ClusterClock>,
        prepared: Option<Schedule>,
    ) -> Result<(ModuleSpec, Self)> {
        config.validate()?;
        if node >= config.nodes || fabric.node() != node || fabric.num_nodes() != config.nodes {
            return Err(BnetError::Config(format!(
                "fabric endpoint {} of {} does not match node {} of {}",
                fabric.node(),
                fabric.num_nodes(),
                node,
                config.nodes
            )));
        }
        build_schedule(config, &vec![true; config.nodes], prepared.as_ref()).fill_receive_schedule()?;

        let is_controller = config.controller && node == 0;
        let data_nodes = config.data_nodes();
        let mut spec = ModuleSpec::new(Self::module_name(node));
        let input = (!is_controller).then(|| spec.add_input("Input", config.recv_queue));
        let outputs = if Self::planned_builders(config, prepared.as_ref()).contains(&node) {
            data_nodes
                .iter()
                .map(|src| Some(spec.add_output(Self::output_name(*src), config.recv_queue)))
                .collect()
        } else {
            vec![None; data_nodes.len()]
        };
        let pool = spec.add_pool_handle("Pool", format!("Pool{}", node));
        let period = (config.turn_period() / 4).max(Duration::from_micros(100));
        let timer = spec.add_timer("Poll", Some(period));

        let role = if is_controller {
            Role::Controller(Box::new(Master::new(config, prepared)))
        } else {
            Role::Worker(Box::new(Worker::new(config, node, prepared)))
        };
        let lids = config.channels.max(1);
        let module = Self {
            node,
            config: config.clone(),
            link: Link {
                node,
                num_nodes: config.nodes,
                fabric,
                clock,
                seq_out: vec![0; config.nodes],
                seq_in: vec![0; config.nodes],
                outstanding: vec![vec![0; config.nodes]; lids],
                in_flight: HashMap::new(),
                next_token: 0,
                stats: TransportStats::default(),
            },
            role,
            input,
            outputs,
            pool,
            timer,
            outbox: Vec::new(),
            eof_seen: 0,
            shared: Arc::new(Mutex::new(TransportStats::default())),
        };
        Ok((spec, module))
    }

    /// Shared view of the counters, refreshed on every step.
    pub fn stats_handle(&self) -> Arc<Mutex<TransportStats>> {
        Arc::clone(&self.shared)
    }

    fn step(&mut self, ctx: &mut ModuleContext<'_>) {
        let now = self.link.clock.now();
        for buffer in self.link.poll() {
            self.on_packet(ctx, buffer, now);
        }
        self.link
            .repost(ctx, self.pool, self.config.buffer_size, self.config.recv_depth);

        match &mut self.role {
            Role::Controller(master) => {
                let out = master.tick(ctx.context(), now);
                self.outbox.extend(out);
                if let Some((mut merged, replied, ok)) = master.poll_collect() {
                    merged.merge(&self.link.stats);
                    if let Some(mut cmd) = ctx.take_postponed("CollectResults") {
                        merged.apply_to(&mut cmd);
                        cmd.set("nodes", replied as u64 + 1);
                        cmd.reply(ok.into());
                    }
                }
            }
            Role::Worker(worker) => {
                let node = self.node;
                Self::read_input(ctx, self.input, worker, &mut self.link.stats, &mut self.eof_seen, now);
                worker.plan_turns(now);
                worker.expand_turns();
                Self::run_ops(ctx, &self.config, &mut self.link, worker, self.pool, now);
                if let Some(report) = worker.report() {
                    self.outbox.push(Outgoing::control(0, report));
                }
                let lifetime = self.config.event_lifetime().as_secs_f64();
                Self::deliver(ctx, node, &self.outputs, worker, &mut self.link.stats, now, lifetime);
            }
        }
        self.flush_outbox(ctx);
        *self.shared.lock() = self.link.stats.clone();
    }

    fn flush_outbox(&mut self, ctx: &mut ModuleContext<'_>) {
        if self.outbox.is_empty() {
            return;
        }
        let pool = ctx.pool(self.pool).clone();
        Self::drain_outbox(self.node, &mut self.link, &pool, &mut self.outbox);
    }

    /// Post queued packets in order up to the first one without a free
    /// packet buffer. Packets larger than any block of `pool` are dropped
    /// and counted as lost.
    fn drain_outbox(node: usize, link: &mut Link, pool: &MemoryPool, outbox: &mut Vec<Outgoing>) {
        let max_packet = pool.max_block_size();
        let mut pending = std::mem::take(outbox).into_iter();
        for out in pending.by_ref() {
            if TransportHeader::SIZE + out.payload.len() > max_packet {
                log::warn!(
                    "[TransportModule::flush_outbox] node {}: {:?} of {} bytes to node {} exceeds packet size {}, dropped",
                    node,
                    out.kind,
                    out.payload.len(),
                    out.target,
                    max_packet
                );
                link.stats.lost += 1;
                continue;
            }
            if !link.post(pool, out.target, 0, out.kind, out.evid, &out.payload) {
                log::debug!(
                    "[TransportModule::flush_outbox] node {}: no packet buffer, {:?} to node {} deferred",
                    node,
                    out.kind,
                    out.target
                );
                outbox.push(out);
                break;
            }
        }
        outbox.extend(pending);
    }

    fn read_input(
        ctx: &mut ModuleContext<'_>,
        input: Option<PortId>,
        worker: &mut Worker,
        stats: &mut TransportStats,
        eof_seen: &mut u64,
        now: f64,
    ) {
        let Some(input) = input else { return };
        while worker.can_accept_part() && ctx.can_recv(input) {
            let Some(buf) = ctx.recv(input) else { break };
            if buf.type_tag() == BUFFER_TYPE_EOF {
                *eof_seen += 1;
                log::debug!("[TransportModule::read_input] {} end of data", ctx.name());
                continue;
            }
            let Some(evid) = EventId::from_le_slice(buf.header()).filter(|e| !e.is_none()) else {
                log::warn!("[TransportModule::read_input] {} buffer without event id", ctx.name());
                stats.lost += 1;
                continue;
            };
            if !worker.accept_part(evid, buf, now) {
                stats.skipped += 1;
            }
        }
    }

    fn run_ops(
        ctx: &mut ModuleContext<'_>,
        config: &BnetConfig,
        link: &mut Link,
        worker: &mut Worker,
        pool: PoolHandleId,
        now: f64,
    ) {
        let lifetime = config.event_lifetime().as_secs_f64();
        loop {
            match worker.next_op(now, lifetime, &mut link.stats) {
                NextOp::Idle => break,
                NextOp::Dummy { target, lid } => {
                    if !link.can_post(target, lid, config.send_queue)
                        || !link.post(ctx.pool(pool), target, lid, SendKind::Dummy, EventId::NONE, &[])
                    {
                        break;
                    }
                    worker.pop_op();
                }
                NextOp::Send { target, lid, evid, len } => {
                    if !link.can_post(target, lid, config.send_queue) {
                        break;
                    }
                    let Some(data) = worker.parts.find(evid).map(|p| p.buf.duplicate()) else {
                        break;
                    };
                    debug_assert_eq!(data.data_len(), len);
                    if !link.post(ctx.pool(pool), target, lid, SendKind::Data, evid, data.data()) {
                        break;
                    }
                    worker.pop_op();
                }
                NextOp::Local { evid } => {
                    let node = link.node;
                    if let Some(part) = worker.pop_op() {
                        if !worker.accept_remote(node, evid, part.buf, now) {
                            link.stats.lost += 1;
                        }
                    }
                }
            }
        }
    }

    fn deliver(
        ctx: &mut ModuleContext<'_>,
        node: usize,
        outputs: &[Option<PortId>],
        worker: &mut Worker,
        stats: &mut TransportStats,
        now: f64,
        lifetime: f64,
    ) {
        loop {
            if !worker.bundles.front_ready() {
                break;
            }
            let blocked = (0..outputs.len()).any(|slot| {
                worker.bundles.is_required(slot) && outputs[slot].map_or(true, |p| !ctx.can_send(p))
            });
            if blocked {
                break;
            }
            let Some(rec) = worker.bundles.pop_front() else { break };
            for (slot, buf) in rec.bufs.into_iter().enumerate() {
                let (Some(buf), Some(port)) = (buf, outputs[slot]) else { continue };
                if let Err(e) = ctx.send(port, buf) {
                    log::warn!("[TransportModule::deliver] node {} event {}: {}", node, rec.evid, e);
                }
            }
            worker.mark_delivered(rec.evid);
            stats.bundles += 1;
        }
        while let Some(rec) = worker.bundles.pop_expired(now - lifetime) {
            log::debug!(
                "[TransportModule::deliver] node {} drops event {} with {} of {} parts",
                node,
                rec.evid,
                rec.num_filled(),
                rec.bufs.len()
            );
            worker.mark_delivered(rec.evid);
            stats.incomplete += 1;
        }
    }

    fn on_packet(&mut self, ctx: &mut ModuleContext<'_>, mut buffer: Buffer, now: f64) {
        let Some(header) = self.link.accept(&buffer) else {
            return;
        };
        let src = header.srcnode as usize;
        let end = TransportHeader::SIZE + header.sendlen as usize;
        match header.kind {
            SendKind::Dummy => {}
            SendKind::Data => {
                let Role::Worker(worker) = &mut self.role else {
                    self.link.stats.lost += 1;
                    return;
                };
                self.link.stats.record_latency(now - header.send_tm);
                let framed = buffer
                    .set_header_size(TransportHeader::SIZE)
                    .and_then(|()| buffer.set_data_len(header.sendlen as usize));
                if framed.is_err() || !worker.accept_remote(src, header.evid, buffer, now) {
                    self.link.stats.lost += 1;
                }
            }
            SendKind::Control => {
                let payload = &buffer.data()[TransportHeader::SIZE..end];
                let handled = match &mut self.role {
                    Role::Controller(master) => master.on_control(src, payload, now),
                    Role::Worker(worker) => Self::worker_control(worker, payload),
                };
                if let Err(e) = handled {
                    log::warn!("[TransportModule::on_packet] node {} control from {}: {}", self.node, src, e);
                }
            }
            SendKind::Command => match CommandMessage::decode(&buffer.data()[TransportHeader::SIZE..end]) {
                Ok((msg, data)) => {
                    if msg.is_reply() {
                        if let Role::Controller(master) = &mut self.role {
                            master.on_reply(src, &msg, data);
                        }
                    } else {
                        self.worker_command(ctx, src, &msg, data);
                    }
                }
                Err(e) => {
                    log::warn!("[TransportModule::on_packet] node {} command from {}: {}", self.node, src, e);
                    self.link.stats.lost += 1;
                }
            },
        }
    }

    fn worker_control(worker: &mut Worker, payload: &[u8]) -> Result<()> {
        for rec in ControlIter::new(payload) {
            let (kind, data) = rec?;
            match kind {
                ControlKind::Turns => {
                    worker.add_raw_turns(data)?;
                }
                ControlKind::SkipMarkers => {
                    if let Some(marker) = EventId::from_le_slice(data) {
                        worker.skip_until(marker);
                    }
                }
                ControlKind::SchedSlot => worker.apply_sched_slot(data)?,
                ControlKind::Null => {}
                other => log::debug!("[TransportModule::worker_control] ignoring {:?}", other),
            }
        }
        Ok(())
    }

    fn worker_command(&mut self, ctx: &mut ModuleContext<'_>, src: usize, msg: &CommandMessage, data: &[u8]) {
        let Role::Worker(worker) = &mut self.role else {
            log::debug!("[TransportModule::worker_command] controller ignores command {}", msg.cmdid);
            return;
        };
        let reply = msg.reply(self.node);
        match msg.command() {
            Some(CommandId::Test) => self.outbox.push(Outgoing::command(src, reply, &[])),
            Some(CommandId::TimeSync) => {
                if data.len() >= 8 {
                    self.link.clock.sync_to(rd_f64(data, 0));
                }
                self.outbox.push(Outgoing::command(src, reply, &[]));
            }
            Some(CommandId::ActiveNodes) => {
                let mask: Vec<bool> = data.iter().map(|b| *b != 0).collect();
                worker.apply_active(&mask);
                self.outbox.push(Outgoing::command(src, reply, &[]));
            }
            Some(CommandId::GetRunRes) => {
                let raw = self.link.stats.encode();
                self.outbox.push(Outgoing::command(src, reply, &raw));
            }
            Some(CommandId::Exit) => {
                log::info!("[TransportModule] {} exit requested by node {}", ctx.name(), src);
                ctx.stop();
            }
            other => log::debug!("[TransportModule::worker_command] unsupported command {:?}", other),
        }
    }
}

impl ModuleCallbacks for TransportModule {
    fn before_start(&mut self, ctx: &mut ModuleContext<'_>) {
        log::info!(
            "[TransportModule] {} starts as {}",
            ctx.name(),
            match &self.role {
                Role::Controller(_) => "controller",
                Role::Worker(w) if w.is_builder() => "builder",
                Role::Worker(_) => "sender",
            }
        );
        if let Role::Worker(worker) = &mut self.role {
            worker.hold_until(self.link.clock.now() + START_GRACE);
        }
        self.step(ctx);
    }

    fn after_stop(&mut self, ctx: &mut ModuleContext<'_>) {
        if let Role::Controller(master) = &self.role {
            let pool = ctx.pool(self.pool).clone();
            for out in master.exit_messages() {
                self.link.post(&pool, out.target, 0, out.kind, out.evid, &out.payload);
            }
        }
        *self.shared.lock() = self.link.stats.clone();
        log::info!(
            "[TransportModule] {} stopped: {} packets out, {} in, {} lost, {} bundles",
            ctx.name(),
            self.link.stats.sent_packets,
            self.link.stats.recv_packets,
            self.link.stats.lost,
            self.link.stats.bundles
        );
    }

    fn process_input_event(&mut self, ctx: &mut ModuleContext<'_>, _port: PortId) {
        self.step(ctx);
    }

    fn process_output_event(&mut self, ctx: &mut ModuleContext<'_>, _port: PortId) {
        self.step(ctx);
    }

    fn process_pool_event(&mut self, ctx: &mut ModuleContext<'_>, _pool: PoolHandleId) {
        self.step(ctx);
    }

    fn process_timer_event(&mut self, ctx: &mut ModuleContext<'_>, timer: TimerId) {
        if timer == self.timer {
            self.step(ctx);
        }
    }

    fn execute_command(&mut self, ctx: &mut ModuleContext<'_>, cmd: &mut Command) -> CommandResult {
        if cmd.is("GetRunRes") {
            self.link.stats.apply_to(cmd);
            cmd.set("eof", self.eof_seen);
            return CommandResult::True;
        }
        if cmd.is("CollectResults") {
            let Role::Controller(master) = &mut self.role else {
                return CommandResult::Denied;
            };
            let out = master.start_collect(ctx.context());
            self.outbox.extend(out);
            self.flush_outbox(ctx);
            return CommandResult::Postponed;
        }
        CommandResult::Unknown
    }
}
