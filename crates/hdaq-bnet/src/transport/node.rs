// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data plane of a worker node: local parts, turns, send operations and
//! bundles of the events built here.

use super::stats::TransportStats;
use super::{build_schedule, builder_nodes};
use crate::config::BnetConfig;
use crate::error::{BnetError, Result};
use crate::queues::{EventPartRec, EventBundlesQueue, EventsPartsQueue, ScheduleTurnsQueue};
use crate::schedule::Schedule;
use crate::wire::{rd_f64, ControlKind, ControlWriter, EventId};
use hdaq::Buffer;
use std::collections::VecDeque;

/// Turns planned ahead of the running one.
const MAX_TURNS_AHEAD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    /// Part of an event built on another node.
    Data,
    /// Part of an event built on this node.
    Local,
    /// Header-only packet to a node that builds nothing.
    Dummy,
}

/// One scheduled operation of this node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SendOp {
    pub turn: u64,
    /// Earliest execution time, cluster seconds.
    pub time: f64,
    pub target: usize,
    pub lid: usize,
    pub evid: EventId,
    pub kind: OpKind,
}

/// What the head operation needs from the module.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum NextOp {
    Idle,
    Dummy { target: usize, lid: usize },
    Send { target: usize, lid: usize, evid: EventId, len: usize },
    Local { evid: EventId },
}

pub(crate) struct Worker {
    node: usize,
    has_controller: bool,
    /// Contributor slots of the bundles, one per configured data node.
    data_nodes: Vec<usize>,
    active: Vec<bool>,
    schedule: Schedule,
    builders: Vec<usize>,
    config: BnetConfig,
    prepared: Option<Schedule>,

    pub(crate) parts: EventsPartsQueue,
    pub(crate) bundles: EventBundlesQueue,
    pub(crate) turns: ScheduleTurnsQueue,
    ops: VecDeque<SendOp>,

    next_turn: u64,
    last_turn_start: Option<f64>,
    expanded: Option<u64>,
    last_reported: EventId,
    pub(crate) last_delivered: EventId,
    reported_delivered: EventId,
    drop_below: EventId,
    /// Schedule running; set by `SchedSlot` when a controller exists.
    activated: bool,
    start_time: f64,
    parts_limit: usize,
}

impl Worker {
    pub(crate) fn new(config: &BnetConfig, node: usize, prepared: Option<Schedule>) -> Self {
        let active = vec![true; config.nodes];
        let data_nodes = config.data_nodes();
        let schedule = build_schedule(config, &active, prepared.as_ref());
        let builders = builder_nodes(&schedule, &data_nodes);
        let mut worker = Self {
            node,
            has_controller: config.controller,
            bundles: EventBundlesQueue::new(data_nodes.len()),
            data_nodes,
            active,
            schedule,
            builders,
            config: config.clone(),
            prepared,
            parts: EventsPartsQueue::new(),
            turns: ScheduleTurnsQueue::new(config.nodes),
            ops: VecDeque::new(),
            next_turn: 0,
            last_turn_start: None,
            expanded: None,
            last_reported: EventId::NONE,
            last_delivered: EventId::NONE,
            reported_delivered: EventId::NONE,
            drop_below: EventId::NONE,
            activated: !config.controller,
            start_time: 0.0,
            parts_limit: 0,
        };
        worker.update_limits();
        worker
    }

    fn update_limits(&mut self) {
        self.parts_limit = self.config.recv_queue.max(2 * self.builders.len());
    }

    pub(crate) fn is_builder(&self) -> bool {
        self.builders.contains(&self.node)
    }

    #[cfg(test)]
    pub(crate) fn builders(&self) -> &[usize] {
        &self.builders
    }

    #[cfg(test)]
    pub(crate) fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    #[cfg(test)]
    pub(crate) fn is_activated(&self) -> bool {
        self.activated
    }

    /// Contributor slot of `node`.
    pub(crate) fn slot_of(&self, node: usize) -> Option<usize> {
        self.data_nodes.iter().position(|n| *n == node)
    }

    #[cfg(test)]
    pub(crate) fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Room for another local part.
    pub(crate) fn can_accept_part(&self) -> bool {
        self.parts.len() < self.parts_limit
    }

    /// Regenerate the schedule for the nodes marked active.
    pub(crate) fn apply_active(&mut self, active: &[bool]) {
        self.active = (0..self.config.nodes)
            .map(|n| active.get(n).copied().unwrap_or(false))
            .collect();
        self.schedule = build_schedule(&self.config, &self.active, self.prepared.as_ref());
        let live: Vec<usize> = self
            .data_nodes
            .iter()
            .copied()
            .filter(|n| self.active[*n])
            .collect();
        self.builders = builder_nodes(&self.schedule, &live);
        for (slot, node) in self.data_nodes.iter().enumerate() {
            self.bundles.set_required(slot, self.active[*node]);
        }
        self.update_limits();
        log::info!(
            "[Worker::apply_active] node {}: {} active data nodes, builders {:?}",
            self.node,
            live.len(),
            self.builders
        );
    }

    /// Start time and slot length announced by the controller.
    pub(crate) fn apply_sched_slot(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() != 16 {
            return Err(BnetError::Wire(format!("SchedSlot record of {} bytes", payload.len())));
        }
        let start = rd_f64(payload, 0);
        let slot = rd_f64(payload, 8);
        if self.schedule.num_slots() > 0 && slot > 0.0 {
            self.schedule.fill_regular_time(slot);
        }
        self.start_time = start;
        self.activated = true;
        log::debug!(
            "[Worker::apply_sched_slot] node {} runs from {:.6} with slot {:.6}",
            self.node,
            start,
            slot
        );
        Ok(())
    }

    /// Delay the first turn until `start`; a controller announces its own.
    pub(crate) fn hold_until(&mut self, start: f64) {
        if !self.has_controller {
            self.start_time = start;
        }
    }

    /// Drop parts and bundles below `marker`.
    pub(crate) fn skip_until(&mut self, marker: EventId) {
        if marker <= self.drop_below {
            return;
        }
        self.drop_below = marker;
        let parts = self.parts.skip_event_parts(marker);
        let bundles = self.bundles.skip_event_bundles(marker);
        if parts + bundles > 0 {
            log::debug!(
                "[Worker::skip_until] node {} dropped {} parts, {} bundles below {}",
                self.node,
                parts,
                bundles,
                marker
            );
        }
    }

    /// Queue a local part. False when it is stale and was released.
    pub(crate) fn accept_part(&mut self, evid: EventId, buf: Buffer, now: f64) -> bool {
        if self.builders.is_empty() {
            // nothing is built, parts only pace the input
            return true;
        }
        if evid < self.drop_below {
            return false;
        }
        match self.parts.push(evid, buf, now) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[Worker::accept_part] node {}: {}", self.node, e);
                false
            }
        }
    }

    /// Store a part received from `src` for an event built here.
    pub(crate) fn accept_remote(&mut self, src: usize, evid: EventId, buf: Buffer, now: f64) -> bool {
        let Some(slot) = self.slot_of(src) else {
            return false;
        };
        if evid <= self.last_delivered || evid < self.drop_below {
            return false;
        }
        self.bundles.add_part(evid, slot, buf, now)
    }

    /// Plan turns from local data (no controller), or dummy turns when
    /// nothing is built.
    pub(crate) fn plan_turns(&mut self, now: f64) {
        if !self.activated || !self.schedule.is_node_active(self.node) {
            return;
        }
        let k = self.builders.len() as u64;
        let end = self.schedule.end_time();
        if k == 0 {
            if self.ops.is_empty() && self.turns.is_empty() {
                let start = self.next_start(now, end);
                self.add_turn(start, |_| {});
            }
            return;
        }
        if self.has_controller {
            return;
        }
        while self.turns.len() < MAX_TURNS_AHEAD
            && self
                .parts
                .newest()
                .is_some_and(|newest| newest.0 > self.next_turn * k)
        {
            let start = self.next_start(now, end);
            let first = self.next_turn * k;
            let builders = self.builders.clone();
            let added = self.add_turn(start, |vector| {
                for (j, b) in builders.iter().enumerate() {
                    vector[*b] = EventId(first + j as u64 + 1);
                }
            });
            if !added {
                break;
            }
        }
    }

    fn next_start(&self, now: f64, end: f64) -> f64 {
        match self.last_turn_start {
            Some(prev) => (prev + end).max(now),
            None => now.max(self.start_time),
        }
    }

    fn add_turn(&mut self, start: f64, fill: impl FnOnce(&mut [EventId])) -> bool {
        match self.turns.add_new_turn(self.next_turn, start) {
            Ok(rec) => {
                fill(&mut rec.vector);
                self.next_turn += 1;
                self.last_turn_start = Some(start);
                true
            }
            Err(e) => {
                log::error!("[Worker::add_turn] node {}: {}", self.node, e);
                false
            }
        }
    }

    /// Turns announced by the controller.
    pub(crate) fn add_raw_turns(&mut self, raw: &[u8]) -> Result<usize> {
        self.turns.add_raw_turns(raw)
    }

    /// Expand turns not yet expanded into send operations.
    pub(crate) fn expand_turns(&mut self) {
        let mut fresh = Vec::new();
        let mut empty = Vec::new();
        for turn in self.turns.iter() {
            if self.expanded.is_some_and(|last| turn.turn <= last) {
                continue;
            }
            let before = fresh.len();
            let own = turn.vector.get(self.node).copied().unwrap_or(EventId::NONE);
            if !own.is_none() && self.slot_of(self.node).is_some() {
                fresh.push(SendOp {
                    turn: turn.turn,
                    time: turn.starttime,
                    target: self.node,
                    lid: 0,
                    evid: own,
                    kind: OpKind::Local,
                });
            }
            for slot in 0..self.schedule.num_slots() {
                let item = self.schedule.item(slot, self.node);
                let Some(target) = item.node else { continue };
                let time = turn.starttime + self.schedule.time_slot(slot);
                let (evid, kind) = if self.builders.contains(&target) {
                    let evid = turn.vector.get(target).copied().unwrap_or(EventId::NONE);
                    if evid.is_none() {
                        continue;
                    }
                    (evid, OpKind::Data)
                } else {
                    (EventId::NONE, OpKind::Dummy)
                };
                fresh.push(SendOp {
                    turn: turn.turn,
                    time,
                    target,
                    lid: item.lid,
                    evid,
                    kind,
                });
            }
            if fresh.len() == before {
                empty.push(turn.turn);
            }
            self.expanded = Some(turn.turn);
        }
        self.ops.extend(fresh);
        for turn in empty {
            self.turn_done(turn);
        }
    }

    /// Inspect the head operation; operations whose part will not come
    /// any more are dropped and counted as skipped.
    pub(crate) fn next_op(&mut self, now: f64, lifetime: f64, stats: &mut TransportStats) -> NextOp {
        loop {
            let Some(op) = self.ops.front().copied() else {
                return NextOp::Idle;
            };
            if op.time > now {
                return NextOp::Idle;
            }
            if op.kind == OpKind::Dummy {
                return NextOp::Dummy {
                    target: op.target,
                    lid: op.lid,
                };
            }
            if let Some(part) = self.parts.find(op.evid) {
                let len = part.buf.data_len();
                return match op.kind {
                    OpKind::Local => NextOp::Local { evid: op.evid },
                    _ => NextOp::Send {
                        target: op.target,
                        lid: op.lid,
                        evid: op.evid,
                        len,
                    },
                };
            }
            let passed = self.parts.newest().is_some_and(|n| n > op.evid) || op.evid < self.drop_below;
            if passed || now - op.time > lifetime {
                log::debug!(
                    "[Worker::next_op] node {} skips event {} for node {}",
                    self.node,
                    op.evid,
                    op.target
                );
                stats.skipped += 1;
                self.pop_op();
                continue;
            }
            return NextOp::Idle;
        }
    }

    /// Remove the head operation and hand out its part.
    pub(crate) fn pop_op(&mut self) -> Option<EventPartRec> {
        let op = self.ops.pop_front()?;
        let part = match op.kind {
            OpKind::Data | OpKind::Local => self.parts.take(op.evid),
            OpKind::Dummy => None,
        };
        if self.ops.front().map_or(true, |next| next.turn != op.turn) {
            self.turn_done(op.turn);
        }
        part
    }

    fn turn_done(&mut self, turn: u64) {
        self.turns.remove_turns_until(turn + 1);
        let k = self.builders.len() as u64;
        if !self.has_controller && k > 0 {
            self.skip_until(EventId((turn + 1) * k + 1));
        }
    }

    /// Control payload for the controller: new parts and build progress.
    pub(crate) fn report(&mut self) -> Option<Vec<u8>> {
        if !self.has_controller || !self.activated {
            return None;
        }
        let mut writer = ControlWriter::new();
        let info = self.parts.fill_events_info(&mut self.last_reported);
        if !info.is_empty() {
            let mut raw = Vec::with_capacity(info.len() * 16);
            for (evid, size) in info {
                raw.extend_from_slice(&evid.to_le_bytes());
                raw.extend_from_slice(&size.to_le_bytes());
            }
            writer.add(ControlKind::SubevSizes, &raw);
        }
        if self.last_delivered > self.reported_delivered {
            writer.add(ControlKind::BuilderInfo, &self.last_delivered.to_le_bytes());
            self.reported_delivered = self.last_delivered;
        }
        (!writer.is_empty()).then(|| writer.into_bytes())
    }

    /// Bundle finished (delivered or expired).
    pub(crate) fn mark_delivered(&mut self, evid: EventId) {
        if evid > self.last_delivered {
            self.last_delivered = evid;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // test scaffolding
    use super::*;
    use hdaq::MemoryPool;

    fn config(nodes: usize) -> BnetConfig {
        BnetConfig {
            nodes,
            turn_period_us: 1000,
            recv_depth: 2,
            pool_size: 16,
            ..BnetConfig::default()
        }
    }

    fn part(pool: &MemoryPool, len: usize) -> Buffer {
        pool.take(len, 0)
    }

    #[test]
    fn round_robin_turn_sends_each_event_to_its_builder() {
        let pool = MemoryPool::with_classes("w", &[(64, 16)]).unwrap();
        let mut w = Worker::new(&config(3), 1, None);
        assert_eq!(w.builders(), &[0, 1, 2]);

        for evid in 1..=3 {
            assert!(w.accept_part(EventId(evid), part(&pool, 10), 0.0));
        }
        w.plan_turns(0.0);
        assert_eq!(w.turns.len(), 1);
        w.expand_turns();
        // local delivery of event 2, then one send per other node
        assert_eq!(w.num_ops(), 3);

        let mut stats = TransportStats::default();
        assert_eq!(w.next_op(0.0, 1.0, &mut stats), NextOp::Local { evid: EventId(2) });
        assert_eq!(w.pop_op().unwrap().evid, EventId(2));

        // slot 0: node 1 sends to node 2, event 3
        assert_eq!(
            w.next_op(0.0, 1.0, &mut stats),
            NextOp::Send { target: 2, lid: 0, evid: EventId(3), len: 10 }
        );
        w.pop_op();
        // slot 1 starts one period later
        assert_eq!(w.next_op(0.0, 1.0, &mut stats), NextOp::Idle);
        assert_eq!(
            w.next_op(0.001, 1.0, &mut stats),
            NextOp::Send { target: 0, lid: 0, evid: EventId(1), len: 10 }
        );
        w.pop_op();
        assert!(w.parts.is_empty());
        assert!(w.turns.is_empty());
    }

    #[test]
    fn missing_part_is_skipped_once_passed() {
        let pool = MemoryPool::with_classes("w", &[(64, 16)]).unwrap();
        let mut w = Worker::new(&config(2), 0, None);
        w.accept_part(EventId(1), part(&pool, 8), 0.0);
        w.plan_turns(0.0);
        w.expand_turns();
        let mut stats = TransportStats::default();
        // event 2 for node 1 has not arrived yet
        assert_eq!(w.next_op(0.0, 1.0, &mut stats), NextOp::Local { evid: EventId(1) });
        w.pop_op();
        assert_eq!(w.next_op(0.0, 1.0, &mut stats), NextOp::Idle);
        // event 3 arriving proves event 2 is gone
        w.accept_part(EventId(3), part(&pool, 8), 0.0);
        assert_eq!(w.next_op(0.0, 1.0, &mut stats), NextOp::Idle);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn late_remote_parts_are_refused() {
        let pool = MemoryPool::with_classes("w", &[(64, 16)]).unwrap();
        let mut w = Worker::new(&config(3), 0, None);
        assert!(w.accept_remote(1, EventId(4), part(&pool, 8), 0.0));
        w.mark_delivered(EventId(4));
        assert!(!w.accept_remote(2, EventId(4), part(&pool, 8), 0.0));
        assert!(!w.accept_remote(7, EventId(5), part(&pool, 8), 0.0));
    }

    #[test]
    fn excluded_node_is_not_required() {
        let mut cfg = config(4);
        cfg.controller = true;
        let mut w = Worker::new(&cfg, 1, None);
        assert_eq!(w.builders(), &[1, 2, 3]);
        assert!(!w.is_activated());
        w.apply_active(&[true, true, true, false]);
        assert_eq!(w.builders(), &[1, 2]);
        assert!(!w.bundles.is_required(2));
        assert!(!w.schedule().is_node_active(3));

        let mut payload = Vec::new();
        payload.extend_from_slice(&1.5f64.to_bits().to_le_bytes());
        payload.extend_from_slice(&0.002f64.to_bits().to_le_bytes());
        w.apply_sched_slot(&payload).unwrap();
        assert!(w.is_activated());
        assert!((w.schedule().end_time() - 0.002).abs() < 1e-12);
    }

    #[test]
    fn reports_new_parts_once() {
        let pool = MemoryPool::with_classes("w", &[(64, 16)]).unwrap();
        let mut cfg = config(3);
        cfg.controller = true;
        let mut w = Worker::new(&cfg, 1, None);
        w.accept_part(EventId(1), part(&pool, 12), 0.0);
        assert!(w.report().is_none());
        w.apply_sched_slot(&[0; 16]).unwrap();

        let raw = w.report().unwrap();
        let recs: Vec<_> = crate::wire::ControlIter::new(&raw).map(|r| r.unwrap()).collect();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].0, ControlKind::SubevSizes);
        assert_eq!(recs[0].1.len(), 16);
        assert!(w.report().is_none());

        w.mark_delivered(EventId(1));
        let raw = w.report().unwrap();
        let (kind, payload) = crate::wire::ControlIter::new(&raw).next().unwrap().unwrap();
        assert_eq!(kind, ControlKind::BuilderInfo);
        assert_eq!(EventId::from_le_slice(payload), Some(EventId(1)));
    }
}
