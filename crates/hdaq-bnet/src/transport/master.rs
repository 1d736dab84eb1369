// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Controller role: node discovery, turn assignment and run results.
//!
//! The controller never carries event data. It tests which workers answer,
//! distributes the active node mask and the schedule start, then assigns
//! every event reported complete to a builder, one turn at a time.

use super::stats::TransportStats;
use super::{build_schedule, builder_nodes, Outgoing};
use crate::config::BnetConfig;
use crate::error::Result;
use crate::queues::{EventsMasterQueue, ScheduleTurnsQueue};
use crate::schedule::Schedule;
use crate::wire::{CommandId, CommandMessage, ControlIter, ControlKind, ControlWriter, EventId};
use hdaq::{CommandResult, CommandsSet, RuntimeContext, SetHandle};

/// Grace period before the first TEST round, seconds.
const STARTUP_DELAY: f64 = 0.05;

/// Turns created per tick.
const MAX_TURNS_PER_TICK: usize = 16;

/// Turns kept while waiting for the builders.
const MAX_OPEN_TURNS: usize = 256;

struct Round {
    set: SetHandle,
    /// `(node, set index)` of the tested nodes.
    slots: Vec<(usize, usize)>,
    attempt: u32,
}

enum Phase {
    Waiting { since: Option<f64> },
    Testing(Round),
    Running,
}

struct Collect {
    set: SetHandle,
    slots: Vec<(usize, usize)>,
    stats: TransportStats,
    replied: usize,
}

pub(crate) struct Master {
    config: BnetConfig,
    prepared: Option<Schedule>,
    phase: Phase,
    answered: Vec<bool>,
    active: Vec<bool>,
    schedule: Schedule,
    builders: Vec<usize>,
    queue: EventsMasterQueue,
    turns: ScheduleTurnsQueue,
    next_turn: u64,
    last_sent_turn: u64,
    last_turn_start: Option<f64>,
    run_start: f64,
    last_build: Vec<EventId>,
    skip_marker: EventId,
    collect: Option<Collect>,
}

impl Master {
    pub(crate) fn new(config: &BnetConfig, prepared: Option<Schedule>) -> Self {
        let n = config.nodes;
        let active: Vec<bool> = (0..n).map(|node| node != 0).collect();
        let schedule = build_schedule(config, &active, prepared.as_ref());
        let builders = builder_nodes(&schedule, &config.data_nodes());
        Self {
            config: config.clone(),
            prepared,
            phase: Phase::Waiting { since: None },
            answered: vec![false; n],
            active,
            schedule,
            builders,
            queue: EventsMasterQueue::new(n, true),
            turns: ScheduleTurnsQueue::new(n),
            next_turn: 1,
            last_sent_turn: 0,
            last_turn_start: None,
            run_start: 0.0,
            last_build: vec![EventId::NONE; n],
            // nothing exists below event 1
            skip_marker: EventId(1),
            collect: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Running)
    }

    /// Workers still considered alive.
    pub(crate) fn active_workers(&self) -> Vec<usize> {
        (1..self.config.nodes).filter(|n| self.active[*n]).collect()
    }

    #[cfg(test)]
    pub(crate) fn builders(&self) -> &[usize] {
        &self.builders
    }

    #[cfg(test)]
    pub(crate) fn skip_marker(&self) -> EventId {
        self.skip_marker
    }

    /// Periodic step; returns the packets to send.
    pub(crate) fn tick(&mut self, ctx: &RuntimeContext, now: f64) -> Vec<Outgoing> {
        let mut out = Vec::new();
        match &mut self.phase {
            Phase::Waiting { since } => {
                let started = *since.get_or_insert(now);
                if now - started >= STARTUP_DELAY {
                    let nodes = self.active_workers();
                    self.start_round(ctx, nodes, 1, &mut out);
                }
            }
            Phase::Testing(round) => {
                if round.set.is_done() {
                    let attempt = round.attempt;
                    let pending: Vec<usize> = self
                        .active_workers()
                        .into_iter()
                        .filter(|n| !self.answered[*n])
                        .collect();
                    if pending.is_empty() || attempt >= self.config.test_attempts {
                        self.finish_testing(now, &mut out);
                    } else {
                        log::debug!(
                            "[Master::tick] TEST attempt {} unanswered by {:?}",
                            attempt,
                            pending
                        );
                        self.start_round(ctx, pending, attempt + 1, &mut out);
                    }
                }
            }
            Phase::Running => self.schedule_turns(now, &mut out),
        }
        out
    }

    fn start_round(&mut self, ctx: &RuntimeContext, nodes: Vec<usize>, attempt: u32, out: &mut Vec<Outgoing>) {
        let mut set = CommandsSet::new(ctx);
        let slots: Vec<(usize, usize)> = nodes
            .iter()
            .map(|n| (*n, set.add_external(format!("Test{}", n))))
            .collect();
        let set = set.submit(self.config.test_timeout());
        let msg = CommandMessage::new(CommandId::Test, 0);
        for node in &nodes {
            out.push(Outgoing::command(*node, msg, &[]));
        }
        self.phase = Phase::Testing(Round { set, slots, attempt });
    }

    fn finish_testing(&mut self, now: f64, out: &mut Vec<Outgoing>) {
        for node in 1..self.config.nodes {
            if self.active[node] && !self.answered[node] {
                log::warn!("[Master::finish_testing] node {} did not answer TEST, excluded", node);
                self.active[node] = false;
                self.queue.exclude_node(node);
            }
        }
        self.schedule = build_schedule(&self.config, &self.active, self.prepared.as_ref());
        let live = self.active_workers();
        self.builders = builder_nodes(&self.schedule, &live);
        self.run_start = now + self.config.presubmit().as_secs_f64();

        let slot = if self.schedule.num_slots() > 0 {
            self.schedule.end_time() / self.schedule.num_slots() as f64
        } else {
            self.config.turn_period().as_secs_f64()
        };
        let mask: Vec<u8> = self.active.iter().map(|a| u8::from(*a)).collect();
        let mut sched = Vec::with_capacity(16);
        sched.extend_from_slice(&self.run_start.to_bits().to_le_bytes());
        sched.extend_from_slice(&slot.to_bits().to_le_bytes());
        let mut control = ControlWriter::new();
        control.add(ControlKind::SchedSlot, &sched);
        let control = control.into_bytes();

        for node in &live {
            out.push(Outgoing::command(
                *node,
                CommandMessage::new(CommandId::TimeSync, 0),
                &now.to_bits().to_le_bytes(),
            ));
            out.push(Outgoing::command(*node, CommandMessage::new(CommandId::ActiveNodes, 0), &mask));
            out.push(Outgoing::control(*node, control.clone()));
        }
        log::info!(
            "[Master::finish_testing] {} of {} workers active, builders {:?}, start at {:.6}",
            live.len(),
            self.config.nodes - 1,
            self.builders,
            self.run_start
        );
        self.phase = Phase::Running;
    }

    fn schedule_turns(&mut self, now: f64, out: &mut Vec<Outgoing>) {
        let k = self.builders.len();
        let presubmit = self.config.presubmit().as_secs_f64();
        if k > 0 {
            let mut created = 0;
            while created < MAX_TURNS_PER_TICK && self.turns.len() < MAX_OPEN_TURNS {
                let complete = self.queue.num_complete_unassigned();
                let overdue = self
                    .queue
                    .oldest_complete_unassigned()
                    .is_some_and(|tm| now - tm >= presubmit);
                if complete == 0 || (complete < k && !overdue) {
                    break;
                }
                let assigned = self.queue.assign(&self.builders);
                let mut start = (now + presubmit).max(self.run_start);
                if let Some(prev) = self.last_turn_start {
                    start = start.max(prev + self.schedule.end_time());
                }
                match self.turns.add_new_turn(self.next_turn, start) {
                    Ok(turn) => {
                        for (target, evid) in assigned {
                            turn.vector[target] = evid;
                        }
                    }
                    Err(e) => {
                        log::error!("[Master::schedule_turns] {}", e);
                        break;
                    }
                }
                self.next_turn += 1;
                self.last_turn_start = Some(start);
                created += 1;
            }
        }

        let raw = self.turns.fill_turns_info(&mut self.last_sent_turn);
        if !raw.is_empty() {
            let mut control = ControlWriter::new();
            control.add(ControlKind::Turns, &raw);
            self.broadcast(control.into_bytes(), out);
        }

        self.advance_skip_marker(out);
        let lifetime = self.config.event_lifetime().as_secs_f64();
        let retired = self.queue.retire_older_than(now - lifetime);
        if retired > 0 {
            log::debug!("[Master::schedule_turns] retired {} incomplete events", retired);
        }
    }

    fn advance_skip_marker(&mut self, out: &mut Vec<Outgoing>) {
        let Some(marker) = self.builders.iter().map(|b| self.last_build[*b].next()).min() else {
            return;
        };
        if marker <= self.skip_marker {
            return;
        }
        self.skip_marker = marker;
        self.queue.skip_events_until(marker);
        while self.turns.front().is_some_and(|t| t.vector.iter().all(|e| *e < marker)) {
            self.turns.pop_front();
        }
        let mut control = ControlWriter::new();
        control.add(ControlKind::SkipMarkers, &marker.to_le_bytes());
        self.broadcast(control.into_bytes(), out);
    }

    fn broadcast(&self, payload: Vec<u8>, out: &mut Vec<Outgoing>) {
        for node in self.active_workers() {
            out.push(Outgoing::control(node, payload.clone()));
        }
    }

    /// Control records sent by worker `src`.
    pub(crate) fn on_control(&mut self, src: usize, payload: &[u8], now: f64) -> Result<()> {
        if !self.active.get(src).copied().unwrap_or(false) {
            return Ok(());
        }
        for rec in ControlIter::new(payload) {
            let (kind, data) = rec?;
            match kind {
                ControlKind::SubevSizes => {
                    self.queue.add_raw_event_info(data, src, now)?;
                }
                ControlKind::BuilderInfo => {
                    if let Some(evid) = EventId::from_le_slice(data) {
                        if evid > self.last_build[src] {
                            self.last_build[src] = evid;
                        }
                    }
                }
                other => {
                    log::debug!("[Master::on_control] ignoring {:?} from node {}", other, src);
                }
            }
        }
        Ok(())
    }

    /// Reply of worker `src` to a network command.
    pub(crate) fn on_reply(&mut self, src: usize, msg: &CommandMessage, data: &[u8]) {
        match msg.command() {
            Some(CommandId::Test) => {
                if let Some(flag) = self.answered.get_mut(src) {
                    *flag = true;
                }
                if let Phase::Testing(round) = &self.phase {
                    if let Some((_, idx)) = round.slots.iter().find(|(n, _)| *n == src) {
                        round.set.complete(*idx, CommandResult::True);
                    }
                }
            }
            Some(CommandId::GetRunRes) => {
                let Some(collect) = self.collect.as_mut() else {
                    return;
                };
                let Some((_, idx)) = collect.slots.iter().find(|(n, _)| *n == src).copied() else {
                    return;
                };
                match TransportStats::decode(data) {
                    Ok(stats) => {
                        if collect.set.complete(idx, CommandResult::True) {
                            collect.stats.merge(&stats);
                            collect.replied += 1;
                        }
                    }
                    Err(e) => {
                        log::warn!("[Master::on_reply] bad run results from node {}: {}", src, e);
                        collect.set.complete(idx, CommandResult::False);
                    }
                }
            }
            Some(CommandId::TimeSync) | Some(CommandId::ActiveNodes) => {}
            other => log::debug!("[Master::on_reply] unexpected reply {:?} from node {}", other, src),
        }
    }

    /// Ask every active worker for its counters.
    pub(crate) fn start_collect(&mut self, ctx: &RuntimeContext) -> Vec<Outgoing> {
        if self.collect.is_some() {
            return Vec::new();
        }
        let nodes = self.active_workers();
        let mut set = CommandsSet::new(ctx);
        let slots: Vec<(usize, usize)> = nodes
            .iter()
            .map(|n| (*n, set.add_external(format!("GetRunRes{}", n))))
            .collect();
        self.collect = Some(Collect {
            set: set.submit(self.config.test_timeout()),
            slots,
            stats: TransportStats::default(),
            replied: 0,
        });
        let msg = CommandMessage::new(CommandId::GetRunRes, 0);
        nodes.into_iter().map(|n| Outgoing::command(n, msg, &[])).collect()
    }

    /// Merged counters, replying nodes and overall success once the
    /// collection finished.
    pub(crate) fn poll_collect(&mut self) -> Option<(TransportStats, usize, bool)> {
        if !self.collect.as_ref()?.set.is_done() {
            return None;
        }
        let collect = self.collect.take()?;
        let ok = collect.set.result() == Some(CommandResult::True);
        Some((collect.stats, collect.replied, ok))
    }

    pub(crate) fn exit_messages(&self) -> Vec<Outgoing> {
        let msg = CommandMessage::new(CommandId::Exit, 0);
        self.active_workers()
            .into_iter()
            .map(|n| Outgoing::command(n, msg, &[]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // test scaffolding
    use super::*;
    use crate::wire::SendKind;
    use hdaq::RuntimeConfig;

    fn config() -> BnetConfig {
        BnetConfig {
            nodes: 4,
            controller: true,
            test_attempts: 2,
            test_timeout_ms: 50,
            presubmit_ms: 0,
            ..BnetConfig::default()
        }
    }

    fn commands(out: &[Outgoing], cmd: CommandId) -> Vec<usize> {
        out.iter()
            .filter(|o| o.kind == SendKind::Command)
            .filter(|o| CommandMessage::decode(&o.payload).unwrap().0.command() == Some(cmd))
            .map(|o| o.target)
            .collect()
    }

    fn info(evids: &[u64]) -> Vec<u8> {
        let mut raw = Vec::new();
        for e in evids {
            raw.extend_from_slice(&e.to_le_bytes());
            raw.extend_from_slice(&100u64.to_le_bytes());
        }
        let mut w = ControlWriter::new();
        w.add(ControlKind::SubevSizes, &raw);
        w.into_bytes()
    }

    fn run_to_testing(master: &mut Master, ctx: &RuntimeContext) -> Vec<Outgoing> {
        assert!(master.tick(ctx, 0.0).is_empty());
        master.tick(ctx, 1.0)
    }

    #[test]
    fn silent_node_is_excluded_after_attempts() {
        let ctx = RuntimeContext::new(RuntimeConfig::default()).unwrap();
        let mut master = Master::new(&config(), None);
        let out = run_to_testing(&mut master, &ctx);
        assert_eq!(commands(&out, CommandId::Test), vec![1, 2, 3]);

        let reply = CommandMessage::new(CommandId::Test, 0).reply(1);
        master.on_reply(1, &reply, &[]);
        master.on_reply(2, &reply.reply(2), &[]);

        // second round only for node 3
        std::thread::sleep(std::time::Duration::from_millis(200));
        let out = master.tick(&ctx, 1.1);
        assert_eq!(commands(&out, CommandId::Test), vec![3]);

        std::thread::sleep(std::time::Duration::from_millis(200));
        let out = master.tick(&ctx, 1.2);
        assert!(master.is_running());
        assert_eq!(master.active_workers(), vec![1, 2]);
        assert_eq!(master.builders(), &[1, 2]);
        assert_eq!(commands(&out, CommandId::ActiveNodes), vec![1, 2]);
        let mask = out
            .iter()
            .filter(|o| o.kind == SendKind::Command && o.target == 1)
            .map(|o| CommandMessage::decode(&o.payload).unwrap())
            .find(|(msg, _)| msg.command() == Some(CommandId::ActiveNodes))
            .map(|(_, data)| data.to_vec())
            .unwrap();
        assert_eq!(mask, vec![0, 1, 1, 0]);
        assert_eq!(out.iter().filter(|o| o.kind == SendKind::Control).count(), 2);
        ctx.shutdown();
    }

    #[test]
    fn complete_events_are_assigned_in_turns() {
        let ctx = RuntimeContext::new(RuntimeConfig::default()).unwrap();
        let cfg = BnetConfig {
            presubmit_ms: 500,
            ..config()
        };
        let mut master = Master::new(&cfg, None);
        run_to_testing(&mut master, &ctx);
        for node in 1..4 {
            let reply = CommandMessage::new(CommandId::Test, 0).reply(node);
            master.on_reply(node, &reply, &[]);
        }
        master.tick(&ctx, 1.1);
        assert!(master.is_running());
        assert_eq!(master.builders(), &[1, 2, 3]);

        for node in 1..4 {
            master.on_control(node, &info(&[1, 2, 3, 4]), 1.1).unwrap();
        }
        let out = master.tick(&ctx, 1.2);
        let turns: Vec<&Outgoing> = out.iter().filter(|o| o.kind == SendKind::Control).collect();
        assert_eq!(turns.len(), 3);
        let (kind, raw) = ControlIter::new(&turns[0].payload).next().unwrap().unwrap();
        assert_eq!(kind, ControlKind::Turns);
        let mut q = ScheduleTurnsQueue::new(4);
        // event 4 waits for two more complete events
        assert_eq!(q.add_raw_turns(raw).unwrap(), 1);
        assert_eq!(
            q.front().unwrap().vector,
            vec![EventId::NONE, EventId(1), EventId(2), EventId(3)]
        );

        // builders report progress, the marker follows the slowest
        let mut w = ControlWriter::new();
        w.add(ControlKind::BuilderInfo, &EventId(1).to_le_bytes());
        master.on_control(1, &w.into_bytes(), 1.3).unwrap();
        for node in 2..4 {
            let mut w = ControlWriter::new();
            w.add(ControlKind::BuilderInfo, &EventId(node as u64).to_le_bytes());
            master.on_control(node, &w.into_bytes(), 1.3).unwrap();
        }
        let out = master.tick(&ctx, 1.3);
        assert_eq!(master.skip_marker(), EventId(2));
        assert!(out.iter().any(|o| {
            o.kind == SendKind::Control
                && ControlIter::new(&o.payload).any(|r| r.unwrap().0 == ControlKind::SkipMarkers)
        }));
        ctx.shutdown();
    }

    #[test]
    fn collected_results_are_merged() {
        let ctx = RuntimeContext::new(RuntimeConfig::default()).unwrap();
        let mut master = Master::new(&BnetConfig { nodes: 3, ..config() }, None);
        let out = master.start_collect(&ctx);
        assert_eq!(commands(&out, CommandId::GetRunRes), vec![1, 2]);
        assert!(master.poll_collect().is_none());

        let stats = TransportStats { bundles: 5, ..TransportStats::default() };
        let reply = CommandMessage::new(CommandId::GetRunRes, 0);
        master.on_reply(1, &reply.reply(1), &stats.encode());
        master.on_reply(2, &reply.reply(2), &stats.encode());
        let (merged, replied, ok) = master.poll_collect().unwrap();
        assert_eq!(merged.bundles, 10);
        assert_eq!(replied, 2);
        assert!(ok);
        ctx.shutdown();
    }
}
