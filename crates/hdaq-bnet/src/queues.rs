// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event and turn bookkeeping of the transport.
//!
//! - [`EventsPartsQueue`]: local event parts waiting to be sent.
//! - [`EventsMasterQueue`]: controller view of which node holds which event.
//! - [`EventBundlesQueue`]: parts of events built on this node.
//! - [`ScheduleTurnsQueue`]: turns with their event assignment.
//!
//! Every queue is ordered by id and can be cut below a marker, which is how
//! retired events stop consuming memory.

use crate::error::{BnetError, Result};
use crate::wire::{rd_f64, rd_u64, EventId};
use hdaq::Buffer;
use std::collections::VecDeque;

// ============================================================================
// Event parts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPartState {
    /// Received from the local producer.
    Init,
    /// Reported to the controller.
    Scheduled,
    /// Handed to the network or to the local bundle.
    Ready,
}

/// One local event part.
#[derive(Debug)]
pub struct EventPartRec {
    pub state: EventPartState,
    pub evid: EventId,
    pub buf: Buffer,
    /// Arrival time, cluster seconds.
    pub acq_tm: f64,
}

/// Local parts in event id order.
#[derive(Debug, Default)]
pub struct EventsPartsQueue {
    parts: VecDeque<EventPartRec>,
}

impl EventsPartsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Append a part. Ids must grow; a stale id is refused.
    pub fn push(&mut self, evid: EventId, buf: Buffer, acq_tm: f64) -> Result<()> {
        if let Some(last) = self.parts.back() {
            if evid <= last.evid {
                return Err(BnetError::Format(format!(
                    "event part {} after {}",
                    evid, last.evid
                )));
            }
        }
        self.parts.push_back(EventPartRec {
            state: EventPartState::Init,
            evid,
            buf,
            acq_tm,
        });
        Ok(())
    }

    pub fn find(&mut self, evid: EventId) -> Option<&mut EventPartRec> {
        self.parts.iter_mut().find(|p| p.evid == evid)
    }

    pub fn contains(&self, evid: EventId) -> bool {
        self.parts.iter().any(|p| p.evid == evid)
    }

    /// Remove and return the part of `evid`.
    pub fn take(&mut self, evid: EventId) -> Option<EventPartRec> {
        let pos = self.parts.iter().position(|p| p.evid == evid)?;
        self.parts.remove(pos)
    }

    pub fn newest(&self) -> Option<EventId> {
        self.parts.back().map(|p| p.evid)
    }

    pub fn oldest(&self) -> Option<&EventPartRec> {
        self.parts.front()
    }

    /// `(evid, size)` of every part newer than `last`; marks them
    /// `Scheduled` and moves `last` forward.
    pub fn fill_events_info(&mut self, last: &mut EventId) -> Vec<(EventId, u64)> {
        let mut info = Vec::new();
        let from = *last;
        for part in self.parts.iter_mut().filter(|p| p.evid > from) {
            info.push((part.evid, part.buf.data_len() as u64));
            if part.state == EventPartState::Init {
                part.state = EventPartState::Scheduled;
            }
            *last = part.evid;
        }
        info
    }

    /// Drop every part with an id below `evid`; returns how many.
    pub fn skip_event_parts(&mut self, evid: EventId) -> usize {
        let before = self.parts.len();
        self.parts.retain(|p| p.evid >= evid);
        before - self.parts.len()
    }

    /// Drop parts that arrived before `tm`.
    pub fn drop_older_than(&mut self, tm: f64) -> usize {
        let before = self.parts.len();
        self.parts.retain(|p| p.acq_tm >= tm);
        before - self.parts.len()
    }
}

// ============================================================================
// Master view
// ============================================================================

/// Controller record of one event.
#[derive(Debug, Clone)]
pub struct EventMasterRec {
    pub evid: EventId,
    /// Node building the event, once assigned to a turn.
    pub tgtnode: Option<usize>,
    /// First report time.
    pub firsttm: f64,
    /// Nodes that reported a part.
    pub nodes: Vec<bool>,
}

/// Controller view of event parts over all nodes.
#[derive(Debug)]
pub struct EventsMasterQueue {
    recs: VecDeque<EventMasterRec>,
    /// Nodes whose part is required for completeness.
    required: Vec<bool>,
    last_skipped: EventId,
}

impl EventsMasterQueue {
    /// Queue for `num_nodes` nodes; node 0 is not required when it is the
    /// controller.
    pub fn new(num_nodes: usize, has_controller: bool) -> Self {
        let required = (0..num_nodes).map(|n| !(has_controller && n == 0)).collect();
        Self {
            recs: VecDeque::new(),
            required,
            last_skipped: EventId::NONE,
        }
    }

    pub fn len(&self) -> usize {
        self.recs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recs.is_empty()
    }

    /// Stop waiting for parts of `node`.
    pub fn exclude_node(&mut self, node: usize) {
        if let Some(r) = self.required.get_mut(node) {
            *r = false;
        }
    }

    pub fn find(&self, evid: EventId) -> Option<&EventMasterRec> {
        self.recs.iter().find(|r| r.evid == evid)
    }

    fn is_complete(&self, rec: &EventMasterRec) -> bool {
        self.required
            .iter()
            .zip(&rec.nodes)
            .all(|(req, has)| !req || *has)
    }

    /// Record that `node` holds a part of `evid`. Ids at or below the last
    /// skip marker are ignored.
    pub fn add_event_info(&mut self, node: usize, evid: EventId, tm: f64) -> Option<&EventMasterRec> {
        if evid <= self.last_skipped || node >= self.required.len() {
            return None;
        }
        let pos = match self.recs.binary_search_by(|r| r.evid.cmp(&evid)) {
            Ok(pos) => pos,
            Err(pos) => {
                self.recs.insert(
                    pos,
                    EventMasterRec {
                        evid,
                        tgtnode: None,
                        firsttm: tm,
                        nodes: vec![false; self.required.len()],
                    },
                );
                pos
            }
        };
        let rec = &mut self.recs[pos];
        rec.nodes[node] = true;
        Some(&self.recs[pos])
    }

    /// Decode a `SubevSizes` payload of `node`; returns the number of
    /// entries.
    pub fn add_raw_event_info(&mut self, raw: &[u8], node: usize, tm: f64) -> Result<usize> {
        if raw.len() % 16 != 0 {
            return Err(BnetError::Wire(format!("event info of {} bytes", raw.len())));
        }
        for chunk in raw.chunks_exact(16) {
            self.add_event_info(node, EventId(rd_u64(chunk, 0)), tm);
        }
        Ok(raw.len() / 16)
    }

    pub fn num_complete_unassigned(&self) -> usize {
        self.recs
            .iter()
            .filter(|r| r.tgtnode.is_none() && self.is_complete(r))
            .count()
    }

    /// Oldest first-report time among complete unassigned events.
    pub fn oldest_complete_unassigned(&self) -> Option<f64> {
        self.recs
            .iter()
            .filter(|r| r.tgtnode.is_none() && self.is_complete(r))
            .map(|r| r.firsttm)
            .reduce(f64::min)
    }

    /// Assign up to `targets.len()` complete events, oldest first, to the
    /// given nodes in order.
    pub fn assign(&mut self, targets: &[usize]) -> Vec<(usize, EventId)> {
        let mut out = Vec::new();
        let complete: Vec<usize> = (0..self.recs.len())
            .filter(|&i| self.recs[i].tgtnode.is_none() && self.is_complete(&self.recs[i]))
            .take(targets.len())
            .collect();
        for (idx, &target) in complete.into_iter().zip(targets) {
            self.recs[idx].tgtnode = Some(target);
            out.push((target, self.recs[idx].evid));
        }
        out
    }

    /// Drop unassigned events first reported before `tm`; they cannot
    /// complete any more. Returns how many.
    pub fn retire_older_than(&mut self, tm: f64) -> usize {
        let before = self.recs.len();
        self.recs.retain(|r| r.tgtnode.is_some() || r.firsttm >= tm);
        before - self.recs.len()
    }

    /// Remove all events with id below `evid`; returns how many.
    pub fn skip_events_until(&mut self, evid: EventId) -> usize {
        let before = self.recs.len();
        self.recs.retain(|r| r.evid >= evid);
        if evid.0 > 0 && EventId(evid.0 - 1) > self.last_skipped {
            self.last_skipped = EventId(evid.0 - 1);
        }
        before - self.recs.len()
    }
}

// ============================================================================
// Bundles
// ============================================================================

/// Parts of one event built on this node, one slot per contributor.
#[derive(Debug)]
pub struct EventBundleRec {
    pub evid: EventId,
    pub bufs: Vec<Option<Buffer>>,
    /// Creation time.
    pub acq_tm: f64,
}

impl EventBundleRec {
    pub fn num_filled(&self) -> usize {
        self.bufs.iter().filter(|b| b.is_some()).count()
    }
}

/// Bundles in event id order.
#[derive(Debug)]
pub struct EventBundlesQueue {
    bundles: VecDeque<EventBundleRec>,
    /// Contributor slots a bundle waits for.
    required: Vec<bool>,
}

impl EventBundlesQueue {
    /// Bundles of `width` contributors, all required.
    pub fn new(width: usize) -> Self {
        Self {
            bundles: VecDeque::new(),
            required: vec![true; width],
        }
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    pub fn width(&self) -> usize {
        self.required.len()
    }

    pub fn set_required(&mut self, slot: usize, required: bool) {
        if let Some(r) = self.required.get_mut(slot) {
            *r = required;
        }
    }

    pub fn is_required(&self, slot: usize) -> bool {
        self.required.get(slot).copied().unwrap_or(false)
    }

    /// All required slots are filled.
    pub fn is_ready(&self, rec: &EventBundleRec) -> bool {
        self.required
            .iter()
            .zip(&rec.bufs)
            .all(|(req, buf)| !req || buf.is_some())
    }

    /// Store the part of contributor `slot`. False when the slot is not
    /// required or already filled.
    pub fn add_part(&mut self, evid: EventId, slot: usize, buf: Buffer, tm: f64) -> bool {
        if !self.is_required(slot) {
            return false;
        }
        let width = self.width();
        let pos = match self.bundles.binary_search_by(|b| b.evid.cmp(&evid)) {
            Ok(pos) => pos,
            Err(pos) => {
                self.bundles.insert(
                    pos,
                    EventBundleRec {
                        evid,
                        bufs: (0..width).map(|_| None).collect(),
                        acq_tm: tm,
                    },
                );
                pos
            }
        };
        let cell = &mut self.bundles[pos].bufs[slot];
        if cell.is_some() {
            return false;
        }
        *cell = Some(buf);
        true
    }

    pub fn front(&self) -> Option<&EventBundleRec> {
        self.bundles.front()
    }

    pub fn front_ready(&self) -> bool {
        self.bundles.front().is_some_and(|b| self.is_ready(b))
    }

    pub fn pop_front(&mut self) -> Option<EventBundleRec> {
        self.bundles.pop_front()
    }

    /// Pop the oldest bundle when it is complete.
    pub fn pop_ready(&mut self) -> Option<EventBundleRec> {
        if self.front_ready() {
            self.bundles.pop_front()
        } else {
            None
        }
    }

    /// Pop the oldest bundle when it is incomplete and was created before
    /// `tm`.
    pub fn pop_expired(&mut self, tm: f64) -> Option<EventBundleRec> {
        let front = self.bundles.front()?;
        if !self.is_ready(front) && front.acq_tm < tm {
            self.bundles.pop_front()
        } else {
            None
        }
    }

    /// Drop bundles with id below `evid`; returns how many.
    pub fn skip_event_bundles(&mut self, evid: EventId) -> usize {
        let before = self.bundles.len();
        self.bundles.retain(|b| b.evid >= evid);
        before - self.bundles.len()
    }
}

// ============================================================================
// Turns
// ============================================================================

/// One turn: start time and the event each node builds.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleTurnRec {
    pub turn: u64,
    pub starttime: f64,
    /// Event built on node `i`, [`EventId::NONE`] for none.
    pub vector: Vec<EventId>,
}

impl ScheduleTurnRec {
    pub fn raw_size(num_nodes: usize) -> usize {
        8 + 8 + 8 * num_nodes
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.turn.to_le_bytes());
        out.extend_from_slice(&self.starttime.to_bits().to_le_bytes());
        for evid in &self.vector {
            out.extend_from_slice(&evid.to_le_bytes());
        }
    }

    pub fn decode(raw: &[u8], num_nodes: usize) -> Result<Self> {
        if raw.len() != Self::raw_size(num_nodes) {
            return Err(BnetError::Wire(format!(
                "turn record of {} bytes, expected {}",
                raw.len(),
                Self::raw_size(num_nodes)
            )));
        }
        Ok(Self {
            turn: rd_u64(raw, 0),
            starttime: rd_f64(raw, 8),
            vector: (0..num_nodes).map(|n| EventId(rd_u64(raw, 16 + 8 * n))).collect(),
        })
    }

    /// Node that builds `evid` in this turn.
    pub fn target_of(&self, evid: EventId) -> Option<usize> {
        self.vector.iter().position(|e| *e == evid)
    }
}

/// Turns in id order.
#[derive(Debug)]
pub struct ScheduleTurnsQueue {
    turns: VecDeque<ScheduleTurnRec>,
    num_nodes: usize,
}

impl ScheduleTurnsQueue {
    pub fn new(num_nodes: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            num_nodes,
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last_id(&self) -> Option<u64> {
        self.turns.back().map(|t| t.turn)
    }

    /// Append turn `id`. Ids must grow.
    pub fn add_new_turn(&mut self, id: u64, tm: f64) -> Result<&mut ScheduleTurnRec> {
        if self.last_id().is_some_and(|last| id <= last) {
            return Err(BnetError::Schedule(format!("turn {} not after {:?}", id, self.last_id())));
        }
        self.turns.push_back(ScheduleTurnRec {
            turn: id,
            starttime: tm,
            vector: vec![EventId::NONE; self.num_nodes],
        });
        let last = self.turns.len() - 1;
        Ok(&mut self.turns[last])
    }

    pub fn find(&self, id: u64) -> Option<&ScheduleTurnRec> {
        self.turns.iter().find(|t| t.turn == id)
    }

    pub fn front(&self) -> Option<&ScheduleTurnRec> {
        self.turns.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScheduleTurnRec> {
        self.turns.iter()
    }

    /// Encode every turn with id above `last`, moving `last` forward.
    pub fn fill_turns_info(&self, last: &mut u64) -> Vec<u8> {
        let mut out = Vec::new();
        let from = *last;
        for turn in self.turns.iter().filter(|t| t.turn > from) {
            turn.encode(&mut out);
            *last = turn.turn;
        }
        out
    }

    /// Decode turns; turns already known are ignored. Returns how many were
    /// added.
    pub fn add_raw_turns(&mut self, raw: &[u8]) -> Result<usize> {
        let size = ScheduleTurnRec::raw_size(self.num_nodes);
        if raw.len() % size != 0 {
            return Err(BnetError::Wire(format!(
                "turns payload of {} bytes, record size {}",
                raw.len(),
                size
            )));
        }
        let mut added = 0;
        for chunk in raw.chunks_exact(size) {
            let rec = ScheduleTurnRec::decode(chunk, self.num_nodes)?;
            if self.last_id().is_some_and(|last| rec.turn <= last) {
                continue;
            }
            self.turns.push_back(rec);
            added += 1;
        }
        Ok(added)
    }

    /// Remove turns with id below `id`.
    pub fn remove_turns_until(&mut self, id: u64) -> usize {
        let before = self.turns.len();
        self.turns.retain(|t| t.turn >= id);
        before - self.turns.len()
    }

    pub fn pop_front(&mut self) -> Option<ScheduleTurnRec> {
        self.turns.pop_front()
    }

    /// Node building `evid` according to the known turns.
    pub fn target_of(&self, evid: EventId) -> Option<usize> {
        self.turns.iter().find_map(|t| t.target_of(evid))
    }
}
