// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transfer schedules.
//!
//! A schedule is a table `[slot][sender] -> (target node, lid)` plus the
//! start time of every slot, relative to the start of one turn. One extra
//! time entry holds the end of the turn, after which the schedule repeats.
//!
//! The receive schedule is derived mechanically: in every slot the target of
//! a send gets the sender as its source.

use crate::error::{BnetError, Result};
use std::fmt::Write as _;
use std::path::Path;

/// Schedule pattern, numbered as in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// All-to-all, round-robin over N-1 slots.
    RoundRobin,
    /// Every node sends to the next one.
    ShiftOne,
    /// Every node sends to the node N/2 further.
    ShiftHalf,
    /// The last node sends to all others.
    OneToAll,
    /// All nodes send to the last one.
    AllToOne,
    /// Even nodes send to the next odd node.
    EvenToOdd,
    /// Schedule replayed from a file.
    File,
}

impl Pattern {
    pub fn from_number(n: u32) -> Option<Self> {
        match n {
            0 => Some(Pattern::RoundRobin),
            1 => Some(Pattern::ShiftOne),
            2 => Some(Pattern::ShiftHalf),
            3 => Some(Pattern::OneToAll),
            4 => Some(Pattern::AllToOne),
            5 => Some(Pattern::EvenToOdd),
            7 => Some(Pattern::File),
            _ => None,
        }
    }

    pub fn number(self) -> u32 {
        match self {
            Pattern::RoundRobin => 0,
            Pattern::ShiftOne => 1,
            Pattern::ShiftHalf => 2,
            Pattern::OneToAll => 3,
            Pattern::AllToOne => 4,
            Pattern::EvenToOdd => 5,
            Pattern::File => 7,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Pattern::RoundRobin => "ALL-TO-ALL",
            Pattern::ShiftOne => "ALL-TO-ALL (shift 1)",
            Pattern::ShiftHalf => "ALL-TO-ALL (shift n/2)",
            Pattern::OneToAll => "ONE-TO-ALL",
            Pattern::AllToOne => "ALL-TO-ONE",
            Pattern::EvenToOdd => "EVEN-TO-ODD",
            Pattern::File => "FILE-BASED",
        }
    }
}

/// One cell of a schedule. `node == None` means no operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScheduleItem {
    pub node: Option<usize>,
    pub lid: usize,
}

impl ScheduleItem {
    pub fn is_empty(&self) -> bool {
        self.node.is_none()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Table of transfer operations per slot and sender.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schedule {
    num_senders: usize,
    slots: Vec<Vec<ScheduleItem>>,
    /// `num_slots + 1` entries, the last one is the end time.
    times: Vec<f64>,
}

impl Schedule {
    /// Empty schedule of `num_slots` x `num_senders`.
    pub fn new(num_slots: usize, num_senders: usize) -> Self {
        Self {
            num_senders,
            slots: vec![vec![ScheduleItem::default(); num_senders]; num_slots],
            times: vec![0.0; num_slots + 1],
        }
    }

    /// Schedule of `pattern` for `nodes` nodes and `lids` channels, one slot
    /// lasting `step` seconds. `prepared` is the file schedule for
    /// [`Pattern::File`]; without a matching one round-robin is used.
    pub fn for_pattern(
        pattern: Pattern,
        nodes: usize,
        lids: usize,
        step: f64,
        prepared: Option<&Schedule>,
    ) -> Self {
        let lids = lids.max(1);
        let n = nodes;
        match pattern {
            Pattern::ShiftOne | Pattern::ShiftHalf => {
                let shift = if pattern == Pattern::ShiftOne { 1 } else { n / 2 };
                let mut sch = Schedule::new(1, n);
                for s in 0..n {
                    sch.set(0, s, (s + shift) % n, s % lids);
                }
                sch.set_end_time(step);
                sch
            }
            Pattern::OneToAll => {
                let mut sch = Schedule::new(n.saturating_sub(1), n);
                for slot in 0..n.saturating_sub(1) {
                    sch.set(slot, n - 1, slot, slot % lids);
                    sch.set_time_slot(slot, step * slot as f64);
                }
                sch.set_end_time(step * n.saturating_sub(1) as f64);
                sch
            }
            Pattern::AllToOne => {
                let mut sch = Schedule::new(n.saturating_sub(1), n);
                for slot in 0..n.saturating_sub(1) {
                    sch.set(slot, slot, n - 1, slot % lids);
                    sch.set_time_slot(slot, step * slot as f64);
                }
                sch.set_end_time(step * n.saturating_sub(1) as f64);
                sch
            }
            Pattern::EvenToOdd => {
                let mut sch = Schedule::new(1, n);
                for s in (0..n.saturating_sub(1)).step_by(2) {
                    sch.set(0, s, s + 1, s % lids);
                }
                sch.set_end_time(step);
                sch
            }
            Pattern::File => match prepared {
                Some(file) if file.num_senders() == n && file.num_lids() <= lids && file.num_slots() > 0 => {
                    let mut sch = file.clone();
                    sch.fill_regular_time(step / file.num_slots() as f64 * n.saturating_sub(1) as f64);
                    sch
                }
                _ => {
                    log::warn!(
                        "[Schedule::for_pattern] no usable schedule file for {} nodes, using round-robin",
                        n
                    );
                    let mut sch = Schedule::new(0, n);
                    sch.fill_round_robin(None, step);
                    sch
                }
            },
            Pattern::RoundRobin => {
                let mut sch = Schedule::new(0, n);
                sch.fill_round_robin(None, step);
                sch
            }
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn num_senders(&self) -> usize {
        self.num_senders
    }

    pub fn item(&self, slot: usize, sender: usize) -> ScheduleItem {
        self.slots
            .get(slot)
            .and_then(|s| s.get(sender))
            .copied()
            .unwrap_or_default()
    }

    pub fn is_empty_item(&self, slot: usize, sender: usize) -> bool {
        self.item(slot, sender).is_empty()
    }

    pub fn set(&mut self, slot: usize, sender: usize, node: usize, lid: usize) {
        if let Some(item) = self.slots.get_mut(slot).and_then(|s| s.get_mut(sender)) {
            *item = ScheduleItem { node: Some(node), lid };
        }
    }

    pub fn time_slot(&self, slot: usize) -> f64 {
        self.times.get(slot).copied().unwrap_or(0.0)
    }

    pub fn set_time_slot(&mut self, slot: usize, tm: f64) {
        if let Some(t) = self.times.get_mut(slot) {
            *t = tm;
        }
    }

    /// Duration of one full pass.
    pub fn end_time(&self) -> f64 {
        self.time_slot(self.num_slots())
    }

    pub fn set_end_time(&mut self, tm: f64) {
        let n = self.num_slots();
        self.set_time_slot(n, tm);
    }

    fn resize_slots(&mut self, num_slots: usize) {
        self.slots = vec![vec![ScheduleItem::default(); self.num_senders]; num_slots];
        self.times = vec![0.0; num_slots + 1];
    }

    /// Round-robin all-to-all over `ids` (all senders when `None`): in slot
    /// `s` the `i`-th id sends to id `(i + s + 1) % n`.
    pub fn fill_round_robin(&mut self, ids: Option<&[usize]>, step: f64) {
        let all: Vec<usize>;
        let ids = match ids {
            Some(ids) => ids,
            None => {
                all = (0..self.num_senders).collect();
                &all
            }
        };
        let n = ids.len();
        self.resize_slots(n.saturating_sub(1));
        for slot in 0..self.num_slots() {
            self.set_time_slot(slot, step * slot as f64);
            for (i, &sender) in ids.iter().enumerate() {
                let target = ids[(i + slot + 1) % n];
                self.set(slot, sender, target, 0);
            }
        }
        self.set_end_time(step * self.num_slots() as f64);
    }

    /// Evenly spaced slot times.
    pub fn fill_regular_time(&mut self, step: f64) {
        for slot in 0..self.num_slots() {
            self.set_time_slot(slot, step * slot as f64);
        }
        self.set_end_time(step * self.num_slots() as f64);
    }

    /// Mirror into a receive schedule: `recv[slot][target] = (sender, lid)`.
    pub fn fill_receive_schedule(&self) -> Result<Schedule> {
        let mut recv = Schedule::new(self.num_slots(), self.num_senders);
        for slot in 0..self.num_slots() {
            recv.set_time_slot(slot, self.time_slot(slot));
            for sender in 0..self.num_senders {
                let item = self.item(slot, sender);
                let Some(target) = item.node else { continue };
                if target >= self.num_senders {
                    return Err(BnetError::Schedule(format!(
                        "slot {} sender {} targets unknown node {}",
                        slot, sender, target
                    )));
                }
                if !recv.is_empty_item(slot, target) {
                    return Err(BnetError::Schedule(format!(
                        "slot {} has more than one sender to node {}",
                        slot, target
                    )));
                }
                recv.set(slot, target, sender, item.lid);
            }
        }
        recv.set_end_time(self.end_time());
        Ok(recv)
    }

    /// True when `node` has at least one operation.
    pub fn is_node_active(&self, node: usize) -> bool {
        node < self.num_senders && (0..self.num_slots()).any(|slot| !self.is_empty_item(slot, node))
    }

    /// Remove every operation from or to `node`.
    pub fn exclude_inactive_node(&mut self, node: usize) {
        if node >= self.num_senders {
            return;
        }
        for slot in &mut self.slots {
            slot[node].reset();
            for item in slot.iter_mut() {
                if item.node == Some(node) {
                    item.reset();
                }
            }
        }
    }

    /// Advance `slot` to the next non-empty operation of `node`, adding the
    /// end time to `base` on every wrap. `None` starts before the first
    /// slot. False when the node has no operation at all.
    pub fn shift_to_next_operation(&self, node: usize, base: &mut f64, slot: &mut Option<usize>) -> bool {
        let n = self.num_slots();
        if n == 0 {
            return false;
        }
        let mut cnt = 0;
        loop {
            let next = slot.map_or(0, |s| s + 1);
            if next == n {
                *base += self.end_time();
                *slot = Some(0);
            } else {
                *slot = Some(next);
            }
            cnt += 1;
            if cnt > 3 * n {
                return false;
            }
            if let Some(s) = *slot {
                if !self.is_empty_item(s, node) {
                    return true;
                }
            }
        }
    }

    /// Check that every ordered pair of distinct `ids` (all senders when
    /// `None`) appears exactly once and no node sends to itself.
    pub fn prove(&self, ids: Option<&[usize]>) -> Result<()> {
        let n = self.num_senders;
        let mut matrix = vec![0u32; n * n];
        for slot in 0..self.num_slots() {
            for sender in 0..n {
                let Some(target) = self.item(slot, sender).node else { continue };
                if target >= n {
                    return Err(BnetError::Schedule(format!("target {} out of range", target)));
                }
                let cell = &mut matrix[sender * n + target];
                *cell += 1;
                if *cell > 1 {
                    return Err(BnetError::Schedule(format!(
                        "pair {} -> {} scheduled more than once",
                        sender, target
                    )));
                }
            }
        }
        let all: Vec<usize>;
        let ids = match ids {
            Some(ids) => ids,
            None => {
                all = (0..n).collect();
                &all
            }
        };
        if let Some(bad) = ids.iter().find(|&&id| id >= n) {
            return Err(BnetError::Schedule(format!(
                "node {} out of range for {} senders",
                bad, n
            )));
        }
        for &a in ids {
            for &b in ids {
                let expected = u32::from(a != b);
                if matrix[a * n + b] != expected {
                    return Err(BnetError::Schedule(format!(
                        "pair {} -> {} scheduled {} times, expected {}",
                        a,
                        b,
                        matrix[a * n + b],
                        expected
                    )));
                }
            }
        }
        log::debug!("[Schedule::prove] schedule with {} slots is OK", self.num_slots());
        Ok(())
    }

    /// Number of lids used, at least 1.
    pub fn num_lids(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .map(|item| item.lid)
            .max()
            .map_or(1, |m| m + 1)
    }

    /// Text form: `Num slots`, `Num senders`, then per slot one line per
    /// sender `sender -> target lid` with `-1` for no operation.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Num slots: {}", self.num_slots());
        let _ = writeln!(out, "Num senders: {}", self.num_senders);
        for slot in 0..self.num_slots() {
            let _ = writeln!(out, "Slot: {}", slot);
            for sender in 0..self.num_senders {
                let item = self.item(slot, sender);
                let node = item.node.map_or(-1, |n| n as i64);
                let _ = writeln!(out, "{:3} -> {:3} {:2}", sender, node, item.lid);
            }
        }
        out
    }

    pub fn from_text(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let num_slots = header_field(&mut lines, "Num slots:")?;
        let num_senders = header_field(&mut lines, "Num senders:")?;
        let mut sch = Schedule::new(num_slots, num_senders);
        for slot in 0..num_slots {
            if header_field(&mut lines, "Slot:")? != slot {
                return Err(BnetError::Schedule(format!("slot {} out of order", slot)));
            }
            for sender in 0..num_senders {
                let line = lines
                    .next()
                    .ok_or_else(|| BnetError::Schedule(format!("slot {} misses sender {}", slot, sender)))?;
                let parsed = parse_item_line(line)
                    .ok_or_else(|| BnetError::Schedule(format!("bad line '{}'", line.trim())))?;
                if parsed.0 != sender {
                    return Err(BnetError::Schedule(format!(
                        "slot {} expects sender {}, got {}",
                        slot, sender, parsed.0
                    )));
                }
                if let Some(node) = parsed.1 {
                    sch.set(slot, sender, node, parsed.2);
                }
            }
        }
        Ok(sch)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_text())?;
        log::info!(
            "[Schedule::save_to_file] {} slots for {} senders saved to {}",
            self.num_slots(),
            self.num_senders,
            path.as_ref().display()
        );
        Ok(())
    }

    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_text(&text)
    }
}

fn header_field<'a>(lines: &mut impl Iterator<Item = &'a str>, prefix: &str) -> Result<usize> {
    lines
        .next()
        .and_then(|l| l.trim().strip_prefix(prefix))
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| BnetError::Schedule(format!("expected '{}'", prefix)))
}

fn parse_item_line(line: &str) -> Option<(usize, Option<usize>, usize)> {
    let (sender, rest) = line.split_once("->")?;
    let mut parts = rest.split_whitespace();
    let sender = sender.trim().parse().ok()?;
    let node: i64 = parts.next()?.parse().ok()?;
    let lid = parts.next()?.parse().ok()?;
    let node = usize::try_from(node).ok();
    Some((sender, node, lid))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // test scaffolding
    use super::*;

    #[test]
    fn round_robin_covers_every_pair_once() {
        for n in 2..12 {
            let sch = Schedule::for_pattern(Pattern::RoundRobin, n, 1, 1e-3, None);
            assert_eq!(sch.num_slots(), n - 1);
            sch.prove(None).unwrap();
            // one receiver per node and slot
            sch.fill_receive_schedule().unwrap();
        }
    }

    #[test]
    fn round_robin_times() {
        let mut sch = Schedule::new(0, 4);
        sch.fill_round_robin(None, 0.5);
        assert_eq!(sch.time_slot(0), 0.0);
        assert_eq!(sch.time_slot(2), 1.0);
        assert_eq!(sch.end_time(), 1.5);
        assert_eq!(sch.item(0, 3).node, Some(0));
        assert_eq!(sch.item(1, 0).node, Some(2));
    }

    #[test]
    fn round_robin_over_subset() {
        let mut sch = Schedule::new(0, 5);
        let ids = [1, 2, 3, 4];
        sch.fill_round_robin(Some(&ids), 1.0);
        assert_eq!(sch.num_slots(), 3);
        sch.prove(Some(&ids)).unwrap();
        assert!(!sch.is_node_active(0));
        assert!(sch.prove(None).is_err());
    }

    #[test]
    fn prove_rejects_unknown_node_ids() {
        let sch = Schedule::for_pattern(Pattern::RoundRobin, 4, 1, 1.0, None);
        sch.prove(Some(&[0, 1, 2, 3])).unwrap();
        assert!(matches!(sch.prove(Some(&[0, 4])), Err(BnetError::Schedule(_))));
        assert!(matches!(sch.prove(Some(&[usize::MAX])), Err(BnetError::Schedule(_))));
    }

    #[test]
    fn receive_schedule_mirrors_send() {
        let send = Schedule::for_pattern(Pattern::RoundRobin, 4, 1, 1.0, None);
        let recv = send.fill_receive_schedule().unwrap();
        for slot in 0..send.num_slots() {
            for sender in 0..4 {
                let target = send.item(slot, sender).node.unwrap();
                assert_eq!(recv.item(slot, target).node, Some(sender));
            }
        }
        assert_eq!(recv.end_time(), send.end_time());
    }

    #[test]
    fn receive_schedule_rejects_collisions() {
        let mut sch = Schedule::new(1, 3);
        sch.set(0, 0, 2, 0);
        sch.set(0, 1, 2, 0);
        assert!(matches!(sch.fill_receive_schedule(), Err(BnetError::Schedule(_))));
    }

    #[test]
    fn fixed_patterns() {
        let sch = Schedule::for_pattern(Pattern::ShiftOne, 4, 2, 1.0, None);
        assert_eq!(sch.num_slots(), 1);
        assert_eq!(sch.item(0, 3), ScheduleItem { node: Some(0), lid: 1 });

        let sch = Schedule::for_pattern(Pattern::ShiftHalf, 6, 1, 1.0, None);
        assert_eq!(sch.item(0, 4).node, Some(1));

        let sch = Schedule::for_pattern(Pattern::OneToAll, 4, 1, 1.0, None);
        assert_eq!(sch.num_slots(), 3);
        assert!((0..3).all(|s| sch.item(s, 3).node == Some(s)));
        assert!(sch.is_empty_item(0, 0));

        let sch = Schedule::for_pattern(Pattern::AllToOne, 4, 1, 1.0, None);
        assert!((0..3).all(|s| sch.item(s, s).node == Some(3)));

        let sch = Schedule::for_pattern(Pattern::EvenToOdd, 5, 1, 1.0, None);
        assert_eq!(sch.item(0, 0).node, Some(1));
        assert_eq!(sch.item(0, 2).node, Some(3));
        assert!(sch.is_empty_item(0, 4));
    }

    #[test]
    fn file_pattern_falls_back_without_match() {
        let prepared = Schedule::for_pattern(Pattern::RoundRobin, 3, 1, 1.0, None);
        let sch = Schedule::for_pattern(Pattern::File, 4, 1, 1.0, Some(&prepared));
        assert_eq!(sch.num_slots(), 3);
        sch.prove(None).unwrap();

        let sch = Schedule::for_pattern(Pattern::File, 3, 1, 1.0, Some(&prepared));
        assert_eq!(sch.item(0, 0), prepared.item(0, 0));
    }

    #[test]
    fn exclude_node_removes_both_directions() {
        let mut sch = Schedule::for_pattern(Pattern::RoundRobin, 4, 1, 1.0, None);
        sch.exclude_inactive_node(2);
        assert!(!sch.is_node_active(2));
        for slot in 0..sch.num_slots() {
            for sender in 0..4 {
                assert_ne!(sch.item(slot, sender).node, Some(2));
            }
        }
        assert!(sch.is_node_active(0));
    }

    #[test]
    fn shift_wraps_and_accumulates_base() {
        let mut sch = Schedule::new(3, 2);
        sch.fill_regular_time(1.0);
        sch.set(1, 0, 1, 0);
        let mut base = 0.0;
        let mut slot = None;
        assert!(sch.shift_to_next_operation(0, &mut base, &mut slot));
        assert_eq!((slot, base), (Some(1), 0.0));
        assert!(sch.shift_to_next_operation(0, &mut base, &mut slot));
        assert_eq!((slot, base), (Some(1), 3.0));
        // node without operations
        assert!(!sch.shift_to_next_operation(1, &mut base, &mut slot));
    }

    #[test]
    fn text_round_trip_through_file() {
        let mut sch = Schedule::for_pattern(Pattern::RoundRobin, 5, 1, 1.0, None);
        sch.exclude_inactive_node(4);
        let text = sch.to_text();
        assert!(text.starts_with("Num slots: 4\nNum senders: 5\nSlot: 0\n"));
        assert!(text.contains("  4 ->  -1  0"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.txt");
        sch.save_to_file(&path).unwrap();
        let read = Schedule::read_from_file(&path).unwrap();
        for slot in 0..sch.num_slots() {
            for sender in 0..5 {
                assert_eq!(read.item(slot, sender), sch.item(slot, sender));
            }
        }
    }

    #[test]
    fn malformed_text_rejected() {
        assert!(Schedule::from_text("Num slots: x\n").is_err());
        assert!(Schedule::from_text("Num slots: 1\nNum senders: 2\nSlot: 0\n  0 ->   1  0\n").is_err());
        assert!(Schedule::from_text("Num slots: 1\nNum senders: 1\nSlot: 3\n").is_err());
        assert!(Schedule::from_text("Num slots: 1\nNum senders: 1\nSlot: 0\n  1 ->   0  0\n").is_err());
    }

    #[test]
    fn pattern_numbers() {
        for n in [0, 1, 2, 3, 4, 5, 7] {
            assert_eq!(Pattern::from_number(n).unwrap().number(), n);
        }
        assert!(Pattern::from_number(6).is_none());
        assert_eq!(Schedule::new(2, 2).num_lids(), 1);
    }
}
