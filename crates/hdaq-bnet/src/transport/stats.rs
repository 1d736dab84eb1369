// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Run counters of a transport node.

use crate::error::{BnetError, Result};
use crate::wire::{rd_f64, rd_u64};
use hdaq::Command;

/// Counters reported through `GetRunRes`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    pub sent_packets: u64,
    pub recv_packets: u64,
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    /// Sequence gaps plus packets that arrived but could not be used.
    pub lost: u64,
    /// Send operations dropped because their part never arrived in time.
    pub skipped: u64,
    /// Complete bundles delivered to the outputs.
    pub bundles: u64,
    /// Bundles dropped incomplete after their lifetime.
    pub incomplete: u64,
    /// Sum of data packet delays, seconds.
    pub latency_sum: f64,
    pub latency_count: u64,
}

impl TransportStats {
    const RAW_SIZE: usize = 10 * 8;

    /// Mean delay of data packets in microseconds.
    pub fn mean_latency_us(&self) -> f64 {
        if self.latency_count == 0 {
            0.0
        } else {
            self.latency_sum / self.latency_count as f64 * 1e6
        }
    }

    pub fn record_latency(&mut self, seconds: f64) {
        self.latency_sum += seconds.max(0.0);
        self.latency_count += 1;
    }

    /// Add the counters of another node.
    pub fn merge(&mut self, other: &TransportStats) {
        self.sent_packets += other.sent_packets;
        self.recv_packets += other.recv_packets;
        self.sent_bytes += other.sent_bytes;
        self.recv_bytes += other.recv_bytes;
        self.lost += other.lost;
        self.skipped += other.skipped;
        self.bundles += other.bundles;
        self.incomplete += other.incomplete;
        self.latency_sum += other.latency_sum;
        self.latency_count += other.latency_count;
    }

    /// Store the counters as command parameters.
    pub fn apply_to(&self, cmd: &mut Command) {
        cmd.set("sent_packets", self.sent_packets);
        cmd.set("recv_packets", self.recv_packets);
        cmd.set("sent_bytes", self.sent_bytes);
        cmd.set("recv_bytes", self.recv_bytes);
        cmd.set("lost", self.lost);
        cmd.set("skipped", self.skipped);
        cmd.set("bundles", self.bundles);
        cmd.set("incomplete", self.incomplete);
        cmd.set("latency_us", self.mean_latency_us());
    }

    /// Read back what [`TransportStats::apply_to`] stored.
    pub fn from_command(cmd: &Command) -> Self {
        let latency_us = cmd.get_f64("latency_us", 0.0);
        let bundles = cmd.get_uint("bundles", 0);
        Self {
            sent_packets: cmd.get_uint("sent_packets", 0),
            recv_packets: cmd.get_uint("recv_packets", 0),
            sent_bytes: cmd.get_uint("sent_bytes", 0),
            recv_bytes: cmd.get_uint("recv_bytes", 0),
            lost: cmd.get_uint("lost", 0),
            skipped: cmd.get_uint("skipped", 0),
            bundles,
            incomplete: cmd.get_uint("incomplete", 0),
            latency_sum: latency_us * 1e-6,
            latency_count: u64::from(latency_us > 0.0),
        }
    }

    /// Wire form carried by `GETRUNRES` replies.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::RAW_SIZE);
        for v in [
            self.sent_packets,
            self.recv_packets,
            self.sent_bytes,
            self.recv_bytes,
            self.lost,
            self.skipped,
            self.bundles,
            self.incomplete,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&self.latency_sum.to_bits().to_le_bytes());
        out.extend_from_slice(&self.latency_count.to_le_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() != Self::RAW_SIZE {
            return Err(BnetError::Wire(format!("run results of {} bytes", raw.len())));
        }
        Ok(Self {
            sent_packets: rd_u64(raw, 0),
            recv_packets: rd_u64(raw, 8),
            sent_bytes: rd_u64(raw, 16),
            recv_bytes: rd_u64(raw, 24),
            lost: rd_u64(raw, 32),
            skipped: rd_u64(raw, 40),
            bundles: rd_u64(raw, 48),
            incomplete: rd_u64(raw, 56),
            latency_sum: rd_f64(raw, 64),
            latency_count: rd_u64(raw, 72),
        })
    }
}
