// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire records of the event building network.
//!
//! Every packet moved by a [`crate::fabric::Fabric`] starts with a
//! [`TransportHeader`]. Its payload depends on the send kind:
//!
//! | Kind | Payload |
//! |------|---------|
//! | `Data` | framed event buffer of one node for one event id |
//! | `Control` | control records, each `{kind:u32, len:u32}` + `len-8` bytes |
//! | `Command` | [`CommandMessage`] + command data |
//! | `Dummy` | nothing |
//!
//! All fields are little-endian.

use crate::error::{BnetError, Result};
use std::fmt;

/// Identifier of a bnet event: one output buffer of the combiner.
///
/// The top bit marks control traffic that carries no event data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventId(pub u64);

impl EventId {
    pub const CONTROL_BIT: u64 = 1 << 63;

    /// No event.
    pub const NONE: EventId = EventId(0);

    pub fn control(value: u64) -> Self {
        EventId(value | Self::CONTROL_BIT)
    }

    pub fn is_control(self) -> bool {
        self.0 & Self::CONTROL_BIT != 0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Id without the control bit.
    pub fn value(self) -> u64 {
        self.0 & !Self::CONTROL_BIT
    }

    pub fn next(self) -> Self {
        EventId(self.0 + 1)
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn from_le_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
        Some(EventId(u64::from_le_bytes(raw)))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_control() {
            write!(f, "ctrl:{}", self.value())
        } else {
            write!(f, "{}", self.0)
        }
    }
}

pub(crate) fn rd_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

pub(crate) fn rd_u64(b: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(raw)
}

pub(crate) fn rd_f64(b: &[u8], off: usize) -> f64 {
    f64::from_bits(rd_u64(b, off))
}

/// Kind of a transport packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    Dummy = 0,
    Data = 1,
    Control = 2,
    Command = 3,
}

impl SendKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(SendKind::Dummy),
            1 => Some(SendKind::Data),
            2 => Some(SendKind::Control),
            3 => Some(SendKind::Command),
            _ => None,
        }
    }
}

/// Header prepended to every packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportHeader {
    pub srcnode: u32,
    pub tgtnode: u32,
    pub evid: EventId,
    /// Sender clock at submission, seconds.
    pub send_tm: f64,
    /// Per source/target sequence number, starting at 1.
    pub seqid: u32,
    pub kind: SendKind,
    /// Payload bytes after this header.
    pub sendlen: u32,
}

impl TransportHeader {
    pub const SIZE: usize = 33;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.srcnode.to_le_bytes());
        out[4..8].copy_from_slice(&self.tgtnode.to_le_bytes());
        out[8..16].copy_from_slice(&self.evid.to_le_bytes());
        out[16..24].copy_from_slice(&self.send_tm.to_bits().to_le_bytes());
        out[24..28].copy_from_slice(&self.seqid.to_le_bytes());
        out[28] = self.kind as u8;
        out[29..33].copy_from_slice(&self.sendlen.to_le_bytes());
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut raw = [0u8; Self::SIZE];
        self.encode(&mut raw);
        raw
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(BnetError::Wire(format!(
                "packet of {} bytes shorter than transport header",
                bytes.len()
            )));
        }
        let kind = SendKind::from_u8(bytes[28])
            .ok_or_else(|| BnetError::Wire(format!("unknown send kind {}", bytes[28])))?;
        Ok(Self {
            srcnode: rd_u32(bytes, 0),
            tgtnode: rd_u32(bytes, 4),
            evid: EventId(rd_u64(bytes, 8)),
            send_tm: rd_f64(bytes, 16),
            seqid: rd_u32(bytes, 24),
            kind,
            sendlen: rd_u32(bytes, 29),
        })
    }

    /// Check the header of a packet received by `node` into a buffer of
    /// `received` bytes, in a cluster of `num_nodes`.
    pub fn validate(&self, node: usize, num_nodes: usize, received: usize) -> Result<()> {
        if self.tgtnode as usize != node {
            return Err(BnetError::Wire(format!(
                "packet for node {} received by node {}",
                self.tgtnode, node
            )));
        }
        if self.srcnode as usize >= num_nodes || self.srcnode as usize == node {
            return Err(BnetError::Wire(format!("unexpected source node {}", self.srcnode)));
        }
        if Self::SIZE + self.sendlen as usize > received {
            return Err(BnetError::Wire(format!(
                "sendlen {} exceeds {} received bytes",
                self.sendlen,
                received - Self::SIZE.min(received)
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Network command ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    Exit = 76_543_201,
    TimeSync = 76_543_202,
    ExecSync = 76_543_203,
    GetSync = 76_543_204,
    Collect = 76_543_205,
    Test = 76_543_206,
    CreateQp = 76_543_207,
    ConnectQp = 76_543_208,
    CloseQp = 76_543_209,
    AllToAll = 76_543_210,
    GetRunRes = 76_543_211,
    ShowRunRes = 76_543_212,
    Cleanup = 76_543_213,
    AskQueue = 76_543_214,
    CollRate = 76_543_215,
    ActiveNodes = 76_543_216,
}

impl CommandId {
    pub fn from_u32(v: u32) -> Option<Self> {
        use CommandId::*;
        let all = [
            Exit, TimeSync, ExecSync, GetSync, Collect, Test, CreateQp, ConnectQp, CloseQp,
            AllToAll, GetRunRes, ShowRunRes, Cleanup, AskQueue, CollRate, ActiveNodes,
        ];
        all.into_iter().find(|c| *c as u32 == v)
    }
}

/// Control-plane command record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandMessage {
    pub magic: u32,
    pub cmdid: u32,
    /// Sending node.
    pub node: u32,
    /// Bytes of command data following the record.
    pub cmddatasize: u32,
    /// Delay before execution, milliseconds.
    pub delay: u32,
    /// Non-zero on replies; the result data follows like command data.
    pub getresults: u32,
}

impl CommandMessage {
    pub const SIZE: usize = 24;
    pub const MAGIC: u32 = 0x1ff1;

    pub fn new(cmd: CommandId, node: usize) -> Self {
        Self {
            magic: Self::MAGIC,
            cmdid: cmd as u32,
            node: node as u32,
            cmddatasize: 0,
            delay: 0,
            getresults: 0,
        }
    }

    /// Reply record sent back by `node`.
    pub fn reply(&self, node: usize) -> Self {
        Self {
            node: node as u32,
            cmddatasize: 0,
            getresults: 1,
            ..*self
        }
    }

    pub fn command(&self) -> Option<CommandId> {
        CommandId::from_u32(self.cmdid)
    }

    pub fn is_reply(&self) -> bool {
        self.getresults != 0
    }

    /// Record followed by `data`.
    pub fn encode_with(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE + data.len());
        for v in [
            self.magic,
            self.cmdid,
            self.node,
            data.len() as u32,
            self.delay,
            self.getresults,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(data);
        out
    }

    /// Decode a record and borrow its command data.
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8])> {
        if bytes.len() < Self::SIZE {
            return Err(BnetError::Wire(format!("command of {} bytes", bytes.len())));
        }
        let msg = Self {
            magic: rd_u32(bytes, 0),
            cmdid: rd_u32(bytes, 4),
            node: rd_u32(bytes, 8),
            cmddatasize: rd_u32(bytes, 12),
            delay: rd_u32(bytes, 16),
            getresults: rd_u32(bytes, 20),
        };
        if msg.magic != Self::MAGIC {
            return Err(BnetError::Wire(format!("bad command magic {:#x}", msg.magic)));
        }
        let end = Self::SIZE + msg.cmddatasize as usize;
        if end > bytes.len() {
            return Err(BnetError::Wire(format!(
                "command data of {} bytes truncated to {}",
                msg.cmddatasize,
                bytes.len() - Self::SIZE
            )));
        }
        Ok((msg, &bytes[Self::SIZE..end]))
    }
}

// ============================================================================
// Control records
// ============================================================================

/// Kind of a control record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Null = 0,
    /// Worker -> controller: `(evid:u64, size:u64)` of new event parts.
    SubevSizes = 123,
    /// Controller -> workers: encoded schedule turns.
    Turns = 234,
    /// Worker -> controller: last delivered event id.
    BuilderInfo = 345,
    /// Controller -> workers: drop everything below this event id.
    SkipMarkers = 456,
    /// Controller -> workers: start time and slot length of the schedule.
    SchedSlot = 567,
}

impl ControlKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(ControlKind::Null),
            123 => Some(ControlKind::SubevSizes),
            234 => Some(ControlKind::Turns),
            345 => Some(ControlKind::BuilderInfo),
            456 => Some(ControlKind::SkipMarkers),
            567 => Some(ControlKind::SchedSlot),
            _ => None,
        }
    }
}

/// Header of one control record; `len` includes these 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSubheader {
    pub kind: u32,
    pub len: u32,
}

impl ControlSubheader {
    pub const SIZE: usize = 8;
}

/// Accumulates control records into one payload.
#[derive(Debug, Default)]
pub struct ControlWriter {
    bytes: Vec<u8>,
}

impl ControlWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: ControlKind, payload: &[u8]) {
        let len = (ControlSubheader::SIZE + payload.len()) as u32;
        self.bytes.extend_from_slice(&(kind as u32).to_le_bytes());
        self.bytes.extend_from_slice(&len.to_le_bytes());
        self.bytes.extend_from_slice(payload);
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Iterator over the control records of a payload. `Null` records are
/// padding and skipped; the first malformed record ends the iteration.
pub struct ControlIter<'a> {
    bytes: &'a [u8],
    failed: bool,
}

impl<'a> ControlIter<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, failed: false }
    }
}

impl<'a> Iterator for ControlIter<'a> {
    type Item = Result<(ControlKind, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed || self.bytes.is_empty() {
                return None;
            }
            if self.bytes.len() < ControlSubheader::SIZE {
                self.failed = true;
                return Some(Err(BnetError::Wire(format!(
                    "{} trailing control bytes",
                    self.bytes.len()
                ))));
            }
            let hdr = ControlSubheader {
                kind: rd_u32(self.bytes, 0),
                len: rd_u32(self.bytes, 4),
            };
            let len = hdr.len as usize;
            if len < ControlSubheader::SIZE || len > self.bytes.len() {
                self.failed = true;
                return Some(Err(BnetError::Wire(format!(
                    "control record of {} bytes, {} available",
                    len,
                    self.bytes.len()
                ))));
            }
            let Some(kind) = ControlKind::from_u32(hdr.kind) else {
                self.failed = true;
                return Some(Err(BnetError::Wire(format!("unknown control kind {}", hdr.kind))));
            };
            let payload = &self.bytes[ControlSubheader::SIZE..len];
            self.bytes = &self.bytes[len..];
            if kind != ControlKind::Null {
                return Some(Ok((kind, payload)));
            }
        }
    }
}
