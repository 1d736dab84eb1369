// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MBS-like event framing.
//!
//! A framed buffer payload is a buffer header followed by events; every
//! event is an event header followed by subevents. All fields are
//! little-endian.
//!
//! ```text
//! +--------------------+-------------------------------------------------+
//! | BufferHeader (24)  | Event | Event | ...                             |
//! +--------------------+-------------------------------------------------+
//! Event:    [ EventHeader (16) | Subevent | Subevent | ... ]
//! Subevent: [ SubeventHeader (12) | raw payload ]
//! ```
//!
//! `full_size` of events and subevents counts bytes including their own
//! header.

mod iter;
mod writer;

#[cfg(test)]
mod tests;

pub use iter::{EventIterator, EventView, SubeventIterator, SubeventView};
pub use writer::EventWriter;

use crate::error::{BnetError, Result};

/// Buffer type tag of a buffer carrying events.
pub const BUFFER_TYPE_EVENTS: u32 = 100;
/// Buffer type tag of the end-of-data marker sent after a stop.
pub const BUFFER_TYPE_EOF: u32 = 101;

/// Type tag of events (type 10, subtype 1).
pub const EVENT_TYPE: u32 = 0x0001_000A;
/// Type tag of subevents (type 10, subtype 1).
pub const SUBEVENT_TYPE: u32 = 0x0001_000A;

/// Regular data trigger.
pub const TRIGGER_DATA: i16 = 1;
/// Start acquisition trigger.
pub const TRIGGER_START_ACQ: i16 = 14;
/// Stop acquisition trigger.
pub const TRIGGER_STOP_ACQ: i16 = 15;

pub(crate) fn rd_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

pub(crate) fn rd_i16(b: &[u8], off: usize) -> i16 {
    i16::from_le_bytes([b[off], b[off + 1]])
}

pub(crate) fn wr_u32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn wr_i16(b: &mut [u8], off: usize, v: i16) {
    b[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

/// Header at the start of every framed buffer payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHeader {
    pub type_tag: u32,
    /// Payload capacity the buffer was written into.
    pub buffer_size: u32,
    /// Bytes in use, this header included.
    pub used_size: u32,
    pub num_events: u32,
    pub buffer_id: u32,
    /// Size of the last event, 0 when empty.
    pub last_event_len: u32,
}

impl BufferHeader {
    pub const SIZE: usize = 24;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(BnetError::Format(format!(
                "buffer of {} bytes has no header",
                bytes.len()
            )));
        }
        let hdr = Self {
            type_tag: rd_u32(bytes, 0),
            buffer_size: rd_u32(bytes, 4),
            used_size: rd_u32(bytes, 8),
            num_events: rd_u32(bytes, 12),
            buffer_id: rd_u32(bytes, 16),
            last_event_len: rd_u32(bytes, 20),
        };
        let used = hdr.used_size as usize;
        if used < Self::SIZE || used > bytes.len() {
            return Err(BnetError::Format(format!(
                "used size {} outside of [{}, {}]",
                used,
                Self::SIZE,
                bytes.len()
            )));
        }
        Ok(hdr)
    }

    pub fn write_to(&self, out: &mut [u8]) {
        wr_u32(out, 0, self.type_tag);
        wr_u32(out, 4, self.buffer_size);
        wr_u32(out, 8, self.used_size);
        wr_u32(out, 12, self.num_events);
        wr_u32(out, 16, self.buffer_id);
        wr_u32(out, 20, self.last_event_len);
    }

    pub fn is_eof(&self) -> bool {
        self.type_tag == BUFFER_TYPE_EOF
    }
}

/// Event header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub full_size: u32,
    pub type_tag: u32,
    pub dummy: i16,
    pub trigger: i16,
    /// Event counter shared by all senders.
    pub count: u32,
}

impl EventHeader {
    pub const SIZE: usize = 16;

    pub fn new(count: u32) -> Self {
        Self {
            full_size: Self::SIZE as u32,
            type_tag: EVENT_TYPE,
            dummy: 0,
            trigger: TRIGGER_DATA,
            count,
        }
    }

    pub fn with_trigger(mut self, trigger: i16) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(BnetError::Format(format!(
                "{} bytes left, event header needs {}",
                bytes.len(),
                Self::SIZE
            )));
        }
        Ok(Self {
            full_size: rd_u32(bytes, 0),
            type_tag: rd_u32(bytes, 4),
            dummy: rd_i16(bytes, 8),
            trigger: rd_i16(bytes, 10),
            count: rd_u32(bytes, 12),
        })
    }

    pub fn write_to(&self, out: &mut [u8]) {
        wr_u32(out, 0, self.full_size);
        wr_u32(out, 4, self.type_tag);
        wr_i16(out, 8, self.dummy);
        wr_i16(out, 10, self.trigger);
        wr_u32(out, 12, self.count);
    }

    /// Bytes of all subevents.
    pub fn subevents_size(&self) -> usize {
        (self.full_size as usize).saturating_sub(Self::SIZE)
    }

    pub fn is_stop_acq(&self) -> bool {
        self.trigger == TRIGGER_STOP_ACQ
    }

    pub fn is_start_acq(&self) -> bool {
        self.trigger == TRIGGER_START_ACQ
    }
}

/// Subevent header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubeventHeader {
    pub full_size: u32,
    pub type_tag: u32,
    pub proc_id: i16,
    pub subcrate: i8,
    pub control: i8,
}

impl SubeventHeader {
    pub const SIZE: usize = 12;

    pub fn new(proc_id: i16) -> Self {
        Self {
            full_size: Self::SIZE as u32,
            type_tag: SUBEVENT_TYPE,
            proc_id,
            subcrate: 0,
            control: 0,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(BnetError::Format(format!(
                "{} bytes left, subevent header needs {}",
                bytes.len(),
                Self::SIZE
            )));
        }
        Ok(Self {
            full_size: rd_u32(bytes, 0),
            type_tag: rd_u32(bytes, 4),
            proc_id: rd_i16(bytes, 8),
            subcrate: bytes[10] as i8,
            control: bytes[11] as i8,
        })
    }

    pub fn write_to(&self, out: &mut [u8]) {
        wr_u32(out, 0, self.full_size);
        wr_u32(out, 4, self.type_tag);
        wr_i16(out, 8, self.proc_id);
        out[10] = self.subcrate as u8;
        out[11] = self.control as u8;
    }

    pub fn payload_size(&self) -> usize {
        (self.full_size as usize).saturating_sub(Self::SIZE)
    }
}
