// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Write cursor filling a pool buffer with framed events.

use super::{
    BufferHeader, EventHeader, SubeventHeader, BUFFER_TYPE_EOF, BUFFER_TYPE_EVENTS,
};
use crate::error::{BnetError, Result};
use hdaq::Buffer;

/// Fills the payload of an exclusively owned buffer with events.
///
/// ```text
/// new ──▶ start_event ──▶ add_subevent* ──▶ finish_event ──▶ ... ──▶ finish
/// ```
///
/// The buffer header is written by [`EventWriter::finish`], which also fixes
/// the used payload length.
pub struct EventWriter {
    buffer: Buffer,
    capacity: usize,
    pos: usize,
    buffer_id: u32,
    num_events: u32,
    last_event_len: u32,
    event_start: Option<usize>,
}

impl EventWriter {
    pub fn new(buffer: Buffer, buffer_id: u32) -> Result<Self> {
        let capacity = buffer.capacity();
        if buffer.is_null() || capacity < BufferHeader::SIZE {
            return Err(BnetError::Format(format!(
                "buffer capacity {} below buffer header",
                capacity
            )));
        }
        if !buffer.is_unique() {
            return Err(BnetError::Runtime(hdaq::Error::BufferShared));
        }
        Ok(Self {
            buffer,
            capacity,
            pos: BufferHeader::SIZE,
            buffer_id,
            num_events: 0,
            last_event_len: 0,
            event_start: None,
        })
    }

    /// Like [`EventWriter::new`] but never fills more than `limit` payload
    /// bytes, leaving room for headers added further down the chain.
    pub fn with_limit(buffer: Buffer, buffer_id: u32, limit: usize) -> Result<Self> {
        let mut writer = Self::new(buffer, buffer_id)?;
        if limit < BufferHeader::SIZE {
            return Err(BnetError::Format(format!("limit {} below buffer header", limit)));
        }
        writer.capacity = writer.capacity.min(limit);
        Ok(writer)
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.pos
    }

    pub fn num_events(&self) -> u32 {
        self.num_events
    }

    pub fn is_empty(&self) -> bool {
        self.num_events == 0 && self.event_start.is_none()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Room for a new event holding `subevents_len` bytes of subevents.
    pub fn is_place_for_event(&self, subevents_len: usize) -> bool {
        self.event_start.is_none() && self.remaining() >= EventHeader::SIZE + subevents_len
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.remaining() {
            return Err(BnetError::Format(format!(
                "{} bytes do not fit, {} remain",
                bytes.len(),
                self.remaining()
            )));
        }
        let pos = self.pos;
        self.buffer.capacity_mut()?[pos..pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    /// Open an event; `full_size` is fixed by [`EventWriter::finish_event`].
    pub fn start_event(&mut self, header: EventHeader) -> Result<()> {
        if self.event_start.is_some() {
            return Err(BnetError::Format("event already open".into()));
        }
        let mut raw = [0u8; EventHeader::SIZE];
        header.write_to(&mut raw);
        let start = self.pos;
        self.write(&raw)?;
        self.event_start = Some(start);
        Ok(())
    }

    /// Append one subevent to the open event.
    pub fn add_subevent(&mut self, header: SubeventHeader, payload: &[u8]) -> Result<()> {
        if self.event_start.is_none() {
            return Err(BnetError::Format("no open event".into()));
        }
        if SubeventHeader::SIZE + payload.len() > self.remaining() {
            return Err(BnetError::Format(format!(
                "subevent of {} bytes does not fit, {} remain",
                payload.len(),
                self.remaining()
            )));
        }
        let mut raw = [0u8; SubeventHeader::SIZE];
        let header = SubeventHeader {
            full_size: (SubeventHeader::SIZE + payload.len()) as u32,
            ..header
        };
        header.write_to(&mut raw);
        self.write(&raw)?;
        self.write(payload)
    }

    /// Append already framed subevents to the open event.
    pub fn add_raw_subevents(&mut self, bytes: &[u8]) -> Result<()> {
        if self.event_start.is_none() {
            return Err(BnetError::Format("no open event".into()));
        }
        self.write(bytes)
    }

    /// Close the open event; returns its full size.
    pub fn finish_event(&mut self) -> Result<u32> {
        let start = self
            .event_start
            .take()
            .ok_or_else(|| BnetError::Format("no open event".into()))?;
        let size = (self.pos - start) as u32;
        self.buffer.capacity_mut()?[start..start + 4].copy_from_slice(&size.to_le_bytes());
        self.num_events += 1;
        self.last_event_len = size;
        Ok(size)
    }

    /// Drop the open event and everything written into it.
    pub fn discard_event(&mut self) {
        if let Some(start) = self.event_start.take() {
            self.pos = start;
        }
    }

    /// Copy a complete, already framed event.
    pub fn add_raw_event(&mut self, bytes: &[u8]) -> Result<()> {
        if self.event_start.is_some() {
            return Err(BnetError::Format("event already open".into()));
        }
        let header = EventHeader::parse(bytes)?;
        if header.full_size as usize != bytes.len() {
            return Err(BnetError::Format(format!(
                "event {} declares {} bytes, got {}",
                header.count,
                header.full_size,
                bytes.len()
            )));
        }
        self.write(bytes)?;
        self.num_events += 1;
        self.last_event_len = bytes.len() as u32;
        Ok(())
    }

    /// Write the buffer header and hand the buffer back.
    pub fn finish(self) -> Result<Buffer> {
        self.finish_tagged(BUFFER_TYPE_EVENTS)
    }

    /// Finish as an end-of-data marker.
    pub fn finish_eof(self) -> Result<Buffer> {
        self.finish_tagged(BUFFER_TYPE_EOF)
    }

    fn finish_tagged(mut self, type_tag: u32) -> Result<Buffer> {
        if self.event_start.is_some() {
            return Err(BnetError::Format("event still open".into()));
        }
        let header = BufferHeader {
            type_tag,
            buffer_size: self.capacity as u32,
            used_size: self.pos as u32,
            num_events: self.num_events,
            buffer_id: self.buffer_id,
            last_event_len: self.last_event_len,
        };
        header.write_to(&mut self.buffer.capacity_mut()?[..BufferHeader::SIZE]);
        self.buffer.set_data_len(self.pos)?;
        self.buffer.set_type_tag(type_tag);
        Ok(self.buffer)
    }
}
