// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Read iterators over framed payloads.

use super::{BufferHeader, EventHeader, SubeventHeader};
use crate::error::{BnetError, Result};

/// One event inside a framed payload.
#[derive(Debug, Clone, Copy)]
pub struct EventView<'a> {
    pub header: EventHeader,
    /// Whole event, header included.
    pub bytes: &'a [u8],
}

impl<'a> EventView<'a> {
    pub fn count(&self) -> u32 {
        self.header.count
    }

    /// Subevents region without the event header.
    pub fn subevents_bytes(&self) -> &'a [u8] {
        &self.bytes[EventHeader::SIZE..]
    }

    pub fn subevents(&self) -> SubeventIterator<'a> {
        SubeventIterator::new(self.subevents_bytes())
    }
}

/// One subevent inside an event.
#[derive(Debug, Clone, Copy)]
pub struct SubeventView<'a> {
    pub header: SubeventHeader,
    pub bytes: &'a [u8],
}

impl<'a> SubeventView<'a> {
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[SubeventHeader::SIZE..]
    }
}

/// Iterator over the events of a framed payload.
///
/// Sizes are validated against the used region; the first malformed event
/// yields an error and ends the iteration.
#[derive(Debug, Clone)]
pub struct EventIterator<'a> {
    header: BufferHeader,
    bytes: &'a [u8],
    pos: usize,
    seen: u32,
    failed: bool,
}

impl<'a> EventIterator<'a> {
    /// Parse the buffer header of `bytes`.
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let header = BufferHeader::parse(bytes)?;
        Ok(Self {
            header,
            bytes: &bytes[..header.used_size as usize],
            pos: BufferHeader::SIZE,
            seen: 0,
            failed: false,
        })
    }

    /// Continue after `seen` events ending at byte `pos`, as reported by
    /// [`EventIterator::position`].
    pub fn resume(bytes: &'a [u8], pos: usize, seen: u32) -> Result<Self> {
        let mut iter = Self::new(bytes)?;
        if pos < BufferHeader::SIZE || pos > iter.bytes.len() {
            return Err(BnetError::Format(format!(
                "resume position {} outside used region of {} bytes",
                pos,
                iter.bytes.len()
            )));
        }
        iter.pos = pos;
        iter.seen = seen;
        Ok(iter)
    }

    /// Byte offset of the next event.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn header(&self) -> &BufferHeader {
        &self.header
    }

    /// Events already yielded.
    pub fn seen(&self) -> u32 {
        self.seen
    }

    fn fail(&mut self, msg: String) -> Option<Result<EventView<'a>>> {
        self.failed = true;
        Some(Err(BnetError::Format(msg)))
    }
}

impl<'a> Iterator for EventIterator<'a> {
    type Item = Result<EventView<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let rest = &self.bytes[self.pos..];
        if rest.is_empty() {
            if self.seen != self.header.num_events {
                let msg = format!(
                    "buffer {} announces {} events, holds {}",
                    self.header.buffer_id, self.header.num_events, self.seen
                );
                return self.fail(msg);
            }
            return None;
        }
        let header = match EventHeader::parse(rest) {
            Ok(h) => h,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        let size = header.full_size as usize;
        if size < EventHeader::SIZE || size > rest.len() {
            let msg = format!(
                "event {} declares {} bytes, {} available",
                header.count,
                size,
                rest.len()
            );
            return self.fail(msg);
        }
        let bytes = &self.bytes[self.pos..self.pos + size];
        self.pos += size;
        self.seen += 1;
        Some(Ok(EventView { header, bytes }))
    }
}

/// Iterator over the subevents of one event.
#[derive(Debug, Clone)]
pub struct SubeventIterator<'a> {
    bytes: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> SubeventIterator<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for SubeventIterator<'a> {
    type Item = Result<SubeventView<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.bytes.len() {
            return None;
        }
        let rest = &self.bytes[self.pos..];
        let header = match SubeventHeader::parse(rest) {
            Ok(h) => h,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        let size = header.full_size as usize;
        if size < SubeventHeader::SIZE || size > rest.len() {
            self.failed = true;
            return Some(Err(BnetError::Format(format!(
                "subevent of proc {} declares {} bytes, {} available",
                header.proc_id,
                size,
                rest.len()
            ))));
        }
        let bytes = &rest[..size];
        self.pos += size;
        Some(Ok(SubeventView { header, bytes }))
    }
}
