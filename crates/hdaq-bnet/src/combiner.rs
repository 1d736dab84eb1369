// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packing of readout events into transport buffers.
//!
//! Consecutive events of one readout are grouped by `events_combine`; every
//! group becomes one output buffer whose user header holds the network
//! event id `(count - 1) / events_combine + 1` (8 bytes, little-endian).

use crate::error::{BnetError, Result};
use crate::format::{EventIterator, EventWriter, BUFFER_TYPE_EOF};
use crate::wire::EventId;
use hdaq::{Buffer, ModuleSpec, PoolHandleId, PortId, SyncContext, SyncModule, WaitError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Bytes of the event id header on combined buffers.
pub const EVENT_ID_HEADER: usize = 8;

/// Network event id of a readout event counter.
pub fn event_id_of(count: u32, events_combine: usize) -> EventId {
    let combine = events_combine.max(1) as u64;
    EventId((u64::from(count).max(1) - 1) / combine + 1)
}

/// Counters of a combiner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CombinerStats {
    pub events: u64,
    pub buffers: u64,
    /// Events that did not fit the transport buffer.
    pub dropped: u64,
    pub stops: u64,
}

/// Open output buffer of one group.
struct Group {
    evid: EventId,
    writer: EventWriter,
}

/// Grouping state, independent of the runtime.
pub struct Combiner {
    events_combine: usize,
    limit: usize,
    buffer_id: u32,
    open: Option<Group>,
    stats: Arc<Mutex<CombinerStats>>,
}

impl Combiner {
    /// Group `events_combine` events into buffers of at most `limit` payload
    /// bytes.
    pub fn new(events_combine: usize, limit: usize) -> Self {
        Self {
            events_combine: events_combine.max(1),
            limit,
            buffer_id: 0,
            open: None,
            stats: Arc::new(Mutex::new(CombinerStats::default())),
        }
    }

    pub fn stats_handle(&self) -> Arc<Mutex<CombinerStats>> {
        Arc::clone(&self.stats)
    }

    /// Id of the open group, if any.
    pub fn open_group(&self) -> Option<EventId> {
        self.open.as_ref().map(|g| g.evid)
    }

    /// Close the open group into a buffer.
    pub fn flush(&mut self) -> Result<Option<Buffer>> {
        let Some(group) = self.open.take() else {
            return Ok(None);
        };
        if group.writer.is_empty() {
            return Ok(None);
        }
        let mut buf = group.writer.finish()?;
        buf.header_mut()?.copy_from_slice(&group.evid.to_le_bytes());
        self.stats.lock().buffers += 1;
        Ok(Some(buf))
    }

    /// Add all events of a readout buffer. `alloc` provides empty buffers
    /// with an [`EVENT_ID_HEADER`] byte header; finished buffers are pushed
    /// to `out`. Returns true when a stop-acquisition event was seen.
    pub fn add_buffer(
        &mut self,
        input: &Buffer,
        alloc: &mut dyn FnMut() -> core::result::Result<Buffer, WaitError>,
        out: &mut Vec<Buffer>,
    ) -> core::result::Result<bool, CombineError> {
        let mut stop = false;
        let iter = EventIterator::new(input.data())?;
        for event in iter {
            let event = match event {
                Ok(ev) => ev,
                Err(e) => {
                    log::warn!("[Combiner::add_buffer] malformed input: {}", e);
                    break;
                }
            };
            let count = event.count();
            let evid = event_id_of(count, self.events_combine);
            if self.open_group().is_some_and(|g| g != evid) {
                if let Some(buf) = self.flush()? {
                    out.push(buf);
                }
            }
            if self.open.is_none() {
                self.buffer_id += 1;
                let writer = EventWriter::with_limit(alloc()?, self.buffer_id, self.limit)?;
                self.open = Some(Group { evid, writer });
            }
            let Some(group) = self.open.as_mut() else {
                continue;
            };
            if group.writer.remaining() < event.bytes.len() {
                log::warn!(
                    "[Combiner::add_buffer] event {} of {} bytes does not fit, {} remain",
                    count,
                    event.bytes.len(),
                    group.writer.remaining()
                );
                self.stats.lock().dropped += 1;
            } else {
                group.writer.add_raw_event(event.bytes)?;
                self.stats.lock().events += 1;
            }
            let group_end = evid.0 * self.events_combine as u64;
            if u64::from(count) >= group_end {
                if let Some(buf) = self.flush()? {
                    out.push(buf);
                }
            }
            if event.header.is_stop_acq() {
                stop = true;
                self.stats.lock().stops += 1;
                if let Some(buf) = self.flush()? {
                    out.push(buf);
                }
            }
        }
        Ok(stop)
    }
}

/// Failure while combining.
#[derive(Debug)]
pub enum CombineError {
    Format(BnetError),
    Wait(WaitError),
}

impl From<BnetError> for CombineError {
    fn from(e: BnetError) -> Self {
        CombineError::Format(e)
    }
}

impl From<hdaq::Error> for CombineError {
    fn from(e: hdaq::Error) -> Self {
        CombineError::Format(BnetError::Runtime(e))
    }
}

impl From<WaitError> for CombineError {
    fn from(e: WaitError) -> Self {
        CombineError::Wait(e)
    }
}

/// Sync module feeding the transport with combined buffers.
///
/// After a stop-acquisition event the open group is flushed, an end-of-data
/// marker follows and the module waits for `Restart`.
pub struct CombinerModule {
    combiner: Combiner,
    input: PortId,
    output: PortId,
    pool: PoolHandleId,
    buffer_size: usize,
}

impl CombinerModule {
    /// `limit` bounds the framed payload so that it still fits a transport
    /// packet.
    pub fn new(name: &str, pool: &str, events_combine: usize, buffer_size: usize, limit: usize) -> (ModuleSpec, Self) {
        let mut spec = ModuleSpec::new(name);
        let input = spec.add_input("Input", 4);
        let output = spec.add_output("Output", 4);
        let pool = spec.add_pool_handle("Pool", pool);
        let module = Self {
            combiner: Combiner::new(events_combine, limit),
            input,
            output,
            pool,
            buffer_size,
        };
        (spec, module)
    }

    pub fn stats_handle(&self) -> Arc<Mutex<CombinerStats>> {
        self.combiner.stats_handle()
    }

    fn take_output(ctx: &mut SyncContext<'_>, pool: PoolHandleId, size: usize) -> core::result::Result<Buffer, WaitError> {
        let mut buf = ctx.take_buffer(pool, size - EVENT_ID_HEADER, None)?;
        buf.set_header_size(EVENT_ID_HEADER)
            .map_err(|e| WaitError::Failed(e.to_string()))?;
        Ok(buf)
    }

    fn send_eof(&mut self, ctx: &mut SyncContext<'_>) -> core::result::Result<(), WaitError> {
        let buf = Self::take_output(ctx, self.pool, self.buffer_size)?;
        let mut eof = EventWriter::new(buf, 0)
            .and_then(EventWriter::finish_eof)
            .map_err(|e| WaitError::Failed(e.to_string()))?;
        if let Ok(hdr) = eof.header_mut() {
            hdr.copy_from_slice(&EventId::NONE.to_le_bytes());
        }
        ctx.send(self.output, eof, None)
    }
}

impl SyncModule for CombinerModule {
    fn main_loop(&mut self, ctx: &mut SyncContext<'_>) -> core::result::Result<(), WaitError> {
        let mut ready = Vec::new();
        loop {
            // flush a partial group instead of holding it while idle
            if ctx.input_pending(self.input) == 0 {
                match ctx.recv(self.input, Some(Duration::from_millis(50))) {
                    Ok(buf) => self.process(ctx, buf, &mut ready)?,
                    Err(WaitError::TimedOut) => {
                        if let Some(buf) = self.combiner.flush().map_err(|e| WaitError::Failed(e.to_string()))? {
                            ctx.send(self.output, buf, None)?;
                        }
                    }
                    Err(e) => return Err(e),
                }
            } else {
                let buf = ctx.recv(self.input, None)?;
                self.process(ctx, buf, &mut ready)?;
            }
        }
    }
}

impl CombinerModule {
    fn process(
        &mut self,
        ctx: &mut SyncContext<'_>,
        input: Buffer,
        ready: &mut Vec<Buffer>,
    ) -> core::result::Result<(), WaitError> {
        if input.type_tag() == BUFFER_TYPE_EOF {
            return Ok(());
        }
        let pool = self.pool;
        let size = self.buffer_size;
        let stop = {
            let mut alloc = || Self::take_output(ctx, pool, size);
            self.combiner.add_buffer(&input, &mut alloc, ready)
        };
        drop(input);
        for buf in ready.drain(..) {
            ctx.send(self.output, buf, None)?;
        }
        match stop {
            Ok(false) => Ok(()),
            Ok(true) => {
                log::info!("[CombinerModule] {} saw stop acquisition", ctx.name());
                self.send_eof(ctx)?;
                ctx.wait_restart()
            }
            Err(CombineError::Wait(e)) => Err(e),
            Err(CombineError::Format(e)) => {
                log::warn!("[CombinerModule] {} skipped input buffer: {}", ctx.name(), e);
                Ok(())
            }
        }
    }
}
