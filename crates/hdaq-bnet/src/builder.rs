// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event building: merge of N aligned subevent streams.
//!
//! Every input delivers framed buffers whose events carry a counter shared by
//! all senders. The builder reads one buffer per input at a time and merges
//! events with equal counters:
//!
//! ```text
//! counters agree ──▶ copy header of input 0 + subevents of every input
//!      │
//!      └─ disagree ──▶ skip the event of the lagging input, retry
//! ```
//!
//! A stop-acquisition trigger flushes the output and parks the module until
//! `Restart`.

use crate::format::{BufferHeader, EventHeader, EventIterator, EventView, EventWriter, BUFFER_TYPE_EOF};
use hdaq::{
    Buffer, Command, CommandResult, FatalError, ModuleSpec, PoolHandleId, PortId, SyncContext,
    SyncModule, WaitError,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Counters of an event builder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuilderStats {
    pub built_events: u64,
    /// Events skipped per input because the other inputs were ahead.
    pub skipped: Vec<u64>,
    pub output_buffers: u64,
    /// Stop triggers seen on only part of the inputs.
    pub partial_stops: u64,
    /// Malformed input buffers and events without subevents.
    pub bad_rounds: u64,
}

/// Result of one build round.
#[derive(Debug, Default)]
pub struct BuildOutcome {
    /// Filled output buffers, in event order.
    pub ready: Vec<Buffer>,
    /// A stop-acquisition event was merged; the output was flushed.
    pub stop_acquisition: bool,
}

/// Why a round did not complete.
#[derive(Debug)]
pub enum BuildFailure {
    /// Invariant violation; the data path must halt.
    Fatal(FatalError),
    /// Waiting for an output buffer failed.
    Wait(WaitError),
}

impl From<WaitError> for BuildFailure {
    fn from(e: WaitError) -> Self {
        BuildFailure::Wait(e)
    }
}

/// Read position inside one input buffer.
struct InputCursor {
    buf: Buffer,
    pos: usize,
    seen: u32,
}

impl InputCursor {
    /// Event under the cursor; `None` once the buffer is consumed.
    fn current(&self) -> Option<crate::error::Result<EventView<'_>>> {
        match EventIterator::resume(self.buf.data(), self.pos, self.seen) {
            Ok(mut iter) => iter.next(),
            Err(e) => Some(Err(e)),
        }
    }

    fn advance(&mut self, size: usize) {
        self.pos += size;
        self.seen += 1;
    }

    fn subevents(&self, size: usize) -> &[u8] {
        &self.buf.data()[self.pos + EventHeader::SIZE..self.pos + size]
    }
}

/// Merge state, independent of the runtime.
///
/// Holds one buffer per input; an input whose buffer is consumed is
/// reported by [`EventBuilder::missing_input`] and refilled with
/// [`EventBuilder::supply`].
pub struct EventBuilder {
    events_combine: usize,
    out_buffer_size: usize,
    buffer_id: u32,
    out: Option<EventWriter>,
    cursors: Vec<Option<InputCursor>>,
    last_count: Option<u32>,
    stats: Arc<Mutex<BuilderStats>>,
}

impl EventBuilder {
    pub fn new(num_inputs: usize, events_combine: usize, out_buffer_size: usize) -> Self {
        let stats = BuilderStats {
            skipped: vec![0; num_inputs],
            ..BuilderStats::default()
        };
        Self {
            events_combine: events_combine.max(1),
            out_buffer_size,
            buffer_id: 0,
            out: None,
            cursors: (0..num_inputs).map(|_| None).collect(),
            last_count: None,
            stats: Arc::new(Mutex::new(stats)),
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.cursors.len()
    }

    pub fn stats_handle(&self) -> Arc<Mutex<BuilderStats>> {
        Arc::clone(&self.stats)
    }

    pub fn has_open_output(&self) -> bool {
        self.out.as_ref().is_some_and(|w| !w.is_empty())
    }

    /// First input without a buffer.
    pub fn missing_input(&self) -> Option<usize> {
        self.cursors.iter().position(Option::is_none)
    }

    /// Hand a buffer to `input`. Buffers without a valid event are released
    /// and `false` is returned.
    pub fn supply(&mut self, input: usize, buf: Buffer) -> bool {
        let Some(slot) = self.cursors.get_mut(input) else {
            log::error!("[EventBuilder::supply] no input {}", input);
            return false;
        };
        let cursor = InputCursor {
            buf,
            pos: BufferHeader::SIZE,
            seen: 0,
        };
        let status = cursor.current().map(|r| r.map(|_| ()));
        match status {
            Some(Ok(())) => {
                *slot = Some(cursor);
                true
            }
            Some(Err(e)) => {
                log::error!(
                    "[EventBuilder::supply] invalid format on input {} ({} bytes): {}",
                    input,
                    cursor.buf.data_len(),
                    e
                );
                self.stats.lock().bad_rounds += 1;
                false
            }
            None => {
                log::warn!("[EventBuilder::supply] input {} delivered an empty buffer", input);
                false
            }
        }
    }

    /// Close the open output buffer.
    pub fn flush(&mut self) -> Result<Option<Buffer>, FatalError> {
        let Some(writer) = self.out.take() else {
            return Ok(None);
        };
        if writer.is_empty() {
            return Ok(None);
        }
        let buf = writer
            .finish()
            .map_err(|e| FatalError::new("EventBuilder", format!("closing output buffer: {}", e)))?;
        self.stats.lock().output_buffers += 1;
        Ok(Some(buf))
    }

    /// Header and size of the current event of every input. Consumed or
    /// malformed buffers are released and `None` is returned.
    fn heads(&mut self) -> Option<Vec<(EventHeader, usize)>> {
        let mut heads = Vec::with_capacity(self.cursors.len());
        for (i, slot) in self.cursors.iter_mut().enumerate() {
            let head = slot.as_ref()?.current().map(|r| r.map(|ev| (ev.header, ev.bytes.len())));
            match head {
                Some(Ok(head)) => heads.push(head),
                Some(Err(e)) => {
                    log::error!("[EventBuilder::build] input {}: {}", i, e);
                    self.stats.lock().bad_rounds += 1;
                    *slot = None;
                    return None;
                }
                None => {
                    *slot = None;
                    return None;
                }
            }
        }
        Some(heads)
    }

    /// Merge up to `events_combine` events. Returns early when an input
    /// buffer is consumed. `alloc` provides output buffers of at least the
    /// given size.
    pub fn build(
        &mut self,
        alloc: &mut dyn FnMut(usize) -> Result<Buffer, WaitError>,
    ) -> Result<BuildOutcome, BuildFailure> {
        let mut outcome = BuildOutcome::default();
        let n = self.cursors.len();
        if n == 0 {
            return Ok(outcome);
        }

        let mut nevent = 0;
        while nevent < self.events_combine {
            let Some(heads) = self.heads() else {
                return Ok(outcome);
            };

            let mut pmin = 0;
            let mut pmax = 0;
            let mut subevents_len = 0;
            for (i, (hdr, _)) in heads.iter().enumerate() {
                if hdr.count < heads[pmin].0.count {
                    pmin = i;
                } else if hdr.count > heads[pmax].0.count {
                    pmax = i;
                }
                subevents_len += hdr.subevents_size();
            }

            let min = heads[pmin].0.count;
            if min < heads[pmax].0.count || self.last_count.is_some_and(|last| min <= last) {
                log::warn!("[EventBuilder::build] skip event {} from input {}", min, pmin);
                if let Some(s) = self.stats.lock().skipped.get_mut(pmin) {
                    *s += 1;
                }
                if let Some(cursor) = self.cursors[pmin].as_mut() {
                    cursor.advance(heads[pmin].1);
                }
                continue;
            }

            if subevents_len == 0 {
                log::error!("[EventBuilder::build] event {} has no subevents", min);
                self.stats.lock().bad_rounds += 1;
                for (slot, (_, size)) in self.cursors.iter_mut().zip(&heads) {
                    if let Some(cursor) = slot.as_mut() {
                        cursor.advance(*size);
                    }
                }
                continue;
            }

            if self.out.as_ref().is_some_and(|w| !w.is_place_for_event(subevents_len)) {
                if let Some(buf) = self.flush().map_err(BuildFailure::Fatal)? {
                    outcome.ready.push(buf);
                }
            }
            if self.out.is_none() {
                let need = BufferHeader::SIZE + EventHeader::SIZE + subevents_len;
                self.buffer_id += 1;
                let buf = match alloc(need.max(self.out_buffer_size)) {
                    Ok(buf) => buf,
                    Err(WaitError::Failed(reason)) => {
                        return Err(BuildFailure::Fatal(FatalError::new(
                            "EventBuilder",
                            format!(
                                "event {} of {} bytes exceeds every output buffer: {}",
                                min,
                                subevents_len + EventHeader::SIZE,
                                reason
                            ),
                        )));
                    }
                    Err(e) => return Err(e.into()),
                };
                let writer = EventWriter::new(buf, self.buffer_id).map_err(|e| {
                    BuildFailure::Fatal(FatalError::new("EventBuilder", format!("output buffer: {}", e)))
                })?;
                if !writer.is_place_for_event(subevents_len) {
                    return Err(BuildFailure::Fatal(FatalError::new(
                        "EventBuilder",
                        format!(
                            "event {} of {} bytes does not fit an output buffer of {}",
                            min,
                            subevents_len + EventHeader::SIZE,
                            writer.capacity()
                        ),
                    )));
                }
                self.out = Some(writer);
            }
            let Some(writer) = self.out.as_mut() else {
                continue;
            };

            let parts: Vec<&[u8]> = self
                .cursors
                .iter()
                .flatten()
                .zip(&heads)
                .map(|(cursor, (_, size))| cursor.subevents(*size))
                .collect();
            if let Err(e) = merge_event(writer, heads[0].0, &parts) {
                writer.discard_event();
                return Err(BuildFailure::Fatal(FatalError::new(
                    "EventBuilder",
                    format!("merging event {}: {}", min, e),
                )));
            }
            for (slot, (_, size)) in self.cursors.iter_mut().zip(&heads) {
                if let Some(cursor) = slot.as_mut() {
                    cursor.advance(*size);
                }
            }
            self.last_count = Some(min);
            self.stats.lock().built_events += 1;
            nevent += 1;

            let num_stop = heads.iter().filter(|(hdr, _)| hdr.is_stop_acq()).count();
            if num_stop > 0 {
                if num_stop < n {
                    log::error!(
                        "[EventBuilder::build] not all buffers have stop flag ({} of {})",
                        num_stop,
                        n
                    );
                    self.stats.lock().partial_stops += 1;
                }
                if let Some(buf) = self.flush().map_err(BuildFailure::Fatal)? {
                    outcome.ready.push(buf);
                }
                outcome.stop_acquisition = true;
                return Ok(outcome);
            }
        }
        Ok(outcome)
    }
}

/// Append one event with the header of the first input and the subevents
/// of all inputs; the event size is recomputed.
fn merge_event(writer: &mut EventWriter, header: EventHeader, parts: &[&[u8]]) -> crate::error::Result<u32> {
    writer.start_event(header)?;
    for part in parts {
        writer.add_raw_subevents(part)?;
    }
    writer.finish_event()
}

/// Sync module merging the event streams of its inputs.
///
/// The open output buffer is flushed whenever an input has nothing queued,
/// so merged events never wait for more input.
pub struct BuilderModule {
    builder: EventBuilder,
    inputs: Vec<PortId>,
    output: PortId,
    pool: PoolHandleId,
}

impl BuilderModule {
    /// Module `name` with `num_inputs` inputs `Input0..` and output buffers
    /// from `pool`.
    pub fn new(
        name: &str,
        pool: &str,
        num_inputs: usize,
        events_combine: usize,
        out_buffer_size: usize,
    ) -> (ModuleSpec, Self) {
        let mut spec = ModuleSpec::new(name);
        let inputs = (0..num_inputs)
            .map(|i| spec.add_input(format!("Input{}", i), 8))
            .collect();
        let output = spec.add_output("Output", 8);
        let pool = spec.add_pool_handle("Pool", pool);
        let module = Self {
            builder: EventBuilder::new(num_inputs, events_combine, out_buffer_size),
            inputs,
            output,
            pool,
        };
        (spec, module)
    }

    pub fn stats_handle(&self) -> Arc<Mutex<BuilderStats>> {
        self.builder.stats_handle()
    }

    fn flush(&mut self, ctx: &mut SyncContext<'_>) -> Result<(), WaitError> {
        match self.builder.flush() {
            Ok(Some(buf)) => ctx.send(self.output, buf, None),
            Ok(None) => Ok(()),
            Err(fatal) => Err(self.fatal(ctx, fatal)),
        }
    }

    fn fatal(&self, ctx: &mut SyncContext<'_>, err: FatalError) -> WaitError {
        log::error!("[BuilderModule] {}: {}", ctx.name(), err);
        let wait = WaitError::from(err.clone());
        ctx.raise_fatal(err);
        wait
    }

    fn serve_commands(&mut self, ctx: &mut SyncContext<'_>) {
        while let Some(mut cmd) = ctx.take_command() {
            let result = self.execute_command(&mut cmd);
            cmd.reply(result);
        }
    }

    /// Next data buffer of `port`, skipping end-of-data markers.
    fn next_input(&mut self, ctx: &mut SyncContext<'_>, port: PortId) -> Result<Buffer, WaitError> {
        loop {
            if ctx.input_pending(port) == 0 && self.builder.has_open_output() {
                self.flush(ctx)?;
            }
            let buf = ctx.recv(port, None)?;
            self.serve_commands(ctx);
            if buf.type_tag() != BUFFER_TYPE_EOF {
                return Ok(buf);
            }
        }
    }
}

impl SyncModule for BuilderModule {
    fn main_loop(&mut self, ctx: &mut SyncContext<'_>) -> Result<(), WaitError> {
        loop {
            while let Some(i) = self.builder.missing_input() {
                let port = self.inputs[i];
                let buf = self.next_input(ctx, port)?;
                self.builder.supply(i, buf);
            }

            let pool = self.pool;
            let result = {
                let mut alloc = |size: usize| ctx.take_buffer(pool, size, None);
                self.builder.build(&mut alloc)
            };

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(BuildFailure::Wait(e)) => return Err(e),
                Err(BuildFailure::Fatal(fatal)) => return Err(self.fatal(ctx, fatal)),
            };
            for buf in outcome.ready {
                ctx.send(self.output, buf, None)?;
            }
            if outcome.stop_acquisition {
                log::info!("[BuilderModule] {} flushed output, waiting for restart", ctx.name());
                ctx.wait_restart()?;
            }
        }
    }

    fn after_stop(&mut self, ctx: &mut SyncContext<'_>) {
        let stats = self.builder.stats.lock().clone();
        log::info!(
            "[BuilderModule] {} built {} events in {} buffers, skipped {:?}",
            ctx.name(),
            stats.built_events,
            stats.output_buffers,
            stats.skipped
        );
    }

    fn execute_command(&mut self, cmd: &mut Command) -> CommandResult {
        if !cmd.is("GetStats") {
            return CommandResult::Unknown;
        }
        let stats = self.builder.stats.lock().clone();
        cmd.set("built_events", stats.built_events);
        cmd.set("output_buffers", stats.output_buffers);
        cmd.set("partial_stops", stats.partial_stops);
        cmd.set("skipped", stats.skipped.iter().sum::<u64>());
        CommandResult::True
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // test scaffolding
    use super::*;
    use crate::format::{SubeventHeader, TRIGGER_STOP_ACQ};
    use hdaq::MemoryPool;

    /// Framed buffer with one 10 byte subevent per counter; payload bytes
    /// are `tag`.
    fn input(pool: &MemoryPool, counts: &[u32], tag: u8, stop: Option<u32>) -> Buffer {
        let mut w = EventWriter::new(pool.take(1024, 0), 1).unwrap();
        for &c in counts {
            let mut h = EventHeader::new(c);
            if stop == Some(c) {
                h = h.with_trigger(TRIGGER_STOP_ACQ);
            }
            w.start_event(h).unwrap();
            w.add_subevent(SubeventHeader::new(i16::from(tag)), &[tag; 10]).unwrap();
            w.finish_event().unwrap();
        }
        w.finish().unwrap()
    }

    fn alloc_from(pool: &MemoryPool) -> impl FnMut(usize) -> Result<Buffer, WaitError> + '_ {
        move |size| {
            let b = pool.take(size, 0);
            if b.is_null() {
                Err(WaitError::TimedOut)
            } else {
                Ok(b)
            }
        }
    }

    /// Build until an input runs dry or acquisition stops.
    fn drain(
        b: &mut EventBuilder,
        alloc: &mut dyn FnMut(usize) -> Result<Buffer, WaitError>,
    ) -> (Vec<Buffer>, bool) {
        let mut ready = Vec::new();
        while b.missing_input().is_none() {
            let outcome = b.build(alloc).unwrap();
            ready.extend(outcome.ready);
            if outcome.stop_acquisition {
                return (ready, true);
            }
        }
        (ready, false)
    }

    fn merged(bufs: &[Buffer]) -> Vec<(u32, Vec<u8>)> {
        let mut out = Vec::new();
        for buf in bufs {
            for ev in EventIterator::new(buf.data()).unwrap() {
                let ev = ev.unwrap();
                let tags = ev.subevents().map(|s| s.unwrap().payload()[0]).collect();
                out.push((ev.count(), tags));
            }
        }
        out
    }

    fn counts(bufs: &[Buffer]) -> Vec<u32> {
        merged(bufs).into_iter().map(|(c, _)| c).collect()
    }

    #[test]
    fn three_aligned_events_merge_in_order() {
        let pool = MemoryPool::with_classes("b", &[(1024, 32)]).unwrap();
        let mut b = EventBuilder::new(2, 1, 1024);
        let mut alloc = alloc_from(&pool);
        let mut ready = Vec::new();
        for c in 1..=3 {
            assert!(b.supply(0, input(&pool, &[c], 0xA, None)));
            assert!(b.supply(1, input(&pool, &[c], 0xB, None)));
            let (out, stop) = drain(&mut b, &mut alloc);
            assert!(!stop);
            ready.extend(out);
            assert_eq!(b.missing_input(), Some(0));
        }
        ready.extend(b.flush().unwrap());

        assert_eq!(
            merged(&ready),
            vec![(1, vec![0xA, 0xB]), (2, vec![0xA, 0xB]), (3, vec![0xA, 0xB])]
        );
        let stats = b.stats_handle().lock().clone();
        assert_eq!(stats.built_events, 3);
        assert_eq!(stats.skipped, vec![0, 0]);
        assert_eq!(stats.output_buffers, 1);
    }

    #[test]
    fn partial_stop_flushes_and_requests_restart() {
        let pool = MemoryPool::with_classes("b", &[(1024, 32)]).unwrap();
        let mut b = EventBuilder::new(2, 1, 1024);
        let mut alloc = alloc_from(&pool);
        b.supply(0, input(&pool, &[1, 2, 3, 4, 5, 6], 1, Some(5)));
        b.supply(1, input(&pool, &[1, 2, 3, 4, 5, 6], 2, None));

        let (ready, stop) = drain(&mut b, &mut alloc);
        assert!(stop);
        assert!(!b.has_open_output());
        assert_eq!(ready.len(), 1);
        assert_eq!(counts(&ready), vec![1, 2, 3, 4, 5]);
        assert_eq!(b.stats_handle().lock().partial_stops, 1);

        // after the restart the remaining event is merged
        let (ready, stop) = drain(&mut b, &mut alloc);
        assert!(!stop);
        assert!(ready.is_empty());
        assert_eq!(counts(&b.flush().unwrap().into_iter().collect::<Vec<_>>()), vec![6]);
    }

    #[test]
    fn lagging_input_is_skipped_forward() {
        let pool = MemoryPool::with_classes("b", &[(1024, 32)]).unwrap();
        let mut b = EventBuilder::new(2, 2, 1024);
        let mut alloc = alloc_from(&pool);
        b.supply(0, input(&pool, &[1, 2, 3], 1, None));
        b.supply(1, input(&pool, &[2, 3, 4], 2, None));
        let (mut ready, _) = drain(&mut b, &mut alloc);
        ready.extend(b.flush().unwrap());

        assert_eq!(counts(&ready), vec![2, 3]);
        assert_eq!(b.stats_handle().lock().skipped, vec![1, 0]);
        // input 0 is consumed, input 1 still holds event 4
        assert_eq!(b.missing_input(), Some(0));
        b.supply(0, input(&pool, &[4], 1, None));
        let (mut ready, _) = drain(&mut b, &mut alloc);
        ready.extend(b.flush().unwrap());
        assert_eq!(counts(&ready), vec![4]);
    }

    #[test]
    fn merged_counters_are_the_common_events() {
        let pool = MemoryPool::with_classes("b", &[(1024, 64)]).unwrap();
        let mut b = EventBuilder::new(3, 1, 1024);
        let mut alloc = alloc_from(&pool);

        // each stream loses about one event in ten
        let streams: Vec<Vec<u32>> = (0..3)
            .map(|_| (1..=300).filter(|_| fastrand::u8(..10) != 0).collect())
            .collect();
        let expected: Vec<u32> = streams[0]
            .iter()
            .copied()
            .filter(|c| streams[1].contains(c) && streams[2].contains(c))
            .collect();

        let mut chunks: Vec<_> = streams.iter().map(|s| s.chunks(7)).collect();
        let mut got = Vec::new();
        'feed: loop {
            while let Some(i) = b.missing_input() {
                let Some(chunk) = chunks[i].next() else {
                    break 'feed;
                };
                b.supply(i, input(&pool, chunk, i as u8, None));
            }
            let (ready, _) = drain(&mut b, &mut alloc);
            got.extend(merged(&ready));
        }
        got.extend(merged(&b.flush().unwrap().into_iter().collect::<Vec<_>>()));

        assert!(got.iter().all(|(_, tags)| tags == &vec![0, 1, 2]));
        let got: Vec<u32> = got.into_iter().map(|(c, _)| c).collect();
        assert!(got.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(got, expected);
    }

    #[test]
    fn malformed_input_is_refused() {
        let pool = MemoryPool::with_classes("b", &[(1024, 8)]).unwrap();
        let mut b = EventBuilder::new(1, 1, 1024);
        let mut junk = pool.take(64, 0);
        junk.data_mut().unwrap().fill(0xFF);
        assert!(!b.supply(0, junk));
        assert_eq!(b.missing_input(), Some(0));
        assert_eq!(b.stats_handle().lock().bad_rounds, 1);
    }

    #[test]
    fn oversized_event_is_fatal() {
        let pool = MemoryPool::with_classes("b", &[(1024, 8)]).unwrap();
        let small = MemoryPool::with_classes("small", &[(48, 4)]).unwrap();
        let mut b = EventBuilder::new(2, 1, 48);
        let mut alloc = |_size: usize| Ok(small.take(48, 0));
        b.supply(0, input(&pool, &[1], 1, None));
        b.supply(1, input(&pool, &[1], 2, None));
        assert!(matches!(b.build(&mut alloc), Err(BuildFailure::Fatal(_))));
    }

    #[test]
    fn missing_pool_class_is_fatal() {
        let pool = MemoryPool::with_classes("b", &[(1024, 8)]).unwrap();
        let mut b = EventBuilder::new(2, 1, 48);
        let mut alloc = |size: usize| Err(WaitError::Failed(format!("no class for {} bytes", size)));
        b.supply(0, input(&pool, &[1], 1, None));
        b.supply(1, input(&pool, &[1], 2, None));
        assert!(matches!(b.build(&mut alloc), Err(BuildFailure::Fatal(_))));
        assert_eq!(b.stats_handle().lock().built_events, 0);

        // a timeout stays a wait failure
        let mut alloc = |_size: usize| Err(WaitError::TimedOut);
        assert!(matches!(b.build(&mut alloc), Err(BuildFailure::Wait(WaitError::TimedOut))));
    }

    // ------------------------------------------------------------------
    // BuilderModule on a runtime
    // ------------------------------------------------------------------

    use crossbeam::channel::{self, Receiver, Sender};
    use hdaq::{RuntimeConfig, RuntimeContext};
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    /// Sends one framed buffer per entry of `buffers`, then idles.
    struct Feeder {
        output: PortId,
        pool: PoolHandleId,
        tag: u8,
        buffers: Vec<(Vec<u32>, Option<u32>)>,
    }

    impl SyncModule for Feeder {
        fn main_loop(&mut self, ctx: &mut SyncContext<'_>) -> Result<(), WaitError> {
            for (id, (counts, stop)) in std::mem::take(&mut self.buffers).into_iter().enumerate() {
                let buf = ctx.take_buffer(self.pool, 1024, Some(WAIT))?;
                let mut w = EventWriter::new(buf, id as u32 + 1).unwrap();
                for c in counts {
                    let mut h = EventHeader::new(c);
                    if stop == Some(c) {
                        h = h.with_trigger(TRIGGER_STOP_ACQ);
                    }
                    w.start_event(h).unwrap();
                    w.add_subevent(SubeventHeader::new(i16::from(self.tag)), &[self.tag; 10])
                        .unwrap();
                    w.finish_event().unwrap();
                }
                ctx.send(self.output, w.finish().unwrap(), Some(WAIT))?;
            }
            loop {
                ctx.sleep(Duration::from_millis(20))?;
            }
        }
    }

    /// Reports the event counters of every buffer it receives.
    struct Collector {
        input: PortId,
        report: Sender<Vec<u32>>,
    }

    impl SyncModule for Collector {
        fn main_loop(&mut self, ctx: &mut SyncContext<'_>) -> Result<(), WaitError> {
            loop {
                let buf = ctx.recv(self.input, None)?;
                let _ = self.report.send(counts(std::slice::from_ref(&buf)));
            }
        }
    }

    /// Two feeders into a builder with output blocks of `out_block` bytes,
    /// the builder output collected.
    fn deploy(
        ctx: &RuntimeContext,
        out_block: usize,
        feeds: [Vec<(Vec<u32>, Option<u32>)>; 2],
    ) -> Receiver<Vec<u32>> {
        ctx.create_pool("Feed", &[(1024, 8)]).unwrap();
        ctx.create_pool("Out", &[(out_block, 4)]).unwrap();
        let (spec, builder) = BuilderModule::new("Builder", "Out", 2, 1, out_block);
        ctx.create_sync_module(spec, builder, "Builder").unwrap();
        for (i, buffers) in feeds.into_iter().enumerate() {
            let name = format!("Feeder{}", i);
            let mut spec = ModuleSpec::new(name.as_str());
            let output = spec.add_output("Output", 4);
            let pool = spec.add_pool_handle("Pool", "Feed");
            let feeder = Feeder {
                output,
                pool,
                tag: i as u8 + 1,
                buffers,
            };
            ctx.create_sync_module(spec, feeder, &name).unwrap();
            ctx.connect(&format!("{}/Output", name), &format!("Builder/Input{}", i))
                .unwrap();
        }

        let (tx, rx) = channel::unbounded();
        let mut spec = ModuleSpec::new("Collector");
        let input = spec.add_input("Input", 4);
        ctx.create_sync_module(spec, Collector { input, report: tx }, "Collector")
            .unwrap();
        ctx.connect("Builder/Output", "Collector/Input").unwrap();
        rx
    }

    #[test]
    fn module_parks_after_stop_until_restart() {
        let ctx = RuntimeContext::new(RuntimeConfig::default()).unwrap();
        let rx = deploy(
            &ctx,
            1024,
            [
                vec![(vec![1, 2, 3, 4, 5, 6], Some(5))],
                vec![(vec![1, 2, 3, 4, 5, 6], None)],
            ],
        );
        ctx.start_all().unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), vec![1, 2, 3, 4, 5]);
        // event 6 is held back while the module waits
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        ctx.restart_module("Builder").unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), vec![6]);
        assert!(ctx.fatal_error().is_none());
        ctx.shutdown();
    }

    #[test]
    fn module_halts_when_no_output_block_fits() {
        let ctx = RuntimeContext::new(RuntimeConfig::default()).unwrap();
        let rx = deploy(&ctx, 48, [vec![(vec![1], None)], vec![(vec![1], None)]]);
        ctx.start_all().unwrap();

        let deadline = Instant::now() + WAIT;
        while ctx.fatal_error().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let fatal = ctx.fatal_error().expect("oversized event must be fatal");
        assert_eq!(fatal.component, "EventBuilder");
        assert!(ctx.is_exit_requested());
        assert!(rx.try_recv().is_err());
        ctx.shutdown();
    }
}
