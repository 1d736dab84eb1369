// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Source of framed test events.

use crate::format::{EventHeader, EventWriter, SubeventHeader, TRIGGER_START_ACQ, TRIGGER_STOP_ACQ};
use hdaq::{Buffer, ModuleCallbacks, ModuleContext, ModuleSpec, PoolHandleId, PortId, TimerId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Shape of the generated events.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Identifies the source in subevent headers.
    pub proc_id: u16,
    /// Subevents per event.
    pub subevents: usize,
    /// Payload bytes per subevent.
    pub subevent_size: usize,
    /// Upper bound of events per buffer.
    pub events_per_buffer: usize,
    /// Size of the taken buffers.
    pub buffer_size: usize,
    /// Stop after this many events; `None` runs until stopped.
    pub total_events: Option<u32>,
    /// Event carrying the stop-acquisition trigger; production ends with it.
    pub stop_event: Option<u32>,
    /// One buffer per period instead of as fast as the output allows.
    pub buffer_period: Option<Duration>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            proc_id: 0,
            subevents: 2,
            subevent_size: 64,
            events_per_buffer: 1,
            buffer_size: 4096,
            total_events: None,
            stop_event: None,
            buffer_period: None,
        }
    }
}

impl GeneratorConfig {
    /// Bytes of the subevents of one event.
    pub fn subevents_len(&self) -> usize {
        self.subevents * (SubeventHeader::SIZE + self.subevent_size)
    }
}

/// Counters of a generator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    pub events: u64,
    pub buffers: u64,
}

/// Async module filling pool buffers with events numbered from 1.
///
/// The first event carries the start-acquisition trigger. Subevent payload
/// bytes repeat the low byte of the event counter, so consumers can check
/// what they merged.
pub struct GeneratorModule {
    config: GeneratorConfig,
    output: PortId,
    pool: PoolHandleId,
    timer: TimerId,
    next_event: u32,
    buffer_id: u32,
    finished: bool,
    stats: Arc<Mutex<GeneratorStats>>,
}

impl GeneratorModule {
    /// Declare the module `name` taking buffers from `pool`.
    pub fn new(name: &str, pool: &str, config: GeneratorConfig) -> (ModuleSpec, Self) {
        let mut spec = ModuleSpec::new(name);
        let output = spec.add_output("Output", 4);
        let pool = spec.add_pool_handle("Pool", pool);
        let timer = spec.add_timer("Tick", config.buffer_period);
        let module = Self {
            config,
            output,
            pool,
            timer,
            next_event: 1,
            buffer_id: 0,
            finished: false,
            stats: Arc::new(Mutex::new(GeneratorStats::default())),
        };
        (spec, module)
    }

    /// Shared view of the counters, valid after the module is handed over.
    pub fn stats_handle(&self) -> Arc<Mutex<GeneratorStats>> {
        Arc::clone(&self.stats)
    }

    fn is_last(&self, count: u32) -> bool {
        self.config.total_events.is_some_and(|t| count >= t)
            || self.config.stop_event.is_some_and(|s| count >= s)
    }

    /// Write events into `buffer`; `None` when nothing was left to write.
    fn fill(&mut self, buffer: Buffer) -> Option<Buffer> {
        self.buffer_id += 1;
        let mut writer = match EventWriter::new(buffer, self.buffer_id) {
            Ok(w) => w,
            Err(e) => {
                log::error!("[GeneratorModule::fill] cannot start buffer: {}", e);
                return None;
            }
        };
        let subevents_len = self.config.subevents_len();
        let mut payload = vec![0u8; self.config.subevent_size];
        while !self.finished
            && (writer.num_events() as usize) < self.config.events_per_buffer.max(1)
            && writer.is_place_for_event(subevents_len)
        {
            let count = self.next_event;
            let mut header = EventHeader::new(count);
            if count == 1 {
                header = header.with_trigger(TRIGGER_START_ACQ);
            }
            if self.config.stop_event == Some(count) {
                header = header.with_trigger(TRIGGER_STOP_ACQ);
            }
            payload.fill(count as u8);
            let written = writer.start_event(header).and_then(|()| {
                for k in 0..self.config.subevents {
                    let mut sub = SubeventHeader::new((self.config.proc_id as usize * self.config.subevents + k) as i16);
                    sub.subcrate = self.config.proc_id as i8;
                    sub.control = 2;
                    writer.add_subevent(sub, &payload)?;
                }
                writer.finish_event()
            });
            if let Err(e) = written {
                log::error!("[GeneratorModule::fill] event {} not written: {}", count, e);
                writer.discard_event();
                break;
            }
            self.next_event += 1;
            if self.is_last(count) {
                self.finished = true;
            }
        }
        if writer.is_empty() {
            if !self.finished {
                log::error!(
                    "[GeneratorModule::fill] event of {} bytes does not fit a {} byte buffer",
                    subevents_len + EventHeader::SIZE,
                    writer.capacity()
                );
                self.finished = true;
            }
            return None;
        }
        let events = writer.num_events();
        match writer.finish() {
            Ok(buf) => {
                let mut stats = self.stats.lock();
                stats.events += u64::from(events);
                stats.buffers += 1;
                Some(buf)
            }
            Err(e) => {
                log::error!("[GeneratorModule::fill] cannot finish buffer: {}", e);
                None
            }
        }
    }

    /// Produce one buffer; false when production has to wait.
    fn produce_one(&mut self, ctx: &mut ModuleContext<'_>) -> bool {
        if self.finished || !ctx.can_send(self.output) {
            return false;
        }
        let Some(buffer) = ctx.request_buffer(self.pool, self.config.buffer_size) else {
            return false;
        };
        match self.fill(buffer) {
            Some(buf) => {
                if let Err(e) = ctx.send(self.output, buf) {
                    log::warn!("[GeneratorModule::produce_one] {}: {}", ctx.name(), e);
                    return false;
                }
                if self.finished {
                    log::info!(
                        "[GeneratorModule] {} produced {} events",
                        ctx.name(),
                        self.next_event - 1
                    );
                }
                true
            }
            None => false,
        }
    }

    fn pump(&mut self, ctx: &mut ModuleContext<'_>) {
        if self.config.buffer_period.is_some() {
            return;
        }
        while self.produce_one(ctx) {}
    }
}

impl ModuleCallbacks for GeneratorModule {
    fn before_start(&mut self, ctx: &mut ModuleContext<'_>) {
        self.pump(ctx);
    }

    fn process_output_event(&mut self, ctx: &mut ModuleContext<'_>, _port: PortId) {
        self.pump(ctx);
    }

    fn process_pool_event(&mut self, ctx: &mut ModuleContext<'_>, _pool: PoolHandleId) {
        if self.config.buffer_period.is_some() {
            self.produce_one(ctx);
        } else {
            self.pump(ctx);
        }
    }

    fn process_timer_event(&mut self, ctx: &mut ModuleContext<'_>, timer: TimerId) {
        if timer == self.timer {
            self.produce_one(ctx);
        }
    }

    fn process_connect_event(&mut self, ctx: &mut ModuleContext<'_>, _port: PortId) {
        self.pump(ctx);
    }
}
