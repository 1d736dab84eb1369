// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::unwrap_used)] // test scaffolding
#![allow(clippy::uninlined_format_args)] // Test readability

//! Runtime integration tests
//!
//! Drives a three-stage pipeline (sync source, async relay, sync sink) on
//! real worker threads through the public API only.

use crossbeam::channel::{self, Sender};
use hdaq::{
    Command, CommandResult, CommandsSet, ModuleCallbacks, ModuleContext, ModuleSpec, PoolHandleId,
    PortConfig, PortId, RuntimeConfig, RuntimeContext, SyncContext, SyncModule, WaitError,
};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

/// Emits `total` numbered buffers, with random sizes, then idles.
struct Source {
    output: PortId,
    pool: PoolHandleId,
    total: u32,
}

impl SyncModule for Source {
    fn main_loop(&mut self, ctx: &mut SyncContext<'_>) -> Result<(), WaitError> {
        for seq in 0..self.total {
            let len = fastrand::usize(4..200);
            let mut buf = ctx.take_buffer(self.pool, len, Some(WAIT))?;
            let data = buf.data_mut().unwrap();
            data[..4].copy_from_slice(&seq.to_le_bytes());
            ctx.send(self.output, buf, Some(WAIT))?;
        }
        loop {
            ctx.sleep(Duration::from_millis(20))?;
        }
    }
}

/// Forwards every buffer unchanged.
struct Relay {
    input: PortId,
    output: PortId,
}

impl Relay {
    fn pump(&mut self, ctx: &mut ModuleContext<'_>) {
        while ctx.can_send(self.output) && ctx.can_recv(self.input) {
            let Some(buf) = ctx.recv(self.input) else {
                return;
            };
            ctx.send(self.output, buf).unwrap();
        }
    }
}

impl ModuleCallbacks for Relay {
    fn process_input_event(&mut self, ctx: &mut ModuleContext<'_>, _port: PortId) {
        self.pump(ctx);
    }

    fn process_output_event(&mut self, ctx: &mut ModuleContext<'_>, _port: PortId) {
        self.pump(ctx);
    }
}

/// Checks order, pool and queue bounds of every arrival.
struct Sink {
    input: PortId,
    report: Sender<(u32, Option<String>, bool)>,
}

impl SyncModule for Sink {
    fn main_loop(&mut self, ctx: &mut SyncContext<'_>) -> Result<(), WaitError> {
        loop {
            let port = ctx.port(self.input);
            let bounded = port.input_pending() <= port.input_capacity();
            let buf = ctx.recv(self.input, None)?;
            let seq = u32::from_le_bytes(buf.data()[..4].try_into().unwrap());
            let pool = buf.pool_name().map(str::to_string);
            drop(buf);
            let _ = self.report.send((seq, pool, bounded));
        }
    }
}

fn build(ctx: &RuntimeContext, total: u32) -> channel::Receiver<(u32, Option<String>, bool)> {
    ctx.create_pool("src", &[(256, 4)]).unwrap();
    ctx.create_pool("dst", &[(256, 8)]).unwrap();

    let mut spec = ModuleSpec::new("Source");
    let output = spec.add_port("Output", PortConfig::output(2).with_pool("src"));
    let pool = spec.add_pool_handle("Pool", "src");
    ctx.create_sync_module(spec, Source { output, pool, total }, "Readout")
        .unwrap();

    let mut spec = ModuleSpec::new("Relay");
    let input = spec.add_input("Input", 2);
    let output = spec.add_output("Output", 2);
    ctx.create_module(spec, Relay { input, output }, "Relay").unwrap();

    let (tx, rx) = channel::unbounded();
    let mut spec = ModuleSpec::new("Sink");
    let input = spec.add_port("Input", PortConfig::input(3).with_pool("dst"));
    ctx.create_sync_module(spec, Sink { input, report: tx }, "Storage")
        .unwrap();

    ctx.connect("Source/Output", "Relay/Input").unwrap();
    ctx.connect("Relay/Output", "Sink/Input").unwrap();
    rx
}

#[test]
fn pipeline_delivers_in_order_within_queue_bounds() {
    let ctx = RuntimeContext::new(RuntimeConfig::default()).unwrap();
    let rx = build(&ctx, 300);
    ctx.start_all().unwrap();

    for expected in 0..300u32 {
        let (seq, _pool, bounded) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(seq, expected);
        assert!(bounded, "input queue exceeded its capacity at {}", seq);
    }
    ctx.shutdown();
}

#[test]
fn relay_without_pool_keeps_source_pool() {
    let ctx = RuntimeContext::new(RuntimeConfig::default()).unwrap();
    let rx = build(&ctx, 5);
    ctx.start_all().unwrap();

    // Relay ports name no pool, so no copy happens on either link.
    for _ in 0..5 {
        let (_seq, pool, _) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(pool.as_deref(), Some("src"));
    }
    ctx.shutdown();
}

#[test]
fn direct_link_copies_into_receiver_pool() {
    let ctx = RuntimeContext::new(RuntimeConfig::default()).unwrap();
    ctx.create_pool("src", &[(256, 4)]).unwrap();
    ctx.create_pool("dst", &[(256, 8)]).unwrap();

    let mut spec = ModuleSpec::new("Source");
    let output = spec.add_port("Output", PortConfig::output(2).with_pool("src"));
    let pool = spec.add_pool_handle("Pool", "src");
    ctx.create_sync_module(spec, Source { output, pool, total: 20 }, "Readout")
        .unwrap();

    let (tx, rx) = channel::unbounded();
    let mut spec = ModuleSpec::new("Sink");
    let input = spec.add_port("Input", PortConfig::input(3).with_pool("dst"));
    ctx.create_sync_module(spec, Sink { input, report: tx }, "Storage")
        .unwrap();
    ctx.connect("Source/Output", "Sink/Input").unwrap();
    ctx.start_all().unwrap();

    // The source pool has 4 blocks; 20 buffers only pass if copies free them.
    for expected in 0..20u32 {
        let (seq, pool, _) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(seq, expected);
        assert_eq!(pool.as_deref(), Some("dst"));
    }
    ctx.shutdown();
}

#[test]
fn commands_set_over_modules_reports_each_state() {
    let ctx = RuntimeContext::new(RuntimeConfig::default()).unwrap();
    let _rx = build(&ctx, 1);
    ctx.start_all().unwrap();

    let mut set = CommandsSet::new(&ctx);
    for name in ["Source", "Relay", "Sink"] {
        set.add(Command::new("GetState").with_receiver(name));
    }
    let outcome = set.execute(WAIT);
    assert!(outcome.is_success(), "{:?}", outcome);
    for child in &outcome.children {
        let cmd = child.command.as_ref().unwrap();
        assert_eq!(cmd.get_str("State"), Some("Running"));
    }

    ctx.stop_all().unwrap();
    let reply = ctx.execute(Command::new("GetState").with_receiver("Relay"), WAIT);
    assert_eq!(reply.result, CommandResult::True);
    assert_eq!(reply.command.unwrap().get_str("State"), Some("Stopped"));
    ctx.shutdown();
}

#[test]
fn module_info_lists_connected_ports() {
    let ctx = RuntimeContext::new(RuntimeConfig::default()).unwrap();
    let _rx = build(&ctx, 1);
    assert_eq!(ctx.module_names(), vec!["Relay", "Sink", "Source"]);

    let info = ctx.module_info("Relay").unwrap();
    assert_eq!(info.thread, "Relay");
    assert!(!info.is_sync);
    assert_eq!(
        info.ports,
        vec![("Input".to_string(), true), ("Output".to_string(), true)]
    );
    ctx.shutdown();
}
