// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::unwrap_used)] // test scaffolding

use super::{ModuleCallbacks, ModuleContext, ModuleSpec, ModuleState, PoolHandleId, PortId, SyncContext, SyncModule, TimerId};
use crate::command::{Command, CommandResult};
use crate::config::{OnErrorPolicy, PortConfig, RuntimeConfig};
use crate::error::WaitError;
use crate::runtime::RuntimeContext;
use crossbeam::channel::{self, Receiver, Sender};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn context() -> RuntimeContext {
    let ctx = RuntimeContext::new(RuntimeConfig::default()).unwrap();
    ctx.create_pool("pool", &[(64, 16)]).unwrap();
    ctx
}

fn seq_of(buf: &crate::memory::Buffer) -> u32 {
    u32::from_le_bytes(buf.data()[..4].try_into().unwrap())
}

/// Sends `total` numbered buffers as fast as the output allows.
struct Producer {
    output: PortId,
    pool: PoolHandleId,
    next: u32,
    total: u32,
}

impl Producer {
    fn spec(name: &str, capacity: usize) -> (ModuleSpec, PortId, PoolHandleId) {
        let mut spec = ModuleSpec::new(name);
        let output = spec.add_output("Output", capacity);
        let pool = spec.add_pool_handle("Pool", "pool");
        (spec, output, pool)
    }

    fn pump(&mut self, ctx: &mut ModuleContext<'_>) {
        while self.next < self.total && ctx.can_send(self.output) {
            let Some(mut buf) = ctx.request_buffer(self.pool, 4) else {
                return;
            };
            buf.data_mut().unwrap().copy_from_slice(&self.next.to_le_bytes());
            ctx.send(self.output, buf).unwrap();
            self.next += 1;
        }
    }
}

impl ModuleCallbacks for Producer {
    fn process_output_event(&mut self, ctx: &mut ModuleContext<'_>, _port: PortId) {
        self.pump(ctx);
    }

    fn process_pool_event(&mut self, ctx: &mut ModuleContext<'_>, _pool: PoolHandleId) {
        self.pump(ctx);
    }
}

/// Reports every received sequence number.
struct Consumer {
    input: PortId,
    seen: Sender<u32>,
}

impl ModuleCallbacks for Consumer {
    fn process_input_event(&mut self, ctx: &mut ModuleContext<'_>, _port: PortId) {
        while let Some(buf) = ctx.recv(self.input) {
            let seq = seq_of(&buf);
            drop(buf);
            let _ = self.seen.send(seq);
        }
    }
}

fn consumer(ctx: &RuntimeContext, name: &str, thread: &str) -> Receiver<u32> {
    let mut spec = ModuleSpec::new(name);
    let input = spec.add_input("Input", 4);
    let (tx, rx) = channel::unbounded();
    ctx.create_module(spec, Consumer { input, seen: tx }, thread)
        .unwrap();
    rx
}

#[test]
fn async_pipeline_preserves_order_under_backpressure() {
    let ctx = context();
    let (spec, output, pool) = Producer::spec("producer", 2);
    ctx.create_module(
        spec,
        Producer {
            output,
            pool,
            next: 0,
            total: 100,
        },
        "T1",
    )
    .unwrap();
    let seen = consumer(&ctx, "consumer", "T2");

    ctx.connect("producer/Output", "consumer/Input").unwrap();
    ctx.start_all().unwrap();

    let got: Vec<u32> = (0..100).map(|_| seen.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(got, (0..100).collect::<Vec<_>>());
    assert_eq!(ctx.pool("pool").unwrap().stats().total_in_use(), 0);
    ctx.shutdown();
}

#[test]
fn pipeline_on_one_thread_works_too() {
    let ctx = context();
    let (spec, output, pool) = Producer::spec("producer", 1);
    ctx.create_module(
        spec,
        Producer {
            output,
            pool,
            next: 0,
            total: 40,
        },
        "Single",
    )
    .unwrap();
    let seen = consumer(&ctx, "consumer", "Single");
    ctx.connect("producer/Output", "consumer/Input").unwrap();
    ctx.start_all().unwrap();

    let got: Vec<u32> = (0..40).map(|_| seen.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(got, (0..40).collect::<Vec<_>>());
    ctx.shutdown();
}

#[test]
fn ports_cannot_be_connected_twice() {
    let ctx = context();
    let (spec, output, pool) = Producer::spec("producer", 1);
    ctx.create_module(
        spec,
        Producer {
            output,
            pool,
            next: 0,
            total: 0,
        },
        "T1",
    )
    .unwrap();
    let _a = consumer(&ctx, "a", "T1");
    let _b = consumer(&ctx, "b", "T1");

    ctx.connect("producer/Output", "a/Input").unwrap();
    assert!(matches!(
        ctx.connect("producer/Output", "b/Input"),
        Err(crate::Error::AlreadyConnected(_))
    ));
    assert!(matches!(
        ctx.connect("producer/Nope", "b/Input"),
        Err(crate::Error::PortNotFound { .. })
    ));
    let info = ctx.module_info("producer").unwrap();
    assert_eq!(info.ports, vec![("Output".to_string(), true)]);
    ctx.shutdown();
}

// ============================================================================
// Timers, user events, postponed commands
// ============================================================================

struct Ticker {
    timer: TimerId,
    ticks: Sender<()>,
}

impl ModuleCallbacks for Ticker {
    fn process_timer_event(&mut self, _ctx: &mut ModuleContext<'_>, timer: TimerId) {
        assert_eq!(timer, self.timer);
        let _ = self.ticks.send(());
    }
}

#[test]
fn periodic_timer_runs_only_while_started() {
    let ctx = context();
    let mut spec = ModuleSpec::new("ticker");
    let timer = spec.add_timer("Tick", Some(Duration::from_millis(10)));
    let (tx, rx) = channel::unbounded();
    ctx.create_module(spec, Ticker { timer, ticks: tx }, "T1")
        .unwrap();

    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    ctx.start_module("ticker").unwrap();
    for _ in 0..3 {
        rx.recv_timeout(WAIT).unwrap();
    }
    ctx.stop_module("ticker").unwrap();
    while rx.try_recv().is_ok() {}
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(ctx.module_state("ticker").unwrap(), ModuleState::Stopped);
    ctx.shutdown();
}

/// Postpones `Wait` until a `Release` arrives; user events echo their code.
struct Gate {
    timer: TimerId,
    codes: Sender<u32>,
}

impl ModuleCallbacks for Gate {
    fn process_user_event(&mut self, _ctx: &mut ModuleContext<'_>, code: u32) {
        let _ = self.codes.send(code);
    }

    fn process_timer_event(&mut self, ctx: &mut ModuleContext<'_>, _timer: TimerId) {
        if let Some(cmd) = ctx.take_postponed("Wait") {
            cmd.reply(CommandResult::True);
        }
    }

    fn execute_command(&mut self, ctx: &mut ModuleContext<'_>, cmd: &mut Command) -> CommandResult {
        match cmd.name() {
            "Wait" => CommandResult::Postponed,
            "Release" => {
                ctx.activate_timer(self.timer, Duration::from_millis(20));
                CommandResult::True
            }
            "Echo" => {
                ctx.fire_user_event(cmd.get_uint("Code", 0) as u32);
                CommandResult::True
            }
            _ => CommandResult::Unknown,
        }
    }
}

#[test]
fn postponed_command_is_replied_later() {
    let ctx = context();
    let mut spec = ModuleSpec::new("gate");
    let timer = spec.add_timer("Release", None);
    let (tx, rx) = channel::unbounded();
    ctx.create_module(spec, Gate { timer, codes: tx }, "T1")
        .unwrap();
    ctx.start_module("gate").unwrap();

    let waiting = ctx.submit(Command::new("Wait").with_receiver("gate"));
    std::thread::sleep(Duration::from_millis(30));
    assert!(waiting.try_reply().is_none());

    let release = ctx.execute(Command::new("Release").with_receiver("gate"), WAIT);
    assert_eq!(release.result, CommandResult::True);
    assert_eq!(waiting.wait(WAIT).result, CommandResult::True);

    let echo = ctx.execute(Command::new("Echo").with_receiver("gate").with("Code", 7u32), WAIT);
    assert_eq!(echo.result, CommandResult::True);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 7);

    let unknown = ctx.execute(Command::new("Bogus").with_receiver("gate"), WAIT);
    assert_eq!(unknown.result, CommandResult::Unknown);
    ctx.shutdown();
}

#[test]
fn get_state_reports_lifecycle() {
    let ctx = context();
    let mut spec = ModuleSpec::new("ticker");
    let timer = spec.add_timer("Tick", None);
    let (tx, _rx) = channel::unbounded();
    ctx.create_module(spec, Ticker { timer, ticks: tx }, "T1")
        .unwrap();

    let state = |ctx: &RuntimeContext| {
        let reply = ctx.execute(Command::new("GetState").with_receiver("ticker"), WAIT);
        reply.command.unwrap().get_str("State").unwrap().to_string()
    };
    assert_eq!(state(&ctx), "Configured");
    ctx.start_module("ticker").unwrap();
    assert_eq!(state(&ctx), "Running");
    ctx.stop_module("ticker").unwrap();
    assert_eq!(state(&ctx), "Stopped");
    ctx.destroy_module("ticker").unwrap();
    assert!(!ctx.has_module("ticker"));
    ctx.shutdown();
}

// ============================================================================
// Sync modules
// ============================================================================

/// Receives buffers until the sum of their sequence numbers is reported.
struct Summer {
    input: PortId,
    count: u32,
    result: Sender<Result<u32, WaitError>>,
    stopped: Sender<()>,
}

impl SyncModule for Summer {
    fn main_loop(&mut self, ctx: &mut SyncContext<'_>) -> Result<(), WaitError> {
        let mut sum = 0;
        for _ in 0..self.count {
            match ctx.recv(self.input, None) {
                Ok(buf) => sum += seq_of(&buf),
                Err(e) => {
                    let _ = self.result.send(Err(e.clone()));
                    return Err(e);
                }
            }
        }
        let _ = self.result.send(Ok(sum));
        Ok(())
    }

    fn after_stop(&mut self, _ctx: &mut SyncContext<'_>) {
        let _ = self.stopped.send(());
    }
}

fn summer(ctx: &RuntimeContext, count: u32, thread: &str) -> (Receiver<Result<u32, WaitError>>, Receiver<()>) {
    let mut spec = ModuleSpec::new("summer");
    let input = spec.add_input("Input", 4);
    let (tx, rx) = channel::unbounded();
    let (stx, srx) = channel::unbounded();
    ctx.create_sync_module(
        spec,
        Summer {
            input,
            count,
            result: tx,
            stopped: stx,
        },
        thread,
    )
    .unwrap();
    (rx, srx)
}

#[test]
fn sync_module_blocks_in_recv() {
    let ctx = context();
    let (spec, output, pool) = Producer::spec("producer", 2);
    ctx.create_module(
        spec,
        Producer {
            output,
            pool,
            next: 0,
            total: 10,
        },
        "T1",
    )
    .unwrap();
    let (result, stopped) = summer(&ctx, 10, "T2");
    ctx.connect("producer/Output", "summer/Input").unwrap();
    ctx.start_all().unwrap();

    assert_eq!(result.recv_timeout(WAIT).unwrap(), Ok(45));
    stopped.recv_timeout(WAIT).unwrap();
    ctx.shutdown();
}

#[test]
fn sync_module_shares_thread_with_async_producer() {
    let ctx = context();
    let (spec, output, pool) = Producer::spec("producer", 1);
    ctx.create_module(
        spec,
        Producer {
            output,
            pool,
            next: 0,
            total: 20,
        },
        "Shared",
    )
    .unwrap();
    let (result, _stopped) = summer(&ctx, 20, "Shared");
    ctx.connect("producer/Output", "summer/Input").unwrap();
    ctx.start_module("summer").unwrap();
    ctx.start_module("producer").unwrap();

    assert_eq!(result.recv_timeout(WAIT).unwrap(), Ok(190));
    ctx.shutdown();
}

#[test]
fn unconnected_input_fails_wait() {
    let ctx = context();
    let (result, stopped) = summer(&ctx, 5, "T1");
    ctx.start_module("summer").unwrap();

    assert!(matches!(
        result.recv_timeout(WAIT).unwrap(),
        Err(WaitError::Disconnected(_))
    ));
    stopped.recv_timeout(WAIT).unwrap();
    assert_eq!(ctx.module_state("summer").unwrap(), ModuleState::Stopped);
    ctx.shutdown();
}

#[test]
fn stop_command_interrupts_wait() {
    let ctx = context();
    let (spec, output, pool) = Producer::spec("producer", 1);
    ctx.create_module(
        spec,
        Producer {
            output,
            pool,
            next: 0,
            total: 0,
        },
        "T1",
    )
    .unwrap();
    let (result, stopped) = summer(&ctx, 5, "T2");
    ctx.connect("producer/Output", "summer/Input").unwrap();
    ctx.start_all().unwrap();
    std::thread::sleep(Duration::from_millis(20));

    ctx.stop_module("summer").unwrap();
    assert_eq!(result.recv_timeout(WAIT).unwrap(), Err(WaitError::Stopped));
    stopped.recv_timeout(WAIT).unwrap();
    ctx.shutdown();
}

/// Two rounds separated by a restart; answers queued commands.
struct Rounds {
    rounds: Sender<u32>,
}

impl SyncModule for Rounds {
    fn main_loop(&mut self, ctx: &mut SyncContext<'_>) -> Result<(), WaitError> {
        let _ = self.rounds.send(1);
        let mut cmd = ctx.wait_command(None)?;
        cmd.set("Round", 1u32);
        cmd.reply(CommandResult::True);
        ctx.wait_restart()?;
        let _ = self.rounds.send(2);
        Ok(())
    }
}

#[test]
fn wait_restart_parks_main_loop() {
    let ctx = context();
    let (tx, rx) = channel::unbounded();
    ctx.create_sync_module(ModuleSpec::new("rounds"), Rounds { rounds: tx }, "T1")
        .unwrap();
    ctx.start_module("rounds").unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 1);

    let reply = ctx.execute(Command::new("Query").with_receiver("rounds"), WAIT);
    assert_eq!(reply.result, CommandResult::True);
    assert_eq!(reply.command.unwrap().get_uint("Round", 0), 1);

    for _ in 0..100 {
        if ctx.is_waiting_restart("rounds").unwrap() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(ctx.is_waiting_restart("rounds").unwrap());
    ctx.restart_module("rounds").unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 2);
    ctx.shutdown();
}

#[test]
fn second_main_loop_on_thread_is_deferred() {
    let ctx = context();
    let (tx, rx) = channel::unbounded();
    ctx.create_sync_module(ModuleSpec::new("first"), Rounds { rounds: tx.clone() }, "T1")
        .unwrap();
    let (result, _stopped) = summer(&ctx, 1, "T1");
    ctx.start_module("first").unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 1);

    // Busy thread: the second loop waits for the first one to return.
    ctx.start_module("summer").unwrap();
    assert!(result.recv_timeout(Duration::from_millis(50)).is_err());

    ctx.stop_module("first").unwrap();
    assert!(matches!(
        result.recv_timeout(WAIT).unwrap(),
        Err(WaitError::Disconnected(_))
    ));
    ctx.shutdown();
}

// ============================================================================
// On-error policies
// ============================================================================

#[test]
fn stop_policy_stops_module_when_peer_vanishes() {
    let ctx = context();
    let mut spec = ModuleSpec::new("producer");
    let output = spec.add_port("Output", PortConfig::output(2).with_on_error(OnErrorPolicy::Stop));
    let pool = spec.add_pool_handle("Pool", "pool");
    ctx.create_module(
        spec,
        Producer {
            output,
            pool,
            next: 0,
            total: 0,
        },
        "T1",
    )
    .unwrap();
    let _seen = consumer(&ctx, "consumer", "T2");
    ctx.connect("producer/Output", "consumer/Input").unwrap();
    ctx.start_all().unwrap();

    ctx.destroy_module("consumer").unwrap();
    for _ in 0..100 {
        if ctx.module_state("producer").unwrap() == ModuleState::Stopped {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(ctx.module_state("producer").unwrap(), ModuleState::Stopped);
    ctx.shutdown();
}

#[test]
fn voluntary_disconnect_does_not_trigger_policy() {
    let ctx = context();
    let mut spec = ModuleSpec::new("producer");
    let output = spec.add_port("Output", PortConfig::output(2).with_on_error(OnErrorPolicy::Stop));
    let pool = spec.add_pool_handle("Pool", "pool");
    ctx.create_module(
        spec,
        Producer {
            output,
            pool,
            next: 0,
            total: 0,
        },
        "T1",
    )
    .unwrap();
    let _seen = consumer(&ctx, "consumer", "T2");
    ctx.connect("producer/Output", "consumer/Input").unwrap();
    ctx.start_all().unwrap();

    ctx.disconnect("consumer/Input").unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(ctx.module_state("producer").unwrap(), ModuleState::Running);
    assert!(!ctx.module_info("producer").unwrap().ports[0].1);
    ctx.shutdown();
}

#[test]
fn reconnect_policy_rebinds_recreated_peer() {
    let ctx = context();
    let mut spec = ModuleSpec::new("producer");
    let output = spec.add_port(
        "Output",
        PortConfig::output(2).with_reconnect(Duration::from_millis(20), 20),
    );
    let pool = spec.add_pool_handle("Pool", "pool");
    ctx.create_module(
        spec,
        Producer {
            output,
            pool,
            next: 0,
            total: 3,
        },
        "T1",
    )
    .unwrap();
    let _old = consumer(&ctx, "consumer", "T2");
    ctx.connect("producer/Output", "consumer/Input").unwrap();

    ctx.destroy_module("consumer").unwrap();
    std::thread::sleep(Duration::from_millis(30));
    let seen = consumer(&ctx, "consumer", "T2");
    ctx.start_all().unwrap();

    for _ in 0..200 {
        if ctx.module_info("producer").unwrap().ports[0].1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(ctx.module_info("producer").unwrap().ports[0].1);
    assert_eq!(ctx.module_state("producer").unwrap(), ModuleState::Running);
    let got: Vec<u32> = (0..3).map(|_| seen.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(got, vec![0, 1, 2]);
    ctx.shutdown();
}
