// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::unwrap_used)] // test scaffolding

use super::RuntimeContext;
use crate::command::{Command, CommandResult};
use crate::config::RuntimeConfig;
use crate::error::{Error, FatalError};
use crossbeam::channel;
use std::time::{Duration, Instant};

fn context() -> RuntimeContext {
    RuntimeContext::new(RuntimeConfig::default()).unwrap()
}

#[test]
fn manager_thread_exists_and_names_are_unique() {
    let ctx = context();
    assert!(ctx.has_thread("Manager"));
    ctx.create_thread("Readout").unwrap();
    assert!(matches!(ctx.create_thread("Readout"), Err(Error::AlreadyExists(_))));
    ctx.shutdown();
}

#[test]
fn command_handler_executes_on_its_thread() {
    let ctx = context();
    ctx.register_command_handler("calc", "Worker", |cmd| {
        let a = cmd.get_int("A", 0);
        let b = cmd.get_int("B", 0);
        cmd.set("Sum", a + b);
        cmd.set("Thread", std::thread::current().name().unwrap_or("").to_string());
        CommandResult::True
    })
    .unwrap();

    let reply = ctx.execute(
        Command::new("Add").with_receiver("calc").with("A", 2).with("B", 3),
        Duration::from_secs(1),
    );
    assert_eq!(reply.result, CommandResult::True);
    let cmd = reply.command.unwrap();
    assert_eq!(cmd.get_int("Sum", 0), 5);
    assert_eq!(cmd.get_str("Thread"), Some("hdaq-Worker"));
    ctx.shutdown();
}

#[test]
fn unknown_receiver_answers_unknown() {
    let ctx = context();
    let reply = ctx.execute(Command::new("Ping").with_receiver("ghost"), Duration::from_secs(1));
    assert_eq!(reply.result, CommandResult::Unknown);
    let reply = ctx.execute(Command::new("Ping"), Duration::from_secs(1));
    assert_eq!(reply.result, CommandResult::Unknown);
    ctx.shutdown();
}

#[test]
fn blocking_execute_on_own_thread_is_denied() {
    let ctx = context();
    ctx.register_command_handler("target", "Shared", |_| CommandResult::True)
        .unwrap();
    let inner = ctx.clone();
    ctx.register_command_handler("caller", "Shared", move |cmd| {
        let reply = inner.execute(Command::new("Ping").with_receiver("target"), Duration::from_secs(1));
        cmd.set("Inner", reply.result.to_string());
        CommandResult::True
    })
    .unwrap();

    let reply = ctx.execute(Command::new("Call").with_receiver("caller"), Duration::from_secs(2));
    assert_eq!(reply.result, CommandResult::True);
    assert_eq!(reply.command.unwrap().get_str("Inner"), Some("denied"));
    ctx.shutdown();
}

#[test]
fn schedule_after_runs_on_manager_thread() {
    let ctx = context();
    let (tx, rx) = channel::bounded(1);
    let start = Instant::now();
    ctx.schedule_after(Duration::from_millis(40), move || {
        let _ = tx.send(std::thread::current().name().map(str::to_string));
    });
    let name = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(40));
    assert_eq!(name.as_deref(), Some("hdaq-Manager"));
    ctx.shutdown();
}

#[test]
fn deferred_closures_run_in_deadline_order() {
    let ctx = context();
    let (tx, rx) = channel::unbounded();
    for (delay, tag) in [(60u64, 3), (20, 1), (40, 2)] {
        let tx = tx.clone();
        ctx.schedule_after(Duration::from_millis(delay), move || {
            let _ = tx.send(tag);
        });
    }
    let got: Vec<i32> = (0..3)
        .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
        .collect();
    assert_eq!(got, vec![1, 2, 3]);
    ctx.shutdown();
}

#[test]
fn fatal_error_requests_exit_once() {
    let ctx = context();
    assert!(!ctx.wait_exit(Some(Duration::from_millis(10))));

    ctx.raise_fatal(FatalError::new("Builder", "event exceeds buffer"));
    ctx.raise_fatal(FatalError::new("Other", "ignored"));

    assert!(ctx.wait_exit(Some(Duration::from_millis(100))));
    let fatal = ctx.fatal_error().unwrap();
    assert_eq!(fatal.component, "Builder");
    ctx.shutdown();
}

#[test]
fn operations_after_shutdown_fail() {
    let ctx = context();
    ctx.shutdown();
    ctx.shutdown();
    assert!(ctx.is_shutting_down());
    assert!(matches!(ctx.create_thread("Late"), Err(Error::ShutDown)));
    assert!(matches!(
        ctx.register_command_handler("late", "Late", |_| CommandResult::True),
        Err(Error::ShutDown)
    ));
}

#[test]
fn port_path_must_name_module_and_port() {
    let ctx = context();
    assert!(matches!(ctx.connect("nomodule", "x/y"), Err(Error::Config(_))));
    assert!(matches!(ctx.connect("a/out", "b/in"), Err(Error::ModuleNotFound(_))));
    ctx.shutdown();
}
