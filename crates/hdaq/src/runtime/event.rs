// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mailbox records exchanged between threads.

use crate::command::Command;
use crate::module::{PoolHandleId, PortId, TimerId};
use crate::transport::Transport;
use crossbeam::channel::Sender;
use std::fmt;
use std::time::Duration;

/// Identifier of a worker (module or command handler) within a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub(crate) u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Event produced by a module item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemEvent {
    Input(PortId),
    Output(PortId),
    Connect(PortId),
    Disconnect { port: PortId, error: bool },
    Pool(PoolHandleId),
    Timer { timer: TimerId, generation: u64 },
    User(u32),
}

/// Lifecycle requests that are not commands.
pub(crate) enum Control {
    /// Bind a transport to a port, on the module thread.
    AssignTransport(PortId, Box<dyn Transport>),
    /// Voluntary disconnect of a port.
    Detach(PortId),
    /// Run the main loop of a Sync module that could not enter it earlier.
    RunMainLoop,
    /// Clean up and remove the worker; the sender is acknowledged afterwards.
    Destroy(Option<Sender<()>>),
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Control::AssignTransport(port, _) => write!(f, "AssignTransport({:?})", port),
            Control::Detach(port) => write!(f, "Detach({:?})", port),
            Control::RunMainLoop => write!(f, "RunMainLoop"),
            Control::Destroy(_) => write!(f, "Destroy"),
        }
    }
}

pub(crate) enum Envelope {
    Attach(WorkerId, Box<dyn super::Worker>),
    Event(WorkerId, ItemEvent),
    Command(WorkerId, Command),
    Control(WorkerId, Control),
    Deferred(Duration, Box<dyn FnOnce() + Send>),
    Shutdown,
}

/// Posts item events of one worker into its thread mailbox.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: Sender<Envelope>,
    worker: WorkerId,
}

impl EventSink {
    pub(crate) fn new(tx: Sender<Envelope>, worker: WorkerId) -> Self {
        Self { tx, worker }
    }

    pub(crate) fn worker(&self) -> WorkerId {
        self.worker
    }

    /// False when the thread mailbox is closed.
    pub(crate) fn fire(&self, event: ItemEvent) -> bool {
        self.tx.send(Envelope::Event(self.worker, event)).is_ok()
    }

    /// Interrupt a thread blocked in its mailbox without addressing any
    /// worker.
    pub(crate) fn wake(&self) {
        let _ = self.tx.send(Envelope::Deferred(Duration::ZERO, Box::new(|| {})));
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventSink({})", self.worker)
    }
}
