// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker thread: one OS thread, one ordered mailbox, one timer heap.
//!
//! Every worker is pinned to exactly one thread; all of its events, commands
//! and timers are processed there, in mailbox order. A Sync module blocked in
//! a wait keeps the thread alive through [`ThreadCore::single_loop`], which
//! returns envelopes addressed to the waiting module and dispatches all
//! others inline.
//!
//! ```text
//!   other threads ──send──▶ [ mailbox ] ──▶ dispatch ──▶ worker
//!                                 ▲                      │
//!                       timers ───┘   single_loop ◀──────┘ (Sync wait)
//! ```

use super::event::{Control, Envelope, ItemEvent, WorkerId};
use super::Worker;
use crate::command::{Command, CommandResult};
use crate::error::{Error, Result};
use crate::module::TimerId;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

/// What a Sync wait receives from the pump.
pub(crate) enum Pumped {
    Event(ItemEvent),
    Command(Command),
    Control(Control),
}

enum TimerAction {
    Module {
        worker: WorkerId,
        timer: TimerId,
        generation: u64,
    },
    Closure(Box<dyn FnOnce() + Send>),
}

/// Owner-side handle of a worker thread.
pub(crate) struct ThreadHandle {
    pub(crate) name: String,
    pub(crate) tx: Sender<Envelope>,
    pub(crate) thread_id: ThreadId,
    join: Option<JoinHandle<()>>,
}

impl ThreadHandle {
    pub(crate) fn spawn(name: &str) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let thread_name = name.to_string();
        let join = thread::Builder::new()
            .name(format!("hdaq-{}", name))
            .spawn(move || {
                let mut core = ThreadCore::new(thread_name, rx);
                core.run();
            })
            .map_err(Error::ThreadSpawn)?;
        log::debug!("[ThreadHandle::spawn] thread {} started", name);
        Ok(Self {
            name: name.to_string(),
            tx,
            thread_id: join.thread().id(),
            join: Some(join),
        })
    }

    /// Ask the thread to exit and join it unless called from that thread.
    pub(crate) fn stop(&mut self) {
        let _ = self.tx.send(Envelope::Shutdown);
        if let Some(join) = self.join.take() {
            if thread::current().id() == self.thread_id {
                return;
            }
            if join.join().is_err() {
                log::error!("[ThreadHandle::stop] thread {} panicked", self.name);
            }
        }
    }
}

/// Thread-side state. Lives on the worker thread's stack.
pub(crate) struct ThreadCore {
    name: String,
    rx: Receiver<Envelope>,
    workers: HashMap<WorkerId, Option<Box<dyn Worker>>>,
    timers: BinaryHeap<Reverse<(Instant, u64)>>,
    timer_actions: HashMap<u64, TimerAction>,
    next_timer: u64,
    active: Option<WorkerId>,
    deferred_loops: VecDeque<WorkerId>,
    shutdown: bool,
}

impl ThreadCore {
    fn new(name: String, rx: Receiver<Envelope>) -> Self {
        Self {
            name,
            rx,
            workers: HashMap::new(),
            timers: BinaryHeap::new(),
            timer_actions: HashMap::new(),
            next_timer: 0,
            active: None,
            deferred_loops: VecDeque::new(),
            shutdown: false,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown
    }

    fn run(&mut self) {
        while !self.shutdown {
            self.fire_due_timers();
            if self.active.is_none() {
                if let Some(worker) = self.deferred_loops.pop_front() {
                    self.dispatch(Envelope::Control(worker, Control::RunMainLoop));
                    continue;
                }
            }
            let env = match self.next_deadline() {
                Some(deadline) => match self.rx.recv_deadline(deadline) {
                    Ok(env) => env,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.rx.recv() {
                    Ok(env) => env,
                    Err(_) => break,
                },
            };
            self.dispatch(env);
        }

        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for id in ids {
            if let Some(Some(mut worker)) = self.workers.remove(&id) {
                worker.cleanup(self);
            }
        }
        log::debug!("[ThreadCore::run] thread {} finished", self.name);
    }

    // ========================================================================
    // Timers
    // ========================================================================

    fn push_timer(&mut self, at: Instant, action: TimerAction) {
        let key = self.next_timer;
        self.next_timer += 1;
        self.timers.push(Reverse((at, key)));
        self.timer_actions.insert(key, action);
    }

    /// Arm a module timer; stale generations are filtered by the module.
    pub(crate) fn arm_timer(
        &mut self,
        worker: WorkerId,
        timer: TimerId,
        at: Instant,
        generation: u64,
    ) {
        self.push_timer(
            at,
            TimerAction::Module {
                worker,
                timer,
                generation,
            },
        );
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse((at, _))| *at)
    }

    fn pop_due_timer(&mut self, now: Instant) -> Option<TimerAction> {
        match self.timers.peek() {
            Some(Reverse((at, _))) if *at <= now => {}
            _ => return None,
        }
        let Reverse((_, key)) = self.timers.pop()?;
        self.timer_actions.remove(&key)
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(action) = self.pop_due_timer(now) {
            self.run_timer_action(action);
        }
    }

    fn run_timer_action(&mut self, action: TimerAction) {
        match action {
            TimerAction::Module {
                worker,
                timer,
                generation,
            } => self.dispatch(Envelope::Event(
                worker,
                ItemEvent::Timer { timer, generation },
            )),
            TimerAction::Closure(f) => f(),
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn dispatch(&mut self, env: Envelope) {
        match env {
            Envelope::Attach(id, worker) => {
                log::debug!(
                    "[ThreadCore::dispatch] {} attached to thread {}",
                    worker.name(),
                    self.name
                );
                self.workers.insert(id, Some(worker));
            }
            Envelope::Deferred(delay, f) => {
                self.push_timer(Instant::now() + delay, TimerAction::Closure(f));
            }
            Envelope::Shutdown => self.shutdown = true,
            Envelope::Event(id, event) => {
                self.with_worker(id, |w, th| w.process_event(th, event), || {});
            }
            Envelope::Command(id, cmd) => {
                let mut slot = Some(cmd);
                let handled = self.with_worker_cmd(id, &mut slot);
                if !handled {
                    if let Some(cmd) = slot {
                        log::debug!(
                            "[ThreadCore::dispatch] no worker {} for command {}",
                            id,
                            cmd.name()
                        );
                        cmd.reply(CommandResult::Unknown);
                    }
                }
            }
            Envelope::Control(id, ctl) => {
                let mut slot = Some(ctl);
                match self.workers.get_mut(&id) {
                    Some(entry) => match entry.take() {
                        Some(mut worker) => {
                            let keep = match slot.take() {
                                Some(ctl) => worker.control(self, ctl),
                                None => true,
                            };
                            self.put_back(id, worker, keep);
                        }
                        None => log::warn!(
                            "[ThreadCore::dispatch] control {:?} for busy worker {}",
                            slot,
                            id
                        ),
                    },
                    None => {
                        if let Some(Control::Destroy(Some(ack))) = slot {
                            let _ = ack.send(());
                        }
                    }
                }
            }
        }
    }

    fn with_worker(
        &mut self,
        id: WorkerId,
        f: impl FnOnce(&mut dyn Worker, &mut ThreadCore) -> bool,
        missing: impl FnOnce(),
    ) {
        let Some(entry) = self.workers.get_mut(&id) else {
            missing();
            return;
        };
        let Some(mut worker) = entry.take() else {
            log::trace!("[ThreadCore::with_worker] worker {} busy, event dropped", id);
            return;
        };
        let keep = f(worker.as_mut(), self);
        self.put_back(id, worker, keep);
    }

    fn with_worker_cmd(&mut self, id: WorkerId, slot: &mut Option<Command>) -> bool {
        let Some(entry) = self.workers.get_mut(&id) else {
            return false;
        };
        let Some(mut worker) = entry.take() else {
            return false;
        };
        let keep = match slot.take() {
            Some(cmd) => worker.execute_command(self, cmd),
            None => true,
        };
        self.put_back(id, worker, keep);
        true
    }

    fn put_back(&mut self, id: WorkerId, worker: Box<dyn Worker>, keep: bool) {
        if keep {
            if let Some(entry) = self.workers.get_mut(&id) {
                *entry = Some(worker);
            }
        } else {
            self.workers.remove(&id);
            log::debug!(
                "[ThreadCore::put_back] {} removed from thread {}",
                worker.name(),
                self.name
            );
        }
    }

    // ========================================================================
    // Sync-module support
    // ========================================================================

    /// Claim the thread for a Sync main loop. False when another loop runs.
    pub(crate) fn enter_main_loop(&mut self, worker: WorkerId) -> bool {
        if self.active.is_some() {
            return false;
        }
        self.active = Some(worker);
        true
    }

    pub(crate) fn leave_main_loop(&mut self, worker: WorkerId) {
        if self.active == Some(worker) {
            self.active = None;
        }
    }

    /// Queue a main loop to start once the current one has returned.
    pub(crate) fn defer_main_loop(&mut self, worker: WorkerId) {
        if !self.deferred_loops.contains(&worker) {
            self.deferred_loops.push_back(worker);
        }
    }

    /// Process one mailbox entry or timer on behalf of the active Sync
    /// module. Entries addressed to it are returned; everything else is
    /// dispatched here. `None` after a timeout or a foreign entry.
    pub(crate) fn single_loop(&mut self, deadline: Option<Instant>) -> Option<Pumped> {
        let active = self.active?;

        if let Some(action) = self.pop_due_timer(Instant::now()) {
            match action {
                TimerAction::Module {
                    worker,
                    timer,
                    generation,
                } if worker == active => {
                    return Some(Pumped::Event(ItemEvent::Timer { timer, generation }));
                }
                other => {
                    self.run_timer_action(other);
                    return None;
                }
            }
        }

        let wake = match (deadline, self.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let env = match wake {
            Some(at) => match self.rx.recv_deadline(at) {
                Ok(env) => env,
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => {
                    self.shutdown = true;
                    return None;
                }
            },
            None => match self.rx.recv() {
                Ok(env) => env,
                Err(_) => {
                    self.shutdown = true;
                    return None;
                }
            },
        };

        match env {
            Envelope::Event(id, event) if id == active => Some(Pumped::Event(event)),
            Envelope::Command(id, cmd) if id == active => Some(Pumped::Command(cmd)),
            Envelope::Control(id, ctl) if id == active => Some(Pumped::Control(ctl)),
            other => {
                self.dispatch(other);
                None
            }
        }
    }
}
