// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Groups of commands completed together.
//!
//! A set submits its child commands (all at once, or one after the other in
//! sequential mode) and completes when every child has replied or when its
//! timeout fires, whichever comes first. Children may also be external
//! slots, completed by the owner through [`SetHandle::complete`], for
//! replies that arrive over a network rather than through a command.
//!
//! The optional parent command is replied exactly once: `True` when all
//! children answered `True`, `Timeout` when the timer fired first, `False`
//! otherwise.

use super::{Command, CommandReply, CommandResult};
use crate::runtime::RuntimeContext;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Grace period after the set timeout for [`SetHandle::wait`], covering a
/// late manager-thread timer.
const WAIT_GRACE: Duration = Duration::from_millis(500);

/// Final state of one child.
pub struct ChildOutcome {
    /// Command name or external slot label.
    pub label: String,
    /// `Timeout` for children that had not replied when the set completed.
    pub result: CommandResult,
    /// Replied command with its result parameters.
    pub command: Option<Command>,
}

impl fmt::Debug for ChildOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildOutcome")
            .field("label", &self.label)
            .field("result", &self.result)
            .finish()
    }
}

/// Result of a completed set.
#[derive(Debug)]
pub struct SetOutcome {
    pub result: CommandResult,
    pub children: Vec<ChildOutcome>,
}

impl SetOutcome {
    pub fn is_success(&self) -> bool {
        self.result == CommandResult::True
    }

    pub fn child(&self, index: usize) -> Option<&ChildOutcome> {
        self.children.get(index)
    }
}

enum Child {
    Command(Command),
    External(String),
}

/// Builder of a commands set.
pub struct CommandsSet {
    ctx: RuntimeContext,
    children: Vec<Child>,
    parent: Option<Command>,
    sequential: bool,
}

impl CommandsSet {
    pub fn new(ctx: &RuntimeContext) -> Self {
        Self {
            ctx: ctx.clone(),
            children: Vec::new(),
            parent: None,
            sequential: false,
        }
    }

    /// Submit each command only after the previous one replied.
    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }

    /// Command replied with the set result.
    pub fn with_parent(mut self, parent: Command) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Add a command child; returns its index.
    pub fn add(&mut self, cmd: Command) -> usize {
        self.children.push(Child::Command(cmd));
        self.children.len() - 1
    }

    /// Add a slot completed with [`SetHandle::complete`]; returns its index.
    pub fn add_external(&mut self, label: impl Into<String>) -> usize {
        self.children.push(Child::External(label.into()));
        self.children.len() - 1
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Submit the children and arm the timeout.
    pub fn submit(self, timeout: Duration) -> SetHandle {
        let n = self.children.len();
        let mut labels = Vec::with_capacity(n);
        let mut commands = VecDeque::new();
        let mut external = vec![false; n];
        for (i, child) in self.children.into_iter().enumerate() {
            match child {
                Child::Command(cmd) => {
                    labels.push(cmd.name().to_string());
                    commands.push_back((i, cmd));
                }
                Child::External(label) => {
                    labels.push(label);
                    external[i] = true;
                }
            }
        }

        let shared = Arc::new(SetShared {
            ctx: self.ctx.clone(),
            deadline: Instant::now() + timeout,
            state: Mutex::new(SetState {
                labels,
                external,
                results: vec![None; n],
                replies: (0..n).map(|_| None).collect(),
                queued: VecDeque::new(),
                sequential: self.sequential,
                parent: self.parent,
                done: false,
                result: None,
                outcome: None,
                on_done: Vec::new(),
            }),
            cv: Condvar::new(),
        });

        if n == 0 {
            SetShared::finish(&shared, CommandResult::True);
            return SetHandle { shared };
        }

        let weak: Weak<SetShared> = Arc::downgrade(&shared);
        self.ctx.schedule_after(timeout, move || {
            if let Some(shared) = weak.upgrade() {
                SetShared::finish(&shared, CommandResult::Timeout);
            }
        });

        if self.sequential {
            let first = commands.pop_front();
            shared.state.lock().queued = commands;
            if let Some((i, cmd)) = first {
                SetShared::submit_child(&shared, i, cmd);
            }
        } else {
            for (i, cmd) in commands {
                SetShared::submit_child(&shared, i, cmd);
            }
        }
        SetHandle { shared }
    }

    /// Submit and block until completion. Must not run on a thread hosting
    /// one of the receivers; Sync modules use
    /// [`crate::SyncContext::execute_set`].
    pub fn execute(self, timeout: Duration) -> SetOutcome {
        self.submit(timeout).wait()
    }
}

struct SetState {
    labels: Vec<String>,
    external: Vec<bool>,
    results: Vec<Option<CommandResult>>,
    replies: Vec<Option<Command>>,
    /// Sequential mode: commands not yet submitted.
    queued: VecDeque<(usize, Command)>,
    sequential: bool,
    parent: Option<Command>,
    done: bool,
    result: Option<CommandResult>,
    outcome: Option<SetOutcome>,
    on_done: Vec<Box<dyn FnOnce() + Send>>,
}

impl SetState {
    fn all_replied(&self) -> bool {
        self.results.iter().all(Option::is_some)
    }
}

struct SetShared {
    ctx: RuntimeContext,
    deadline: Instant,
    state: Mutex<SetState>,
    cv: Condvar,
}

impl SetShared {
    fn submit_child(this: &Arc<Self>, index: usize, cmd: Command) {
        let target = Arc::clone(this);
        this.ctx.submit_with(cmd, move |reply| {
            SetShared::child_replied(&target, index, reply);
        });
    }

    fn child_replied(this: &Arc<Self>, index: usize, reply: CommandReply) {
        let next = {
            let mut state = this.state.lock();
            if state.done || state.results[index].is_some() {
                return;
            }
            state.results[index] = Some(reply.result);
            state.replies[index] = reply.command;
            if state.sequential {
                state.queued.pop_front()
            } else {
                None
            }
        };
        if let Some((i, cmd)) = next {
            SetShared::submit_child(this, i, cmd);
        }
        SetShared::complete_if_ready(this);
    }

    fn complete_if_ready(this: &Arc<Self>) {
        let result = {
            let state = this.state.lock();
            if state.done || !state.all_replied() {
                return;
            }
            if state.results.iter().all(|r| *r == Some(CommandResult::True)) {
                CommandResult::True
            } else {
                CommandResult::False
            }
        };
        SetShared::finish(this, result);
    }

    /// Complete the set once; later calls are ignored.
    fn finish(this: &Arc<Self>, result: CommandResult) {
        let (parent, callbacks, queued) = {
            let mut state = this.state.lock();
            if state.done {
                return;
            }
            state.done = true;
            state.result = Some(result);
            let replies = std::mem::take(&mut state.replies);
            let children = state
                .labels
                .iter()
                .zip(state.results.iter())
                .zip(replies)
                .map(|((label, r), command)| ChildOutcome {
                    label: label.clone(),
                    result: r.unwrap_or(CommandResult::Timeout),
                    command,
                })
                .collect();
            state.outcome = Some(SetOutcome { result, children });
            (
                state.parent.take(),
                std::mem::take(&mut state.on_done),
                std::mem::take(&mut state.queued),
            )
        };
        this.cv.notify_all();
        // Never submitted: no reply expected.
        drop(queued);
        if let Some(parent) = parent {
            parent.reply(result);
        }
        log::debug!("[CommandsSet::finish] set completed: {}", result);
        for f in callbacks {
            f();
        }
    }
}

/// Handle of a submitted set.
pub struct SetHandle {
    shared: Arc<SetShared>,
}

impl SetHandle {
    /// Complete an external slot. False when the index is not an external
    /// slot, was already completed, or the set is done.
    pub fn complete(&self, index: usize, result: CommandResult) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.done || !state.external.get(index).copied().unwrap_or(false) {
                return false;
            }
            if state.results[index].is_some() {
                return false;
            }
            state.results[index] = Some(result);
        }
        SetShared::complete_if_ready(&self.shared);
        true
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.lock().done
    }

    /// Final result, once done.
    pub fn result(&self) -> Option<CommandResult> {
        self.shared.state.lock().result
    }

    /// Outcome, once done. Yielded a single time.
    pub fn take_outcome(&self) -> Option<SetOutcome> {
        self.shared.state.lock().outcome.take()
    }

    /// Run `f` once the set is done, immediately when it already is.
    pub(crate) fn on_done(&self, f: Box<dyn FnOnce() + Send>) {
        {
            let mut state = self.shared.state.lock();
            if !state.done {
                state.on_done.push(f);
                return;
            }
        }
        f();
    }

    /// Complete now with `Timeout` unless done, and return the outcome.
    pub fn cancel(&self) -> SetOutcome {
        SetShared::finish(&self.shared, CommandResult::Timeout);
        let mut state = self.shared.state.lock();
        state.outcome.take().unwrap_or_else(|| SetOutcome {
            result: state.result.unwrap_or(CommandResult::Timeout),
            children: Vec::new(),
        })
    }

    /// Block until the set completes.
    pub fn wait(self) -> SetOutcome {
        let limit = self.shared.deadline + WAIT_GRACE;
        {
            let mut state = self.shared.state.lock();
            while !state.done {
                if self.shared.cv.wait_until(&mut state, limit).timed_out() {
                    break;
                }
            }
        }
        self.cancel()
    }
}

impl fmt::Debug for SetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("SetHandle")
            .field("children", &state.labels)
            .field("done", &state.done)
            .finish()
    }
}
