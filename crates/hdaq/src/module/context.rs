// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Views a module gets of itself while it runs.

use super::core::ModuleCore;
use super::port::Port;
use super::{ModuleState, PoolHandleId, PortId, TimerId};
use crate::command::{Command, CommandReply, CommandResult, CommandsSet, SetOutcome};
use crate::error::{FatalError, Result, WaitError};
use crate::memory::{AsyncTake, Buffer, MemoryPool};
use crate::runtime::{ItemEvent, RuntimeContext, ThreadCore};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Non-blocking access to the module's items, handed to every callback.
///
/// Item ids must come from the [`super::ModuleSpec`] the module was created
/// with; accessors panic on foreign ids.
pub struct ModuleContext<'a> {
    pub(crate) core: &'a mut ModuleCore,
    pub(crate) th: &'a mut ThreadCore,
}

impl<'a> ModuleContext<'a> {
    pub(crate) fn new(core: &'a mut ModuleCore, th: &'a mut ThreadCore) -> Self {
        Self { core, th }
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Name of the worker thread running this module.
    pub fn thread_name(&self) -> &str {
        self.th.name()
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.core.ctx
    }

    pub fn state(&self) -> ModuleState {
        self.core.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// Configuration parameter of the runtime.
    pub fn param(&self, key: &str) -> Option<Arc<str>> {
        self.core.ctx.config().param(key)
    }

    // ========================================================================
    // Ports
    // ========================================================================

    pub fn port(&self, port: PortId) -> &Port {
        &self.core.ports[port.index()]
    }

    pub fn port_by_name(&self, name: &str) -> Option<PortId> {
        self.core.shared.port_index(name)
    }

    pub fn num_ports(&self) -> usize {
        self.core.ports.len()
    }

    pub fn can_send(&self, port: PortId) -> bool {
        self.port(port).can_send()
    }

    pub fn can_recv(&self, port: PortId) -> bool {
        self.port(port).can_recv()
    }

    pub fn input_pending(&self, port: PortId) -> usize {
        self.port(port).input_pending()
    }

    pub fn is_connected(&self, port: PortId) -> bool {
        self.port(port).is_connected()
    }

    /// Send without waiting; fails with `QueueFull` when
    /// [`ModuleContext::can_send`] is false.
    pub fn send(&mut self, port: PortId, buffer: Buffer) -> Result<()> {
        self.core.ports[port.index()].send(buffer)
    }

    pub fn recv(&mut self, port: PortId) -> Option<Buffer> {
        self.core.ports[port.index()].recv()
    }

    /// Duplicate of the `index`-th pending input buffer.
    pub fn peek_input(&self, port: PortId, index: usize) -> Option<Buffer> {
        self.port(port).peek(index)
    }

    pub fn skip_input(&mut self, port: PortId, count: usize) -> usize {
        self.core.ports[port.index()].skip(count)
    }

    // ========================================================================
    // Pools
    // ========================================================================

    pub fn pool(&self, handle: PoolHandleId) -> &MemoryPool {
        &self.core.pools[handle.index()].pool
    }

    /// Immediate take of `size` data bytes; `None` when the pool is
    /// exhausted.
    pub fn take_buffer(&mut self, handle: PoolHandleId, size: usize) -> Option<Buffer> {
        let buffer = self.pool(handle).take(size, 0);
        (!buffer.is_null()).then_some(buffer)
    }

    /// Take a buffer, or register for a pool event once one is released.
    ///
    /// After `None` the module gets `process_pool_event` and collects the
    /// buffer with [`ModuleContext::take_requested`]. Only one request per
    /// handle is outstanding.
    pub fn request_buffer(&mut self, handle: PoolHandleId, size: usize) -> Option<Buffer> {
        if let Some(buffer) = self.take_requested(handle, size) {
            return Some(buffer);
        }
        let h = &mut self.core.pools[handle.index()];
        if h.pending.is_some() {
            return None;
        }
        let waiter = Arc::clone(&h.waiter);
        match h.pool.take_async(waiter, size, 0) {
            AsyncTake::Ready(buffer) => Some(buffer),
            AsyncTake::Queued(id) => {
                h.pending = Some(id);
                None
            }
            AsyncTake::Impossible => {
                log::warn!(
                    "[ModuleContext::request_buffer] {} (pool {}) cannot hold {} bytes",
                    h.name,
                    h.pool.name(),
                    size
                );
                None
            }
        }
    }

    /// Buffer delivered after a [`ModuleContext::request_buffer`], resized
    /// to `size` data bytes.
    pub fn take_requested(&mut self, handle: PoolHandleId, size: usize) -> Option<Buffer> {
        let h = &self.core.pools[handle.index()];
        while let Some(mut buffer) = h.take_ready() {
            if buffer.capacity() >= size && buffer.set_data_len(size).is_ok() {
                return Some(buffer);
            }
        }
        None
    }

    // ========================================================================
    // Timers and user events
    // ========================================================================

    /// Arm a timer to fire once after `delay`; periodic timers keep their
    /// period afterwards.
    pub fn activate_timer(&mut self, timer: TimerId, delay: Duration) {
        self.core.arm_timer(self.th, timer, delay);
    }

    pub fn cancel_timer(&mut self, timer: TimerId) {
        self.core.cancel_timer(timer);
    }

    pub fn is_timer_active(&self, timer: TimerId) -> bool {
        self.core.timers[timer.index()].armed
    }

    /// Queue a user event for this module, processed after pending ones.
    pub fn fire_user_event(&self, code: u32) {
        self.core.sink.fire(ItemEvent::User(code));
    }

    // ========================================================================
    // Lifecycle and commands
    // ========================================================================

    /// Stop this module once the current callback returns.
    pub fn stop(&mut self) {
        self.core.stop_requested = true;
    }

    /// Reply a command kept after a `Postponed` result.
    pub fn reply_postponed(&mut self, id: u64, result: CommandResult) -> bool {
        match self.core.postponed.take(id) {
            Some(cmd) => {
                cmd.reply(result);
                true
            }
            None => false,
        }
    }

    /// Oldest postponed command with this name.
    pub fn take_postponed(&mut self, name: &str) -> Option<Command> {
        self.core.postponed.take_by_name(name)
    }

    pub fn num_postponed(&self) -> usize {
        self.core.postponed.len()
    }

    /// Report an unrecoverable condition; stops every module of the context.
    pub fn raise_fatal(&mut self, err: FatalError) {
        self.core.stop_requested = true;
        self.core.ctx.raise_fatal(err);
    }
}

/// Blocking view for Sync modules.
///
/// Every wait keeps processing the thread mailbox, so other modules of the
/// same thread keep running, and fails with [`WaitError::Stopped`] as soon
/// as this module is stopped.
pub struct SyncContext<'a> {
    inner: ModuleContext<'a>,
}

impl<'a> Deref for SyncContext<'a> {
    type Target = ModuleContext<'a>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for SyncContext<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl<'a> SyncContext<'a> {
    pub(crate) fn new(core: &'a mut ModuleCore, th: &'a mut ThreadCore) -> Self {
        Self {
            inner: ModuleContext::new(core, th),
        }
    }

    fn deadline(timeout: Option<Duration>) -> Option<Instant> {
        timeout.map(|t| Instant::now() + t)
    }

    /// Pump the mailbox until `ready` yields, the deadline passes or the
    /// module stops.
    fn wait_until<T>(
        &mut self,
        deadline: Option<Instant>,
        mut ready: impl FnMut(&mut ModuleCore) -> Option<core::result::Result<T, WaitError>>,
    ) -> core::result::Result<T, WaitError> {
        loop {
            let core = &mut *self.inner.core;
            if !core.is_running() || core.destroy_ack.is_some() || self.inner.th.is_shutting_down() {
                return Err(WaitError::Stopped);
            }
            if let Some(result) = ready(core) {
                return result;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(WaitError::TimedOut);
            }
            if let Some(pumped) = self.inner.th.single_loop(deadline) {
                self.inner.core.absorb(self.inner.th, pumped);
            }
        }
    }

    /// Send, waiting for room in the output queue.
    pub fn send(
        &mut self,
        port: PortId,
        buffer: Buffer,
        timeout: Option<Duration>,
    ) -> core::result::Result<(), WaitError> {
        let deadline = Self::deadline(timeout);
        self.wait_until(deadline, |core| {
            let p = &core.ports[port.index()];
            if !p.has_transport() {
                Some(Err(WaitError::Disconnected(p.name().to_string())))
            } else if p.can_send() {
                Some(Ok(()))
            } else {
                None
            }
        })?;
        self.inner
            .send(port, buffer)
            .map_err(|e| WaitError::Failed(e.to_string()))
    }

    /// Receive, waiting for an input buffer.
    pub fn recv(&mut self, port: PortId, timeout: Option<Duration>) -> core::result::Result<Buffer, WaitError> {
        let deadline = Self::deadline(timeout);
        self.wait_until(deadline, |core| {
            let p = &mut core.ports[port.index()];
            if let Some(buffer) = p.recv() {
                Some(Ok(buffer))
            } else if !p.has_transport() {
                Some(Err(WaitError::Disconnected(p.name().to_string())))
            } else {
                None
            }
        })
    }

    /// Wait until at least `count` buffers are queued on `port`.
    pub fn wait_input(
        &mut self,
        port: PortId,
        count: usize,
        timeout: Option<Duration>,
    ) -> core::result::Result<(), WaitError> {
        let deadline = Self::deadline(timeout);
        self.wait_until(deadline, |core| {
            let p = &core.ports[port.index()];
            if p.input_pending() >= count {
                Some(Ok(()))
            } else if !p.has_transport() {
                Some(Err(WaitError::Disconnected(p.name().to_string())))
            } else {
                None
            }
        })
    }

    /// Wait until `port` is bound to a transport.
    pub fn wait_connect(&mut self, port: PortId, timeout: Option<Duration>) -> core::result::Result<(), WaitError> {
        let deadline = Self::deadline(timeout);
        self.wait_until(deadline, |core| {
            core.ports[port.index()].is_connected().then_some(Ok(()))
        })
    }

    /// Take `size` data bytes from the pool, waiting for a release.
    pub fn take_buffer(
        &mut self,
        handle: PoolHandleId,
        size: usize,
        timeout: Option<Duration>,
    ) -> core::result::Result<Buffer, WaitError> {
        if let Some(buffer) = self.inner.request_buffer(handle, size) {
            return Ok(buffer);
        }
        if self.inner.core.pools[handle.index()].pending.is_none() {
            let pool = self.inner.pool(handle).name().to_string();
            return Err(WaitError::Failed(format!("pool {} cannot hold {} bytes", pool, size)));
        }
        let deadline = Self::deadline(timeout);
        let result = self.wait_until(deadline, |core| {
            let h = &core.pools[handle.index()];
            while let Some(mut buffer) = h.take_ready() {
                if buffer.capacity() >= size && buffer.set_data_len(size).is_ok() {
                    return Some(Ok(buffer));
                }
            }
            None
        });
        if result.is_err() {
            self.inner.core.pools[handle.index()].cancel();
        }
        result
    }

    /// Block for `duration` while serving the mailbox.
    pub fn sleep(&mut self, duration: Duration) -> core::result::Result<(), WaitError> {
        match self.wait_until(Self::deadline(Some(duration)), |_| None::<core::result::Result<(), WaitError>>) {
            Err(WaitError::TimedOut) => Ok(()),
            other => other,
        }
    }

    /// Wait for the next firing of `timer`.
    pub fn wait_timer(&mut self, timer: TimerId, timeout: Option<Duration>) -> core::result::Result<(), WaitError> {
        let deadline = Self::deadline(timeout);
        self.wait_until(deadline, |core| {
            let t = &mut core.timers[timer.index()];
            if t.fired {
                t.fired = false;
                Some(Ok(()))
            } else if !t.armed {
                Some(Err(WaitError::Failed(format!("timer {} not active", t.name))))
            } else {
                None
            }
        })
    }

    /// Park the main loop until a `Restart` command arrives.
    pub fn wait_restart(&mut self) -> core::result::Result<(), WaitError> {
        self.inner.core.restart_requested = false;
        self.inner.core.shared.set_waiting_restart(true);
        log::debug!("[SyncContext::wait_restart] {} waiting for restart", self.inner.name());
        let result = self.wait_until(None, |core| {
            if core.restart_requested {
                core.restart_requested = false;
                Some(Ok(()))
            } else {
                None
            }
        });
        self.inner.core.shared.set_waiting_restart(false);
        result
    }

    /// Next user event, if any was fired.
    pub fn take_user_event(&mut self) -> Option<u32> {
        self.inner.core.user_events.pop_front()
    }

    /// Next command received during a wait.
    pub fn take_command(&mut self) -> Option<Command> {
        self.inner.core.queued_commands.pop()
    }

    pub fn wait_command(&mut self, timeout: Option<Duration>) -> core::result::Result<Command, WaitError> {
        let deadline = Self::deadline(timeout);
        self.wait_until(deadline, |core| core.queued_commands.pop().map(Ok))
    }

    /// Execute a command while serving the mailbox, so a receiver on this
    /// thread is still reached. A `Timeout` reply when nothing arrives in
    /// time.
    pub fn execute(&mut self, cmd: Command, timeout: Duration) -> CommandReply {
        let slot: Arc<Mutex<Option<CommandReply>>> = Arc::new(Mutex::new(None));
        let waker = self.inner.core.sink.clone();
        let target = Arc::clone(&slot);
        self.inner.core.ctx.submit_with(cmd, move |reply| {
            *target.lock() = Some(reply);
            waker.wake();
        });
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reply) = slot.lock().take() {
                return reply;
            }
            if Instant::now() >= deadline || self.inner.th.is_shutting_down() {
                return CommandReply::synthesized(CommandResult::Timeout);
            }
            if let Some(pumped) = self.inner.th.single_loop(Some(deadline)) {
                self.inner.core.absorb(self.inner.th, pumped);
            }
        }
    }

    /// Run a commands set to completion while serving the mailbox.
    pub fn execute_set(&mut self, set: CommandsSet, timeout: Duration) -> SetOutcome {
        let handle = set.submit(timeout);
        let waker = self.inner.core.sink.clone();
        handle.on_done(Box::new(move || waker.wake()));
        loop {
            if let Some(outcome) = handle.take_outcome() {
                return outcome;
            }
            if self.inner.th.is_shutting_down() {
                return handle.cancel();
            }
            if let Some(pumped) = self.inner.th.single_loop(None) {
                self.inner.core.absorb(self.inner.th, pumped);
            }
        }
    }
}
