// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

use super::items::{PoolHandle, Timer};
use super::port::Port;
use super::{ModuleSpec, ModuleState, PoolHandleId, PortId, PortSpec, TimerId};
use crate::command::{Command, CommandResult, CommandsQueue};
use crate::config::OnErrorPolicy;
use crate::error::Result;
use crate::runtime::{Control, EventSink, ItemEvent, Pumped, RuntimeContext, ThreadCore};
use crate::transport::Transport;
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Module data visible from other threads through the context registry.
pub(crate) struct ModuleShared {
    pub(crate) name: String,
    pub(crate) is_sync: bool,
    pub(crate) ports: Vec<PortSpec>,
    state: Mutex<ModuleState>,
    running: AtomicBool,
    waiting_restart: AtomicBool,
    /// Reserved by `connect` before the transport reaches the module
    /// thread, so two concurrent connects cannot bind the same port.
    connected: Vec<AtomicBool>,
}

impl ModuleShared {
    pub(crate) fn new(spec: &ModuleSpec, is_sync: bool) -> Self {
        Self {
            name: spec.name.clone(),
            is_sync,
            ports: spec.ports.clone(),
            state: Mutex::new(ModuleState::Created),
            running: AtomicBool::new(false),
            waiting_restart: AtomicBool::new(false),
            connected: spec.ports.iter().map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub(crate) fn state(&self) -> ModuleState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ModuleState) {
        *self.state.lock() = state;
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub(crate) fn is_waiting_restart(&self) -> bool {
        self.waiting_restart.load(Ordering::Acquire)
    }

    pub(crate) fn set_waiting_restart(&self, waiting: bool) {
        self.waiting_restart.store(waiting, Ordering::Release);
    }

    pub(crate) fn port_index(&self, name: &str) -> Option<PortId> {
        self.ports
            .iter()
            .position(|p| p.name == name)
            .map(|i| PortId(i as u16))
    }

    pub(crate) fn port_spec(&self, port: PortId) -> Option<&PortSpec> {
        self.ports.get(port.index())
    }

    /// Claim a port for a new connection. False when already bound.
    pub(crate) fn reserve_port(&self, port: PortId) -> bool {
        self.connected
            .get(port.index())
            .is_some_and(|c| c.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok())
    }

    pub(crate) fn release_port(&self, port: PortId) {
        if let Some(c) = self.connected.get(port.index()) {
            c.store(false, Ordering::Release);
        }
    }

    pub(crate) fn is_port_reserved(&self, port: PortId) -> bool {
        self.connected
            .get(port.index())
            .is_some_and(|c| c.load(Ordering::Acquire))
    }
}

/// What the runner must do after a disconnect was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PolicyAction {
    Nothing,
    StopModule,
}

/// Thread-side state of a module: items, queues and flags.
pub(crate) struct ModuleCore {
    pub(crate) shared: Arc<ModuleShared>,
    pub(crate) ctx: RuntimeContext,
    pub(crate) sink: EventSink,
    pub(crate) ports: Vec<Port>,
    pub(crate) pools: Vec<PoolHandle>,
    pub(crate) timers: Vec<Timer>,
    /// Commands an Async module answered with `Postponed`.
    pub(crate) postponed: CommandsQueue,
    /// Commands received while a Sync main loop was waiting.
    pub(crate) queued_commands: CommandsQueue,
    pub(crate) user_events: VecDeque<u32>,
    pub(crate) restart_requested: bool,
    /// Set by a stop request issued from inside a callback.
    pub(crate) stop_requested: bool,
    /// Destroy received during a Sync wait; acknowledged once the loop
    /// has unwound.
    pub(crate) destroy_ack: Option<Option<Sender<()>>>,
}

impl ModuleCore {
    pub(crate) fn new(
        shared: Arc<ModuleShared>,
        ctx: RuntimeContext,
        sink: EventSink,
        spec: &ModuleSpec,
    ) -> Result<Self> {
        let ports = spec
            .ports
            .iter()
            .enumerate()
            .map(|(i, p)| Port::new(p.name.clone(), PortId(i as u16), p.config.clone()))
            .collect();
        let mut pools = Vec::with_capacity(spec.pools.len());
        for (i, p) in spec.pools.iter().enumerate() {
            let pool = ctx.pool(&p.pool)?;
            pools.push(PoolHandle::new(
                p.name.clone(),
                pool,
                sink.clone(),
                PoolHandleId(i as u16),
            ));
        }
        let timers = spec
            .timers
            .iter()
            .map(|t| Timer::new(t.name.clone(), t.period))
            .collect();
        Ok(Self {
            shared,
            ctx,
            sink,
            ports,
            pools,
            timers,
            postponed: CommandsQueue::new(),
            queued_commands: CommandsQueue::new(),
            user_events: VecDeque::new(),
            restart_requested: false,
            stop_requested: false,
            destroy_ack: None,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.shared.name
    }

    pub(crate) fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Mark running and arm periodic timers. False when already running.
    pub(crate) fn begin_run(&mut self, th: &mut ThreadCore) -> bool {
        if self.shared.is_running() {
            return false;
        }
        self.shared.set_running(true);
        self.shared.set_state(ModuleState::Running);
        self.stop_requested = false;
        let periodic: Vec<(usize, Duration)> = self
            .timers
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.period.map(|p| (i, p)))
            .collect();
        for (i, period) in periodic {
            self.arm_timer(th, TimerId(i as u16), period);
        }
        log::info!("[ModuleCore::begin_run] {} running", self.name());
        true
    }

    /// Clear the running flag and disarm timers. False when not running.
    pub(crate) fn halt(&mut self) -> bool {
        self.stop_requested = false;
        if !self.shared.is_running() {
            return false;
        }
        self.shared.set_running(false);
        if self.shared.state() == ModuleState::Running {
            self.shared.set_state(ModuleState::Stopped);
        }
        for t in &mut self.timers {
            t.generation += 1;
            t.armed = false;
            t.fired = false;
        }
        log::info!("[ModuleCore::halt] {} stopped", self.name());
        true
    }

    /// Release every resource; the module is not used afterwards.
    pub(crate) fn teardown(&mut self) {
        self.halt();
        self.shared.set_state(ModuleState::Destroyed);
        for i in 0..self.ports.len() {
            if self.ports[i].detach(true) {
                self.shared.release_port(PortId(i as u16));
            }
        }
        for p in &mut self.pools {
            p.cancel();
        }
        self.postponed.reply_all(CommandResult::False);
        self.queued_commands.reply_all(CommandResult::False);
        log::debug!("[ModuleCore::teardown] {} destroyed", self.name());
    }

    // ========================================================================
    // Ports
    // ========================================================================

    pub(crate) fn assign(&mut self, port: PortId, transport: Box<dyn Transport>) -> bool {
        match self.ports.get_mut(port.index()) {
            Some(p) => {
                log::debug!(
                    "[ModuleCore::assign] {}/{} bound to {} transport",
                    self.shared.name,
                    p.name(),
                    transport.kind()
                );
                p.assign(transport);
                true
            }
            None => false,
        }
    }

    /// Voluntary disconnect; no on-error policy applies.
    pub(crate) fn detach(&mut self, port: PortId) -> bool {
        let Some(p) = self.ports.get_mut(port.index()) else {
            return false;
        };
        let had = p.detach(false);
        self.shared.release_port(port);
        had
    }

    /// Handle a disconnect event and apply the port's on-error policy.
    pub(crate) fn on_disconnect(&mut self, port: PortId, error: bool) -> PolicyAction {
        let Some(p) = self.ports.get_mut(port.index()) else {
            return PolicyAction::Nothing;
        };
        if p.is_connected() {
            // Stale event of a transport replaced meanwhile.
            return PolicyAction::Nothing;
        }
        p.detach(error);
        self.shared.release_port(port);
        log::info!(
            "[ModuleCore::on_disconnect] {}/{} disconnected (error={})",
            self.shared.name,
            p.name(),
            error
        );
        if !error || self.ctx.is_shutting_down() {
            return PolicyAction::Nothing;
        }

        let config = p.config().clone();
        match config.on_error {
            OnErrorPolicy::None => PolicyAction::Nothing,
            OnErrorPolicy::Stop => PolicyAction::StopModule,
            OnErrorPolicy::Exit => {
                self.ctx.request_exit();
                PolicyAction::Nothing
            }
            OnErrorPolicy::Abort => {
                log::error!(
                    "[ModuleCore::on_disconnect] {}/{} lost its peer, aborting",
                    self.shared.name,
                    p.name()
                );
                std::process::abort();
            }
            OnErrorPolicy::Reconnect => {
                self.ctx.schedule_reconnect(
                    self.shared.name.clone(),
                    p.name().to_string(),
                    config.reconnect_period,
                    config.reconnect_limit,
                    0,
                );
                PolicyAction::Nothing
            }
        }
    }

    /// Post Input/Output events for queue states that callbacks may have
    /// missed (events dropped while stopped, freshly bound transport).
    pub(crate) fn kick(&self, port: PortId) {
        let Some(p) = self.ports.get(port.index()) else {
            return;
        };
        if p.can_recv() {
            self.sink.fire(ItemEvent::Input(port));
        }
        if p.can_send() {
            self.sink.fire(ItemEvent::Output(port));
        }
    }

    pub(crate) fn kick_all(&self) {
        for i in 0..self.ports.len() {
            self.kick(PortId(i as u16));
        }
        for (i, p) in self.pools.iter().enumerate() {
            if p.has_ready() {
                self.sink.fire(ItemEvent::Pool(PoolHandleId(i as u16)));
            }
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    pub(crate) fn arm_timer(&mut self, th: &mut ThreadCore, timer: TimerId, delay: Duration) -> bool {
        let worker = self.sink.worker();
        let Some(t) = self.timers.get_mut(timer.index()) else {
            return false;
        };
        t.generation += 1;
        t.armed = true;
        t.fired = false;
        th.arm_timer(worker, timer, Instant::now() + delay, t.generation);
        true
    }

    pub(crate) fn cancel_timer(&mut self, timer: TimerId) {
        if let Some(t) = self.timers.get_mut(timer.index()) {
            t.generation += 1;
            t.armed = false;
            t.fired = false;
        }
    }

    /// Validate a timer firing; periodic timers are re-armed here.
    pub(crate) fn timer_due(&mut self, th: &mut ThreadCore, timer: TimerId, generation: u64) -> bool {
        let Some(t) = self.timers.get_mut(timer.index()) else {
            return false;
        };
        if !t.armed || t.generation != generation {
            return false;
        }
        t.armed = false;
        let period = t.period;
        if let (Some(period), true) = (period, self.shared.is_running()) {
            self.arm_timer(th, timer, period);
        }
        true
    }

    // ========================================================================
    // Sync wait support
    // ========================================================================

    /// Consume an entry pumped during a Sync wait.
    pub(crate) fn absorb(&mut self, th: &mut ThreadCore, pumped: Pumped) {
        match pumped {
            Pumped::Event(event) => self.absorb_event(th, event),
            Pumped::Command(cmd) => self.absorb_command(cmd),
            Pumped::Control(ctl) => match ctl {
                Control::AssignTransport(port, transport) => {
                    self.assign(port, transport);
                }
                Control::Detach(port) => {
                    self.detach(port);
                }
                Control::RunMainLoop => {}
                Control::Destroy(ack) => {
                    self.halt();
                    self.destroy_ack = Some(ack);
                }
            },
        }
    }

    fn absorb_event(&mut self, th: &mut ThreadCore, event: ItemEvent) {
        match event {
            ItemEvent::Disconnect { port, error } => {
                if self.on_disconnect(port, error) == PolicyAction::StopModule {
                    self.halt();
                }
            }
            ItemEvent::Timer { timer, generation } => {
                if self.timer_due(th, timer, generation) {
                    if let Some(t) = self.timers.get_mut(timer.index()) {
                        t.fired = true;
                    }
                }
            }
            ItemEvent::User(code) => self.user_events.push_back(code),
            ItemEvent::Pool(handle) => {
                if let Some(p) = self.pools.get_mut(handle.index()) {
                    p.pending = None;
                }
            }
            // Queue states are re-checked by the waiter.
            ItemEvent::Input(_) | ItemEvent::Output(_) | ItemEvent::Connect(_) => {}
        }
    }

    fn absorb_command(&mut self, mut cmd: Command) {
        match cmd.name() {
            "Start" => cmd.reply(CommandResult::True),
            "Stop" => {
                self.halt();
                cmd.reply(CommandResult::True);
            }
            "GetState" => {
                cmd.set("State", self.shared.state().to_string());
                cmd.reply(CommandResult::True);
            }
            "Restart" => {
                self.restart_requested = true;
                cmd.reply(CommandResult::True);
            }
            _ => self.queued_commands.push(cmd),
        }
    }
}
