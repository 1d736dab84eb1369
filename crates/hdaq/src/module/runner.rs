// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Binds module bodies to the worker thread.

use super::context::{ModuleContext, SyncContext};
use super::core::{ModuleCore, PolicyAction};
use super::{ModuleCallbacks, ModuleState, SyncModule};
use crate::command::{Command, CommandResult};
use crate::error::WaitError;
use crate::runtime::{Control, ItemEvent, ThreadCore, Worker};

pub(crate) enum Body {
    Async(Box<dyn ModuleCallbacks>),
    Sync(Box<dyn SyncModule>),
}

pub(crate) struct ModuleRunner {
    core: ModuleCore,
    body: Body,
}

impl ModuleRunner {
    pub(crate) fn new(core: ModuleCore, body: Body) -> Self {
        core.shared.set_state(ModuleState::Configured);
        Self { core, body }
    }

    fn start(&mut self, th: &mut ThreadCore) -> CommandResult {
        if self.core.shared.state() == ModuleState::Destroyed {
            return CommandResult::Denied;
        }
        if !self.core.begin_run(th) {
            return CommandResult::True;
        }
        if let Body::Async(m) = &mut self.body {
            let mut ctx = ModuleContext::new(&mut self.core, th);
            m.before_start(&mut ctx);
        }
        CommandResult::True
    }

    fn stop(&mut self, th: &mut ThreadCore) -> CommandResult {
        if !self.core.halt() {
            return CommandResult::True;
        }
        if let Body::Async(m) = &mut self.body {
            let mut ctx = ModuleContext::new(&mut self.core, th);
            m.after_stop(&mut ctx);
        }
        CommandResult::True
    }

    /// Stop requested from inside a callback.
    fn check_stop_request(&mut self, th: &mut ThreadCore) {
        if self.core.stop_requested {
            self.stop(th);
        }
    }

    /// Run the Sync main loop to completion. Returns false when the module
    /// was destroyed meanwhile.
    fn run_main_loop(&mut self, th: &mut ThreadCore) -> bool {
        let Body::Sync(m) = &mut self.body else {
            return true;
        };
        if !self.core.is_running() {
            return true;
        }
        let id = self.core.sink.worker();
        if !th.enter_main_loop(id) {
            log::debug!(
                "[ModuleRunner::run_main_loop] {} deferred, thread {} busy",
                self.core.name(),
                th.name()
            );
            th.defer_main_loop(id);
            return true;
        }

        log::debug!("[ModuleRunner::run_main_loop] {} entering main loop", self.core.name());
        {
            let mut ctx = SyncContext::new(&mut self.core, th);
            match m.main_loop(&mut ctx) {
                Ok(()) => log::debug!("[ModuleRunner::run_main_loop] {} main loop returned", ctx.name()),
                Err(WaitError::Stopped) => {
                    log::debug!("[ModuleRunner::run_main_loop] {} main loop stopped", ctx.name())
                }
                Err(e) => log::warn!("[ModuleRunner::run_main_loop] {} main loop failed: {}", ctx.name(), e),
            }
            m.after_stop(&mut ctx);
        }
        th.leave_main_loop(id);
        self.core.halt();

        // Commands that arrived during the last waits.
        while let Some(mut cmd) = self.core.queued_commands.pop() {
            let result = m.execute_command(&mut cmd);
            cmd.reply(sync_result(result));
        }

        if let Some(ack) = self.core.destroy_ack.take() {
            self.core.teardown();
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
            return false;
        }
        true
    }

    fn execute(&mut self, th: &mut ThreadCore, mut cmd: Command) -> bool {
        match cmd.name() {
            "Start" => {
                let result = self.start(th);
                cmd.reply(result);
                if result == CommandResult::True {
                    return match self.body {
                        Body::Async(_) => {
                            self.core.kick_all();
                            true
                        }
                        Body::Sync(_) => self.run_main_loop(th),
                    };
                }
            }
            "Stop" => {
                let result = self.stop(th);
                cmd.reply(result);
            }
            "GetState" => {
                cmd.set("State", self.core.shared.state().to_string());
                cmd.reply(CommandResult::True);
            }
            "Restart" => {
                self.stop(th);
                let result = self.start(th);
                cmd.reply(result);
                if result == CommandResult::True {
                    if let Body::Sync(_) = self.body {
                        return self.run_main_loop(th);
                    }
                    self.core.kick_all();
                }
            }
            _ => match &mut self.body {
                Body::Async(m) => {
                    let result = {
                        let mut ctx = ModuleContext::new(&mut self.core, th);
                        m.execute_command(&mut ctx, &mut cmd)
                    };
                    if result == CommandResult::Postponed {
                        log::trace!(
                            "[ModuleRunner::execute] {} postponed {}",
                            self.core.name(),
                            cmd.name()
                        );
                        self.core.postponed.push(cmd);
                    } else {
                        cmd.reply(result);
                    }
                    self.check_stop_request(th);
                }
                Body::Sync(m) => {
                    let result = m.execute_command(&mut cmd);
                    cmd.reply(sync_result(result));
                }
            },
        }
        true
    }

    fn dispatch_async(&mut self, th: &mut ThreadCore, event: ItemEvent) {
        let Body::Async(m) = &mut self.body else {
            return;
        };
        let core = &mut self.core;
        match event {
            ItemEvent::Input(port) => {
                if core.ports[port.index()].can_recv() {
                    m.process_input_event(&mut ModuleContext::new(core, th), port);
                }
            }
            ItemEvent::Output(port) => {
                if core.ports[port.index()].can_send() {
                    m.process_output_event(&mut ModuleContext::new(core, th), port);
                }
            }
            ItemEvent::Pool(handle) => {
                core.pools[handle.index()].pending = None;
                if core.pools[handle.index()].has_ready() {
                    m.process_pool_event(&mut ModuleContext::new(core, th), handle);
                }
            }
            ItemEvent::Timer { timer, generation } => {
                if core.timer_due(th, timer, generation) {
                    m.process_timer_event(&mut ModuleContext::new(core, th), timer);
                }
            }
            ItemEvent::User(code) => {
                m.process_user_event(&mut ModuleContext::new(core, th), code);
            }
            ItemEvent::Connect(_) | ItemEvent::Disconnect { .. } => {}
        }
    }
}

/// Sync modules cannot keep commands outside their main loop.
fn sync_result(result: CommandResult) -> CommandResult {
    if result == CommandResult::Postponed {
        CommandResult::False
    } else {
        result
    }
}

impl Worker for ModuleRunner {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn process_event(&mut self, th: &mut ThreadCore, event: ItemEvent) -> bool {
        match event {
            ItemEvent::Connect(port) => {
                if let Body::Async(m) = &mut self.body {
                    m.process_connect_event(&mut ModuleContext::new(&mut self.core, th), port);
                }
                if self.core.is_running() {
                    self.core.kick(port);
                }
            }
            ItemEvent::Disconnect { port, error } => {
                let action = self.core.on_disconnect(port, error);
                if let Body::Async(m) = &mut self.body {
                    m.process_disconnect_event(&mut ModuleContext::new(&mut self.core, th), port);
                }
                if action == PolicyAction::StopModule {
                    log::info!(
                        "[ModuleRunner::process_event] {} stopped after port error",
                        self.core.name()
                    );
                    self.stop(th);
                }
            }
            _ if !self.core.is_running() => {
                log::trace!(
                    "[ModuleRunner::process_event] {} not running, {:?} dropped",
                    self.core.name(),
                    event
                );
            }
            ItemEvent::Timer { timer, generation } if matches!(self.body, Body::Sync(_)) => {
                // Sync module outside its loop: keep periodic timers alive.
                self.core.timer_due(th, timer, generation);
            }
            _ => self.dispatch_async(th, event),
        }
        self.check_stop_request(th);
        true
    }

    fn execute_command(&mut self, th: &mut ThreadCore, cmd: Command) -> bool {
        self.execute(th, cmd)
    }

    fn control(&mut self, th: &mut ThreadCore, ctl: Control) -> bool {
        match ctl {
            Control::AssignTransport(port, transport) => {
                if self.core.assign(port, transport) {
                    return self.process_event(th, ItemEvent::Connect(port));
                }
                true
            }
            Control::Detach(port) => {
                if self.core.detach(port) {
                    if let Body::Async(m) = &mut self.body {
                        m.process_disconnect_event(&mut ModuleContext::new(&mut self.core, th), port);
                    }
                }
                true
            }
            Control::RunMainLoop => self.run_main_loop(th),
            Control::Destroy(ack) => {
                self.stop(th);
                self.core.teardown();
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                false
            }
        }
    }

    fn cleanup(&mut self, th: &mut ThreadCore) {
        self.stop(th);
        self.core.teardown();
    }
}
