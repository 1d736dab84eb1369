// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Threads, mailboxes and the runtime context.

mod context;
mod event;
mod thread;

#[cfg(test)]
mod tests;

pub use context::{ModuleInfo, RuntimeContext};
pub use event::WorkerId;

pub(crate) use event::{Control, EventSink, ItemEvent};
#[cfg(test)]
pub(crate) use event::Envelope;
pub(crate) use thread::{Pumped, ThreadCore};

use crate::command::{Command, CommandResult};

/// Unit of execution pinned to one thread.
///
/// Each method returns `false` when the worker must be removed from its
/// thread afterwards.
pub(crate) trait Worker: Send {
    fn name(&self) -> &str;
    fn process_event(&mut self, th: &mut ThreadCore, event: ItemEvent) -> bool;
    fn execute_command(&mut self, th: &mut ThreadCore, cmd: Command) -> bool;
    fn control(&mut self, th: &mut ThreadCore, ctl: Control) -> bool;
    /// Called when the thread exits with the worker still attached.
    fn cleanup(&mut self, th: &mut ThreadCore);
}

pub(crate) type CommandHandler = Box<dyn FnMut(&mut Command) -> CommandResult + Send>;

/// Worker that only executes commands through a closure.
pub(crate) struct CommandWorker {
    name: String,
    handler: CommandHandler,
}

impl CommandWorker {
    pub(crate) fn new(name: String, handler: CommandHandler) -> Self {
        Self { name, handler }
    }
}

impl Worker for CommandWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_event(&mut self, _th: &mut ThreadCore, _event: ItemEvent) -> bool {
        true
    }

    fn execute_command(&mut self, _th: &mut ThreadCore, mut cmd: Command) -> bool {
        let result = (self.handler)(&mut cmd);
        if result == CommandResult::Postponed {
            log::warn!(
                "[CommandWorker::execute_command] {} cannot postpone {}",
                self.name,
                cmd.name()
            );
            cmd.reply(CommandResult::False);
        } else {
            cmd.reply(result);
        }
        true
    }

    fn control(&mut self, _th: &mut ThreadCore, ctl: Control) -> bool {
        match ctl {
            Control::Destroy(ack) => {
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                false
            }
            _ => true,
        }
    }

    fn cleanup(&mut self, _th: &mut ThreadCore) {}
}
