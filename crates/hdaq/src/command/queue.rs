// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

use super::{Command, CommandResult};
use std::collections::VecDeque;

/// Ordered queue of commands waiting for processing or for a late reply.
#[derive(Debug, Default)]
pub struct CommandsQueue {
    items: VecDeque<Command>,
}

impl CommandsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cmd: Command) {
        self.items.push_back(cmd);
    }

    pub fn pop(&mut self) -> Option<Command> {
        self.items.pop_front()
    }

    pub fn front(&self) -> Option<&Command> {
        self.items.front()
    }

    /// Remove the command with the given id.
    pub fn take(&mut self, id: u64) -> Option<Command> {
        let pos = self.items.iter().position(|c| c.id() == id)?;
        self.items.remove(pos)
    }

    /// Remove the oldest command with the given name.
    pub fn take_by_name(&mut self, name: &str) -> Option<Command> {
        let pos = self.items.iter().position(|c| c.is(name))?;
        self.items.remove(pos)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.items.iter()
    }

    /// Reply every queued command with `result`, oldest first.
    pub fn reply_all(&mut self, result: CommandResult) {
        while let Some(cmd) = self.items.pop_front() {
            cmd.reply(result);
        }
    }
}
