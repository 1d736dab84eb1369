// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Commands: named requests executed on the receiver's thread.
//!
//! A [`Command`] carries an ordered parameter map, the receiver name and an
//! optional timeout. It is replied exactly once: explicitly through
//! [`Command::reply`], or with [`CommandResult::False`] when dropped
//! unreplied.
//!
//! ```text
//!  caller                    receiver thread
//!    | submit(cmd) ------------> mailbox
//!    |                             | execute_command(&mut cmd) -> result
//!    | <------------------------ reply(result)
//!  CommandHandle::wait
//! ```

mod queue;
mod set;


pub use queue::CommandsQueue;
pub use set::{ChildOutcome, CommandsSet, SetHandle, SetOutcome};

use crossbeam::channel::{Receiver, Sender};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Result code of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandResult {
    True,
    False,
    /// Receiver does not know the command, or no such receiver.
    Unknown,
    /// No reply before the deadline.
    Timeout,
    /// Receiver refused the operation in its current state.
    Denied,
    /// Receiver keeps the command and replies later.
    Postponed,
}

impl CommandResult {
    pub fn is_success(self) -> bool {
        self == CommandResult::True
    }
}

impl From<bool> for CommandResult {
    fn from(ok: bool) -> Self {
        if ok {
            CommandResult::True
        } else {
            CommandResult::False
        }
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandResult::True => "true",
            CommandResult::False => "false",
            CommandResult::Unknown => "unknown",
            CommandResult::Timeout => "timeout",
            CommandResult::Denied => "denied",
            CommandResult::Postponed => "postponed",
        };
        f.write_str(s)
    }
}

/// Typed command parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl From<bool> for CommandValue {
    fn from(v: bool) -> Self {
        CommandValue::Bool(v)
    }
}

impl From<i64> for CommandValue {
    fn from(v: i64) -> Self {
        CommandValue::Int(v)
    }
}

impl From<i32> for CommandValue {
    fn from(v: i32) -> Self {
        CommandValue::Int(i64::from(v))
    }
}

impl From<u64> for CommandValue {
    fn from(v: u64) -> Self {
        CommandValue::UInt(v)
    }
}

impl From<u32> for CommandValue {
    fn from(v: u32) -> Self {
        CommandValue::UInt(u64::from(v))
    }
}

impl From<usize> for CommandValue {
    fn from(v: usize) -> Self {
        CommandValue::UInt(v as u64)
    }
}

impl From<f64> for CommandValue {
    fn from(v: f64) -> Self {
        CommandValue::Float(v)
    }
}

impl From<&str> for CommandValue {
    fn from(v: &str) -> Self {
        CommandValue::Str(v.to_string())
    }
}

impl From<String> for CommandValue {
    fn from(v: String) -> Self {
        CommandValue::Str(v)
    }
}

impl From<Vec<u8>> for CommandValue {
    fn from(v: Vec<u8>) -> Self {
        CommandValue::Bytes(v)
    }
}

/// Where the single reply of a command goes.
pub(crate) enum Replier {
    Channel(Sender<CommandReply>),
    Callback(Box<dyn FnOnce(CommandReply) + Send>),
}

/// Reply delivered to the submitter.
#[derive(Debug)]
pub struct CommandReply {
    pub result: CommandResult,
    /// The executed command with any result parameters; `None` when the
    /// reply was synthesized (timeout, dropped mailbox).
    pub command: Option<Command>,
}

impl CommandReply {
    pub(crate) fn synthesized(result: CommandResult) -> Self {
        Self {
            result,
            command: None,
        }
    }
}

/// Named request with ordered parameters.
pub struct Command {
    name: String,
    params: BTreeMap<String, CommandValue>,
    receiver: Option<String>,
    timeout: Option<Duration>,
    id: u64,
    replier: Option<Replier>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
            receiver: None,
            timeout: None,
            id: 0,
            replier: None,
        }
    }

    /// Builder: target worker name.
    pub fn with_receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    /// Builder: reply deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builder: parameter.
    pub fn with(mut self, key: &str, value: impl Into<CommandValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    pub fn receiver(&self) -> Option<&str> {
        self.receiver.as_deref()
    }

    pub fn set_receiver(&mut self, receiver: impl Into<String>) {
        self.receiver = Some(receiver.into());
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn set(&mut self, key: &str, value: impl Into<CommandValue>) {
        self.params.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&CommandValue> {
        self.params.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &CommandValue)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.params.get(key) {
            Some(CommandValue::Bool(v)) => *v,
            Some(CommandValue::Int(v)) => *v != 0,
            Some(CommandValue::UInt(v)) => *v != 0,
            Some(CommandValue::Str(s)) => s == "true",
            _ => default,
        }
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.params.get(key) {
            Some(CommandValue::Int(v)) => *v,
            Some(CommandValue::UInt(v)) => i64::try_from(*v).unwrap_or(default),
            Some(CommandValue::Str(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_uint(&self, key: &str, default: u64) -> u64 {
        match self.params.get(key) {
            Some(CommandValue::UInt(v)) => *v,
            Some(CommandValue::Int(v)) => u64::try_from(*v).unwrap_or(default),
            Some(CommandValue::Str(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.params.get(key) {
            Some(CommandValue::Float(v)) => *v,
            Some(CommandValue::Int(v)) => *v as f64,
            Some(CommandValue::UInt(v)) => *v as f64,
            Some(CommandValue::Str(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.params.get(key) {
            Some(CommandValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.params.get(key) {
            Some(CommandValue::Bytes(b)) => Some(b.as_slice()),
            _ => None,
        }
    }

    pub(crate) fn set_replier(&mut self, replier: Replier) {
        self.replier = Some(replier);
    }

    /// Deliver the reply. Consumes the command; a command is replied once.
    pub fn reply(mut self, result: CommandResult) {
        let replier = self.replier.take();
        deliver(replier, result, self);
    }

    /// Parameter-only copy without reply channel, used for fan-out.
    pub fn clone_params(&self) -> Command {
        Command {
            name: self.name.clone(),
            params: self.params.clone(),
            receiver: self.receiver.clone(),
            timeout: self.timeout,
            id: 0,
            replier: None,
        }
    }
}

fn deliver(replier: Option<Replier>, result: CommandResult, command: Command) {
    let reply = CommandReply {
        result,
        command: Some(command),
    };
    match replier {
        Some(Replier::Channel(tx)) => {
            // Submitter may have given up waiting.
            let _ = tx.send(reply);
        }
        Some(Replier::Callback(f)) => f(reply),
        None => {}
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if let Some(replier) = self.replier.take() {
            log::debug!(
                "[Command::drop] {} dropped without reply, answering false",
                self.name
            );
            let orphan = Command {
                name: std::mem::take(&mut self.name),
                params: std::mem::take(&mut self.params),
                receiver: self.receiver.take(),
                timeout: self.timeout,
                id: self.id,
                replier: None,
            };
            deliver(Some(replier), CommandResult::False, orphan);
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("receiver", &self.receiver)
            .field("params", &self.params)
            .finish()
    }
}

/// Waitable handle of a submitted command.
pub struct CommandHandle {
    rx: Receiver<CommandReply>,
}

impl CommandHandle {
    pub(crate) fn new(rx: Receiver<CommandReply>) -> Self {
        Self { rx }
    }

    /// Block for the reply. `Timeout` when the deadline passes first.
    pub fn wait(self, timeout: Duration) -> CommandReply {
        match self.rx.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                CommandReply::synthesized(CommandResult::Timeout)
            }
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                CommandReply::synthesized(CommandResult::False)
            }
        }
    }

    /// Reply if already delivered.
    pub fn try_reply(&self) -> Option<CommandReply> {
        self.rx.try_recv().ok()
    }
}
