// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

use super::PortId;
use crate::config::PortConfig;
use crate::error::{Error, Result};
use crate::memory::Buffer;
use crate::transport::Transport;
use std::fmt;

/// Traffic counters of one port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    pub sent_buffers: u64,
    pub sent_bytes: u64,
    pub recv_buffers: u64,
    pub recv_bytes: u64,
    pub skipped: u64,
    pub send_failures: u64,
    pub connects: u64,
    pub disconnects: u64,
}

/// Named endpoint of a module, bound to at most one transport.
pub struct Port {
    name: String,
    id: PortId,
    config: PortConfig,
    transport: Option<Box<dyn Transport>>,
    stats: PortStats,
    pub(crate) reconnect_attempts: u32,
}

impl Port {
    pub(crate) fn new(name: String, id: PortId, config: PortConfig) -> Self {
        Self {
            name,
            id,
            config,
            transport: None,
            stats: PortStats::default(),
            reconnect_attempts: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    pub fn stats(&self) -> PortStats {
        self.stats
    }

    /// Kind of the bound transport, if any.
    pub fn transport_kind(&self) -> Option<&'static str> {
        self.transport.as_ref().map(|t| t.kind())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_connected())
    }

    /// True when a send would be accepted now.
    pub fn can_send(&self) -> bool {
        match &self.transport {
            Some(t) => t.is_connected() && t.output_pending() < t.output_capacity(),
            None => false,
        }
    }

    /// True when at least one buffer waits in the input queue.
    pub fn can_recv(&self) -> bool {
        self.input_pending() > 0
    }

    pub fn input_pending(&self) -> usize {
        self.transport.as_ref().map_or(0, |t| t.input_pending())
    }

    pub fn output_pending(&self) -> usize {
        self.transport.as_ref().map_or(0, |t| t.output_pending())
    }

    pub fn input_capacity(&self) -> usize {
        self.transport
            .as_ref()
            .map_or(self.config.input_capacity, |t| t.input_capacity())
    }

    pub fn output_capacity(&self) -> usize {
        self.transport
            .as_ref()
            .map_or(self.config.output_capacity, |t| t.output_capacity())
    }

    pub(crate) fn send(&mut self, buffer: Buffer) -> Result<()> {
        let Some(t) = self.transport.as_mut() else {
            self.stats.send_failures += 1;
            return Err(Error::NotConnected(self.name.clone()));
        };
        let bytes = buffer.data_len() as u64;
        match t.send(buffer) {
            Ok(()) => {
                self.stats.sent_buffers += 1;
                self.stats.sent_bytes += bytes;
                Ok(())
            }
            Err(e) => {
                self.stats.send_failures += 1;
                Err(match e {
                    Error::QueueFull(_) => Error::QueueFull(self.name.clone()),
                    Error::NotConnected(_) => Error::NotConnected(self.name.clone()),
                    other => other,
                })
            }
        }
    }

    pub(crate) fn recv(&mut self) -> Option<Buffer> {
        let buffer = self.transport.as_mut()?.recv()?;
        self.stats.recv_buffers += 1;
        self.stats.recv_bytes += buffer.data_len() as u64;
        Some(buffer)
    }

    pub(crate) fn peek(&self, index: usize) -> Option<Buffer> {
        self.transport.as_ref()?.peek(index)
    }

    pub(crate) fn skip(&mut self, count: usize) -> usize {
        let n = self.transport.as_mut().map_or(0, |t| t.skip(count));
        self.stats.skipped += n as u64;
        n
    }

    pub(crate) fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Bind a transport, closing any previous one.
    pub(crate) fn assign(&mut self, transport: Box<dyn Transport>) {
        if let Some(mut old) = self.transport.replace(transport) {
            old.close(false);
        }
        self.stats.connects += 1;
        self.reconnect_attempts = 0;
    }

    /// Unbind and close the transport.
    pub(crate) fn detach(&mut self, with_error: bool) -> bool {
        match self.transport.take() {
            Some(mut t) => {
                t.close(with_error);
                self.stats.disconnects += 1;
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("transport", &self.transport_kind())
            .field("stats", &self.stats)
            .finish()
    }
}
