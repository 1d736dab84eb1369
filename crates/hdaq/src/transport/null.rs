// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

use super::Transport;
use crate::error::Result;
use crate::memory::Buffer;

/// Sink transport: accepts and releases every buffer, never delivers input.
#[derive(Debug, Default)]
pub struct NullTransport {
    sent: u64,
    closed: bool,
}

impl NullTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers swallowed so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }
}

impl Transport for NullTransport {
    fn kind(&self) -> &'static str {
        "null"
    }

    fn send(&mut self, mut buffer: Buffer) -> Result<()> {
        buffer.release();
        self.sent += 1;
        Ok(())
    }

    fn recv(&mut self) -> Option<Buffer> {
        None
    }

    fn peek(&self, _index: usize) -> Option<Buffer> {
        None
    }

    fn skip(&mut self, _count: usize) -> usize {
        0
    }

    fn input_pending(&self) -> usize {
        0
    }

    fn input_capacity(&self) -> usize {
        0
    }

    fn output_pending(&self) -> usize {
        0
    }

    fn output_capacity(&self) -> usize {
        1
    }

    fn is_connected(&self) -> bool {
        !self.closed
    }

    fn close(&mut self, _with_error: bool) {
        self.closed = true;
    }
}
