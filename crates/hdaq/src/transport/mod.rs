// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transports move buffers between two ports.
//!
//! A port owns at most one transport. The transport owns the port's input
//! queue and knows the capacity of the peer's input queue, which is the
//! port's output capacity:
//!
//! ```text
//!   port A                                   port B
//!   output ──send──▶ [ B input queue ] ──recv──▶ module B
//!   module A ◀──recv── [ A input queue ] ◀──send── output
//! ```
//!
//! Implementations: [`LocalTransport`] for ports of the same process and
//! [`NullTransport`] as a sink for unconnected outputs. Network transports
//! implement the same trait outside this crate.

mod local;
mod null;

pub use local::LocalTransport;
pub use null::NullTransport;

pub(crate) use local::{LinkEnd, LocalLink};

use crate::error::Result;
use crate::memory::Buffer;

/// Buffer mover bound to one port.
pub trait Transport: Send {
    /// Short name for logs.
    fn kind(&self) -> &'static str;

    /// Push a buffer towards the peer. Fails when the peer queue is full or
    /// the transport is closed.
    fn send(&mut self, buffer: Buffer) -> Result<()>;

    /// Pop the oldest buffer of the input queue.
    fn recv(&mut self) -> Option<Buffer>;

    /// Duplicate of the input buffer at `index` without removing it.
    fn peek(&self, index: usize) -> Option<Buffer>;

    /// Drop up to `count` buffers from the head of the input queue.
    fn skip(&mut self, count: usize) -> usize;

    fn input_pending(&self) -> usize;
    fn input_capacity(&self) -> usize;
    fn output_pending(&self) -> usize;
    fn output_capacity(&self) -> usize;

    fn is_connected(&self) -> bool;

    /// Close the transport; the peer sees a disconnect, flagged as error
    /// when `with_error` is set. Idempotent.
    fn close(&mut self, with_error: bool);
}
