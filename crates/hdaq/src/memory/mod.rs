// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Memory pools and zero-copy buffers.

mod buffer;
mod pool;

#[cfg(test)]
mod tests;

pub use buffer::{Buffer, Segment};
pub use pool::{AsyncTake, ClassStats, MemoryPool, PoolRequester, PoolStats, RequestId};
