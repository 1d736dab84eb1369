// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pool handles and timers of a module.

use super::PoolHandleId;
use crate::memory::{Buffer, MemoryPool, PoolRequester, RequestId};
use crate::runtime::{EventSink, ItemEvent};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Receives buffers delivered by the pool on behalf of one pool handle and
/// posts a pool event to the module thread.
pub(crate) struct PoolWaiter {
    sink: EventSink,
    handle: PoolHandleId,
    ready: Mutex<VecDeque<Buffer>>,
}

impl PoolRequester for PoolWaiter {
    fn buffer_available(&self, _id: RequestId, buffer: Buffer) -> Result<(), Buffer> {
        self.ready.lock().push_back(buffer);
        if self.sink.fire(ItemEvent::Pool(self.handle)) {
            return Ok(());
        }
        // Module thread is gone; give the block back.
        match self.ready.lock().pop_back() {
            Some(buffer) => Err(buffer),
            None => Ok(()),
        }
    }
}

pub(crate) struct PoolHandle {
    pub(crate) name: String,
    pub(crate) pool: MemoryPool,
    pub(crate) waiter: Arc<PoolWaiter>,
    pub(crate) pending: Option<RequestId>,
}

impl PoolHandle {
    pub(crate) fn new(name: String, pool: MemoryPool, sink: EventSink, handle: PoolHandleId) -> Self {
        Self {
            name,
            pool,
            waiter: Arc::new(PoolWaiter {
                sink,
                handle,
                ready: Mutex::new(VecDeque::new()),
            }),
            pending: None,
        }
    }

    /// Buffer delivered by an earlier request, if any.
    pub(crate) fn take_ready(&self) -> Option<Buffer> {
        self.waiter.ready.lock().pop_front()
    }

    pub(crate) fn has_ready(&self) -> bool {
        !self.waiter.ready.lock().is_empty()
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(id) = self.pending.take() {
            self.pool.cancel_request(id);
        }
        self.waiter.ready.lock().clear();
    }
}

pub(crate) struct Timer {
    pub(crate) name: String,
    pub(crate) period: Option<Duration>,
    /// Incremented on every (re)arm and cancel; stale firings carry an
    /// older value.
    pub(crate) generation: u64,
    pub(crate) armed: bool,
    /// Set by a firing during a Sync wait, cleared by the waiter.
    pub(crate) fired: bool,
}

impl Timer {
    pub(crate) fn new(name: String, period: Option<Duration>) -> Self {
        Self {
            name,
            period,
            generation: 0,
            armed: false,
            fired: false,
        }
    }
}
