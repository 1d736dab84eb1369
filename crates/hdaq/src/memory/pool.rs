// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Memory pool with fixed size classes.
//!
//! Each class owns `count` blocks of `block_size` bytes, either allocated up
//! front (`prealloc`) or lazily on first use. A take picks the smallest class
//! whose blocks fit the request and falls back to larger classes when the
//! smaller ones are exhausted. The number of blocks of a class in circulation
//! never exceeds its count.
//!
//! Three take policies are offered:
//!
//! - [`MemoryPool::take`]: immediate, null buffer when exhausted
//! - [`MemoryPool::take_blocking`]: waits on a condition variable until a
//!   block is released or the timeout expires
//! - [`MemoryPool::take_async`]: queues a [`PoolRequester`] that is handed a
//!   buffer as soon as a block returns to the pool

use super::buffer::{Block, Buffer};
use crate::error::{Error, Result, WaitError};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifier of a queued asynchronous take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// Receiver of buffers produced by [`MemoryPool::take_async`].
pub trait PoolRequester: Send + Sync {
    /// Hand over the requested buffer. Returning it back rejects the delivery
    /// (receiver gone); the buffer then returns to the pool.
    fn buffer_available(&self, id: RequestId, buffer: Buffer) -> core::result::Result<(), Buffer>;
}

/// Result of [`MemoryPool::take_async`].
#[derive(Debug)]
pub enum AsyncTake {
    /// A block was free; no notification follows.
    Ready(Buffer),
    /// Requester queued; it is notified once a block is released.
    Queued(RequestId),
    /// No class of this pool can ever hold the requested size.
    Impossible,
}

/// Usage counters of one size class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassStats {
    pub block_size: usize,
    pub count: usize,
    pub allocated: usize,
    pub in_use: usize,
}

/// Snapshot of pool usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub name: String,
    pub classes: Vec<ClassStats>,
    pub pending_requests: usize,
    pub failed_takes: u64,
}

impl PoolStats {
    pub fn total_blocks(&self) -> usize {
        self.classes.iter().map(|c| c.count).sum()
    }

    pub fn total_in_use(&self) -> usize {
        self.classes.iter().map(|c| c.in_use).sum()
    }
}

struct SizeClass {
    block_size: usize,
    count: usize,
    allocated: usize,
    in_use: usize,
    free: Vec<Box<[u8]>>,
}

impl SizeClass {
    fn new(block_size: usize, count: usize, prealloc: bool) -> Self {
        let free = if prealloc {
            (0..count)
                .map(|_| vec![0u8; block_size].into_boxed_slice())
                .collect()
        } else {
            Vec::with_capacity(count)
        };
        Self {
            block_size,
            count,
            allocated: if prealloc { count } else { 0 },
            in_use: 0,
            free,
        }
    }

    fn has_free(&self) -> bool {
        !self.free.is_empty() || self.allocated < self.count
    }

    fn try_reserve(&mut self) -> Option<Box<[u8]>> {
        let data = match self.free.pop() {
            Some(data) => data,
            None if self.allocated < self.count => {
                self.allocated += 1;
                vec![0u8; self.block_size].into_boxed_slice()
            }
            None => return None,
        };
        self.in_use += 1;
        Some(data)
    }
}

struct PendingRequest {
    id: RequestId,
    min_size: usize,
    header_size: usize,
    requester: Arc<dyn PoolRequester>,
}

struct PoolState {
    classes: Vec<SizeClass>,
    requests: VecDeque<PendingRequest>,
    failed_takes: u64,
}

impl PoolState {
    /// Smallest fitting class first, larger ones as fallback.
    ///
    /// Class indices are stable (blocks in circulation carry them), so the
    /// size order is computed here instead of sorting the vector.
    fn reserve(&mut self, total: usize) -> Option<(usize, Box<[u8]>)> {
        let idx = self.pick(total)?;
        self.classes[idx].try_reserve().map(|data| (idx, data))
    }

    /// Class `reserve` would draw from for `total` bytes.
    fn pick(&self, total: usize) -> Option<usize> {
        (0..self.classes.len())
            .filter(|&idx| self.classes[idx].block_size >= total && self.classes[idx].has_free())
            .min_by_key(|&idx| self.classes[idx].block_size)
    }

    /// True when a queued async request would accept a block of `class`.
    fn wanted_by_queued(&self, class: usize) -> bool {
        let size = self.classes[class].block_size;
        self.requests
            .iter()
            .any(|r| r.min_size + r.header_size <= size)
    }

    fn sorted_classes(&self) -> impl Iterator<Item = &SizeClass> {
        let mut refs: Vec<&SizeClass> = self.classes.iter().collect();
        refs.sort_by_key(|c| c.block_size);
        refs.into_iter()
    }

    fn can_ever_fit(&self, total: usize) -> bool {
        self.classes.iter().any(|c| c.block_size >= total)
    }

    fn can_serve(&self, total: usize) -> bool {
        self.classes
            .iter()
            .any(|c| c.block_size >= total && c.has_free())
    }
}

pub(crate) struct PoolShared {
    name: String,
    state: Mutex<PoolState>,
    available: Condvar,
    next_request: AtomicU64,
}

impl PoolShared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn try_take(
        this: &Arc<Self>,
        min_size: usize,
        header_size: usize,
    ) -> Result<Buffer> {
        let total = min_size + header_size;
        let mut state = this.state.lock();
        let reserved = state.reserve(total);
        match reserved {
            Some((class, data)) => {
                drop(state);
                let block = Block::new(data, class, Arc::clone(this));
                Ok(Buffer::from_block(block, header_size, min_size))
            }
            None => {
                state.failed_takes += 1;
                Err(Error::PoolExhausted {
                    pool: this.name.clone(),
                    size: total,
                })
            }
        }
    }

    /// Return a block to its class, serving queued async requesters first.
    pub(crate) fn give_back(this: &Arc<Self>, class: usize, data: Box<[u8]>) {
        let mut state = this.state.lock();
        if let Some(c) = state.classes.get_mut(class) {
            c.in_use -= 1;
            c.free.push(data);
        }

        let mut served = Vec::new();
        while let Some(pos) = state
            .requests
            .iter()
            .position(|r| state.can_serve(r.min_size + r.header_size))
        {
            let Some(req) = state.requests.remove(pos) else {
                break;
            };
            if let Some((class, data)) = state.reserve(req.min_size + req.header_size) {
                served.push((req, class, data));
            }
        }
        drop(state);

        if served.is_empty() {
            this.available.notify_all();
            return;
        }
        for (req, class, data) in served {
            let block = Block::new(data, class, Arc::clone(this));
            let buffer = Buffer::from_block(block, req.header_size, req.min_size);
            if req.requester.buffer_available(req.id, buffer).is_err() {
                log::debug!(
                    "[MemoryPool::give_back] requester {} of pool {} is gone",
                    req.id.0,
                    this.name
                );
            }
        }
    }
}

/// Named memory pool producing reference-counted [`Buffer`]s.
///
/// Cloning the pool clones the handle; all clones share the same classes.
#[derive(Clone)]
pub struct MemoryPool {
    shared: Arc<PoolShared>,
}

impl MemoryPool {
    /// Pool without classes; add them with [`MemoryPool::allocate_class`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                name: name.into(),
                state: Mutex::new(PoolState {
                    classes: Vec::new(),
                    requests: VecDeque::new(),
                    failed_takes: 0,
                }),
                available: Condvar::new(),
                next_request: AtomicU64::new(1),
            }),
        }
    }

    /// Pool with preallocated `(block_size, count)` classes.
    pub fn with_classes(name: impl Into<String>, classes: &[(usize, usize)]) -> Result<Self> {
        let pool = Self::new(name);
        for &(size, count) in classes {
            pool.allocate_class(size, count, true)?;
        }
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Add a class of `count` blocks of `block_size` bytes.
    pub fn allocate_class(&self, block_size: usize, count: usize, prealloc: bool) -> Result<()> {
        if block_size == 0 || count == 0 {
            return Err(Error::Config(format!(
                "pool {}: class {}x{} is empty",
                self.shared.name, block_size, count
            )));
        }
        let mut state = self.shared.state.lock();
        if state.classes.iter().any(|c| c.block_size == block_size) {
            return Err(Error::AlreadyExists(format!(
                "{}: class of {} bytes",
                self.shared.name, block_size
            )));
        }
        state
            .classes
            .push(SizeClass::new(block_size, count, prealloc));
        drop(state);

        log::debug!(
            "[MemoryPool::allocate_class] {} + {} x {} bytes (prealloc={})",
            self.shared.name,
            count,
            block_size,
            prealloc
        );
        Ok(())
    }

    /// Immediate take. Returns the null buffer when no block fits.
    pub fn take(&self, min_size: usize, header_size: usize) -> Buffer {
        self.try_take(min_size, header_size).unwrap_or_default()
    }

    /// Immediate take reporting exhaustion as an error.
    pub fn try_take(&self, min_size: usize, header_size: usize) -> Result<Buffer> {
        PoolShared::try_take(&self.shared, min_size, header_size)
    }

    /// Take, waiting for a release when the pool is exhausted.
    ///
    /// `None` waits forever.
    pub fn take_blocking(
        &self,
        min_size: usize,
        header_size: usize,
        timeout: Option<Duration>,
    ) -> core::result::Result<Buffer, WaitError> {
        let total = min_size + header_size;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        if !state.can_ever_fit(total) {
            return Err(WaitError::Failed(format!(
                "pool {} has no class for {} bytes",
                self.shared.name, total
            )));
        }
        loop {
            // Async requesters queued earlier keep priority on the blocks
            // they could use.
            let class = state.pick(total).filter(|&c| !state.wanted_by_queued(c));
            if let Some(class) = class {
                if let Some(data) = state.classes[class].try_reserve() {
                    drop(state);
                    let block = Block::new(data, class, Arc::clone(&self.shared));
                    return Ok(Buffer::from_block(block, header_size, min_size));
                }
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .available
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        state.failed_takes += 1;
                        return Err(WaitError::TimedOut);
                    }
                }
                None => self.shared.available.wait(&mut state),
            }
        }
    }

    /// Take, or queue `requester` to be handed a buffer on a later release.
    pub fn take_async(
        &self,
        requester: Arc<dyn PoolRequester>,
        min_size: usize,
        header_size: usize,
    ) -> AsyncTake {
        let total = min_size + header_size;
        let mut state = self.shared.state.lock();
        if !state.can_ever_fit(total) {
            return AsyncTake::Impossible;
        }
        if state.requests.is_empty() {
            let reserved = state.reserve(total);
            if let Some((class, data)) = reserved {
                drop(state);
                let block = Block::new(data, class, Arc::clone(&self.shared));
                return AsyncTake::Ready(Buffer::from_block(block, header_size, min_size));
            }
        }
        let id = RequestId(self.shared.next_request.fetch_add(1, Ordering::Relaxed));
        state.requests.push_back(PendingRequest {
            id,
            min_size,
            header_size,
            requester,
        });
        log::trace!(
            "[MemoryPool::take_async] {} queued request {} for {} bytes",
            self.shared.name,
            id.0,
            total
        );
        AsyncTake::Queued(id)
    }

    /// Drop a queued request. Returns false when it was already served.
    pub fn cancel_request(&self, id: RequestId) -> bool {
        let mut state = self.shared.state.lock();
        let before = state.requests.len();
        state.requests.retain(|r| r.id != id);
        state.requests.len() != before
    }

    /// Release a handle explicitly; same as dropping it.
    pub fn release(&self, mut buffer: Buffer) {
        if !buffer.is_null() && !buffer.owned_by(&self.shared) {
            log::debug!(
                "[MemoryPool::release] buffer of pool {:?} released through {}",
                buffer.pool_name(),
                self.shared.name
            );
        }
        buffer.release();
    }

    /// Largest block size of any class.
    pub fn max_block_size(&self) -> usize {
        let state = self.shared.state.lock();
        state.classes.iter().map(|c| c.block_size).max().unwrap_or(0)
    }

    /// True when both handles refer to the same pool.
    pub fn same_pool(&self, other: &MemoryPool) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            name: self.shared.name.clone(),
            classes: state
                .sorted_classes()
                .map(|c| ClassStats {
                    block_size: c.block_size,
                    count: c.count,
                    allocated: c.allocated,
                    in_use: c.in_use,
                })
                .collect(),
            pending_requests: state.requests.len(),
            failed_takes: state.failed_takes,
        }
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("name", &self.shared.name)
            .finish()
    }
}
