// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reference-counted buffer handles over pool blocks.
//!
//! A [`Buffer`] is a list of [`Segment`]s, each one a window into a pool
//! block. Cloning a buffer duplicates the handle, never the memory: the block
//! returns to its size class when the last segment referencing it is dropped.
//!
//! Layout of the first segment:
//!
//! ```text
//! block:  [ offset | user header (header_size) | payload ........ | spare ]
//!                   ^ header()                  ^ data()
//! ```
//!
//! Mutable access requires the handle to be the only one referencing its
//! blocks; shared buffers must be copied first with [`Buffer::make_unique`].

use super::pool::PoolShared;
use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// One block of pool memory. Returns itself to the pool on drop.
pub(crate) struct Block {
    data: Box<[u8]>,
    class: usize,
    pool: Arc<PoolShared>,
}

impl Block {
    pub(crate) fn new(data: Box<[u8]>, class: usize, pool: Arc<PoolShared>) -> Self {
        Self { data, class, pool }
    }

    pub(crate) fn pool(&self) -> &Arc<PoolShared> {
        &self.pool
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        PoolShared::give_back(&self.pool, self.class, data);
    }
}

/// Window into one pool block.
#[derive(Clone)]
pub struct Segment {
    block: Arc<Block>,
    offset: usize,
    len: usize,
}

impl Segment {
    /// Bytes covered by this segment.
    pub fn as_slice(&self) -> &[u8] {
        &self.block.data[self.offset..self.offset + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of handles sharing the underlying block.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.block)
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("block_size", &self.block.data.len())
            .finish()
    }
}

/// Reference-counted handle over one or more pool segments.
///
/// The default value is the null buffer, the explicit "no buffer" signal
/// returned by non-blocking pool takes.
#[derive(Clone, Default)]
pub struct Buffer {
    segments: Vec<Segment>,
    header_size: usize,
    type_tag: u32,
}

impl Buffer {
    /// Null buffer.
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_block(block: Block, header_size: usize, data_len: usize) -> Self {
        Self {
            segments: vec![Segment {
                block: Arc::new(block),
                offset: 0,
                len: header_size + data_len,
            }],
            header_size,
            type_tag: 0,
        }
    }

    /// True when the handle references no memory.
    pub fn is_null(&self) -> bool {
        self.segments.is_empty()
    }

    /// Duplicate the handle. Both handles alias the same memory.
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// Drop the reference. Idempotent; the handle becomes null.
    pub fn release(&mut self) {
        self.segments.clear();
        self.header_size = 0;
    }

    pub fn type_tag(&self) -> u32 {
        self.type_tag
    }

    pub fn set_type_tag(&mut self, tag: u32) {
        self.type_tag = tag;
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    /// Header plus payload bytes over all segments.
    pub fn total_size(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    /// Payload bytes over all segments.
    pub fn data_len(&self) -> usize {
        self.total_size().saturating_sub(self.header_size)
    }

    /// Payload capacity of the first segment.
    pub fn capacity(&self) -> usize {
        match self.segments.first() {
            Some(seg) => seg.block.data.len() - seg.offset - self.header_size,
            None => 0,
        }
    }

    /// User header region. Empty for the null buffer.
    pub fn header(&self) -> &[u8] {
        match self.segments.first() {
            Some(seg) => &seg.block.data[seg.offset..seg.offset + self.header_size],
            None => &[],
        }
    }

    /// Payload of the first segment. Empty for the null buffer.
    pub fn data(&self) -> &[u8] {
        match self.segments.first() {
            Some(seg) => &seg.block.data[seg.offset + self.header_size..seg.offset + seg.len],
            None => &[],
        }
    }

    /// Number of handles sharing the first block.
    pub fn ref_count(&self) -> usize {
        self.segments.first().map_or(0, Segment::ref_count)
    }

    /// True when no other handle references any block of this buffer.
    pub fn is_unique(&self) -> bool {
        self.segments
            .iter()
            .all(|s| Arc::strong_count(&s.block) == 1)
    }

    fn first_block_mut(&mut self) -> Result<(&mut [u8], usize, usize)> {
        let header_size = self.header_size;
        let seg = self.segments.first_mut().ok_or(Error::BufferReleased)?;
        let offset = seg.offset;
        let len = seg.len;
        let block = Arc::get_mut(&mut seg.block).ok_or(Error::BufferShared)?;
        Ok((&mut block.data[offset..], header_size, len))
    }

    /// Mutable user header region.
    pub fn header_mut(&mut self) -> Result<&mut [u8]> {
        let (block, header_size, _) = self.first_block_mut()?;
        Ok(&mut block[..header_size])
    }

    /// Mutable payload of the first segment, current length.
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        let (block, header_size, len) = self.first_block_mut()?;
        Ok(&mut block[header_size..len])
    }

    /// Mutable payload of the first segment up to its full capacity.
    ///
    /// Writers fill this region and then fix the length with
    /// [`Buffer::set_data_len`].
    pub fn capacity_mut(&mut self) -> Result<&mut [u8]> {
        let (block, header_size, _) = self.first_block_mut()?;
        Ok(&mut block[header_size..])
    }

    /// Set the used payload length of the first segment.
    pub fn set_data_len(&mut self, len: usize) -> Result<()> {
        let capacity = self.capacity();
        let header_size = self.header_size;
        let seg = self.segments.first_mut().ok_or(Error::BufferReleased)?;
        if len > capacity {
            return Err(Error::BufferTooSmall {
                need: len,
                have: capacity,
            });
        }
        seg.len = header_size + len;
        Ok(())
    }

    /// Move the header/payload boundary of the first segment. Bytes stay in
    /// place; the payload shrinks or grows by the difference.
    pub fn set_header_size(&mut self, size: usize) -> Result<()> {
        let seg = self.segments.first_mut().ok_or(Error::BufferReleased)?;
        let room = seg.block.data.len() - seg.offset;
        if size > room {
            return Err(Error::BufferTooSmall { need: size, have: room });
        }
        seg.len = seg.len.max(size);
        self.header_size = size;
        Ok(())
    }

    /// Append the payload of `other` as additional segments, without copying.
    pub fn append(&mut self, mut other: Buffer) -> Result<()> {
        if self.is_null() {
            return Err(Error::BufferReleased);
        }
        let header_size = other.header_size;
        for (idx, mut seg) in other.segments.drain(..).enumerate() {
            if idx == 0 {
                seg.offset += header_size;
                seg.len -= header_size;
            }
            if seg.len > 0 {
                self.segments.push(seg);
            }
        }
        Ok(())
    }

    /// Gather the payload of all segments into one vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data_len());
        for (idx, seg) in self.segments.iter().enumerate() {
            let slice = seg.as_slice();
            if idx == 0 {
                out.extend_from_slice(&slice[self.header_size..]);
            } else {
                out.extend_from_slice(slice);
            }
        }
        out
    }

    /// Name of the pool owning the first block.
    pub fn pool_name(&self) -> Option<&str> {
        self.segments.first().map(|s| s.block.pool().name())
    }

    pub(crate) fn owned_by(&self, pool: &Arc<PoolShared>) -> bool {
        self.segments
            .first()
            .is_some_and(|s| Arc::ptr_eq(s.block.pool(), pool))
    }

    /// Make this handle exclusive, copying into a fresh block of the same
    /// pool when the memory is shared or spread over several segments.
    pub fn make_unique(&mut self) -> Result<()> {
        if self.is_null() {
            return Err(Error::BufferReleased);
        }
        if self.segments.len() == 1 && self.is_unique() {
            return Ok(());
        }
        let pool = Arc::clone(self.segments[0].block.pool());
        let payload = self.to_vec();
        let mut copy = PoolShared::try_take(&pool, payload.len(), self.header_size)?;
        copy.header_mut()?.copy_from_slice(self.header());
        copy.data_mut()?.copy_from_slice(&payload);
        copy.type_tag = self.type_tag;
        log::trace!(
            "[Buffer::make_unique] copied {} bytes in pool {}",
            payload.len(),
            pool.name()
        );
        *self = copy;
        Ok(())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "Buffer(null)");
        }
        f.debug_struct("Buffer")
            .field("type_tag", &self.type_tag)
            .field("header_size", &self.header_size)
            .field("data_len", &self.data_len())
            .field("segments", &self.segments.len())
            .finish()
    }
}
