// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process transport between two ports.
//!
//! Both ends share one [`LocalLink`] holding the two input queues. The link
//! stores, for each end, the event sink and port id to notify; these are
//! indices into the owning thread, never owning references to the module.
//! Closing one end clears its entry before the peer is told, so no event can
//! reach a module that already left the pairing.
//!
//! When both ports name different pools, buffers are copied into the
//! receiver's pool on send, with the negotiated user header size.

use super::Transport;
use crate::error::{Error, Result};
use crate::memory::{Buffer, MemoryPool};
use crate::module::PortId;
use crate::runtime::{EventSink, ItemEvent};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Description of one end at connection time.
pub(crate) struct LinkEnd {
    pub(crate) sink: EventSink,
    pub(crate) port: PortId,
    /// Negotiated capacity of this end's input queue.
    pub(crate) capacity: usize,
    /// Pool to copy arriving buffers into, when pools differ.
    pub(crate) copy_pool: Option<MemoryPool>,
    pub(crate) thread: String,
}

/// Shared state of an in-process pairing.
///
/// Both queues sit behind one mutex whether or not the ends share a
/// thread. The link is built on the connecting thread and its ends reach
/// the module threads through their mailboxes, so it is shared in either
/// case; for same-thread pairs the lock is never contended.
/// `cross_thread` is informational only.
pub(crate) struct LocalLink {
    queues: Mutex<[VecDeque<Buffer>; 2]>,
    capacity: [usize; 2],
    ends: Mutex<[Option<(EventSink, PortId)>; 2]>,
    copy_pool: [Option<MemoryPool>; 2],
    header_size: usize,
    closed: AtomicBool,
    cross_thread: bool,
}

impl LocalLink {
    /// Create both transports of a new pairing.
    pub(crate) fn pair(a: LinkEnd, b: LinkEnd, header_size: usize) -> (LocalTransport, LocalTransport) {
        let cross_thread = a.thread != b.thread;
        let link = Arc::new(LocalLink {
            queues: Mutex::new([VecDeque::with_capacity(a.capacity), VecDeque::with_capacity(b.capacity)]),
            capacity: [a.capacity, b.capacity],
            ends: Mutex::new([Some((a.sink, a.port)), Some((b.sink, b.port))]),
            copy_pool: [a.copy_pool, b.copy_pool],
            header_size,
            closed: AtomicBool::new(false),
            cross_thread,
        });
        log::debug!(
            "[LocalLink::pair] capacities {}/{} header {} cross_thread={}",
            link.capacity[0],
            link.capacity[1],
            header_size,
            cross_thread
        );
        (
            LocalTransport {
                link: Arc::clone(&link),
                side: 0,
            },
            LocalTransport { link, side: 1 },
        )
    }

    fn notify(&self, side: usize, event: impl FnOnce(PortId) -> ItemEvent) {
        let target = self.ends.lock()[side].clone();
        if let Some((sink, port)) = target {
            sink.fire(event(port));
        }
    }

    fn copy_for(&self, side: usize, buffer: Buffer) -> Result<Buffer> {
        let Some(pool) = &self.copy_pool[side] else {
            return Ok(buffer);
        };
        if buffer.pool_name() == Some(pool.name()) {
            return Ok(buffer);
        }
        let payload = buffer.to_vec();
        let mut copy = pool.try_take(payload.len(), self.header_size)?;
        let n = buffer.header().len().min(self.header_size);
        copy.header_mut()?[..n].copy_from_slice(&buffer.header()[..n]);
        copy.data_mut()?.copy_from_slice(&payload);
        copy.set_type_tag(buffer.type_tag());
        Ok(copy)
    }
}

/// One end of an in-process pairing.
pub struct LocalTransport {
    link: Arc<LocalLink>,
    side: usize,
}

impl LocalTransport {
    fn peer(&self) -> usize {
        1 - self.side
    }

    /// True when both ends run on different threads.
    pub fn is_cross_thread(&self) -> bool {
        self.link.cross_thread
    }
}

impl Transport for LocalTransport {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn send(&mut self, buffer: Buffer) -> Result<()> {
        if self.link.closed.load(Ordering::Acquire) {
            return Err(Error::NotConnected("local".into()));
        }
        let peer = self.peer();
        {
            let queues = self.link.queues.lock();
            if queues[peer].len() >= self.link.capacity[peer] {
                return Err(Error::QueueFull("local".into()));
            }
        }
        let buffer = self.link.copy_for(peer, buffer)?;
        {
            let mut queues = self.link.queues.lock();
            if queues[peer].len() >= self.link.capacity[peer] {
                return Err(Error::QueueFull("local".into()));
            }
            queues[peer].push_back(buffer);
        }
        self.link.notify(peer, ItemEvent::Input);
        Ok(())
    }

    fn recv(&mut self) -> Option<Buffer> {
        let buffer = self.link.queues.lock()[self.side].pop_front()?;
        self.link.notify(self.peer(), ItemEvent::Output);
        Some(buffer)
    }

    fn peek(&self, index: usize) -> Option<Buffer> {
        self.link.queues.lock()[self.side].get(index).cloned()
    }

    fn skip(&mut self, count: usize) -> usize {
        let skipped = {
            let mut queues = self.link.queues.lock();
            let n = count.min(queues[self.side].len());
            queues[self.side].drain(..n);
            n
        };
        for _ in 0..skipped {
            self.link.notify(self.peer(), ItemEvent::Output);
        }
        skipped
    }

    fn input_pending(&self) -> usize {
        self.link.queues.lock()[self.side].len()
    }

    fn input_capacity(&self) -> usize {
        self.link.capacity[self.side]
    }

    fn output_pending(&self) -> usize {
        self.link.queues.lock()[self.peer()].len()
    }

    fn output_capacity(&self) -> usize {
        self.link.capacity[self.peer()]
    }

    fn is_connected(&self) -> bool {
        !self.link.closed.load(Ordering::Acquire)
    }

    fn close(&mut self, with_error: bool) {
        self.link.ends.lock()[self.side] = None;
        if self.link.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.link.queues.lock()[self.side].clear();
        self.link.notify(self.peer(), |port| ItemEvent::Disconnect {
            port,
            error: with_error,
        });
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.close(true);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // test scaffolding

    use super::*;
    use crate::runtime::{Envelope, WorkerId};

    fn same_thread_end(port: u16, capacity: usize) -> (LinkEnd, Receiver<Envelope>) {
        let (mut e, rx) = end(port, capacity, None);
        e.thread = "T".into();
        (e, rx)
    }
    use crossbeam::channel::{self, Receiver};

    fn end(port: u16, capacity: usize, pool: Option<MemoryPool>) -> (LinkEnd, Receiver<Envelope>) {
        let (tx, rx) = channel::unbounded();
        (
            LinkEnd {
                sink: EventSink::new(tx, WorkerId(u32::from(port))),
                port: PortId(port),
                capacity,
                copy_pool: pool,
                thread: format!("T{}", port),
            },
            rx,
        )
    }

    fn events(rx: &Receiver<Envelope>) -> Vec<ItemEvent> {
        rx.try_iter()
            .filter_map(|env| match env {
                Envelope::Event(_, ev) => Some(ev),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_flow_control_and_notifications() {
        let pool = MemoryPool::with_classes("p", &[(64, 8)]).unwrap();
        let (a, rx_a) = end(0, 0, None);
        let (b, rx_b) = end(1, 2, None);
        let (mut ta, mut tb) = LocalLink::pair(a, b, 0);

        assert_eq!(ta.output_capacity(), 2);
        assert_eq!(tb.input_capacity(), 2);
        assert!(ta.is_cross_thread());

        ta.send(pool.take(8, 0)).unwrap();
        ta.send(pool.take(8, 0)).unwrap();
        assert!(matches!(ta.send(pool.take(8, 0)), Err(Error::QueueFull(_))));
        assert_eq!(ta.output_pending(), 2);
        assert_eq!(tb.input_pending(), 2);
        assert_eq!(events(&rx_b), vec![ItemEvent::Input(PortId(1)); 2]);

        assert!(tb.recv().is_some());
        assert_eq!(events(&rx_a), vec![ItemEvent::Output(PortId(0))]);
        assert_eq!(tb.skip(5), 1);
        assert_eq!(ta.output_pending(), 0);
    }

    #[test]
    fn test_copy_into_receiver_pool() {
        let src = MemoryPool::with_classes("src", &[(64, 2)]).unwrap();
        let dst = MemoryPool::with_classes("dst", &[(64, 2)]).unwrap();
        let (a, _rx_a) = end(0, 0, None);
        let (b, _rx_b) = end(1, 4, Some(dst.clone()));
        let (mut ta, mut tb) = LocalLink::pair(a, b, 4);

        let mut buf = src.take(3, 4);
        buf.header_mut().unwrap().copy_from_slice(&[9, 9, 9, 9]);
        buf.data_mut().unwrap().copy_from_slice(b"xyz");
        ta.send(buf).unwrap();

        let got = tb.recv().unwrap();
        assert_eq!(got.pool_name(), Some("dst"));
        assert_eq!(got.header(), &[9, 9, 9, 9]);
        assert_eq!(got.data(), b"xyz");
        assert_eq!(src.stats().total_in_use(), 0);
    }

    #[test]
    fn test_close_notifies_peer_once() {
        let (a, rx_a) = end(0, 1, None);
        let (b, rx_b) = end(1, 1, None);
        let (mut ta, tb) = LocalLink::pair(a, b, 0);

        ta.close(false);
        ta.close(true);
        assert!(!tb.is_connected());
        assert_eq!(
            events(&rx_b),
            vec![ItemEvent::Disconnect {
                port: PortId(1),
                error: false
            }]
        );
        drop(tb);
        assert!(events(&rx_a).is_empty());
    }

    #[test]
    fn test_same_thread_pair_queues_like_cross_thread() {
        let pool = MemoryPool::with_classes("p", &[(64, 4)]).unwrap();
        let (a, rx_a) = same_thread_end(0, 1);
        let (b, rx_b) = same_thread_end(1, 1);
        let (mut ta, mut tb) = LocalLink::pair(a, b, 0);
        assert!(!ta.is_cross_thread());
        assert!(!tb.is_cross_thread());

        ta.send(pool.take(8, 0)).unwrap();
        assert!(matches!(ta.send(pool.take(8, 0)), Err(Error::QueueFull(_))));
        assert_eq!(events(&rx_b), vec![ItemEvent::Input(PortId(1))]);

        tb.send(pool.take(8, 0)).unwrap();
        assert_eq!(ta.recv().map(|b| b.data_len()), Some(8));
        assert_eq!(tb.recv().map(|b| b.data_len()), Some(8));
        assert_eq!(
            events(&rx_a),
            vec![ItemEvent::Input(PortId(0)), ItemEvent::Output(PortId(0))]
        );
        assert_eq!(pool.stats().total_in_use(), 0);
    }
}
