// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Network device abstraction.
//!
//! A [`Fabric`] moves whole packets between nodes with posted receive
//! buffers, like an unreliable datagram queue pair: a send to a node without
//! a posted receive buffer is lost. Work is posted with a caller token and
//! reported back through [`Fabric::poll`].
//!
//! [`LoopbackCluster`] connects the endpoints of an in-process cluster.

use crate::error::{BnetError, Result};
use crate::wire::{EventId, SendKind, TransportHeader};
use hdaq::Buffer;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Finished work item.
#[derive(Debug)]
pub enum Completion {
    /// A posted send left the device.
    Send { token: u64, ok: bool },
    /// A posted receive buffer was filled; its payload length is the packet
    /// length.
    Recv { token: u64, buffer: Buffer },
}

/// Network endpoint of one node.
pub trait Fabric: Send {
    fn node(&self) -> usize;

    fn num_nodes(&self) -> usize;

    /// Queue `packet` (user header plus payload) for `target` on logical
    /// channel `lid`.
    fn post_send(&mut self, target: usize, lid: usize, packet: Buffer, token: u64) -> Result<()>;

    /// Offer an exclusively owned buffer for the next incoming packet.
    fn post_recv(&mut self, buffer: Buffer, token: u64) -> Result<()>;

    /// Receive buffers currently posted.
    fn posted_recvs(&self) -> usize;

    /// Move up to `max` completions into `out`; returns how many.
    fn poll(&mut self, out: &mut Vec<Completion>, max: usize) -> usize;
}

/// Description of a packet in flight, handed to the drop filter.
#[derive(Debug, Clone, Copy)]
pub struct PacketInfo {
    pub src: usize,
    pub target: usize,
    pub lid: usize,
    pub kind: Option<SendKind>,
    pub evid: EventId,
    pub len: usize,
}

type DropFilter = Box<dyn FnMut(&PacketInfo) -> bool + Send>;

#[derive(Default)]
struct Endpoint {
    claimed: bool,
    posted: VecDeque<(u64, Buffer)>,
    completions: VecDeque<Completion>,
}

struct ClusterState {
    endpoints: Vec<Endpoint>,
    drop_filter: Option<DropFilter>,
    dropped: u64,
    delivered: u64,
}

/// Shared medium of an in-process cluster.
#[derive(Clone)]
pub struct LoopbackCluster {
    state: Arc<Mutex<ClusterState>>,
    num_nodes: usize,
}

impl LoopbackCluster {
    pub fn new(num_nodes: usize) -> Self {
        let endpoints = (0..num_nodes).map(|_| Endpoint::default()).collect();
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                endpoints,
                drop_filter: None,
                dropped: 0,
                delivered: 0,
            })),
            num_nodes,
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Claim the endpoint of `node`; each endpoint is handed out once.
    pub fn endpoint(&self, node: usize) -> Result<LoopbackFabric> {
        let mut state = self.state.lock();
        let ep = state
            .endpoints
            .get_mut(node)
            .ok_or_else(|| BnetError::Fabric(format!("no node {} in cluster of {}", node, self.num_nodes)))?;
        if ep.claimed {
            return Err(BnetError::Fabric(format!("endpoint {} already claimed", node)));
        }
        ep.claimed = true;
        Ok(LoopbackFabric {
            cluster: self.clone(),
            node,
        })
    }

    /// Drop packets for which `filter` returns true.
    pub fn set_drop_filter<F>(&self, filter: F)
    where
        F: FnMut(&PacketInfo) -> bool + Send + 'static,
    {
        self.state.lock().drop_filter = Some(Box::new(filter));
    }

    /// Packets lost, by filter or for lack of a posted receive buffer.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub fn delivered(&self) -> u64 {
        self.state.lock().delivered
    }
}

/// Endpoint of one node in a [`LoopbackCluster`].
pub struct LoopbackFabric {
    cluster: LoopbackCluster,
    node: usize,
}

impl Fabric for LoopbackFabric {
    fn node(&self) -> usize {
        self.node
    }

    fn num_nodes(&self) -> usize {
        self.cluster.num_nodes
    }

    fn post_send(&mut self, target: usize, lid: usize, packet: Buffer, token: u64) -> Result<()> {
        if target >= self.cluster.num_nodes {
            return Err(BnetError::Fabric(format!("no target node {}", target)));
        }
        if packet.is_null() {
            return Err(BnetError::Fabric("null packet".into()));
        }
        let mut bytes = Vec::with_capacity(packet.total_size());
        bytes.extend_from_slice(packet.header());
        bytes.extend_from_slice(&packet.to_vec());
        drop(packet);

        let header = TransportHeader::decode(&bytes).ok();
        let info = PacketInfo {
            src: self.node,
            target,
            lid,
            kind: header.map(|h| h.kind),
            evid: header.map_or(EventId::NONE, |h| h.evid),
            len: bytes.len(),
        };

        let mut state = self.cluster.state.lock();
        let drop_it = state.drop_filter.as_mut().is_some_and(|f| f(&info));
        let delivered = if drop_it {
            false
        } else {
            match state.endpoints[target].posted.pop_front() {
                Some((rtoken, mut buffer)) => {
                    if fill(&mut buffer, &bytes) {
                        state.endpoints[target]
                            .completions
                            .push_back(Completion::Recv { token: rtoken, buffer });
                        true
                    } else {
                        log::warn!(
                            "[LoopbackFabric::post_send] {} byte packet does not fit receive buffer of node {}",
                            bytes.len(),
                            target
                        );
                        state.endpoints[target].posted.push_front((rtoken, buffer));
                        false
                    }
                }
                None => false,
            }
        };
        if delivered {
            state.delivered += 1;
        } else {
            state.dropped += 1;
            log::trace!(
                "[LoopbackFabric::post_send] packet {} -> {} evid {} lost",
                self.node,
                target,
                info.evid
            );
        }
        state.endpoints[self.node]
            .completions
            .push_back(Completion::Send { token, ok: true });
        Ok(())
    }

    fn post_recv(&mut self, mut buffer: Buffer, token: u64) -> Result<()> {
        if buffer.is_null() || !buffer.is_unique() {
            return Err(BnetError::Fabric("receive buffer must be exclusively owned".into()));
        }
        buffer.set_type_tag(0);
        self.cluster.state.lock().endpoints[self.node]
            .posted
            .push_back((token, buffer));
        Ok(())
    }

    fn posted_recvs(&self) -> usize {
        self.cluster.state.lock().endpoints[self.node].posted.len()
    }

    fn poll(&mut self, out: &mut Vec<Completion>, max: usize) -> usize {
        let mut state = self.cluster.state.lock();
        let queue = &mut state.endpoints[self.node].completions;
        let n = max.min(queue.len());
        out.extend(queue.drain(..n));
        n
    }
}

impl Drop for LoopbackFabric {
    fn drop(&mut self) {
        let mut state = self.cluster.state.lock();
        let ep = &mut state.endpoints[self.node];
        ep.posted.clear();
        ep.completions.clear();
        ep.claimed = false;
    }
}

fn fill(buffer: &mut Buffer, bytes: &[u8]) -> bool {
    if buffer.header_size() != 0 || buffer.capacity() < bytes.len() {
        return false;
    }
    match buffer.capacity_mut() {
        Ok(region) => region[..bytes.len()].copy_from_slice(bytes),
        Err(_) => return false,
    }
    buffer.set_data_len(bytes.len()).is_ok()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // test scaffolding
    use super::*;
    use hdaq::MemoryPool;

    fn packet(pool: &MemoryPool, src: u32, tgt: u32, evid: u64) -> Buffer {
        let mut buf = pool.take(4, TransportHeader::SIZE);
        let hdr = TransportHeader {
            srcnode: src,
            tgtnode: tgt,
            evid: EventId(evid),
            send_tm: 0.0,
            seqid: 1,
            kind: SendKind::Data,
            sendlen: 4,
        };
        hdr.encode(buf.header_mut().unwrap());
        buf.data_mut().unwrap().copy_from_slice(&[1, 2, 3, 4]);
        buf
    }

    #[test]
    fn packet_lands_in_posted_buffer() {
        let pool = MemoryPool::with_classes("fabric", &[(128, 8)]).unwrap();
        let cluster = LoopbackCluster::new(2);
        let mut a = cluster.endpoint(0).unwrap();
        let mut b = cluster.endpoint(1).unwrap();
        assert!(cluster.endpoint(1).is_err());

        b.post_recv(pool.take(128, 0), 7).unwrap();
        a.post_send(1, 0, packet(&pool, 0, 1, 5), 1).unwrap();

        let mut out = Vec::new();
        assert_eq!(a.poll(&mut out, 8), 1);
        assert!(matches!(out[0], Completion::Send { token: 1, ok: true }));

        out.clear();
        assert_eq!(b.poll(&mut out, 8), 1);
        let Completion::Recv { token, buffer } = out.pop().unwrap() else {
            panic!("expected receive completion");
        };
        assert_eq!(token, 7);
        assert_eq!(buffer.data_len(), TransportHeader::SIZE + 4);
        let hdr = TransportHeader::decode(buffer.data()).unwrap();
        assert_eq!(hdr.evid, EventId(5));
        assert_eq!(&buffer.data()[TransportHeader::SIZE..], &[1, 2, 3, 4]);
        assert_eq!(cluster.delivered(), 1);
    }

    #[test]
    fn send_without_posted_buffer_is_lost() {
        let pool = MemoryPool::with_classes("fabric", &[(128, 4)]).unwrap();
        let cluster = LoopbackCluster::new(2);
        let mut a = cluster.endpoint(0).unwrap();
        a.post_send(1, 0, packet(&pool, 0, 1, 1), 1).unwrap();
        assert_eq!(cluster.dropped(), 1);
        // the packet block went back to its pool
        assert_eq!(pool.stats().total_in_use(), 0);
    }

    #[test]
    fn drop_filter_selects_packets() {
        let pool = MemoryPool::with_classes("fabric", &[(128, 8)]).unwrap();
        let cluster = LoopbackCluster::new(2);
        cluster.set_drop_filter(|info| info.evid == EventId(2));
        let mut a = cluster.endpoint(0).unwrap();
        let mut b = cluster.endpoint(1).unwrap();
        b.post_recv(pool.take(128, 0), 1).unwrap();
        b.post_recv(pool.take(128, 0), 2).unwrap();

        for evid in 1..=3 {
            a.post_send(1, 0, packet(&pool, 0, 1, evid), evid).unwrap();
        }
        let mut out = Vec::new();
        b.poll(&mut out, 8);
        assert_eq!(out.len(), 2);
        assert_eq!(cluster.dropped(), 1);
        assert_eq!(b.posted_recvs(), 0);
    }

    #[test]
    fn dropping_endpoint_releases_posted_buffers() {
        let pool = MemoryPool::with_classes("fabric", &[(128, 4)]).unwrap();
        let cluster = LoopbackCluster::new(1);
        let mut a = cluster.endpoint(0).unwrap();
        a.post_recv(pool.take(128, 0), 1).unwrap();
        assert_eq!(pool.stats().total_in_use(), 1);
        drop(a);
        assert_eq!(pool.stats().total_in_use(), 0);
        assert!(cluster.endpoint(0).is_ok());
    }
}
