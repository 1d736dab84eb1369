// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::unwrap_used)] // test scaffolding

use super::{AsyncTake, Buffer, MemoryPool, PoolRequester, RequestId};
use crate::error::{Error, WaitError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn take_picks_smallest_fitting_class() {
    let pool = MemoryPool::with_classes("pool", &[(4096, 2), (256, 2), (1024, 2)]).expect("pool");

    let small = pool.take(100, 0);
    assert_eq!(small.capacity(), 256);
    let medium = pool.take(300, 0);
    assert_eq!(medium.capacity(), 1024);
    assert_eq!(medium.data_len(), 300);
}

#[test]
fn take_falls_back_to_larger_class() {
    let pool = MemoryPool::with_classes("pool", &[(256, 1), (1024, 1)]).expect("pool");

    let first = pool.take(200, 0);
    let second = pool.take(200, 0);
    assert_eq!(first.capacity(), 256);
    assert_eq!(second.capacity(), 1024);
    assert!(pool.take(200, 0).is_null());
}

#[test]
fn oversized_request_is_explicit_failure() {
    let pool = MemoryPool::with_classes("pool", &[(256, 4)]).expect("pool");
    assert!(pool.take(512, 0).is_null());
    assert!(matches!(
        pool.try_take(512, 0),
        Err(Error::PoolExhausted { size: 512, .. })
    ));
    assert!(matches!(
        pool.take_blocking(512, 0, Some(Duration::from_millis(1))),
        Err(WaitError::Failed(_))
    ));
    assert_eq!(pool.stats().failed_takes, 2);
}

#[test]
fn header_reserves_space_in_front_of_payload() {
    let pool = MemoryPool::with_classes("pool", &[(64, 1)]).expect("pool");
    let mut buf = pool.take(16, 8);
    assert_eq!(buf.header_size(), 8);
    assert_eq!(buf.capacity(), 56);

    buf.header_mut().unwrap().copy_from_slice(&[7u8; 8]);
    buf.data_mut().unwrap().copy_from_slice(&[1u8; 16]);
    assert_eq!(buf.header(), &[7u8; 8]);
    assert_eq!(buf.data(), &[1u8; 16]);
    assert_eq!(buf.total_size(), 24);
}

#[test]
fn duplicate_keeps_memory_until_last_release() {
    let pool = MemoryPool::with_classes("pool", &[(128, 1)]).expect("pool");
    let mut a = pool.take(128, 0);
    let ptr = a.data().as_ptr();
    let mut b = a.duplicate();
    assert_eq!(a.ref_count(), 2);
    assert_eq!(pool.stats().total_in_use(), 1);

    a.release();
    a.release();
    assert!(a.is_null());
    assert!(a.data().is_empty());
    assert_eq!(pool.stats().total_in_use(), 1);
    assert!(pool.take(16, 0).is_null());

    b.release();
    assert_eq!(pool.stats().total_in_use(), 0);
    let c = pool.take(16, 0);
    assert_eq!(c.data().as_ptr(), ptr);
}

#[test]
fn shared_buffer_denies_mutation() {
    let pool = MemoryPool::with_classes("pool", &[(64, 2)]).expect("pool");
    let mut a = pool.take(32, 0);
    let b = a.clone();
    assert!(matches!(a.data_mut(), Err(Error::BufferShared)));

    a.make_unique().expect("copy");
    assert!(a.is_unique());
    a.data_mut().unwrap()[0] = 0xAA;
    assert_ne!(a.data()[0], b.data()[0]);
    assert_eq!(pool.stats().total_in_use(), 2);
}

#[test]
fn released_buffer_reports_errors() {
    let mut buf = Buffer::empty();
    assert!(buf.is_null());
    assert!(matches!(buf.data_mut(), Err(Error::BufferReleased)));
    assert!(matches!(buf.set_data_len(1), Err(Error::BufferReleased)));
    buf.release();
    assert_eq!(buf.data_len(), 0);
}

#[test]
fn set_data_len_is_bounded_by_capacity() {
    let pool = MemoryPool::with_classes("pool", &[(64, 1)]).expect("pool");
    let mut buf = pool.take(8, 4);
    buf.set_data_len(60).expect("fits");
    assert!(matches!(
        buf.set_data_len(61),
        Err(Error::BufferTooSmall { need: 61, have: 60 })
    ));
}

#[test]
fn header_boundary_moves_in_place() {
    let pool = MemoryPool::with_classes("pool", &[(64, 1)]).expect("pool");
    let mut buf = pool.take(20, 0);
    buf.data_mut().unwrap()[..8].copy_from_slice(&42u64.to_le_bytes());
    buf.set_header_size(8).unwrap();
    assert_eq!(buf.header(), &42u64.to_le_bytes());
    assert_eq!(buf.data_len(), 12);
    assert_eq!(buf.capacity(), 56);
    assert!(matches!(
        buf.set_header_size(65),
        Err(Error::BufferTooSmall { need: 65, have: 64 })
    ));
}

#[test]
fn append_gathers_segments_without_copy() {
    let pool = MemoryPool::with_classes("pool", &[(64, 4)]).expect("pool");
    let mut a = pool.take(4, 2);
    a.data_mut().unwrap().copy_from_slice(b"abcd");
    let mut b = pool.take(3, 2);
    b.data_mut().unwrap().copy_from_slice(b"efg");

    a.append(b).expect("append");
    assert_eq!(a.num_segments(), 2);
    assert_eq!(a.data_len(), 7);
    assert_eq!(a.to_vec(), b"abcdefg");

    a.make_unique().expect("flatten");
    assert_eq!(a.num_segments(), 1);
    assert_eq!(a.data(), b"abcdefg");
    assert_eq!(pool.stats().total_in_use(), 1);
}

#[test]
fn lazy_class_allocates_on_demand() {
    let pool = MemoryPool::new("lazy");
    pool.allocate_class(256, 3, false).expect("class");
    assert_eq!(pool.stats().classes[0].allocated, 0);

    let a = pool.take(10, 0);
    let b = pool.take(10, 0);
    assert_eq!(pool.stats().classes[0].allocated, 2);
    drop(a);
    let _c = pool.take(10, 0);
    assert_eq!(pool.stats().classes[0].allocated, 2);
    drop(b);
}

#[test]
fn allocate_class_rejects_duplicates_and_empty() {
    let pool = MemoryPool::new("pool");
    pool.allocate_class(128, 2, true).expect("class");
    assert!(matches!(
        pool.allocate_class(128, 4, true),
        Err(Error::AlreadyExists(_))
    ));
    assert!(matches!(pool.allocate_class(0, 4, true), Err(Error::Config(_))));
}

#[test]
fn fifth_blocking_take_waits_for_release() {
    let pool = MemoryPool::with_classes("pool", &[(1024, 4)]).expect("pool");

    let held: Vec<Buffer> = (0..4)
        .map(|_| {
            pool.take_blocking(1024, 0, Some(Duration::from_millis(10)))
                .expect("immediate")
        })
        .collect();

    let waiter_pool = pool.clone();
    let started = Instant::now();
    let waiter = thread::spawn(move || {
        let buf = waiter_pool
            .take_blocking(1024, 0, Some(Duration::from_secs(5)))
            .expect("after release");
        (buf.data().as_ptr() as usize, started.elapsed())
    });

    thread::sleep(Duration::from_millis(50));
    let freed_ptr = held[2].data().as_ptr() as usize;
    let mut held = held;
    held.remove(2);

    let (ptr, waited) = waiter.join().expect("waiter thread");
    assert_eq!(ptr, freed_ptr);
    assert!(waited >= Duration::from_millis(40));
}

#[test]
fn blocking_take_times_out() {
    let pool = MemoryPool::with_classes("pool", &[(64, 1)]).expect("pool");
    let _held = pool.take(64, 0);
    assert_eq!(
        pool.take_blocking(64, 0, Some(Duration::from_millis(20))).unwrap_err(),
        WaitError::TimedOut
    );
}

#[derive(Default)]
struct Collector {
    got: Mutex<Vec<(RequestId, Buffer)>>,
}

impl PoolRequester for Collector {
    fn buffer_available(&self, id: RequestId, buffer: Buffer) -> Result<(), Buffer> {
        self.got.lock().push((id, buffer));
        Ok(())
    }
}

struct Rejector;

impl PoolRequester for Rejector {
    fn buffer_available(&self, _id: RequestId, buffer: Buffer) -> Result<(), Buffer> {
        Err(buffer)
    }
}

#[test]
fn async_take_notifies_on_release_in_order() {
    let pool = MemoryPool::with_classes("pool", &[(256, 1)]).expect("pool");
    let collector = Arc::new(Collector::default());

    let AsyncTake::Ready(first) = pool.take_async(collector.clone(), 100, 0) else {
        panic!("first take should be immediate");
    };
    let AsyncTake::Queued(id_a) = pool.take_async(collector.clone(), 100, 0) else {
        panic!("pool exhausted");
    };
    let AsyncTake::Queued(id_b) = pool.take_async(collector.clone(), 100, 0) else {
        panic!("pool exhausted");
    };
    assert_eq!(pool.stats().pending_requests, 2);

    drop(first);
    {
        let got = collector.got.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, id_a);
        assert_eq!(got[0].1.data_len(), 100);
    }

    let (_, buf) = collector.got.lock().remove(0);
    drop(buf);
    assert_eq!(collector.got.lock()[0].0, id_b);
    assert_eq!(pool.stats().pending_requests, 0);
}

#[test]
fn async_take_impossible_and_cancel() {
    let pool = MemoryPool::with_classes("pool", &[(64, 1)]).expect("pool");
    let collector = Arc::new(Collector::default());
    assert!(matches!(
        pool.take_async(collector.clone(), 65, 0),
        AsyncTake::Impossible
    ));

    let _held = pool.take(64, 0);
    let AsyncTake::Queued(id) = pool.take_async(collector.clone(), 8, 0) else {
        panic!("should queue");
    };
    assert!(pool.cancel_request(id));
    assert!(!pool.cancel_request(id));
}

#[test]
fn rejected_async_delivery_returns_block() {
    let pool = MemoryPool::with_classes("pool", &[(64, 1)]).expect("pool");
    let held = pool.take(64, 0);
    assert!(matches!(
        pool.take_async(Arc::new(Rejector), 8, 0),
        AsyncTake::Queued(_)
    ));
    drop(held);
    assert_eq!(pool.stats().total_in_use(), 0);
    assert!(!pool.take(8, 0).is_null());
}

#[test]
fn random_duplicate_release_returns_each_block_once() {
    let pool = MemoryPool::with_classes("pool", &[(32, 8)]).expect("pool");
    let mut rng = fastrand::Rng::with_seed(7);
    let mut handles: Vec<Buffer> = Vec::new();

    for _ in 0..2000 {
        match rng.u8(0..3) {
            0 => {
                let buf = pool.take(16, 0);
                if !buf.is_null() {
                    handles.push(buf);
                }
            }
            1 if !handles.is_empty() => {
                let idx = rng.usize(0..handles.len());
                let dup = handles[idx].duplicate();
                handles.push(dup);
            }
            _ if !handles.is_empty() => {
                let idx = rng.usize(0..handles.len());
                handles.swap_remove(idx);
            }
            _ => {}
        }

        let mut live: Vec<usize> = handles.iter().map(|h| h.data().as_ptr() as usize).collect();
        live.sort_unstable();
        live.dedup();
        assert_eq!(pool.stats().total_in_use(), live.len());
    }

    handles.clear();
    assert_eq!(pool.stats().total_in_use(), 0);
}

#[test]
fn blocking_take_ignores_queued_requests_it_cannot_starve() {
    let pool = MemoryPool::with_classes("pool", &[(64, 2), (1024, 1)]).expect("pool");
    let collector = Arc::new(Collector::default());

    let _big = pool.take(1000, 0);
    let AsyncTake::Queued(_) = pool.take_async(collector.clone(), 1000, 0) else {
        panic!("large class exhausted");
    };

    // A 64-byte block is useless to the queued 1000-byte request.
    let small = pool
        .take_blocking(32, 0, Some(Duration::from_millis(20)))
        .expect("small class is free");
    assert_eq!(small.capacity(), 64);
    assert!(collector.got.lock().is_empty());
    assert_eq!(pool.stats().pending_requests, 1);
}

#[test]
fn blocking_take_yields_to_queued_request_that_fits() {
    let pool = MemoryPool::with_classes("pool", &[(64, 1), (1024, 1)]).expect("pool");
    let collector = Arc::new(Collector::default());

    let big = pool.take(1000, 0);
    let AsyncTake::Queued(id_big) = pool.take_async(collector.clone(), 1000, 0) else {
        panic!("large class exhausted");
    };
    // Queued behind the first request although the small block is free.
    let AsyncTake::Queued(id_small) = pool.take_async(collector.clone(), 16, 0) else {
        panic!("queue is not empty");
    };

    assert_eq!(
        pool.take_blocking(16, 0, Some(Duration::from_millis(20))).unwrap_err(),
        WaitError::TimedOut
    );

    drop(big);
    let got: Vec<RequestId> = collector.got.lock().iter().map(|(id, _)| *id).collect();
    assert_eq!(got, vec![id_big, id_small]);
    assert_eq!(pool.stats().pending_requests, 0);
}
