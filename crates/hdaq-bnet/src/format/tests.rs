// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::unwrap_used)] // test scaffolding

use super::*;
use hdaq::MemoryPool;

fn pool() -> MemoryPool {
    MemoryPool::with_classes("format", &[(512, 8)]).unwrap()
}

fn write_events(pool: &MemoryPool, counts: &[u32]) -> hdaq::Buffer {
    let mut w = EventWriter::new(pool.take(512, 0), 7).unwrap();
    for &count in counts {
        w.start_event(EventHeader::new(count)).unwrap();
        w.add_subevent(SubeventHeader::new(1), &[count as u8; 10]).unwrap();
        w.add_subevent(SubeventHeader::new(2), &[0xEE; 6]).unwrap();
        w.finish_event().unwrap();
    }
    w.finish().unwrap()
}

#[test]
fn written_events_read_back() {
    let pool = pool();
    let buf = write_events(&pool, &[1, 2, 3]);
    assert_eq!(buf.type_tag(), BUFFER_TYPE_EVENTS);

    let it = EventIterator::new(buf.data()).unwrap();
    assert_eq!(it.header().num_events, 3);
    assert_eq!(it.header().buffer_id, 7);
    assert_eq!(it.header().used_size as usize, buf.data_len());

    let events: Vec<_> = it.map(|e| e.unwrap()).collect();
    assert_eq!(events.iter().map(EventView::count).collect::<Vec<_>>(), vec![1, 2, 3]);

    let expected_size = EventHeader::SIZE + 2 * SubeventHeader::SIZE + 16;
    for ev in &events {
        assert_eq!(ev.header.full_size as usize, expected_size);
        let subs: Vec<_> = ev.subevents().map(|s| s.unwrap()).collect();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].header.proc_id, 1);
        assert_eq!(subs[0].payload(), &[ev.count() as u8; 10]);
        assert_eq!(subs[1].payload().len(), 6);
    }
}

#[test]
fn truncated_event_is_reported_once() {
    let pool = pool();
    let buf = write_events(&pool, &[1, 2]);
    let mut bytes = buf.to_vec();
    // Shrink used size so the second event overruns it.
    let used = rd_u32(&bytes, 8) - 4;
    wr_u32(&mut bytes, 8, used);

    let mut it = EventIterator::new(&bytes).unwrap();
    assert!(it.next().unwrap().is_ok());
    assert!(matches!(it.next(), Some(Err(BnetError::Format(_)))));
    assert!(it.next().is_none());
}

#[test]
fn event_count_mismatch_detected() {
    let pool = pool();
    let buf = write_events(&pool, &[4]);
    let mut bytes = buf.to_vec();
    wr_u32(&mut bytes, 12, 2);
    let results: Vec<_> = EventIterator::new(&bytes).unwrap().collect();
    assert_eq!(results.len(), 2);
    assert!(results[1].is_err());
}

#[test]
fn header_outside_payload_rejected() {
    assert!(BufferHeader::parse(&[0u8; 10]).is_err());
    let mut raw = [0u8; 24];
    wr_u32(&mut raw, 8, 100);
    assert!(BufferHeader::parse(&raw).is_err());
}

#[test]
fn writer_refuses_overflow_and_keeps_state() {
    let pool = MemoryPool::with_classes("small", &[(64, 1)]).unwrap();
    let mut w = EventWriter::new(pool.take(64, 0), 0).unwrap();
    assert_eq!(w.remaining(), 64 - BufferHeader::SIZE);
    assert!(w.is_place_for_event(24));
    assert!(!w.is_place_for_event(25));

    w.start_event(EventHeader::new(1)).unwrap();
    assert!(w.add_subevent(SubeventHeader::new(0), &[0; 20]).is_err());
    w.add_subevent(SubeventHeader::new(0), &[0; 8]).unwrap();
    assert!(w.finish().is_err());
}

#[test]
fn discard_restores_position() {
    let pool = pool();
    let mut w = EventWriter::new(pool.take(512, 0), 0).unwrap();
    let before = w.remaining();
    w.start_event(EventHeader::new(9)).unwrap();
    w.add_subevent(SubeventHeader::new(3), &[1, 2, 3]).unwrap();
    w.discard_event();
    assert_eq!(w.remaining(), before);
    assert!(w.is_empty());
    let buf = w.finish().unwrap();
    assert_eq!(EventIterator::new(buf.data()).unwrap().count(), 0);
}

#[test]
fn raw_event_copy_keeps_bytes() {
    let pool = pool();
    let src = write_events(&pool, &[5]);
    let ev = EventIterator::new(src.data()).unwrap().next().unwrap().unwrap();

    let mut w = EventWriter::new(pool.take(512, 0), 1).unwrap();
    w.add_raw_event(ev.bytes).unwrap();
    assert!(w.add_raw_event(&ev.bytes[..20]).is_err());
    let out = w.finish().unwrap();

    let copy = EventIterator::new(out.data()).unwrap().next().unwrap().unwrap();
    assert_eq!(copy.bytes, ev.bytes);
}

#[test]
fn eof_marker_carries_no_events() {
    let pool = pool();
    let buf = EventWriter::new(pool.take(64, 0), 3).unwrap().finish_eof().unwrap();
    assert_eq!(buf.type_tag(), BUFFER_TYPE_EOF);
    assert_eq!(buf.data_len(), BufferHeader::SIZE);
    let hdr = BufferHeader::parse(buf.data()).unwrap();
    assert!(hdr.is_eof());
    assert_eq!(hdr.num_events, 0);
}

#[test]
fn trigger_helpers() {
    let h = EventHeader::new(1).with_trigger(TRIGGER_STOP_ACQ);
    assert!(h.is_stop_acq());
    assert!(!h.is_start_acq());
    assert!(EventHeader::new(1).with_trigger(TRIGGER_START_ACQ).is_start_acq());
}
