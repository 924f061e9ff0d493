use std::sync::mpsc;
use std::time::Duration;

use bytes::Bytes;

use super::{DecodedRing, Freshness};
use crate::error::StreamError;
use crate::frame::{DecodedSurface, RawFrame, Surface};

fn frame(sequence: u64) -> RawFrame {
    RawFrame::new(
        DecodedSurface {
            surface: Surface::from(Bytes::from(vec![sequence as u8; 6])),
            pts: Some(sequence as i64),
            width: 2,
            height: 2,
        },
        sequence,
    )
}

#[test]
fn test_zero_capacity_is_rejected() {
    assert!(matches!(
        DecodedRing::new(0),
        Err(StreamError::Configuration(_))
    ));
}

#[test]
fn test_newest_and_oldest_track_inserts() {
    for capacity in 1..=6usize {
        let ring = DecodedRing::new(capacity).unwrap();
        for sequence in 1..=(capacity as u64 * 3) {
            ring.insert(frame(sequence)).unwrap();

            assert_eq!(ring.get(0).unwrap().sequence(), sequence);
            let oldest = -(capacity as i32 - 1);
            if sequence >= capacity as u64 {
                assert_eq!(
                    ring.get(oldest).unwrap().sequence(),
                    sequence - (capacity as u64 - 1)
                );
            } else if capacity > 1 {
                assert!(matches!(
                    ring.get(oldest),
                    Err(StreamError::OutOfRange { .. })
                ));
            }
        }
        assert_eq!(ring.len(), capacity);
        assert_eq!(ring.pinned(), 0);
    }
}

#[test]
fn test_index_outside_window_is_out_of_range() {
    for capacity in 1..=5usize {
        let ring = DecodedRing::new(capacity).unwrap();
        for sequence in 1..=capacity as u64 {
            ring.insert(frame(sequence)).unwrap();
        }
        for index in [1, 7, -(capacity as i32), -(capacity as i32) - 3, i32::MIN] {
            assert!(!ring.in_window(index));
            match ring.get(index) {
                Err(StreamError::OutOfRange {
                    index: got,
                    capacity: cap,
                    retained,
                }) => {
                    assert_eq!(got, index);
                    assert_eq!(cap, capacity);
                    assert_eq!(retained, capacity);
                }
                Err(other) => panic!("unexpected error {other}"),
                Ok(pinned) => panic!("index {index} resolved to {}", pinned.sequence()),
            }
        }
    }
}

#[test]
fn test_empty_ring_reports_out_of_range() {
    let ring = DecodedRing::new(3).unwrap();
    assert!(ring.is_empty());
    assert!(ring.in_window(0));
    assert!(matches!(
        ring.get(0),
        Err(StreamError::OutOfRange { retained: 0, .. })
    ));
}

#[test]
fn test_insert_returns_evicted_oldest() {
    let ring = DecodedRing::new(2).unwrap();
    assert!(ring.insert(frame(1)).unwrap().is_none());
    assert!(ring.insert(frame(2)).unwrap().is_none());
    let evicted = ring.insert(frame(3)).unwrap().unwrap();
    assert_eq!(evicted.sequence(), 1);
    assert_eq!(ring.newest_sequence(), Some(3));
}

#[test]
fn test_pin_is_released_on_drop() {
    let ring = DecodedRing::new(3).unwrap();
    ring.insert(frame(1)).unwrap();
    {
        let a = ring.get(0).unwrap();
        let b = ring.get(0).unwrap();
        assert_eq!(a.sequence(), b.sequence());
        assert_eq!(ring.pinned(), 2);
    }
    assert_eq!(ring.pinned(), 0);
}

#[test]
fn test_insert_waits_for_pinned_oldest() {
    let ring = DecodedRing::new(2).unwrap();
    ring.insert(frame(1)).unwrap();
    ring.insert(frame(2)).unwrap();

    let pinned = ring.get(-1).unwrap();
    assert_eq!(pinned.sequence(), 1);

    std::thread::scope(|scope| {
        let (done_tx, done_rx) = mpsc::channel();
        let ring = &ring;
        scope.spawn(move || {
            let evicted = ring.insert(frame(3)).unwrap();
            let _ = done_tx.send(evicted.map(|f| f.sequence()));
        });

        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(pinned);
        let evicted = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(evicted, Some(1));
    });

    assert_eq!(ring.get(0).unwrap().sequence(), 3);
    assert_eq!(ring.get(-1).unwrap().sequence(), 2);
}

#[test]
fn test_pinning_newer_frames_does_not_block_insert() {
    let ring = DecodedRing::new(3).unwrap();
    for sequence in 1..=3 {
        ring.insert(frame(sequence)).unwrap();
    }
    let newest = ring.get(0).unwrap();
    let evicted = ring.insert(frame(4)).unwrap();
    assert_eq!(evicted.map(|f| f.sequence()), Some(1));
    assert_eq!(newest.sequence(), 3);
}

#[test]
fn test_release_closes_ring() {
    let ring = DecodedRing::new(2).unwrap();
    ring.insert(frame(1)).unwrap();
    ring.insert(frame(2)).unwrap();
    let pinned = ring.get(0).unwrap();

    let released = ring.release();
    assert_eq!(released.len(), 2);
    assert!(ring.is_closed());
    assert_eq!(ring.pinned(), 0);
    assert_eq!(ring.newest_sequence(), Some(2));

    // guard from before the release stays readable and is inert on drop
    assert_eq!(pinned.sequence(), 2);
    drop(pinned);
    assert_eq!(ring.pinned(), 0);

    assert!(matches!(ring.get(0), Err(StreamError::PipelineClosed)));
    assert!(matches!(
        ring.insert(frame(3)),
        Err(StreamError::PipelineClosed)
    ));
    assert!(ring.release().is_empty());
}

#[test]
fn test_release_wakes_blocked_insert() {
    let ring = DecodedRing::new(1).unwrap();
    ring.insert(frame(1)).unwrap();
    let pinned = ring.get(0).unwrap();

    std::thread::scope(|scope| {
        let (done_tx, done_rx) = mpsc::channel();
        let ring = &ring;
        scope.spawn(move || {
            let _ = done_tx.send(ring.insert(frame(2)).is_err());
        });
        assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
        ring.release();
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    });
    drop(pinned);
}

#[test]
fn test_wait_for_newer() {
    let ring = DecodedRing::new(2).unwrap();
    assert_eq!(
        ring.wait_for_newer(None, Duration::from_millis(10)).unwrap(),
        Freshness::TimedOut
    );

    ring.insert(frame(1)).unwrap();
    assert_eq!(
        ring.wait_for_newer(None, Duration::ZERO).unwrap(),
        Freshness::Newer
    );

    std::thread::scope(|scope| {
        let ring = &ring;
        scope.spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            ring.insert(frame(2)).unwrap();
        });
        assert_eq!(
            ring.wait_for_newer(Some(1), Duration::from_secs(5)).unwrap(),
            Freshness::Newer
        );
    });

    ring.stop_producing();
    assert_eq!(
        ring.wait_for_newer(Some(2), Duration::from_secs(5)).unwrap(),
        Freshness::Stopped
    );

    ring.release();
    assert!(matches!(
        ring.wait_for_newer(Some(2), Duration::from_secs(5)),
        Err(StreamError::PipelineClosed)
    ));
}

#[test]
fn test_wait_unpinned() {
    let ring = DecodedRing::new(2).unwrap();
    ring.insert(frame(1)).unwrap();
    let pinned = ring.get(0).unwrap();

    std::thread::scope(|scope| {
        let (done_tx, done_rx) = mpsc::channel();
        let ring = &ring;
        scope.spawn(move || {
            ring.wait_unpinned();
            let _ = done_tx.send(());
        });
        assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(pinned);
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    });
}
