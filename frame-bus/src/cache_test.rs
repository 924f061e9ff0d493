use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, mpsc};
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::ConversionCache;
use crate::backend::ConversionStage;
use crate::error::StreamError;
use crate::frame::{DecodedSurface, FrameRequest, PixelFormat, RawFrame, Surface};
use crate::ring::DecodedRing;
use crate::stream::StreamParameters;

const WIDTH: u32 = 8;
const HEIGHT: u32 = 4;

fn params() -> StreamParameters {
    StreamParameters {
        frame_rate_num: 30,
        frame_rate_den: 1,
        width: WIDTH,
        height: HEIGHT,
    }
}

fn frame(sequence: u64) -> RawFrame {
    RawFrame::new(
        DecodedSurface {
            surface: Surface::from(Bytes::from(vec![
                sequence as u8;
                PixelFormat::Nv12.frame_size(WIDTH, HEIGHT)
            ])),
            pts: Some(sequence as i64),
            width: WIDTH,
            height: HEIGHT,
        },
        sequence,
    )
}

fn filled_ring(capacity: usize, frames: u64) -> DecodedRing {
    let ring = DecodedRing::new(capacity).unwrap();
    for sequence in 1..=frames {
        ring.insert(frame(sequence)).unwrap();
    }
    ring
}

/// Fills the output with the source sequence so tests can tell frames apart.
#[derive(Default)]
struct CountingConverter {
    calls: AtomicUsize,
    fail_with: Option<&'static str>,
    // conversions to this format block until the gate receives a message
    gate: Option<(PixelFormat, Mutex<mpsc::Receiver<()>>)>,
}

impl CountingConverter {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ConversionStage for CountingConverter {
    fn convert(
        &self,
        frame: &RawFrame,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> anyhow::Result<Surface> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.fail_with {
            anyhow::bail!(message);
        }
        if let Some((gated, gate)) = &self.gate {
            if *gated == format {
                gate.lock().unwrap().recv()?;
            }
        }
        Ok(Surface::from(Bytes::from(vec![
            frame.sequence() as u8;
            format.frame_size(width, height)
        ])))
    }
}

#[test]
fn test_zero_size_resolves_to_native() {
    let ring = filled_ring(3, 2);
    let cache = ConversionCache::new(&params());
    let converter = CountingConverter::default();

    let frame = cache
        .resolve(&ring, &converter, "a", &FrameRequest::new(0, PixelFormat::Rgb24), None)
        .unwrap();
    assert_eq!((frame.width(), frame.height()), (WIDTH, HEIGHT));
    assert_eq!(frame.surface().len(), (WIDTH * HEIGHT * 3) as usize);
    assert_eq!(frame.source_sequence(), 2);

    let request = FrameRequest::new(-1, PixelFormat::Y800).with_size(4, 0);
    let frame = cache.resolve(&ring, &converter, "a", &request, None).unwrap();
    assert_eq!((frame.width(), frame.height()), (4, HEIGHT));
    assert_eq!(frame.source_sequence(), 1);
}

#[test]
fn test_identical_request_is_served_from_cache() {
    let ring = filled_ring(3, 3);
    let cache = ConversionCache::new(&params());
    let converter = CountingConverter::default();
    let request = FrameRequest::new(-1, PixelFormat::Bgr24).with_size(4, 2);

    let first = cache.resolve(&ring, &converter, "a", &request, None).unwrap();
    let second = cache.resolve(&ring, &converter, "a", &request, None).unwrap();

    assert_eq!(converter.calls(), 1);
    assert_eq!(first.source_sequence(), 2);
    assert_eq!(second.source_sequence(), 2);
    assert!(first.surface().same_memory(second.surface()));
    assert_eq!(ring.pinned(), 0);
}

#[test]
fn test_new_frame_supersedes_cached_entry() {
    let ring = filled_ring(3, 1);
    let cache = ConversionCache::new(&params());
    let converter = CountingConverter::default();
    let request = FrameRequest::new(0, PixelFormat::Nv12);

    let first = cache.resolve(&ring, &converter, "a", &request, None).unwrap();
    ring.insert(frame(2)).unwrap();
    let second = cache.resolve(&ring, &converter, "a", &request, None).unwrap();

    assert_eq!(converter.calls(), 2);
    assert_eq!(first.source_sequence(), 1);
    assert_eq!(second.source_sequence(), 2);
    let cached = cache.cached("a").unwrap();
    assert!(cached.surface().same_memory(second.surface()));
}

#[test]
fn test_consumers_do_not_share_entries() {
    let ring = filled_ring(2, 2);
    let cache = ConversionCache::new(&params());
    let converter = CountingConverter::default();

    let a = cache
        .resolve(&ring, &converter, "a", &FrameRequest::new(0, PixelFormat::Rgb24), None)
        .unwrap();
    let b = cache
        .resolve(&ring, &converter, "b", &FrameRequest::new(0, PixelFormat::Y800), None)
        .unwrap();
    let a_again = cache
        .resolve(&ring, &converter, "a", &FrameRequest::new(0, PixelFormat::Rgb24), None)
        .unwrap();

    assert_eq!(converter.calls(), 2);
    assert_eq!(cache.consumers(), 2);
    assert_eq!(a.format(), PixelFormat::Rgb24);
    assert_eq!(b.format(), PixelFormat::Y800);
    assert!(!a.surface().same_memory(b.surface()));
    assert!(a.surface().same_memory(a_again.surface()));
    assert_eq!(cache.cached("b").unwrap().format(), PixelFormat::Y800);
}

#[test]
fn test_not_yet_decoded_is_not_ready() {
    let ring = filled_ring(5, 2);
    let cache = ConversionCache::new(&params());
    let converter = CountingConverter::default();

    let err = cache
        .resolve(&ring, &converter, "a", &FrameRequest::new(-3, PixelFormat::Rgb24), None)
        .unwrap_err();
    assert!(matches!(err, StreamError::NotReady(-3)));
    assert!(err.is_transient());

    let err = cache
        .resolve(&ring, &converter, "a", &FrameRequest::new(-5, PixelFormat::Rgb24), None)
        .unwrap_err();
    assert!(matches!(err, StreamError::OutOfRange { index: -5, .. }));
    assert_eq!(converter.calls(), 0);
}

#[test]
fn test_conversion_failure_releases_pin() {
    let ring = filled_ring(2, 2);
    let cache = ConversionCache::new(&params());
    let good = CountingConverter::default();
    let bad = CountingConverter {
        fail_with: Some("kernel launch failed"),
        ..Default::default()
    };

    let kept = cache
        .resolve(&ring, &good, "a", &FrameRequest::new(0, PixelFormat::Rgb24), None)
        .unwrap();
    let err = cache
        .resolve(&ring, &bad, "a", &FrameRequest::new(-1, PixelFormat::Rgb24), None)
        .unwrap_err();

    assert!(matches!(err, StreamError::ConversionFailed(_)));
    assert!(err.to_string().contains("kernel launch failed"));
    assert_eq!(ring.pinned(), 0);
    let cached = cache.cached("a").unwrap();
    assert!(cached.surface().same_memory(kept.surface()));
}

#[test]
fn test_fresh_wait_times_out_without_new_frame() {
    let ring = filled_ring(2, 1);
    let cache = ConversionCache::new(&params());
    let converter = CountingConverter::default();
    let request = FrameRequest::new(0, PixelFormat::Rgb24);
    let wait = Some(Duration::from_millis(30));

    // first request of a consumer never waits
    let first = cache.resolve(&ring, &converter, "a", &request, wait).unwrap();
    assert_eq!(first.source_sequence(), 1);

    let started = Instant::now();
    let err = cache.resolve(&ring, &converter, "a", &request, wait).unwrap_err();
    assert!(matches!(err, StreamError::NotReady(0)));
    assert!(started.elapsed() >= Duration::from_millis(30));

    ring.insert(frame(2)).unwrap();
    let next = cache.resolve(&ring, &converter, "a", &request, wait).unwrap();
    assert_eq!(next.source_sequence(), 2);

    ring.stop_producing();
    let retained = cache.resolve(&ring, &converter, "a", &request, wait).unwrap();
    assert_eq!(retained.source_sequence(), 2);
    assert_eq!(converter.calls(), 2);
}

#[test]
fn test_fresh_wait_wakes_on_insert() {
    let ring = filled_ring(2, 1);
    let cache = ConversionCache::new(&params());
    let converter = CountingConverter::default();
    let request = FrameRequest::new(0, PixelFormat::Rgb24);
    let wait = Some(Duration::from_secs(5));

    cache.resolve(&ring, &converter, "a", &request, wait).unwrap();
    std::thread::scope(|scope| {
        let ring = &ring;
        scope.spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            ring.insert(frame(2)).unwrap();
        });
        let next = cache.resolve(ring, &converter, "a", &request, wait).unwrap();
        assert_eq!(next.source_sequence(), 2);
    });
}

#[test]
fn test_slow_consumer_does_not_block_others() {
    let ring = filled_ring(3, 3);
    let cache = ConversionCache::new(&params());
    let (release_tx, release_rx) = mpsc::channel();
    let converter = CountingConverter {
        gate: Some((PixelFormat::Hsv, Mutex::new(release_rx))),
        ..Default::default()
    };

    std::thread::scope(|scope| {
        let (ring, cache, converter) = (&ring, &cache, &converter);
        let slow = scope.spawn(move || {
            cache.resolve(ring, converter, "slow", &FrameRequest::new(-2, PixelFormat::Hsv), None)
        });

        while converter.calls() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        let fast = cache
            .resolve(ring, converter, "fast", &FrameRequest::new(-2, PixelFormat::Rgb24), None)
            .unwrap();
        assert_eq!(fast.source_sequence(), 1);
        assert_eq!(ring.pinned(), 1);

        release_tx.send(()).unwrap();
        let slow = slow.join().unwrap().unwrap();
        assert_eq!(slow.format(), PixelFormat::Hsv);
    });
    assert_eq!(ring.pinned(), 0);
}

#[test]
fn test_clear_rejects_later_requests() {
    let ring = filled_ring(2, 2);
    let cache = ConversionCache::new(&params());
    let converter = CountingConverter::default();
    let request = FrameRequest::new(0, PixelFormat::Rgb24);

    cache.resolve(&ring, &converter, "a", &request, None).unwrap();
    cache.clear();

    assert_eq!(cache.consumers(), 0);
    assert!(cache.cached("a").is_none());
    assert!(matches!(
        cache.resolve(&ring, &converter, "a", &request, None),
        Err(StreamError::PipelineClosed)
    ));
}

#[test]
fn test_conversion_finishing_after_release_is_discarded() {
    let ring = filled_ring(2, 2);
    let cache = ConversionCache::new(&params());
    let (release_tx, release_rx) = mpsc::channel();
    let converter = CountingConverter {
        gate: Some((PixelFormat::Hsv, Mutex::new(release_rx))),
        ..Default::default()
    };

    std::thread::scope(|scope| {
        let (ring, cache, converter) = (&ring, &cache, &converter);
        let pending = scope.spawn(move || {
            cache.resolve(ring, converter, "a", &FrameRequest::new(0, PixelFormat::Hsv), None)
        });

        while converter.calls() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        // the ring goes away while the cache itself is still open
        assert_eq!(ring.release().len(), 2);
        release_tx.send(()).unwrap();

        let result = pending.join().unwrap();
        assert!(matches!(result, Err(StreamError::PipelineClosed)));
    });
    assert!(cache.cached("a").is_none());
}
