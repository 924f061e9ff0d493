use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{
    backend::ConversionStage,
    error::{Result, StreamError},
    frame::{FrameRequest, ProcessedFrame},
    ring::{DecodedRing, Freshness},
    stream::StreamParameters,
};

#[derive(Default)]
struct ConsumerSlot {
    frame: Option<ProcessedFrame>,
    // newest decoded sequence when this consumer was last served
    seen_newest: Option<u64>,
}

/// Per-consumer converted frames, filled on demand from the decoded ring.
///
/// Every consumer name owns one slot behind its own lock, so consumers never
/// wait on each other; the map lock is only held to find or create a slot.
pub struct ConversionCache {
    native_width: u32,
    native_height: u32,
    slots: Mutex<HashMap<String, Arc<Mutex<ConsumerSlot>>>>,
    closed: AtomicBool,
}

impl ConversionCache {
    pub fn new(params: &StreamParameters) -> Self {
        Self {
            native_width: params.width,
            native_height: params.height,
            slots: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn consumers(&self) -> usize {
        self.slots.lock().len()
    }

    /// The frame currently held for `consumer`, if any.
    pub fn cached(&self, consumer: &str) -> Option<ProcessedFrame> {
        let slot = self.slots.lock().get(consumer).cloned()?;
        let frame = slot.lock().frame.clone();
        frame
    }

    /// Converts the frame at `request.index` for `consumer`, reusing the
    /// consumer's cached result when it already matches.
    ///
    /// With `fresh_wait`, a consumer that has already been served waits up
    /// to that long for a frame newer than the one it last saw.
    pub fn resolve(
        &self,
        ring: &DecodedRing,
        converter: &dyn ConversionStage,
        consumer: &str,
        request: &FrameRequest,
        fresh_wait: Option<Duration>,
    ) -> Result<ProcessedFrame> {
        let slot = self.slot(consumer)?;
        let mut slot = slot.lock();

        if let (Some(timeout), Some(seen)) = (fresh_wait, slot.seen_newest) {
            if ring.wait_for_newer(Some(seen), timeout)? == Freshness::TimedOut {
                return Err(StreamError::NotReady(request.index));
            }
        }

        let pinned = ring.get(request.index).map_err(|err| match err {
            StreamError::OutOfRange { .. } if ring.in_window(request.index) => {
                StreamError::NotReady(request.index)
            }
            err => err,
        })?;
        let (width, height) = request.target_size(self.native_width, self.native_height);

        let hit = slot
            .frame
            .as_ref()
            .filter(|cached| cached.matches(pinned.sequence(), request.format, width, height))
            .cloned();
        if let Some(cached) = hit {
            slot.seen_newest = Some(pinned.newest_sequence());
            return Ok(cached);
        }

        log::debug!(
            "cache: converting frame {} for {} to {} {}x{}",
            pinned.sequence(),
            consumer,
            request.format,
            width,
            height
        );
        let surface = converter
            .convert(pinned.frame(), request.format, width, height)
            .map_err(StreamError::ConversionFailed)?;
        let processed =
            ProcessedFrame::new(surface, pinned.sequence(), request.format, width, height);
        let newest = pinned.newest_sequence();
        drop(pinned);

        if self.closed.load(Ordering::Acquire) || ring.is_closed() {
            return Err(StreamError::PipelineClosed);
        }
        slot.frame = Some(processed.clone());
        slot.seen_newest = Some(newest);
        Ok(processed)
    }

    /// Drops every cached frame without waiting for in-flight requests;
    /// those finish against their own slot and then report `PipelineClosed`.
    pub fn clear(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<_> = self.slots.lock().drain().collect();
        log::debug!("cache: released {} consumer slot(s)", drained.len());
    }

    fn slot(&self, consumer: &str) -> Result<Arc<Mutex<ConsumerSlot>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::PipelineClosed);
        }
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(consumer) {
            return Ok(slot.clone());
        }
        log::debug!("cache: new consumer {}", consumer);
        Ok(slots.entry(consumer.to_string()).or_default().clone())
    }
}

#[cfg(test)]
#[path = "cache_test.rs"]
mod cache_test;
