//! Bounded store of the most recent decoded frames.
//!
//! The ring is a fixed arena of `capacity` slots written round-robin by the
//! decode thread. Consumers address frames relative to the newest one
//! (`0` newest, `-(capacity - 1)` oldest) and pin the slot for as long as
//! they hold the returned [`PinnedFrame`]. The writer never overwrites a
//! pinned slot: it waits for the pin to drop, which bounds the number of
//! live decoder surfaces to the ring capacity.

use std::ops::Deref;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{
    error::{Result, StreamError},
    frame::RawFrame,
};

struct Slot {
    frame: RawFrame,
    pins: usize,
}

struct RingState {
    slots: Vec<Option<Slot>>,
    // slot the next insert writes to; the newest frame sits just before it
    next: usize,
    len: usize,
    newest: Option<u64>,
    pinned: usize,
    // bumped on release so guards taken before it become inert
    generation: u64,
    producing: bool,
    closed: bool,
}

/// Outcome of [`DecodedRing::wait_for_newer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    Newer,
    /// No newer frame will arrive: production has stopped.
    Stopped,
    TimedOut,
}

pub struct DecodedRing {
    capacity: usize,
    state: Mutex<RingState>,
    changed: Condvar,
}

impl DecodedRing {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(StreamError::Configuration(
                "decoded ring capacity must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            capacity,
            state: Mutex::new(RingState {
                slots: (0..capacity).map(|_| None).collect(),
                next: 0,
                len: 0,
                newest: None,
                pinned: 0,
                generation: 0,
                producing: true,
                closed: false,
            }),
            changed: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence of the most recently inserted frame. Kept after release.
    pub fn newest_sequence(&self) -> Option<u64> {
        self.state.lock().newest
    }

    /// Number of outstanding pins across all slots.
    pub fn pinned(&self) -> usize {
        self.state.lock().pinned
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether `index` is addressable at all, i.e. lies in `[-(capacity - 1), 0]`.
    pub fn in_window(&self, index: i32) -> bool {
        index <= 0 && (index.unsigned_abs() as usize) < self.capacity
    }

    /// Appends the newest frame and returns the evicted oldest one, if the
    /// ring was full. Blocks while the oldest slot is pinned.
    pub fn insert(&self, frame: RawFrame) -> Result<Option<RawFrame>> {
        let mut state = self.state.lock();
        debug_assert!(
            state.newest.is_none_or(|newest| frame.sequence() > newest),
            "frames must be inserted in sequence order"
        );

        loop {
            if state.closed {
                return Err(StreamError::PipelineClosed);
            }
            let pins = state.slots[state.next]
                .as_ref()
                .map_or(0, |slot| slot.pins);
            if pins == 0 {
                break;
            }
            log::debug!("ring: oldest frame pinned by {} consumer(s), waiting", pins);
            self.changed.wait(&mut state);
        }

        let at = state.next;
        let sequence = frame.sequence();
        let evicted = state.slots[at]
            .replace(Slot { frame, pins: 0 })
            .map(|slot| slot.frame);
        if evicted.is_none() {
            state.len += 1;
        }
        state.next = (at + 1) % self.capacity;
        state.newest = Some(sequence);
        drop(state);

        self.changed.notify_all();
        Ok(evicted)
    }

    /// Pins and returns the frame `index` steps back from the newest one.
    pub fn get(&self, index: i32) -> Result<PinnedFrame<'_>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StreamError::PipelineClosed);
        }

        let back = index.unsigned_abs() as usize;
        let out_of_range = StreamError::OutOfRange {
            index,
            capacity: self.capacity,
            retained: state.len,
        };
        if index > 0 || back >= state.len {
            return Err(out_of_range);
        }

        let at = (state.next + self.capacity - 1 - back) % self.capacity;
        let generation = state.generation;
        let newest = state.newest.unwrap_or_default();
        let Some(slot) = state.slots[at].as_mut() else {
            return Err(out_of_range);
        };
        slot.pins += 1;
        let frame = slot.frame.clone();
        state.pinned += 1;

        Ok(PinnedFrame {
            ring: self,
            slot: at,
            generation,
            newest,
            frame,
        })
    }

    /// Blocks until a frame newer than `after` is inserted, production
    /// stops, or `timeout` expires.
    pub fn wait_for_newer(&self, after: Option<u64>, timeout: Duration) -> Result<Freshness> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(StreamError::PipelineClosed);
            }
            if state.newest > after {
                return Ok(Freshness::Newer);
            }
            if !state.producing {
                return Ok(Freshness::Stopped);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Freshness::TimedOut);
            }
            self.changed.wait_for(&mut state, deadline - now);
        }
    }

    /// Marks the end of production and wakes everyone waiting for a frame.
    pub fn stop_producing(&self) {
        self.state.lock().producing = false;
        self.changed.notify_all();
    }

    /// Blocks until no pins are outstanding or the ring is released.
    pub fn wait_unpinned(&self) {
        let mut state = self.state.lock();
        while state.pinned > 0 && !state.closed {
            self.changed.wait(&mut state);
        }
    }

    /// Drops every retained frame and closes the ring in one step. Later
    /// `get` and `insert` calls fail with `PipelineClosed`.
    pub fn release(&self) -> Vec<RawFrame> {
        let mut state = self.state.lock();
        let frames = state
            .slots
            .iter_mut()
            .filter_map(|slot| slot.take().map(|slot| slot.frame))
            .collect();
        state.len = 0;
        state.next = 0;
        state.pinned = 0;
        state.generation += 1;
        state.producing = false;
        state.closed = true;
        drop(state);

        self.changed.notify_all();
        frames
    }

    fn unpin(&self, at: usize, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        if let Some(slot) = state.slots[at].as_mut() {
            slot.pins = slot.pins.saturating_sub(1);
        }
        state.pinned = state.pinned.saturating_sub(1);
        drop(state);

        self.changed.notify_all();
    }
}

/// A frame held against eviction. Unpins on drop.
pub struct PinnedFrame<'a> {
    ring: &'a DecodedRing,
    slot: usize,
    generation: u64,
    newest: u64,
    frame: RawFrame,
}

impl PinnedFrame<'_> {
    pub fn frame(&self) -> &RawFrame {
        &self.frame
    }

    /// Sequence of the newest frame in the ring when this one was pinned.
    pub fn newest_sequence(&self) -> u64 {
        self.newest
    }
}

impl Deref for PinnedFrame<'_> {
    type Target = RawFrame;

    fn deref(&self) -> &RawFrame {
        &self.frame
    }
}

impl Drop for PinnedFrame<'_> {
    fn drop(&mut self) {
        self.ring.unpin(self.slot, self.generation);
    }
}

#[cfg(test)]
#[path = "ring_test.rs"]
mod ring_test;
