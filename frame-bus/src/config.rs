use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime knobs of a [`FrameBus`](crate::bus::FrameBus).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Pace decoding to the stream's frame rate and make consumers that
    /// already saw the newest frame wait for the next one.
    pub pacing: bool,
    /// Consecutive packet failures tolerated before the decode loop gives up.
    pub max_decode_retries: u32,
    /// Upper bound on a paced consumer's wait for a fresh frame.
    pub frame_wait_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            pacing: true,
            max_decode_retries: 3,
            frame_wait_timeout_ms: 1000,
        }
    }
}

impl BusConfig {
    pub fn with_pacing(mut self, pacing: bool) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_max_decode_retries(mut self, retries: u32) -> Self {
        self.max_decode_retries = retries;
        self
    }

    pub fn frame_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_wait_timeout_ms)
    }
}
