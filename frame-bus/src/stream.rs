use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::error::{Result, StreamError};

/// What a stream source knows about its video stream right after open.
/// Rates are `(numerator, denominator)` pairs as the container reports them.
#[derive(Clone, Debug, Default)]
pub struct StreamMetadata {
    pub codec: String,
    pub avg_frame_rate: Option<(i32, i32)>,
    /// Lowest rate all timestamps can be represented with; used when the
    /// container has no average rate (raw elementary streams, some RTSP feeds).
    pub real_frame_rate: Option<(i32, i32)>,
    pub width: u32,
    pub height: u32,
}

/// Immutable snapshot of the stream, taken once at initialization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StreamParameters {
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    pub width: u32,
    pub height: u32,
}

impl StreamParameters {
    pub fn from_metadata(metadata: &StreamMetadata) -> Result<Self> {
        let (frame_rate_num, frame_rate_den) = metadata
            .avg_frame_rate
            .and_then(usable_rate)
            .or_else(|| metadata.real_frame_rate.and_then(usable_rate))
            .ok_or_else(|| {
                StreamError::UnsupportedStream(format!(
                    "{} stream reports no usable frame rate (avg: {:?}, real: {:?})",
                    metadata.codec, metadata.avg_frame_rate, metadata.real_frame_rate
                ))
            })?;

        if metadata.width == 0 || metadata.height == 0 {
            return Err(StreamError::UnsupportedStream(format!(
                "{} stream has invalid size {}x{}",
                metadata.codec, metadata.width, metadata.height
            )));
        }

        Ok(Self {
            frame_rate_num,
            frame_rate_den,
            width: metadata.width,
            height: metadata.height,
        })
    }

    /// Nominal time between two frames, `1 / frame rate`.
    pub fn frame_interval(&self) -> Duration {
        let nanos = 1_000_000_000u64 * self.frame_rate_den as u64 / self.frame_rate_num as u64;
        Duration::from_nanos(nanos)
    }

    /// Keyed form: `framerate_num`, `framerate_den`, `width`, `height`.
    pub fn as_map(&self) -> BTreeMap<&'static str, u32> {
        BTreeMap::from([
            ("framerate_num", self.frame_rate_num),
            ("framerate_den", self.frame_rate_den),
            ("width", self.width),
            ("height", self.height),
        ])
    }
}

fn usable_rate((num, den): (i32, i32)) -> Option<(u32, u32)> {
    if num <= 0 || den <= 0 {
        return None;
    }
    let (num, den) = (num as u32, den as u32);
    let divisor = gcd(num, den);
    Some((num / divisor, den / divisor))
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}
