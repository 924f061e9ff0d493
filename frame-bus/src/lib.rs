//! Bounded, indexable access to decoded video frames with per-consumer
//! conversion caching.

/// Registers FFmpeg components. Call once at startup before opening inputs.
#[cfg(feature = "ffmpeg")]
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod backend;
pub mod bus;
pub mod cache;
pub mod config;
pub mod dump;
pub mod error;
pub mod frame;
pub mod packet;
pub mod ring;
pub mod stream;
pub mod synthetic;

#[cfg(feature = "ffmpeg")]
pub mod av;
#[cfg(feature = "ffmpeg")]
pub mod decoder;
#[cfg(feature = "ffmpeg")]
pub mod hw;
#[cfg(feature = "ffmpeg")]
pub mod input;
#[cfg(feature = "ffmpeg")]
pub mod scaler;

pub use bus::{CloseMode, FrameBus, PipelineState};
pub use config::BusConfig;
pub use error::{Result, StreamError};
pub use frame::{FrameRequest, PixelFormat, ProcessedFrame};
pub use stream::StreamParameters;
