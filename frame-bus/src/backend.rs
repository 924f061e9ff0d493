//! Seams to the external demux, decode and conversion engines.
//!
//! The bus never touches codec or colour math itself; it drives these traits
//! from its decode thread (source, decoder) and from consumer threads
//! (converter).

use std::sync::Arc;

use crate::{
    error::Result,
    frame::{DecodedSurface, PixelFormat, RawFrame, Surface},
    packet::Packet,
    stream::StreamMetadata,
};

/// Demuxed compressed packets of a single video stream.
pub trait StreamSource: Send + 'static {
    fn metadata(&self) -> &StreamMetadata;

    /// Next packet, or `None` at end of stream.
    fn next_packet(&mut self) -> anyhow::Result<Option<Packet>>;
}

/// Hardware (or software) decoder producing frames in its own memory.
pub trait DecodeStage: Send + 'static {
    /// How many decoded frames the engine can keep alive at once.
    fn max_in_flight_frames(&self) -> usize;

    /// Decodes one packet. `Ok(None)` means the decoder needs more input
    /// before it can emit a picture.
    fn decode(&mut self, packet: &Packet) -> anyhow::Result<Option<DecodedSurface>>;

    /// Drains pictures still buffered inside the decoder at end of stream.
    fn flush(&mut self) -> anyhow::Result<Vec<DecodedSurface>> {
        Ok(Vec::new())
    }
}

/// Colour-space and scale conversion. Called concurrently by consumers.
pub trait ConversionStage: Send + Sync + 'static {
    fn convert(
        &self,
        frame: &RawFrame,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> anyhow::Result<Surface>;
}

/// An opened stream: the source and the decoder configured for it.
pub struct OpenedStream {
    pub source: Box<dyn StreamSource>,
    pub decoder: Box<dyn DecodeStage>,
}

/// Factory tying the three engines together for a given locator.
pub trait MediaBackend: Send + Sync + 'static {
    /// Opens `locator`. Fails with `SourceUnavailable` when it cannot be
    /// reached and `UnsupportedStream` when no decodable video stream exists.
    fn open(&self, locator: &str) -> Result<OpenedStream>;

    fn converter(&self) -> Arc<dyn ConversionStage>;
}
