//! In-memory backend producing numbered frames without any codec.
//!
//! Locators look like `synthetic://640x360@30000/1001?frames=300&depth=8&corrupt=50`.
//! `frames` bounds the stream (endless when absent), `depth` is the
//! decoder's in-flight frame limit and `corrupt=K` makes every K-th packet
//! undecodable. Every byte of a decoded surface holds the low byte of its
//! packet number, so tests can tell frames apart after conversion.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, anyhow, bail};
use bytes::Bytes;

use crate::{
    backend::{ConversionStage, DecodeStage, MediaBackend, OpenedStream, StreamSource},
    error::{Result, StreamError},
    frame::{DecodedSurface, PixelFormat, RawFrame, Surface},
    packet::Packet,
    stream::StreamMetadata,
};

pub const SCHEME: &str = "synthetic://";

const DEFAULT_DEPTH: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: (i32, i32),
    pub frames: Option<u64>,
    pub depth: usize,
    pub corrupt_every: Option<u64>,
}

impl FromStr for SyntheticConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| anyhow!("not a synthetic locator: {}", s))?;
        let (geometry, query) = rest.split_once('?').unwrap_or((rest, ""));

        let (size, rate) = geometry
            .split_once('@')
            .ok_or_else(|| anyhow!("missing frame rate in {}", s))?;
        let (width, height) = size
            .split_once('x')
            .ok_or_else(|| anyhow!("size must be WIDTHxHEIGHT, got {}", size))?;
        let (num, den) = rate.split_once('/').unwrap_or((rate, "1"));

        let mut config = SyntheticConfig {
            width: width.parse().context("width")?,
            height: height.parse().context("height")?,
            frame_rate: (num.parse().context("frame rate")?, den.parse().context("frame rate")?),
            frames: None,
            depth: DEFAULT_DEPTH,
            corrupt_every: None,
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed option {}", pair))?;
            match key {
                "frames" => config.frames = Some(value.parse().context("frames")?),
                "depth" => config.depth = value.parse().context("depth")?,
                "corrupt" => {
                    let every: u64 = value.parse().context("corrupt")?;
                    if every == 0 {
                        bail!("corrupt interval must be positive");
                    }
                    config.corrupt_every = Some(every);
                }
                _ => bail!("unknown option {}", key),
            }
        }

        Ok(config)
    }
}

impl SyntheticConfig {
    pub fn metadata(&self) -> StreamMetadata {
        StreamMetadata {
            codec: "synthetic".to_string(),
            avg_frame_rate: Some(self.frame_rate),
            real_frame_rate: None,
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Default)]
pub struct SyntheticBackend {
    converter: Arc<SyntheticConverter>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conversions performed so far across all consumers.
    pub fn conversions(&self) -> usize {
        self.converter.conversions()
    }
}

impl MediaBackend for SyntheticBackend {
    fn open(&self, locator: &str) -> Result<OpenedStream> {
        let config = locator
            .parse::<SyntheticConfig>()
            .map_err(|e| StreamError::SourceUnavailable(format!("{:#}", e)))?;
        log::debug!("synthetic: opening {:?}", config);

        Ok(OpenedStream {
            source: Box::new(SyntheticSource::new(config.clone())),
            decoder: Box::new(SyntheticDecoder::new(&config)),
        })
    }

    fn converter(&self) -> Arc<dyn ConversionStage> {
        self.converter.clone()
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    metadata: StreamMetadata,
    produced: u64,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        let metadata = config.metadata();
        Self {
            config,
            metadata,
            produced: 0,
        }
    }
}

impl StreamSource for SyntheticSource {
    fn metadata(&self) -> &StreamMetadata {
        &self.metadata
    }

    fn next_packet(&mut self) -> anyhow::Result<Option<Packet>> {
        if self.config.frames.is_some_and(|frames| self.produced >= frames) {
            return Ok(None);
        }
        self.produced += 1;
        let number = self.produced;

        let corrupt = self
            .config
            .corrupt_every
            .is_some_and(|every| number % every == 0);
        let data = if corrupt {
            Bytes::from_static(b"\xff")
        } else {
            Bytes::copy_from_slice(&number.to_be_bytes())
        };

        let pts = number as i64;
        Ok(Some(
            Packet::new(data)
                .with_timestamps(Some(pts), Some(pts))
                .with_key(true),
        ))
    }
}

pub struct SyntheticDecoder {
    width: u32,
    height: u32,
    depth: usize,
}

impl SyntheticDecoder {
    pub fn new(config: &SyntheticConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            depth: config.depth,
        }
    }
}

impl DecodeStage for SyntheticDecoder {
    fn max_in_flight_frames(&self) -> usize {
        self.depth
    }

    fn decode(&mut self, packet: &Packet) -> anyhow::Result<Option<DecodedSurface>> {
        let number: [u8; 8] = packet
            .data()
            .as_ref()
            .try_into()
            .map_err(|_| anyhow!("corrupt packet of {} bytes", packet.size()))?;
        let number = u64::from_be_bytes(number);

        let size = PixelFormat::Nv12.frame_size(self.width, self.height);
        Ok(Some(DecodedSurface {
            surface: Surface::from(Bytes::from(vec![number as u8; size])),
            pts: packet.pts(),
            width: self.width,
            height: self.height,
        }))
    }
}

/// Fills the target buffer with the first byte of the source surface.
#[derive(Default)]
pub struct SyntheticConverter {
    conversions: AtomicUsize,
}

impl SyntheticConverter {
    pub fn conversions(&self) -> usize {
        self.conversions.load(Ordering::Relaxed)
    }
}

impl ConversionStage for SyntheticConverter {
    fn convert(
        &self,
        frame: &RawFrame,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> anyhow::Result<Surface> {
        let host = frame.surface().copy_to_host()?;
        let fill = host.first().copied().unwrap_or_default();
        self.conversions.fetch_add(1, Ordering::Relaxed);
        Ok(Surface::from(Bytes::from(vec![
            fill;
            format.frame_size(width, height)
        ])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_locator() {
        let config: SyntheticConfig = "synthetic://640x360@30000/1001?frames=12&depth=4&corrupt=5"
            .parse()
            .unwrap();
        assert_eq!(
            config,
            SyntheticConfig {
                width: 640,
                height: 360,
                frame_rate: (30000, 1001),
                frames: Some(12),
                depth: 4,
                corrupt_every: Some(5),
            }
        );

        let config: SyntheticConfig = "synthetic://16x8@25".parse().unwrap();
        assert_eq!(config.frame_rate, (25, 1));
        assert_eq!(config.frames, None);
        assert_eq!(config.depth, DEFAULT_DEPTH);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for locator in [
            "file:///tmp/a.mp4",
            "synthetic://16x8",
            "synthetic://16@25",
            "synthetic://16x8@25?speed=2",
            "synthetic://16x8@25?corrupt=0",
        ] {
            assert!(locator.parse::<SyntheticConfig>().is_err(), "{}", locator);
        }
    }

    #[test]
    fn test_open_unknown_locator_is_unavailable() {
        let backend = SyntheticBackend::new();
        assert!(matches!(
            backend.open("rtsp://camera/stream"),
            Err(StreamError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn test_source_decoder_and_converter() -> anyhow::Result<()> {
        let backend = SyntheticBackend::new();
        let mut opened = backend.open("synthetic://4x2@10?frames=3&corrupt=2")?;
        assert_eq!(opened.source.metadata().width, 4);
        assert_eq!(opened.decoder.max_in_flight_frames(), DEFAULT_DEPTH);

        let first = opened.source.next_packet()?.unwrap();
        let decoded = opened.decoder.decode(&first)?.unwrap();
        assert_eq!(decoded.surface.len(), PixelFormat::Nv12.frame_size(4, 2));
        assert_eq!(decoded.pts, Some(1));

        let second = opened.source.next_packet()?.unwrap();
        assert!(opened.decoder.decode(&second).is_err());

        let third = opened.source.next_packet()?.unwrap();
        let decoded = opened.decoder.decode(&third)?.unwrap();
        assert!(opened.source.next_packet()?.is_none());

        let raw = RawFrame::new(decoded, 2);
        let converted = backend.converter().convert(&raw, PixelFormat::Rgb24, 2, 2)?;
        assert_eq!(converted.copy_to_host()?.as_ref(), &[3u8; 12]);
        assert_eq!(backend.conversions(), 1);
        Ok(())
    }
}
