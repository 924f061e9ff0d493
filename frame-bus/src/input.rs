use std::path::Path;

use bytes::Bytes;
use ffmpeg_next::codec::Parameters;

use crate::{
    backend::StreamSource,
    error::{Result, StreamError},
    packet::Packet,
    stream::StreamMetadata,
};

/// Demuxer over the best video stream of a file or network URL.
pub struct AvInput {
    inner: ffmpeg_next::format::context::Input,
    stream_index: usize,
    parameters: Parameters,
    time_base: ffmpeg_next::Rational,
    metadata: StreamMetadata,
}

// The demuxer is only ever driven by the decode thread that owns it.
unsafe impl Send for AvInput {}

impl AvInput {
    pub fn open(url: &str) -> Result<Self> {
        let inner = ffmpeg_next::format::input(Path::new(url))
            .map_err(|e| StreamError::SourceUnavailable(format!("{}: {}", url, e)))?;

        let stream = inner
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| StreamError::UnsupportedStream(format!("{}: no video stream", url)))?;
        let parameters = stream.parameters();
        let (width, height) = coded_size(&parameters);
        let metadata = StreamMetadata {
            codec: parameters.id().name().to_string(),
            avg_frame_rate: rational(stream.avg_frame_rate()),
            real_frame_rate: rational(stream.rate()),
            width,
            height,
        };
        let stream_index = stream.index();
        let time_base = stream.time_base();

        log::info!(
            "input: {} stream #{} {} {}x{}",
            url,
            stream_index,
            metadata.codec,
            width,
            height
        );

        Ok(Self {
            inner,
            stream_index,
            parameters,
            time_base,
            metadata,
        })
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn time_base(&self) -> ffmpeg_next::Rational {
        self.time_base
    }
}

impl StreamSource for AvInput {
    fn metadata(&self) -> &StreamMetadata {
        &self.metadata
    }

    fn next_packet(&mut self) -> anyhow::Result<Option<Packet>> {
        loop {
            match self.inner.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() != self.stream_index {
                        continue;
                    }
                    let data = packet.data().map(Bytes::copy_from_slice).unwrap_or_default();
                    return Ok(Some(
                        Packet::new(data)
                            .with_timestamps(packet.pts(), packet.dts())
                            .with_key(packet.is_key()),
                    ));
                }
                None => return Ok(None),
            }
        }
    }
}

fn rational(rate: ffmpeg_next::Rational) -> Option<(i32, i32)> {
    (rate.numerator() != 0).then(|| (rate.numerator(), rate.denominator()))
}

fn coded_size(parameters: &Parameters) -> (u32, u32) {
    unsafe {
        let ptr = parameters.as_ptr() as *const ffmpeg_next::ffi::AVCodecParameters;
        ((*ptr).width.max(0) as u32, (*ptr).height.max(0) as u32)
    }
}
