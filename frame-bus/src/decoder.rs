use std::collections::VecDeque;

use ffmpeg_next::codec::Id;

use crate::{
    backend::DecodeStage,
    error::{Result, StreamError},
    frame::{DecodedSurface, Surface},
    hw,
    input::AvInput,
    packet::Packet,
    scaler::AvFrame,
};

/// Video decoder for the stream of an [`AvInput`], hardware first.
pub struct AvDecoder {
    inner: ffmpeg_next::codec::decoder::Video,
    codec_id: Id,
    // pictures received but not yet handed out
    pending: VecDeque<ffmpeg_next::frame::Video>,
}

unsafe impl Send for AvDecoder {}

impl AvDecoder {
    pub fn new(input: &AvInput, prefer_hw: bool) -> Result<Self> {
        let codec_id = input.parameters().id();
        let hw_codec = if prefer_hw {
            hw::find_hw_decoder(codec_id)
        } else {
            None
        };

        let inner = match hw_codec {
            Some(codec) => {
                let name = codec.name().to_string();
                match Self::open(input, Some(codec)) {
                    Ok(decoder) => decoder,
                    Err(e) => {
                        log::warn!("decoder: {} unavailable ({}), using software decoder", name, e);
                        Self::open(input, None)?
                    }
                }
            }
            None => Self::open(input, None)?,
        };
        log::info!(
            "decoder: {} {}x{} {:?}",
            codec_id.name(),
            inner.width(),
            inner.height(),
            inner.format()
        );

        Ok(Self {
            inner,
            codec_id,
            pending: VecDeque::new(),
        })
    }

    fn open(
        input: &AvInput,
        codec: Option<ffmpeg_next::Codec>,
    ) -> Result<ffmpeg_next::codec::decoder::Video> {
        let unsupported = |e: ffmpeg_next::Error| {
            StreamError::UnsupportedStream(format!(
                "{} decoder: {}",
                input.parameters().id().name(),
                e
            ))
        };

        let mut context = ffmpeg_next::codec::Context::new();
        unsafe {
            (*context.as_mut_ptr()).time_base = input.time_base().into();
        }
        context
            .set_parameters(input.parameters().clone())
            .map_err(unsupported)?;

        let decoder = match codec {
            Some(codec) => context.decoder().open_as(codec).and_then(|d| d.video()),
            None => context.decoder().video(),
        }
        .map_err(unsupported)?;

        if decoder.format() == ffmpeg_next::format::Pixel::None
            || decoder.width() == 0
            || decoder.height() == 0
        {
            return Err(StreamError::UnsupportedStream(
                "missing codec parameters".to_string(),
            ));
        }
        Ok(decoder)
    }

    fn receive_all(&mut self) -> anyhow::Result<()> {
        loop {
            let mut frame = ffmpeg_next::frame::Video::empty();
            match self.inner.receive_frame(&mut frame) {
                Ok(()) => self.pending.push_back(frame),
                Err(ffmpeg_next::Error::Eof) => return Ok(()),
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn surface(frame: ffmpeg_next::frame::Video) -> DecodedSurface {
        let pts = frame.timestamp().or(frame.pts());
        let (width, height) = (frame.width(), frame.height());
        DecodedSurface {
            surface: Surface::new(AvFrame::from(frame)),
            pts,
            width,
            height,
        }
    }
}

impl DecodeStage for AvDecoder {
    fn max_in_flight_frames(&self) -> usize {
        hw::decoded_picture_buffer(self.codec_id)
    }

    fn decode(&mut self, packet: &Packet) -> anyhow::Result<Option<DecodedSurface>> {
        if !packet.data().is_empty() {
            let mut raw = ffmpeg_next::Packet::copy(packet.data());
            raw.set_pts(packet.pts());
            raw.set_dts(packet.dts());
            if packet.is_key() {
                raw.set_flags(ffmpeg_next::packet::Flags::KEY);
            }
            self.inner.send_packet(&raw)?;
            self.receive_all()?;
        }
        Ok(self.pending.pop_front().map(Self::surface))
    }

    fn flush(&mut self) -> anyhow::Result<Vec<DecodedSurface>> {
        self.inner.send_eof()?;
        self.receive_all()?;
        Ok(self.pending.drain(..).map(Self::surface).collect())
    }
}
