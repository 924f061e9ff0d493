use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use bytes::Bytes;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;
use parking_lot::Mutex;

use crate::{
    backend::ConversionStage,
    frame::{DeviceBuffer, PixelFormat, RawFrame, Surface},
};

/// A decoded or scaled FFmpeg picture used as frame memory.
pub struct AvFrame {
    frame: ffmpeg_next::frame::Video,
    len: usize,
}

// Frames are immutable once wrapped; only shared references are handed out.
unsafe impl Send for AvFrame {}
unsafe impl Sync for AvFrame {}

impl From<ffmpeg_next::frame::Video> for AvFrame {
    fn from(frame: ffmpeg_next::frame::Video) -> Self {
        let len = unsafe {
            ffmpeg_next::ffi::av_image_get_buffer_size(
                frame.format().into(),
                frame.width() as i32,
                frame.height() as i32,
                1,
            )
        };
        Self {
            frame,
            len: len.max(0) as usize,
        }
    }
}

impl AvFrame {
    pub fn video(&self) -> &ffmpeg_next::frame::Video {
        &self.frame
    }
}

impl DeviceBuffer for AvFrame {
    fn len(&self) -> usize {
        self.len
    }

    /// Packs the planes without row padding.
    fn copy_to_host(&self) -> anyhow::Result<Bytes> {
        let mut buf = vec![0u8; self.len];
        let written = unsafe {
            let ptr = self.frame.as_ptr();
            ffmpeg_next::ffi::av_image_copy_to_buffer(
                buf.as_mut_ptr(),
                buf.len() as i32,
                (*ptr).data.as_ptr() as *const *const u8,
                (*ptr).linesize.as_ptr(),
                self.frame.format().into(),
                self.frame.width() as i32,
                self.frame.height() as i32,
                1,
            )
        };
        if written < 0 {
            anyhow::bail!("copy frame to host: {}", ffmpeg_next::Error::from(written));
        }
        Ok(Bytes::from(buf))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct Scaler {
    context: scaling::Context,
}

impl Scaler {
    pub fn new(context: scaling::Context) -> Self {
        Self { context }
    }

    pub fn run(
        &mut self,
        frame: &ffmpeg_next::frame::Video,
        dst: &mut ffmpeg_next::frame::Video,
    ) -> anyhow::Result<()> {
        self.context.run(frame, dst).map_err(|e| e.into())
    }
}

unsafe impl Send for Scaler {}

#[derive(Clone, Copy, Debug)]
struct Geometry {
    src: Pixel,
    src_width: u32,
    src_height: u32,
    dst: Pixel,
    width: u32,
    height: u32,
}

impl Geometry {
    fn key(&self) -> GeometryKey {
        let pixel = |p: Pixel| ffmpeg_next::ffi::AVPixelFormat::from(p) as i32;
        (
            pixel(self.src),
            self.src_width,
            self.src_height,
            pixel(self.dst),
            self.width,
            self.height,
        )
    }
}

type GeometryKey = (i32, u32, u32, i32, u32, u32);

/// Contexts kept at once. Consumers switching sizes would otherwise leave
/// one context behind per geometry they ever asked for.
const MAX_SCALERS: usize = 8;

/// Small map that drops its least recently used entry when full.
struct LruMap<K, V> {
    capacity: usize,
    tick: u64,
    entries: HashMap<K, (u64, V)>,
}

impl<K: Eq + Hash + Copy, V: Clone> LruMap<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            entries: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get_or_try_insert_with<E>(
        &mut self,
        key: K,
        create: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        self.tick += 1;
        if let Some((used, value)) = self.entries.get_mut(&key) {
            *used = self.tick;
            return Ok(value.clone());
        }

        let value = create()?;
        if self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (used, _))| *used)
                .map(|(key, _)| *key);
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key, (self.tick, value.clone()));
        Ok(value)
    }
}

/// `swscale` conversion with a bounded set of cached contexts, one per geometry.
pub struct SwsConverter {
    scalers: Mutex<LruMap<GeometryKey, Arc<Mutex<Scaler>>>>,
}

impl Default for SwsConverter {
    fn default() -> Self {
        Self {
            scalers: Mutex::new(LruMap::new(MAX_SCALERS)),
        }
    }
}

impl SwsConverter {
    pub fn new() -> Self {
        Self::default()
    }

    fn scaler(&self, geometry: Geometry) -> anyhow::Result<Arc<Mutex<Scaler>>> {
        self.scalers
            .lock()
            .get_or_try_insert_with(geometry.key(), || -> anyhow::Result<_> {
                log::debug!("scaler: new context {:?}", geometry);
                let context = scaling::Context::get(
                    geometry.src,
                    geometry.src_width,
                    geometry.src_height,
                    geometry.dst,
                    geometry.width,
                    geometry.height,
                    scaling::flag::Flags::BILINEAR,
                )?;
                Ok(Arc::new(Mutex::new(Scaler::new(context))))
            })
    }
}

impl ConversionStage for SwsConverter {
    fn convert(
        &self,
        frame: &RawFrame,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> anyhow::Result<Surface> {
        let source = frame
            .surface()
            .downcast_ref::<AvFrame>()
            .ok_or_else(|| anyhow::anyhow!("frame {} is not an FFmpeg picture", frame.sequence()))?
            .video();

        let target = target_pixel(format);
        let geometry = Geometry {
            src: source.format(),
            src_width: source.width(),
            src_height: source.height(),
            dst: target,
            width,
            height,
        };
        let scaler = self.scaler(geometry)?;

        let mut converted = ffmpeg_next::frame::Video::new(target, width, height);
        scaler.lock().run(source, &mut converted)?;
        converted.set_pts(source.pts());

        let converted = AvFrame::from(converted);
        if format == PixelFormat::Hsv {
            let mut packed = converted.copy_to_host()?.to_vec();
            rgb_to_hsv(&mut packed);
            return Ok(Surface::from(Bytes::from(packed)));
        }
        Ok(Surface::new(converted))
    }
}

fn target_pixel(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Y800 => Pixel::GRAY8,
        PixelFormat::Rgb24 | PixelFormat::Hsv => Pixel::RGB24,
        PixelFormat::Bgr24 => Pixel::BGR24,
        PixelFormat::Nv12 => Pixel::NV12,
        PixelFormat::Uyvy => Pixel::UYVY422,
        PixelFormat::Yuv444 => Pixel::YUV444P,
    }
}

/// In-place packed RGB24 to HSV, every channel scaled to 0..=255.
fn rgb_to_hsv(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(3) {
        let (r, g, b) = (px[0] as i32, px[1] as i32, px[2] as i32);
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let delta = max - min;

        let s = if max == 0 { 0 } else { 255 * delta / max };
        let h = if delta == 0 {
            0
        } else if max == r {
            (43 * (g - b) / delta).rem_euclid(256)
        } else if max == g {
            85 + 43 * (b - r) / delta
        } else {
            171 + 43 * (r - g) / delta
        };

        px[0] = h as u8;
        px[1] = s as u8;
        px[2] = max as u8;
    }
}
