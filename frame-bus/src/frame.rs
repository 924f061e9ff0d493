use std::any::Any;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Output pixel layouts a conversion stage can be asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit grey.
    Y800,
    Rgb24,
    Bgr24,
    Nv12,
    Uyvy,
    /// Planar 4:4:4.
    Yuv444,
    /// Packed hue/saturation/value, one byte each.
    Hsv,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 7] = [
        PixelFormat::Y800,
        PixelFormat::Rgb24,
        PixelFormat::Bgr24,
        PixelFormat::Nv12,
        PixelFormat::Uyvy,
        PixelFormat::Yuv444,
        PixelFormat::Hsv,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Y800 => "y800",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Uyvy => "uyvy",
            PixelFormat::Yuv444 => "yuv444",
            PixelFormat::Hsv => "hsv",
        }
    }

    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Y800 => *b"Y800",
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Nv12 => *b"NV12",
            PixelFormat::Uyvy => *b"UYVY",
            PixelFormat::Yuv444 => *b"444P",
            PixelFormat::Hsv => *b"HSV3",
        }
    }

    /// Size in bytes of one tightly packed frame. Chroma planes round odd
    /// dimensions up.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        let half_w = w.div_ceil(2);
        let half_h = h.div_ceil(2);
        match self {
            PixelFormat::Y800 => w * h,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 | PixelFormat::Hsv | PixelFormat::Yuv444 => {
                w * h * 3
            }
            PixelFormat::Nv12 => w * h + half_w * half_h * 2,
            PixelFormat::Uyvy => half_w * 4 * h,
        }
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        PixelFormat::ALL
            .into_iter()
            .find(|f| f.name() == lower)
            .or(match lower.as_str() {
                "gray" | "grey" | "gray8" => Some(PixelFormat::Y800),
                "rgb" => Some(PixelFormat::Rgb24),
                "bgr" => Some(PixelFormat::Bgr24),
                _ => None,
            })
            .ok_or_else(|| anyhow::anyhow!("unknown pixel format: {:?}", s))
    }
}

/// Frame memory owned by a decode or conversion backend. On accelerators
/// this wraps device memory; `copy_to_host` is the only way bytes leave it.
pub trait DeviceBuffer: Send + Sync + 'static {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn copy_to_host(&self) -> anyhow::Result<Bytes>;

    fn as_any(&self) -> &dyn Any;
}

impl DeviceBuffer for Bytes {
    fn len(&self) -> usize {
        Bytes::len(self)
    }

    fn copy_to_host(&self) -> anyhow::Result<Bytes> {
        Ok(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Opaque, cheaply clonable handle to frame memory. The memory is released
/// when the last handle is dropped.
#[derive(Clone)]
pub struct Surface(Arc<dyn DeviceBuffer>);

impl Surface {
    pub fn new<B: DeviceBuffer>(buffer: B) -> Self {
        Self(Arc::new(buffer))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn copy_to_host(&self) -> anyhow::Result<Bytes> {
        self.0.copy_to_host()
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    /// True when both handles refer to the same allocation.
    pub fn same_memory(&self, other: &Surface) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl From<Bytes> for Surface {
    fn from(data: Bytes) -> Self {
        Surface::new(data)
    }
}

impl Debug for Surface {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Surface {{ len: {} }}", self.len())
    }
}

/// What a decode stage hands back for one picture.
#[derive(Clone, Debug)]
pub struct DecodedSurface {
    pub surface: Surface,
    pub pts: Option<i64>,
    pub width: u32,
    pub height: u32,
}

/// A decoded picture as retained by the ring buffer.
#[derive(Clone, Debug)]
pub struct RawFrame {
    surface: Surface,
    sequence: u64,
    pts: Option<i64>,
    width: u32,
    height: u32,
}

impl RawFrame {
    pub fn new(decoded: DecodedSurface, sequence: u64) -> Self {
        Self {
            surface: decoded.surface,
            sequence,
            pts: decoded.pts,
            width: decoded.width,
            height: decoded.height,
        }
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    /// 1-based position of the frame in decode order.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

/// A converted frame owned by one consumer's cache slot.
#[derive(Clone, Debug)]
pub struct ProcessedFrame {
    surface: Surface,
    source_sequence: u64,
    format: PixelFormat,
    width: u32,
    height: u32,
}

impl ProcessedFrame {
    pub fn new(
        surface: Surface,
        source_sequence: u64,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            surface,
            source_sequence,
            format,
            width,
            height,
        }
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn source_sequence(&self) -> u64 {
        self.source_sequence
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn matches(&self, source_sequence: u64, format: PixelFormat, width: u32, height: u32) -> bool {
        self.source_sequence == source_sequence
            && self.format == format
            && self.width == width
            && self.height == height
    }
}

impl Display for ProcessedFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "ProcessedFrame source: {}, format: {}, width: {}, height: {}, len: {}",
            self.source_sequence,
            self.format,
            self.width,
            self.height,
            self.surface.len()
        )
    }
}

/// One consumer request. A zero width or height means "native".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRequest {
    pub index: i32,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl FrameRequest {
    pub fn new(index: i32, format: PixelFormat) -> Self {
        Self {
            index,
            format,
            width: 0,
            height: 0,
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Replaces zero dimensions with the given native size.
    pub fn target_size(&self, native_width: u32, native_height: u32) -> (u32, u32) {
        let width = if self.width == 0 { native_width } else { self.width };
        let height = if self.height == 0 { native_height } else { self.height };
        (width, height)
    }
}
