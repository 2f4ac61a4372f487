//! Graphic buffers and the per-frame metadata that travels with them from a
//! producer to the consumer.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use enumn::N;

use crate::sync::Fence;
use crate::{Nsecs, PixelFormat, Rect, Region};

bitflags! {
    /// Usage flags of a graphic buffer, i.e. which hardware blocks may
    /// access it.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Usage: u64 {
        const SW_READ_RARELY = 0x0000_0002;
        const SW_READ_OFTEN = 0x0000_0003;
        const SW_WRITE_RARELY = 0x0000_0020;
        const SW_WRITE_OFTEN = 0x0000_0030;
        const HW_TEXTURE = 0x0000_0100;
        const HW_RENDER = 0x0000_0200;
        const HW_2D = 0x0000_0400;
        const HW_COMPOSER = 0x0000_0800;
        const HW_FB = 0x0000_1000;
        const PROTECTED = 0x0000_4000;
        const HW_VIDEO_ENCODER = 0x0001_0000;
    }
}

bitflags! {
    /// Transform to apply to a buffer's content before displaying it.
    ///
    /// Rotations are expressed as combinations of flips, e.g. a 180 degree
    /// rotation is a horizontal plus a vertical flip.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Transform: u32 {
        const FLIP_H = 0x01;
        const FLIP_V = 0x02;
        const ROT_90 = 0x04;
        const ROT_180 = 0x03;
        const ROT_270 = 0x07;
        /// The buffer has been pre-rotated to compensate for the display
        /// transform.
        const INVERSE_DISPLAY = 0x08;
    }
}

/// How the content of a buffer is fit into the window it is displayed in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
#[repr(u32)]
pub enum ScalingMode {
    /// The window is not resized until a buffer of the right size arrives.
    #[default]
    Freeze = 0,
    ScaleToWindow = 1,
    /// The buffer is scaled uniformly to fill the window, and cropped to its
    /// aspect ratio.
    ScaleCrop = 2,
    NoScaleCrop = 3,
}

/// API a producer used to fill a buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
#[repr(i32)]
pub enum ProducerApi {
    #[default]
    None = 0,
    Egl = 1,
    Cpu = 2,
    Media = 3,
    Camera = 4,
}

/// Color space of a buffer's content.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Dataspace(pub u32);

impl Dataspace {
    pub const UNKNOWN: Dataspace = Dataspace(0);
    pub const SRGB_LINEAR: Dataspace = Dataspace(0x0841_0000);
    pub const SRGB: Dataspace = Dataspace(0x0881_0000);
    pub const DISPLAY_P3: Dataspace = Dataspace(0x088a_0000);
    pub const BT2020: Dataspace = Dataspace(0x08c6_0000);
    pub const BT2020_PQ: Dataspace = Dataspace(0x09c6_0000);
}

impl fmt::Debug for Dataspace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            Self::UNKNOWN => "UNKNOWN",
            Self::SRGB_LINEAR => "SRGB_LINEAR",
            Self::SRGB => "SRGB",
            Self::DISPLAY_P3 => "DISPLAY_P3",
            Self::BT2020 => "BT2020",
            Self::BT2020_PQ => "BT2020_PQ",
            _ => "?",
        };
        write!(f, "0x{:08x} ({})", self.0, name)
    }
}

bitflags! {
    /// Which parts of an `HdrMetadata` are valid.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct HdrMetadataType: u32 {
        const SMPTE2086 = 1 << 0;
        const CTA861_3 = 1 << 1;
        const HDR10PLUS = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct XyColor {
    pub x: f32,
    pub y: f32,
}

/// Mastering display color volume.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Smpte2086 {
    pub display_primary_red: XyColor,
    pub display_primary_green: XyColor,
    pub display_primary_blue: XyColor,
    pub white_point: XyColor,
    pub max_luminance: f32,
    pub min_luminance: f32,
}

/// Content light levels.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Cta861_3 {
    pub max_content_light_level: f32,
    pub max_frame_average_light_level: f32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HdrMetadata {
    pub valid_types: HdrMetadataType,
    pub smpte2086: Smpte2086,
    pub cta8613: Cta861_3,
    pub hdr10plus: Vec<u8>,
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// A buffer allocated for display. Buffers are shared between producer and
/// consumer as `Arc<GraphicBuffer>`, and identified by pointer.
#[derive(Debug)]
pub struct GraphicBuffer {
    id: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub usage: Usage,
}

impl GraphicBuffer {
    pub fn new(width: u32, height: u32, format: PixelFormat, usage: Usage) -> Arc<Self> {
        Arc::new(GraphicBuffer {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            format,
            usage,
        })
    }

    /// Unique identifier of this buffer within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bounds(&self) -> Rect {
        Rect::from_size(self.width, self.height)
    }
}

/// A buffer acquired from a `BufferSource`, along with everything the
/// producer specified about how to display it.
#[derive(Clone, Debug, Default)]
pub struct BufferItem {
    /// Slot the buffer occupies in the source.
    pub slot: usize,
    /// Only set the first time a buffer is acquired from a given slot. The
    /// consumer is expected to remember it afterwards.
    pub graphic_buffer: Option<Arc<GraphicBuffer>>,
    /// Signaled once the producer has finished writing the buffer.
    pub fence: Fence,
    pub crop: Rect,
    pub transform: Transform,
    pub scaling_mode: ScalingMode,
    pub timestamp: Nsecs,
    pub data_space: Dataspace,
    pub hdr_metadata: HdrMetadata,
    pub frame_number: u64,
    pub transform_to_display_inverse: bool,
    pub surface_damage: Region,
    pub api: ProducerApi,
    /// The producer is in shared-buffer mode and wants its buffer
    /// redisplayed on every refresh.
    pub auto_refresh: bool,
    /// This item was queued by the producer, as opposed to being the
    /// shared buffer acquired again.
    pub queued_buffer: bool,
}
