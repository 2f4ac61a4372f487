//! This library provides the two primitives any display compositor built on
//! top of it must get right:
//!
//! * The `consumer` module implements the consumer side of a buffer queue:
//!   it acquires buffers produced by clients, tracks the ownership and
//!   synchronization fences of every buffer slot, and makes sure a buffer
//!   being displaced is not returned to its producer while the GPU may still
//!   be reading it.
//!
//! * The `event` module implements the vsync distributor: a dedicated thread
//!   that receives timing pulses from a `VsyncSource` and fans them out to any
//!   number of connections, each one subscribed either to a single pulse or to
//!   every n-th pulse.
//!
//! Both subsystems are independent: they each own a single lock, and never
//! call into each other while holding it.
//!
pub mod buffer;
pub mod consumer;
pub mod event;
pub mod sync;

use std::fmt;
use std::fmt::Display;

use nix::time::{clock_gettime, ClockId};

/// Timestamps and durations in nanoseconds, as used by the timing sources.
pub type Nsecs = i64;

/// Returns the current time of the monotonic clock, in nanoseconds.
pub fn system_time() -> Nsecs {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as Nsecs * 1_000_000_000 + ts.tv_nsec() as Nsecs,
        // The monotonic clock is always available on Linux.
        Err(_) => 0,
    }
}

/// A pixel format, as stored in a `GraphicBuffer`. The values are those of
/// the `HAL_PIXEL_FORMAT_*` constants.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct PixelFormat(u32);

impl PixelFormat {
    pub const RGBA_8888: PixelFormat = PixelFormat(1);
    pub const RGBX_8888: PixelFormat = PixelFormat(2);
    pub const RGB_888: PixelFormat = PixelFormat(3);
    pub const RGB_565: PixelFormat = PixelFormat(4);
    pub const BGRA_8888: PixelFormat = PixelFormat(5);
    pub const RGBA_FP16: PixelFormat = PixelFormat(0x16);
    pub const YCBCR_420_888: PixelFormat = PixelFormat(0x23);
    pub const RGBA_1010102: PixelFormat = PixelFormat(0x2b);
    pub const YV12: PixelFormat = PixelFormat(0x3231_5659);

    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    /// Returns whether none of the channels of this format are subsampled.
    ///
    /// Formats we do not know about are assumed to be subsampled, since that
    /// is the worst case for sampling at the edge of a crop.
    pub fn is_unsubsampled_rgb(self) -> bool {
        matches!(
            self,
            Self::RGBA_8888
                | Self::RGBX_8888
                | Self::RGBA_FP16
                | Self::RGBA_1010102
                | Self::RGB_888
                | Self::RGB_565
                | Self::BGRA_8888
        )
    }
}

/// Converts a raw format value into the matching pixel format.
///
/// # Examples
///
/// ```
/// # use flingr::PixelFormat;
/// let f = PixelFormat::from(1);
/// assert_eq!(f, PixelFormat::RGBA_8888);
/// assert_eq!(u32::from(f), 1);
/// ```
impl From<u32> for PixelFormat {
    fn from(i: u32) -> Self {
        Self::from_u32(i)
    }
}

impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.to_u32()
    }
}

/// Produces a debug string for this PixelFormat, including its hexadecimal
/// and symbolic representation.
///
/// # Examples
///
/// ```
/// # use flingr::PixelFormat;
/// assert_eq!(format!("{:?}", PixelFormat::RGBA_8888), "0x00000001 (RGBA_8888)");
/// ```
impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            Self::RGBA_8888 => "RGBA_8888",
            Self::RGBX_8888 => "RGBX_8888",
            Self::RGB_888 => "RGB_888",
            Self::RGB_565 => "RGB_565",
            Self::BGRA_8888 => "BGRA_8888",
            Self::RGBA_FP16 => "RGBA_FP16",
            Self::YCBCR_420_888 => "YCBCR_420_888",
            Self::RGBA_1010102 => "RGBA_1010102",
            Self::YV12 => "YV12",
            _ => "unknown",
        };
        f.write_str(name)
    }
}

/// A rectangle in buffer coordinates. `right` and `bottom` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const EMPTY: Rect = Rect {
        left: 0,
        top: 0,
        right: 0,
        bottom: 0,
    };

    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Rect {
        Rect {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Build a rectangle at the origin of the given size.
    pub fn from_size(width: u32, height: u32) -> Rect {
        Rect::new(0, 0, width as i32, height as i32)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }
}

impl Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{},{},{}]",
            self.left, self.top, self.right, self.bottom
        )
    }
}

/// A set of rectangles, used to describe the damaged area of a surface.
///
/// An empty region means the producer did not provide damage information,
/// i.e. the whole surface must be considered damaged.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    /// Add `rect` to the region. Empty rectangles are ignored.
    pub fn add(&mut self, rect: Rect) {
        if !rect.is_empty() {
            self.rects.push(rect);
        }
    }

    /// Smallest rectangle containing the whole region.
    pub fn bounds(&self) -> Rect {
        self.rects
            .iter()
            .copied()
            .reduce(|a, b| Rect {
                left: a.left.min(b.left),
                top: a.top.min(b.top),
                right: a.right.max(b.right),
                bottom: a.bottom.max(b.bottom),
            })
            .unwrap_or(Rect::EMPTY)
    }
}

impl From<Rect> for Region {
    fn from(rect: Rect) -> Self {
        let mut region = Region::new();
        region.add(rect);
        region
    }
}
