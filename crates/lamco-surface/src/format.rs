//! Pixel formats and frame geometry
//!
//! Formats are identified by their FourCC. Byte sizes and plane layouts
//! follow the packing used by hardware codec runtimes: planar YUV with an
//! interleaved chroma plane (NV12, P010), packed YUV (YUY2, UYVY, AYUV)
//! and packed RGB (RGB3, RGB4, A2RGB10).

use std::fmt;

/// Round `value` up to the next multiple of 16
#[must_use]
pub const fn align16(value: u32) -> u32 {
    (value + 15) & !15
}

/// Round `value` up to the next multiple of 32
#[must_use]
pub const fn align32(value: u32) -> u32 {
    (value + 31) & !31
}

const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

/// Pixel formats understood by the allocators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit 4:2:0, Y plane followed by interleaved UV
    Nv12,
    /// 8-bit 4:2:0, Y plane then V then U
    Yv12,
    /// 8-bit 4:2:2, Y plane followed by interleaved UV
    Nv16,
    /// Packed 4:2:2, Y0 U Y1 V
    Yuy2,
    /// Packed 4:2:2, U Y0 V Y1
    Uyvy,
    /// Packed 24-bit B G R
    Rgb3,
    /// Packed 32-bit B G R A
    Rgb4,
    /// 10-bit 4:2:0 in 16-bit words
    P010,
    /// 10-bit 4:2:2 in 16-bit words
    P210,
    /// Packed 4:4:4:4 V U Y A
    Ayuv,
    /// Packed 10-bit RGB with 2-bit alpha
    A2rgb10,
    /// Single 16-bit channel
    R16,
    /// Linear 8-bit buffer, used for codec side data
    P8,
}

impl PixelFormat {
    /// FourCC code for this format
    #[must_use]
    pub const fn fourcc(self) -> u32 {
        match self {
            Self::Nv12 => fourcc(b"NV12"),
            Self::Yv12 => fourcc(b"YV12"),
            Self::Nv16 => fourcc(b"NV16"),
            Self::Yuy2 => fourcc(b"YUY2"),
            Self::Uyvy => fourcc(b"UYVY"),
            Self::Rgb3 => fourcc(b"RGB3"),
            Self::Rgb4 => fourcc(b"RGB4"),
            Self::P010 => fourcc(b"P010"),
            Self::P210 => fourcc(b"P210"),
            Self::Ayuv => fourcc(b"AYUV"),
            Self::A2rgb10 => fourcc(b"RG10"),
            Self::R16 => fourcc(b"R16U"),
            Self::P8 => fourcc(b"P8  "),
        }
    }

    /// Look up a format by FourCC
    #[must_use]
    pub fn from_fourcc(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.fourcc() == code)
    }

    /// All known formats
    pub const ALL: [Self; 13] = [
        Self::Nv12,
        Self::Yv12,
        Self::Nv16,
        Self::Yuy2,
        Self::Uyvy,
        Self::Rgb3,
        Self::Rgb4,
        Self::P010,
        Self::P210,
        Self::Ayuv,
        Self::A2rgb10,
        Self::R16,
        Self::P8,
    ];

    /// Whether the first plane is addressed as B rather than Y
    #[must_use]
    pub const fn is_rgb(self) -> bool {
        matches!(self, Self::Rgb3 | Self::Rgb4 | Self::A2rgb10 | Self::R16)
    }

    /// Bytes needed for a `width` x `height` frame in host memory
    ///
    /// Returns `None` for formats with no host layout (P8).
    #[must_use]
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            Self::Nv12 | Self::Yv12 => Some(pixels * 3 / 2),
            Self::Nv16 | Self::R16 | Self::Uyvy | Self::Yuy2 => Some(pixels * 2),
            Self::Rgb3 | Self::P010 => Some(pixels * 3),
            Self::Rgb4 | Self::Ayuv | Self::A2rgb10 | Self::P210 => Some(pixels * 4),
            Self::P8 => None,
        }
    }

    /// Short display name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Nv12 => "NV12",
            Self::Yv12 => "YV12",
            Self::Nv16 => "NV16",
            Self::Yuy2 => "YUY2",
            Self::Uyvy => "UYVY",
            Self::Rgb3 => "RGB3",
            Self::Rgb4 => "RGB4",
            Self::P010 => "P010",
            Self::P210 => "P210",
            Self::Ayuv => "AYUV",
            Self::A2rgb10 => "A2RGB10",
            Self::R16 => "R16",
            Self::P8 => "P8",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Crop rectangle inside a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropRect {
    /// Left edge
    pub x: u32,
    /// Top edge
    pub y: u32,
    /// Visible width
    pub w: u32,
    /// Visible height
    pub h: u32,
}

impl CropRect {
    /// Crop covering the whole `width` x `height` frame
    #[must_use]
    pub const fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            w: width,
            h: height,
        }
    }

    /// Whether the rectangle is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }
}

/// Format and geometry of one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Pixel format
    pub format: PixelFormat,
    /// Allocated width
    pub width: u32,
    /// Allocated height
    pub height: u32,
    /// Visible region
    pub crop: CropRect,
}

impl FrameInfo {
    /// Frame info with a full-frame crop
    #[must_use]
    pub const fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            crop: CropRect::full(width, height),
        }
    }

    /// Replace the crop rectangle
    #[must_use]
    pub const fn with_crop(mut self, crop: CropRect) -> Self {
        self.crop = crop;
        self
    }

    /// Same info with width and height rounded up to 16
    ///
    /// The crop keeps the original visible size.
    #[must_use]
    pub const fn aligned16(self) -> Self {
        Self {
            format: self.format,
            width: align16(self.width),
            height: align16(self.height),
            crop: self.crop,
        }
    }

    /// Whether format, width or height differ from `other`
    #[must_use]
    pub fn differs_in_shape(&self, other: &Self) -> bool {
        self.format != other.format || self.width != other.width || self.height != other.height
    }
}

/// Byte offsets of each plane relative to the first pixel, plus row pitch
///
/// Packed formats expose their component offsets within the first pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Luma (or first component) offset
    pub y: usize,
    /// U / Cb offset
    pub u: Option<usize>,
    /// V / Cr offset
    pub v: Option<usize>,
    /// Alpha offset
    pub a: Option<usize>,
    /// Row pitch in bytes
    pub pitch: usize,
}

impl PlaneLayout {
    /// Host-memory layout of a `width` x `height` frame
    ///
    /// Returns `None` for formats with no host layout.
    #[must_use]
    pub fn for_format(format: PixelFormat, width: u32, height: u32) -> Option<Self> {
        let w = width as usize;
        let h = height as usize;
        let layout = match format {
            PixelFormat::Nv12 | PixelFormat::Nv16 => Self {
                y: 0,
                u: Some(w * h),
                v: Some(w * h + 1),
                a: None,
                pitch: w,
            },
            PixelFormat::Yv12 => {
                let v = w * h;
                Self {
                    y: 0,
                    u: Some(v + (w / 2) * (h / 2)),
                    v: Some(v),
                    a: None,
                    pitch: w,
                }
            }
            PixelFormat::Uyvy => Self {
                y: 1,
                u: Some(0),
                v: Some(2),
                a: None,
                pitch: 2 * w,
            },
            PixelFormat::Yuy2 => Self {
                y: 0,
                u: Some(1),
                v: Some(3),
                a: None,
                pitch: 2 * w,
            },
            // B G R order: y addresses B.
            PixelFormat::Rgb3 => Self {
                y: 0,
                u: None,
                v: None,
                a: None,
                pitch: 3 * w,
            },
            PixelFormat::Rgb4 | PixelFormat::A2rgb10 => Self {
                y: 0,
                u: None,
                v: None,
                a: Some(3),
                pitch: 4 * w,
            },
            PixelFormat::R16 => Self {
                y: 0,
                u: None,
                v: None,
                a: None,
                pitch: 2 * w,
            },
            PixelFormat::P010 | PixelFormat::P210 => Self {
                y: 0,
                u: Some(w * h * 2),
                v: Some(w * h * 2 + 2),
                a: None,
                pitch: 2 * w,
            },
            PixelFormat::Ayuv => Self {
                y: 0,
                u: Some(1),
                v: Some(2),
                a: Some(3),
                pitch: 4 * w,
            },
            PixelFormat::P8 => return None,
        };
        Some(layout)
    }

    /// Offset handed out as the frame's native CPU handle
    ///
    /// RGB formats expose the B plane, everything else the Y plane.
    #[must_use]
    pub fn handle_offset(&self, format: PixelFormat) -> usize {
        if format.is_rgb() {
            0
        } else {
            self.y
        }
    }
}
