//! Codec Configuration
//!
//! One configuration type drives encode, decode and post-process sessions.
//! Fields a session does not use are ignored by it.
//!
//! # Examples
//!
//! ```rust
//! use lamco_codec::config::{CodecConfig, CodecKind, RateControlMode};
//!
//! // Using builder pattern
//! let config = CodecConfig::builder()
//!     .codec(CodecKind::Hevc)
//!     .resolution(1280, 720)
//!     .rc_mode(RateControlMode::Cbr)
//!     .bitrate_kbps(6000)
//!     .async_depth(3)
//!     .build();
//! assert!(config.validate().is_ok());
//!
//! // Using struct literal with defaults
//! let config = CodecConfig {
//!     width: 640,
//!     height: 480,
//!     ..Default::default()
//! };
//! assert_eq!(config.gop, 30);
//! ```

use std::fmt;

use lamco_surface::{MemType, PixelFormat};

/// Maximum quantization parameter
pub const MAX_QP: u8 = 51;

/// Maximum number of ROI regions
pub const MAX_REGIONS: usize = 8;

/// Default decode carry-over cache size
pub const DEFAULT_DECODE_CACHE_BYTES: usize = 16 << 20;

/// Bitstream codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecKind {
    /// H.264 / AVC
    #[default]
    Avc,
    /// H.265 / HEVC
    Hevc,
    /// Motion JPEG
    Jpeg,
}

impl CodecKind {
    /// FourCC code
    #[must_use]
    pub const fn fourcc(self) -> u32 {
        match self {
            Self::Avc => u32::from_le_bytes(*b"AVC "),
            Self::Hevc => u32::from_le_bytes(*b"HEVC"),
            Self::Jpeg => u32::from_le_bytes(*b"JPEG"),
        }
    }

    /// Look up a codec by FourCC
    #[must_use]
    pub fn from_fourcc(code: u32) -> Option<Self> {
        [Self::Avc, Self::Hevc, Self::Jpeg]
            .into_iter()
            .find(|c| c.fourcc() == code)
    }
}

/// Caller-facing color format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorFormat {
    /// 8-bit 4:2:0
    #[default]
    Nv12,
    /// 32-bit packed RGB with alpha
    Argb,
}

impl ColorFormat {
    /// Pixel format used for surfaces of this color format
    #[must_use]
    pub const fn pixel_format(self) -> PixelFormat {
        match self {
            Self::Nv12 => PixelFormat::Nv12,
            Self::Argb => PixelFormat::Rgb4,
        }
    }
}

/// Where input surfaces live and who owns them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryType {
    /// Caller-registered device textures
    ExternalGpu,
    /// Caller-registered host memory
    ExternalCpu,
    /// Session-owned device textures
    InternalGpu,
    /// Session-owned host memory
    #[default]
    InternalCpu,
}

impl MemoryType {
    /// Whether surfaces are device textures
    #[must_use]
    pub const fn is_gpu(self) -> bool {
        matches!(self, Self::ExternalGpu | Self::InternalGpu)
    }

    /// Whether the caller supplies the surfaces
    #[must_use]
    pub const fn is_external(self) -> bool {
        matches!(self, Self::ExternalGpu | Self::ExternalCpu)
    }

    /// Allocator memory flag for this placement
    #[must_use]
    pub const fn mem_type(self) -> MemType {
        if self.is_gpu() {
            MemType::VideoMemory
        } else {
            MemType::SystemMemory
        }
    }
}

/// Rate control method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateControlMode {
    /// Constant QP on the device, per-frame QP steered toward the target bitrate
    #[default]
    Auto,
    /// Constant QP from `const_qp`
    Cqp,
    /// Constant bitrate
    Cbr,
    /// Variable bitrate capped by the vendor max bitrate
    Vbr,
}

/// Slice partitioning mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SliceMode {
    /// Fixed macroblocks per slice
    #[default]
    MbBased,
    /// Fixed bytes per slice
    ByteBased,
    /// Tile rows
    TileBased,
    /// Block rows
    BlockBased,
}

/// Rotation applied by the post-process chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    /// 90 degrees clockwise
    Deg90,
    /// 180 degrees
    Deg180,
    /// 270 degrees clockwise
    Deg270,
}

impl Rotation {
    /// Angle in degrees
    #[must_use]
    pub const fn degrees(self) -> u16 {
        match self {
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }
}

/// Mirroring applied by the post-process chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirror {
    /// Flip left-right
    Horizontal,
    /// Flip top-bottom
    Vertical,
}

/// GPU vendor, identified by PCI vendor id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterVendor {
    /// Intel (0x8086)
    #[default]
    Intel,
    /// Nvidia (0x10DE)
    Nvidia,
    /// AMD (0x1002)
    Amd,
    /// Graphics debugger virtual adapter (0x1414)
    MsvcDebugger,
}

impl AdapterVendor {
    /// PCI vendor id
    #[must_use]
    pub const fn id(self) -> u16 {
        match self {
            Self::Intel => 0x8086,
            Self::Nvidia => 0x10DE,
            Self::Amd => 0x1002,
            Self::MsvcDebugger => 0x1414,
        }
    }

    /// Look up a vendor by PCI id
    #[must_use]
    pub const fn from_id(id: u16) -> Option<Self> {
        match id {
            0x8086 => Some(Self::Intel),
            0x10DE => Some(Self::Nvidia),
            0x1002 => Some(Self::Amd),
            0x1414 => Some(Self::MsvcDebugger),
            _ => None,
        }
    }
}

impl fmt::Display for AdapterVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Intel => "Intel",
            Self::Nvidia => "Nvidia",
            Self::Amd => "AMD",
            Self::MsvcDebugger => "MSVC debugger",
        };
        write!(f, "{name} (0x{:04X})", self.id())
    }
}

/// Intel-specific options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntelConfig {
    /// Run colour conversion on the fixed-function engine and enable low power (default: false)
    pub qsvff: bool,
    /// Encode regions of interest with their own QP (default: false)
    pub roi: bool,
    /// Per-region QP, at most 8 regions (default: empty)
    pub region_qp: Vec<i8>,
}

/// Nvidia-specific options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NvidiaConfig {
    /// Temporal adaptive quantization (default: false)
    pub temporal_aq: bool,
    /// Asynchronous completion events (default: false)
    pub async_mode: bool,
    /// Spatial AQ strength 1-15, 0 lets the driver choose (default: 0)
    pub aq_strength: u8,
    /// VBR ceiling in kbps, 0 for none (default: 0)
    pub max_bitrate_kbps: u32,
    /// VBV buffer size in bits, 0 for driver default (default: 0)
    pub vbv_size: u32,
}

/// Advanced encode options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvancedConfig {
    /// Partition frames into slices (default: false)
    pub slice: bool,
    /// Periodic intra refresh instead of IDR frames (default: false)
    pub intra_refresh: bool,
    /// Multi-view encode (default: false)
    pub mvc: bool,
    /// Slice partitioning mode (default: MbBased)
    pub slice_mode: SliceMode,
    /// Mode-specific slice size (default: 0)
    pub slice_data: u32,
    /// Frames between intra refresh cycles (default: 0)
    pub intra_refresh_period: u32,
    /// Frames per intra refresh cycle, below the period (default: 0)
    pub intra_refresh_duration: u32,
}

/// Post-process options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VppConfig {
    /// Input crop as x, y, w, h; all zero for none (default: zeros)
    pub in_crop: [u32; 4],
    /// Output width, 0 to keep the input width (default: 0)
    pub out_width: u32,
    /// Output height, 0 to keep the input height (default: 0)
    pub out_height: u32,
    /// Output crop as x, y, w, h; all zero for none (default: zeros)
    pub out_crop: [u32; 4],
    /// Rotation stage (default: None)
    pub rotation: Option<Rotation>,
    /// Mirror stage (default: None)
    pub mirror: Option<Mirror>,
}

/// Configuration for codec sessions
///
/// Use [`CodecConfig::builder()`] for ergonomic construction or struct
/// literal syntax with [`Default::default()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecConfig {
    /// Bitstream codec (default: Avc)
    pub codec: CodecKind,

    /// Frame width in pixels (default: 1920)
    pub width: u32,

    /// Frame height in pixels (default: 1080)
    pub height: u32,

    /// Average bitrate in kbps, ignored in CQP mode (default: 8000)
    pub bitrate_kbps: u32,

    /// QP for I, P and B frames (default: [24, 26, 28])
    ///
    /// Used directly in CQP mode; in Auto mode the I value is the starting
    /// point of the per-frame QP.
    pub const_qp: [u8; 3],

    /// Frames per second (default: 30)
    pub fps: u32,

    /// Frames per group of pictures (default: 30)
    pub gop: u32,

    /// Input ring depth (default: 4)
    ///
    /// At most this many frames are queued before output must be drained.
    pub async_depth: usize,

    /// Bytes reserved per encoded frame (default: 1 MiB)
    pub output_size_max: usize,

    /// Rate control method (default: Auto)
    pub rc_mode: RateControlMode,

    /// Color format of caller input (default: Nv12)
    pub input_format: ColorFormat,

    /// Color format of decoded or post-processed output (default: Nv12)
    pub output_format: ColorFormat,

    /// Input surface memory (default: InternalCpu)
    pub memory_type: MemoryType,

    /// GPU vendor (default: Intel)
    pub adapter: AdapterVendor,

    /// Intel-specific options
    pub intel: IntelConfig,

    /// Nvidia-specific options
    pub nvidia: NvidiaConfig,

    /// Advanced encode options
    pub advanced: AdvancedConfig,

    /// Post-process options
    pub vpp: VppConfig,

    /// Decode carry-over cache size in bytes (default: 16 MiB)
    pub decode_cache_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            codec: CodecKind::Avc,
            width: 1920,
            height: 1080,
            bitrate_kbps: 8000,
            const_qp: [24, 26, 28],
            fps: 30,
            gop: 30,
            async_depth: 4,
            output_size_max: 1 << 20,
            rc_mode: RateControlMode::Auto,
            input_format: ColorFormat::Nv12,
            output_format: ColorFormat::Nv12,
            memory_type: MemoryType::InternalCpu,
            adapter: AdapterVendor::Intel,
            intel: IntelConfig::default(),
            nvidia: NvidiaConfig::default(),
            advanced: AdvancedConfig::default(),
            vpp: VppConfig::default(),
            decode_cache_bytes: DEFAULT_DECODE_CACHE_BYTES,
        }
    }
}

impl CodecConfig {
    /// Create a new configuration builder
    #[must_use]
    pub fn builder() -> CodecConfigBuilder {
        CodecConfigBuilder::default()
    }

    /// Configuration tuned for interactive streaming
    ///
    /// Shallow ring, CBR, intra refresh instead of periodic IDR frames.
    #[must_use]
    pub fn low_latency() -> Self {
        Self {
            async_depth: 2,
            rc_mode: RateControlMode::Cbr,
            bitrate_kbps: 12000,
            fps: 60,
            gop: 60,
            advanced: AdvancedConfig {
                intra_refresh: true,
                intra_refresh_period: 60,
                intra_refresh_duration: 8,
                ..AdvancedConfig::default()
            },
            ..Self::default()
        }
    }

    /// Configuration tuned for recording
    ///
    /// Deeper ring, constant QP, larger output slots.
    #[must_use]
    pub fn archival() -> Self {
        Self {
            async_depth: 8,
            rc_mode: RateControlMode::Cqp,
            const_qp: [20, 22, 24],
            output_size_max: 4 << 20,
            ..Self::default()
        }
    }

    /// Configuration for decoding `codec` at an initial `width` x `height`
    ///
    /// The decoder overwrites width and height with what the stream header says.
    #[must_use]
    pub fn decode(codec: CodecKind, width: u32, height: u32) -> Self {
        Self {
            codec,
            width,
            height,
            ..Self::default()
        }
    }

    /// Pixel format the codec works in
    #[must_use]
    pub fn codec_pixel_format(&self) -> PixelFormat {
        PixelFormat::Nv12
    }

    /// Post-process output width, falling back to the frame width
    #[must_use]
    pub fn vpp_out_width(&self) -> u32 {
        if self.vpp.out_width == 0 {
            self.width
        } else {
            self.vpp.out_width
        }
    }

    /// Post-process output height, falling back to the frame height
    #[must_use]
    pub fn vpp_out_height(&self) -> u32 {
        if self.vpp.out_height == 0 {
            self.height
        } else {
            self.vpp.out_height
        }
    }

    /// Validate configuration and return any issues
    ///
    /// Returns `Ok(())` if configuration is valid, or a list of issues.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.width == 0 || self.height == 0 {
            issues.push("width and height must be non-zero".to_string());
        }

        if self.fps == 0 {
            issues.push("fps must be at least 1".to_string());
        }

        if self.async_depth == 0 {
            issues.push("async_depth must be at least 1".to_string());
        }

        if self.async_depth > 16 {
            issues.push("async_depth should not exceed 16".to_string());
        }

        if self.output_size_max == 0 {
            issues.push("output_size_max must be non-zero".to_string());
        }

        if matches!(self.rc_mode, RateControlMode::Cbr | RateControlMode::Vbr | RateControlMode::Auto)
            && self.bitrate_kbps == 0
        {
            issues.push(format!("{:?} rate control needs a bitrate", self.rc_mode));
        }

        if self.const_qp.iter().any(|&qp| qp > MAX_QP) {
            issues.push(format!("const_qp values must not exceed {MAX_QP}"));
        }

        if self.intel.region_qp.len() > MAX_REGIONS {
            issues.push(format!("at most {MAX_REGIONS} ROI regions are supported"));
        }

        if self.nvidia.aq_strength > 15 {
            issues.push("aq_strength must be in 0..=15".to_string());
        }

        if self.advanced.intra_refresh
            && self.advanced.intra_refresh_duration >= self.advanced.intra_refresh_period
        {
            issues.push("intra_refresh_duration must be smaller than intra_refresh_period".to_string());
        }

        if self.decode_cache_bytes == 0 {
            issues.push("decode_cache_bytes must be non-zero".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

/// Builder for [`CodecConfig`]
///
/// Provides a fluent interface for constructing configuration.
#[derive(Debug, Clone, Default)]
pub struct CodecConfigBuilder {
    codec: Option<CodecKind>,
    width: Option<u32>,
    height: Option<u32>,
    bitrate_kbps: Option<u32>,
    const_qp: Option<[u8; 3]>,
    fps: Option<u32>,
    gop: Option<u32>,
    async_depth: Option<usize>,
    output_size_max: Option<usize>,
    rc_mode: Option<RateControlMode>,
    input_format: Option<ColorFormat>,
    output_format: Option<ColorFormat>,
    memory_type: Option<MemoryType>,
    adapter: Option<AdapterVendor>,
    intel: Option<IntelConfig>,
    nvidia: Option<NvidiaConfig>,
    advanced: Option<AdvancedConfig>,
    vpp: Option<VppConfig>,
    decode_cache_bytes: Option<usize>,
}

impl CodecConfigBuilder {
    /// Set codec
    #[must_use]
    pub fn codec(mut self, codec: CodecKind) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Set frame width and height
    #[must_use]
    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Set average bitrate in kbps
    #[must_use]
    pub fn bitrate_kbps(mut self, kbps: u32) -> Self {
        self.bitrate_kbps = Some(kbps);
        self
    }

    /// Set I, P and B frame QP
    #[must_use]
    pub fn const_qp(mut self, qp: [u8; 3]) -> Self {
        self.const_qp = Some(qp);
        self
    }

    /// Set frames per second
    #[must_use]
    pub fn fps(mut self, fps: u32) -> Self {
        self.fps = Some(fps);
        self
    }

    /// Set GOP length
    #[must_use]
    pub fn gop(mut self, gop: u32) -> Self {
        self.gop = Some(gop);
        self
    }

    /// Set input ring depth
    #[must_use]
    pub fn async_depth(mut self, depth: usize) -> Self {
        self.async_depth = Some(depth);
        self
    }

    /// Set bytes reserved per encoded frame
    #[must_use]
    pub fn output_size_max(mut self, bytes: usize) -> Self {
        self.output_size_max = Some(bytes);
        self
    }

    /// Set rate control method
    #[must_use]
    pub fn rc_mode(mut self, mode: RateControlMode) -> Self {
        self.rc_mode = Some(mode);
        self
    }

    /// Set input color format
    #[must_use]
    pub fn input_format(mut self, format: ColorFormat) -> Self {
        self.input_format = Some(format);
        self
    }

    /// Set output color format
    #[must_use]
    pub fn output_format(mut self, format: ColorFormat) -> Self {
        self.output_format = Some(format);
        self
    }

    /// Set input surface memory
    #[must_use]
    pub fn memory_type(mut self, memory: MemoryType) -> Self {
        self.memory_type = Some(memory);
        self
    }

    /// Set GPU vendor
    #[must_use]
    pub fn adapter(mut self, adapter: AdapterVendor) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Set Intel-specific options
    #[must_use]
    pub fn intel(mut self, intel: IntelConfig) -> Self {
        self.intel = Some(intel);
        self
    }

    /// Set Nvidia-specific options
    #[must_use]
    pub fn nvidia(mut self, nvidia: NvidiaConfig) -> Self {
        self.nvidia = Some(nvidia);
        self
    }

    /// Set advanced encode options
    #[must_use]
    pub fn advanced(mut self, advanced: AdvancedConfig) -> Self {
        self.advanced = Some(advanced);
        self
    }

    /// Set post-process options
    #[must_use]
    pub fn vpp(mut self, vpp: VppConfig) -> Self {
        self.vpp = Some(vpp);
        self
    }

    /// Set decode carry-over cache size
    #[must_use]
    pub fn decode_cache_bytes(mut self, bytes: usize) -> Self {
        self.decode_cache_bytes = Some(bytes);
        self
    }

    /// Build the configuration
    ///
    /// Returns a [`CodecConfig`] with builder values overriding defaults.
    #[must_use]
    pub fn build(self) -> CodecConfig {
        let defaults = CodecConfig::default();

        CodecConfig {
            codec: self.codec.unwrap_or(defaults.codec),
            width: self.width.unwrap_or(defaults.width),
            height: self.height.unwrap_or(defaults.height),
            bitrate_kbps: self.bitrate_kbps.unwrap_or(defaults.bitrate_kbps),
            const_qp: self.const_qp.unwrap_or(defaults.const_qp),
            fps: self.fps.unwrap_or(defaults.fps),
            gop: self.gop.unwrap_or(defaults.gop),
            async_depth: self.async_depth.unwrap_or(defaults.async_depth),
            output_size_max: self.output_size_max.unwrap_or(defaults.output_size_max),
            rc_mode: self.rc_mode.unwrap_or(defaults.rc_mode),
            input_format: self.input_format.unwrap_or(defaults.input_format),
            output_format: self.output_format.unwrap_or(defaults.output_format),
            memory_type: self.memory_type.unwrap_or(defaults.memory_type),
            adapter: self.adapter.unwrap_or(defaults.adapter),
            intel: self.intel.unwrap_or(defaults.intel),
            nvidia: self.nvidia.unwrap_or(defaults.nvidia),
            advanced: self.advanced.unwrap_or(defaults.advanced),
            vpp: self.vpp.unwrap_or(defaults.vpp),
            decode_cache_bytes: self
                .decode_cache_bytes
                .unwrap_or(defaults.decode_cache_bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CodecConfig::default();

        assert_eq!(config.codec, CodecKind::Avc);
        assert_eq!(config.const_qp, [24, 26, 28]);
        assert_eq!(config.gop, 30);
        assert_eq!(config.async_depth, 4);
        assert_eq!(config.decode_cache_bytes, 16 << 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = CodecConfig::builder()
            .codec(CodecKind::Jpeg)
            .resolution(640, 360)
            .async_depth(2)
            .output_format(ColorFormat::Argb)
            .build();

        assert_eq!(config.codec, CodecKind::Jpeg);
        assert_eq!((config.width, config.height), (640, 360));
        assert_eq!(config.async_depth, 2);
        assert_eq!(config.output_format.pixel_format(), PixelFormat::Rgb4);
        assert_eq!(config.fps, 30);
    }

    #[test]
    fn test_config_validation() {
        let invalid = CodecConfig {
            width: 0,
            async_depth: 0,
            const_qp: [60, 26, 28],
            ..Default::default()
        };
        let issues = invalid.validate().expect_err("invalid");
        assert_eq!(issues.len(), 3);

        let cqp_without_bitrate = CodecConfig {
            rc_mode: RateControlMode::Cqp,
            bitrate_kbps: 0,
            ..Default::default()
        };
        assert!(cqp_without_bitrate.validate().is_ok());

        let cbr_without_bitrate = CodecConfig {
            rc_mode: RateControlMode::Cbr,
            bitrate_kbps: 0,
            ..Default::default()
        };
        assert!(cbr_without_bitrate.validate().is_err());
    }

    #[test]
    fn test_vendor_limits() {
        let config = CodecConfig {
            intel: IntelConfig {
                roi: true,
                region_qp: vec![0; 9],
                ..Default::default()
            },
            nvidia: NvidiaConfig {
                aq_strength: 16,
                ..Default::default()
            },
            advanced: AdvancedConfig {
                intra_refresh: true,
                intra_refresh_period: 8,
                intra_refresh_duration: 8,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(config.validate().expect_err("invalid").len(), 3);
    }

    #[test]
    fn test_presets() {
        let live = CodecConfig::low_latency();
        assert_eq!(live.rc_mode, RateControlMode::Cbr);
        assert!(live.validate().is_ok());

        let archive = CodecConfig::archival();
        assert!(archive.async_depth > live.async_depth);
        assert!(archive.validate().is_ok());

        let decode = CodecConfig::decode(CodecKind::Hevc, 320, 240);
        assert_eq!(decode.codec, CodecKind::Hevc);
    }

    #[test]
    fn test_adapter_vendor_ids() {
        for vendor in [
            AdapterVendor::Intel,
            AdapterVendor::Nvidia,
            AdapterVendor::Amd,
            AdapterVendor::MsvcDebugger,
        ] {
            assert_eq!(AdapterVendor::from_id(vendor.id()), Some(vendor));
        }
        assert_eq!(AdapterVendor::from_id(0x1234), None);
        assert_eq!(AdapterVendor::Nvidia.to_string(), "Nvidia (0x10DE)");
    }

    #[test]
    fn test_vpp_output_fallback() {
        let mut config = CodecConfig::default();
        assert_eq!(config.vpp_out_width(), 1920);
        config.vpp.out_width = 1280;
        config.vpp.out_height = 720;
        assert_eq!((config.vpp_out_width(), config.vpp_out_height()), (1280, 720));
    }

    #[test]
    fn test_codec_fourcc() {
        assert_eq!(CodecKind::from_fourcc(CodecKind::Hevc.fourcc()), Some(CodecKind::Hevc));
        assert_eq!(CodecKind::from_fourcc(0), None);
    }
}
