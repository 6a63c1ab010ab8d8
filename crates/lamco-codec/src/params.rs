//! Vendor Parameter Translation
//!
//! Turns a [`CodecConfig`] into the parameter blocks a hardware runtime is
//! initialized with. The two encode backends differ in how they express
//! rate control and which optional features they carry:
//!
//! - **Intel**: 16-bit bitrate fields with a BRC multiplier, ROI regions,
//!   low-power (fixed-function) mode, multi-view encode
//! - **Nvidia**: low-delay CBR, VBR ceiling and VBV size, adaptive
//!   quantization
//!
//! Both align frame dimensions to 16 with the crop set to the real size,
//! use 30 fps when none is configured and disable B-frames.
//!
//! # Examples
//!
//! ```rust
//! use lamco_codec::config::{AdapterVendor, CodecConfig, RateControlMode};
//! use lamco_codec::params::{EncodeParams, RateControl};
//!
//! # fn main() -> lamco_codec::Result<()> {
//! let config = CodecConfig::builder()
//!     .adapter(AdapterVendor::Intel)
//!     .rc_mode(RateControlMode::Cbr)
//!     .bitrate_kbps(100_000)
//!     .build();
//! let params = EncodeParams::for_vendor(&config)?;
//!
//! assert_eq!(params.brc_multiplier, 2);
//! assert_eq!(params.rate, RateControl::Cbr { target_kbps: 50_000 });
//! # Ok(())
//! # }
//! ```

use enumflags2::BitFlags;
use lamco_surface::{CropRect, FrameInfo, MemType};

use crate::config::{
    AdapterVendor, CodecConfig, CodecKind, Mirror, RateControlMode, Rotation, SliceMode, MAX_REGIONS,
};
use crate::error::{CodecError, Result};

/// Largest bitrate an Intel 16-bit rate field can carry
pub const INTEL_MAX_KBPS_FIELD: u32 = 65_535;

/// Frame rate used when none is configured
pub const DEFAULT_FPS: u32 = 30;

/// Rate control as programmed on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    /// Fixed QP for I, P and B frames
    ConstQp {
        /// I/P/B quantization parameters
        qp: [u8; 3],
    },
    /// Constant bitrate
    Cbr {
        /// Target in kbps, divided by the BRC multiplier
        target_kbps: u32,
    },
    /// Low-delay constant bitrate
    LowDelayCbr {
        /// Target in kbps
        target_kbps: u32,
    },
    /// Variable bitrate with a ceiling
    Vbr {
        /// Target in kbps, divided by the BRC multiplier
        target_kbps: u32,
        /// Ceiling in kbps, divided by the BRC multiplier
        max_kbps: u32,
    },
}

/// Region of interest with its own QP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiRegion {
    /// Region index
    pub index: u8,
    /// QP delta for the region
    pub qp: i8,
}

/// Slice partitioning as programmed on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceParams {
    /// Device slice mode code
    pub mode: u8,
    /// Mode-specific size
    pub data: u32,
}

impl SliceParams {
    fn from_mode(mode: SliceMode, data: u32) -> Self {
        let mode = match mode {
            SliceMode::TileBased => 1,
            SliceMode::BlockBased => 2,
            SliceMode::MbBased | SliceMode::ByteBased => 3,
        };
        Self { mode, data }
    }
}

/// Periodic intra refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntraRefresh {
    /// Frames between refresh cycles
    pub period: u32,
    /// Frames per refresh cycle
    pub duration: u32,
}

/// Adaptive quantization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveQuant {
    /// Temporal AQ
    pub temporal: bool,
    /// Spatial AQ strength, 0 for driver default
    pub strength: u8,
}

/// Encoder initialization parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeParams {
    /// Vendor the parameters were translated for
    pub vendor: AdapterVendor,
    /// Codec
    pub codec: CodecKind,
    /// Frame geometry, aligned to 16 with the real size as crop
    pub info: FrameInfo,
    /// Frame rate numerator
    pub fps_num: u32,
    /// Frame rate denominator
    pub fps_den: u32,
    /// Frames per GOP
    pub gop: u32,
    /// B-frames between references
    pub b_frames: u8,
    /// Frames in flight
    pub async_depth: usize,
    /// Device rate control
    pub rate: RateControl,
    /// QP is chosen per frame by the session
    pub per_frame_qp: bool,
    /// Divisor applied to bitrate fields
    pub brc_multiplier: u16,
    /// Fixed-function low-power mode
    pub low_power: bool,
    /// ROI regions
    pub roi: Vec<RoiRegion>,
    /// Number of views
    pub views: u16,
    /// Slice partitioning
    pub slice: Option<SliceParams>,
    /// Intra refresh
    pub intra_refresh: Option<IntraRefresh>,
    /// Adaptive quantization
    pub aq: Option<AdaptiveQuant>,
    /// VBV buffer size in bits, 0 for driver default
    pub vbv_size: u32,
}

/// Split `kbps` into a 16-bit target and a multiplier
///
/// Returns `(target, multiplier)` with `target * multiplier >= kbps`.
#[must_use]
pub fn intel_brc(kbps: u32) -> (u32, u16) {
    if kbps <= INTEL_MAX_KBPS_FIELD {
        return (kbps, 1);
    }
    let mult = kbps.div_ceil(INTEL_MAX_KBPS_FIELD);
    let target = kbps.div_ceil(mult).min(INTEL_MAX_KBPS_FIELD);
    (target, mult as u16)
}

fn aligned_info(config: &CodecConfig) -> FrameInfo {
    FrameInfo::new(config.codec_pixel_format(), config.width, config.height)
        .aligned16()
        .with_crop(CropRect::full(config.width, config.height))
}

impl EncodeParams {
    /// Translate `config` for its adapter vendor
    ///
    /// Vendors without an encode backend are [`CodecError::UnsupportedVendor`].
    pub fn for_vendor(config: &CodecConfig) -> Result<Self> {
        let base = Self {
            vendor: config.adapter,
            codec: config.codec,
            info: aligned_info(config),
            fps_num: if config.fps == 0 { DEFAULT_FPS } else { config.fps },
            fps_den: 1,
            gop: config.gop,
            b_frames: 0,
            async_depth: config.async_depth,
            rate: RateControl::ConstQp { qp: config.const_qp },
            per_frame_qp: config.rc_mode == RateControlMode::Auto,
            brc_multiplier: 1,
            low_power: false,
            roi: Vec::new(),
            views: 1,
            slice: None,
            intra_refresh: None,
            aq: None,
            vbv_size: 0,
        };

        match config.adapter {
            AdapterVendor::Intel => Self::intel(config, base),
            AdapterVendor::Nvidia => Ok(Self::nvidia(config, base)),
            other => Err(CodecError::UnsupportedVendor {
                vendor: other.to_string(),
                session: "encode",
            }),
        }
    }

    fn intel(config: &CodecConfig, mut params: Self) -> Result<Self> {
        let (target, mult) = intel_brc(config.bitrate_kbps);
        match config.rc_mode {
            RateControlMode::Auto | RateControlMode::Cqp => {}
            RateControlMode::Cbr => {
                params.brc_multiplier = mult;
                params.rate = RateControl::Cbr { target_kbps: target };
            }
            RateControlMode::Vbr => {
                params.brc_multiplier = mult;
                params.rate = RateControl::Vbr {
                    target_kbps: target,
                    max_kbps: target,
                };
            }
        }

        if config.intel.roi {
            params.rate = RateControl::ConstQp { qp: [0; 3] };
            params.per_frame_qp = false;
            params.brc_multiplier = 1;
            params.roi = config
                .intel
                .region_qp
                .iter()
                .take(MAX_REGIONS)
                .enumerate()
                .map(|(index, &qp)| RoiRegion {
                    index: index as u8,
                    qp,
                })
                .collect();
        }

        params.low_power = config.intel.qsvff;

        if config.advanced.mvc {
            if config.codec == CodecKind::Jpeg {
                return Err(CodecError::incompatible("multi-view encode is not available for JPEG"));
            }
            params.views = 2;
        }

        if config.advanced.slice {
            params.slice = Some(SliceParams::from_mode(
                config.advanced.slice_mode,
                config.advanced.slice_data,
            ));
        }

        if config.advanced.intra_refresh {
            params.intra_refresh = Some(IntraRefresh {
                period: config.advanced.intra_refresh_period,
                duration: config.advanced.intra_refresh_duration,
            });
        }

        Ok(params)
    }

    fn nvidia(config: &CodecConfig, mut params: Self) -> Self {
        let nv = &config.nvidia;
        match config.rc_mode {
            RateControlMode::Auto | RateControlMode::Cqp => {}
            RateControlMode::Cbr => {
                params.rate = RateControl::LowDelayCbr {
                    target_kbps: config.bitrate_kbps,
                };
            }
            RateControlMode::Vbr => {
                let max_kbps = if nv.max_bitrate_kbps == 0 {
                    config.bitrate_kbps
                } else {
                    nv.max_bitrate_kbps
                };
                params.rate = RateControl::Vbr {
                    target_kbps: config.bitrate_kbps,
                    max_kbps,
                };
                params.vbv_size = nv.vbv_size;
            }
        }

        if nv.temporal_aq || nv.aq_strength > 0 {
            params.aq = Some(AdaptiveQuant {
                temporal: nv.temporal_aq,
                strength: nv.aq_strength.min(15),
            });
        }

        if config.advanced.intra_refresh {
            params.intra_refresh = Some(IntraRefresh {
                period: config.advanced.intra_refresh_period,
                duration: config.advanced.intra_refresh_duration,
            });
        }

        params
    }
}

/// Decoder initialization parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeParams {
    /// Codec
    pub codec: CodecKind,
    /// Decoded frame geometry
    pub info: FrameInfo,
    /// Frames in flight
    pub async_depth: usize,
    /// Memory the work surfaces live in
    pub memory: BitFlags<MemType>,
}

/// Post-process stage operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Scale and color-convert
    ResizeCsc,
    /// Rotate
    Rotate(Rotation),
    /// Mirror
    Mirror(Mirror),
}

/// Post-process stage initialization parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VppParams {
    /// Operation
    pub kind: StageKind,
    /// Input geometry
    pub input: FrameInfo,
    /// Output geometry
    pub output: FrameInfo,
    /// Frame rate numerator
    pub fps_num: u32,
    /// Frame rate denominator
    pub fps_den: u32,
    /// Progressive frames
    pub progressive: bool,
}

impl VppParams {
    /// Stage parameters at 30/1 fps, progressive
    #[must_use]
    pub fn new(kind: StageKind, input: FrameInfo, output: FrameInfo) -> Self {
        Self {
            kind,
            input,
            output,
            fps_num: DEFAULT_FPS,
            fps_den: 1,
            progressive: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdvancedConfig, IntelConfig, NvidiaConfig};

    #[test]
    fn test_intel_brc_multiplier() {
        assert_eq!(intel_brc(8000), (8000, 1));
        assert_eq!(intel_brc(65_535), (65_535, 1));
        assert_eq!(intel_brc(65_536), (32_768, 2));
        assert_eq!(intel_brc(200_000), (50_000, 4));

        let (target, mult) = intel_brc(131_070);
        assert_eq!(mult, 2);
        assert!(target <= INTEL_MAX_KBPS_FIELD);
        assert!(target * u32::from(mult) >= 131_070);
    }

    #[test]
    fn test_alignment_and_crop() {
        let config = CodecConfig::builder().resolution(1918, 1078).build();
        let params = EncodeParams::for_vendor(&config).expect("params");
        assert_eq!((params.info.width, params.info.height), (1920, 1088));
        assert_eq!((params.info.crop.w, params.info.crop.h), (1918, 1078));
        assert_eq!(params.b_frames, 0);
        assert_eq!(params.gop, 30);
        assert_eq!((params.fps_num, params.fps_den), (30, 1));
    }

    #[test]
    fn test_auto_maps_to_const_qp() {
        let config = CodecConfig::default();
        let params = EncodeParams::for_vendor(&config).expect("params");
        assert_eq!(params.rate, RateControl::ConstQp { qp: [24, 26, 28] });
        assert!(params.per_frame_qp);
    }

    #[test]
    fn test_intel_roi_and_low_power() {
        let config = CodecConfig {
            rc_mode: RateControlMode::Cbr,
            intel: IntelConfig {
                qsvff: true,
                roi: true,
                region_qp: vec![-4, 2, 6],
            },
            ..Default::default()
        };
        let params = EncodeParams::for_vendor(&config).expect("params");
        assert_eq!(params.rate, RateControl::ConstQp { qp: [0; 3] });
        assert!(!params.per_frame_qp);
        assert!(params.low_power);
        assert_eq!(params.roi.len(), 3);
        assert_eq!(params.roi[2], RoiRegion { index: 2, qp: 6 });
    }

    #[test]
    fn test_intel_mvc() {
        let mut config = CodecConfig {
            advanced: AdvancedConfig {
                mvc: true,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(EncodeParams::for_vendor(&config).expect("params").views, 2);

        config.codec = CodecKind::Jpeg;
        assert!(matches!(
            EncodeParams::for_vendor(&config),
            Err(CodecError::Incompatible(_))
        ));
    }

    #[test]
    fn test_intel_slice_modes() {
        let mut config = CodecConfig {
            advanced: AdvancedConfig {
                slice: true,
                slice_mode: SliceMode::TileBased,
                slice_data: 4,
                ..Default::default()
            },
            ..Default::default()
        };
        let slice = EncodeParams::for_vendor(&config).expect("params").slice;
        assert_eq!(slice, Some(SliceParams { mode: 1, data: 4 }));

        config.advanced.slice_mode = SliceMode::BlockBased;
        assert_eq!(EncodeParams::for_vendor(&config).expect("params").slice.map(|s| s.mode), Some(2));

        config.advanced.slice_mode = SliceMode::ByteBased;
        assert_eq!(EncodeParams::for_vendor(&config).expect("params").slice.map(|s| s.mode), Some(3));
    }

    #[test]
    fn test_nvidia_rate_control() {
        let mut config = CodecConfig {
            adapter: AdapterVendor::Nvidia,
            rc_mode: RateControlMode::Cbr,
            bitrate_kbps: 100_000,
            ..Default::default()
        };
        let params = EncodeParams::for_vendor(&config).expect("params");
        assert_eq!(params.rate, RateControl::LowDelayCbr { target_kbps: 100_000 });
        assert_eq!(params.brc_multiplier, 1);

        config.rc_mode = RateControlMode::Vbr;
        config.nvidia = NvidiaConfig {
            temporal_aq: true,
            aq_strength: 8,
            max_bitrate_kbps: 150_000,
            vbv_size: 4_000_000,
            ..Default::default()
        };
        let params = EncodeParams::for_vendor(&config).expect("params");
        assert_eq!(
            params.rate,
            RateControl::Vbr {
                target_kbps: 100_000,
                max_kbps: 150_000
            }
        );
        assert_eq!(params.vbv_size, 4_000_000);
        assert_eq!(
            params.aq,
            Some(AdaptiveQuant {
                temporal: true,
                strength: 8
            })
        );
    }

    #[test]
    fn test_intra_refresh() {
        let config = CodecConfig::low_latency();
        let params = EncodeParams::for_vendor(&config).expect("params");
        assert_eq!(
            params.intra_refresh,
            Some(IntraRefresh {
                period: 60,
                duration: 8
            })
        );
    }

    #[test]
    fn test_unsupported_vendor() {
        let config = CodecConfig {
            adapter: AdapterVendor::Amd,
            ..Default::default()
        };
        assert!(matches!(
            EncodeParams::for_vendor(&config),
            Err(CodecError::UnsupportedVendor { session: "encode", .. })
        ));
    }

    #[test]
    fn test_vpp_params_defaults() {
        let info = FrameInfo::new(lamco_surface::PixelFormat::Nv12, 64, 64);
        let params = VppParams::new(StageKind::ResizeCsc, info, info);
        assert_eq!((params.fps_num, params.fps_den), (30, 1));
        assert!(params.progressive);
    }
}
