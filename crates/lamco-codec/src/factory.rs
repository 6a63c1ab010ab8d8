//! Vendor Dispatch
//!
//! Picks a session implementation from [`CodecConfig::adapter`].
//!
//! | Vendor          | Encode | Decode | Post-process |
//! |-----------------|--------|--------|--------------|
//! | Intel (0x8086)  | yes    | yes    | yes          |
//! | Nvidia (0x10DE) | yes    | no     | no           |
//! | AMD (0x1002)    | no     | no     | no           |
//! | Debugger (0x1414) | no   | no     | no           |
//!
//! # Examples
//!
//! ```rust
//! use lamco_codec::config::{AdapterVendor, CodecConfig};
//! use lamco_codec::factory::{Encoder, SessionKind};
//! use lamco_codec::sim::SimulatedSession;
//! use lamco_surface::SystemAllocator;
//!
//! # fn main() -> lamco_codec::Result<()> {
//! assert!(!SessionKind::Decode.supported_by(AdapterVendor::Nvidia));
//!
//! let config = CodecConfig::builder()
//!     .adapter(AdapterVendor::Nvidia)
//!     .resolution(64, 64)
//!     .output_size_max(8192)
//!     .build();
//! let encoder = Encoder::allocate(
//!     config,
//!     Box::new(SimulatedSession::new()),
//!     Box::new(SystemAllocator::new()),
//! )?;
//! assert_eq!(encoder.vendor(), AdapterVendor::Nvidia);
//! # Ok(())
//! # }
//! ```

use lamco_surface::FrameAllocator;

use crate::config::{AdapterVendor, CodecConfig};
use crate::decoder::DecodeSession;
use crate::encoder::EncodeSession;
use crate::error::{CodecError, Result};
use crate::hardware::HardwareSession;
use crate::vpp::VppSession;

/// Kind of session a vendor may provide
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Encoding
    Encode,
    /// Decoding
    Decode,
    /// Post-processing
    Vpp,
}

impl SessionKind {
    /// Short name used in errors
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Encode => "encode",
            Self::Decode => "decode",
            Self::Vpp => "vpp",
        }
    }

    /// Whether `vendor` provides this kind of session
    #[must_use]
    pub const fn supported_by(self, vendor: AdapterVendor) -> bool {
        matches!(
            (vendor, self),
            (AdapterVendor::Intel, _) | (AdapterVendor::Nvidia, Self::Encode)
        )
    }
}

fn unsupported(vendor: AdapterVendor, kind: SessionKind) -> CodecError {
    CodecError::UnsupportedVendor {
        vendor: vendor.to_string(),
        session: kind.name(),
    }
}

/// Vendor-tagged encode session
pub enum Encoder {
    /// Intel encoder
    Intel(EncodeSession),
    /// Nvidia encoder
    Nvidia(EncodeSession),
}

impl Encoder {
    /// Allocate the encoder for `config.adapter`
    pub fn allocate(
        config: CodecConfig,
        hw: Box<dyn HardwareSession>,
        frames: Box<dyn FrameAllocator>,
    ) -> Result<Self> {
        match config.adapter {
            AdapterVendor::Intel => Ok(Self::Intel(EncodeSession::allocate(config, hw, frames)?)),
            AdapterVendor::Nvidia => Ok(Self::Nvidia(EncodeSession::allocate(config, hw, frames)?)),
            other => Err(unsupported(other, SessionKind::Encode)),
        }
    }

    /// Vendor of the session
    #[must_use]
    pub fn vendor(&self) -> AdapterVendor {
        match self {
            Self::Intel(_) => AdapterVendor::Intel,
            Self::Nvidia(_) => AdapterVendor::Nvidia,
        }
    }

    /// The session
    #[must_use]
    pub fn session(&self) -> &EncodeSession {
        match self {
            Self::Intel(s) | Self::Nvidia(s) => s,
        }
    }

    /// Unwrap the session
    #[must_use]
    pub fn into_session(self) -> EncodeSession {
        match self {
            Self::Intel(s) | Self::Nvidia(s) => s,
        }
    }
}

/// Vendor-tagged decode session
pub enum Decoder {
    /// Intel decoder
    Intel(DecodeSession),
}

impl Decoder {
    /// Allocate the decoder for `config.adapter`
    pub fn allocate(
        config: CodecConfig,
        hw: Box<dyn HardwareSession>,
        frames: Box<dyn FrameAllocator>,
        header: &[u8],
    ) -> Result<Self> {
        match config.adapter {
            AdapterVendor::Intel => Ok(Self::Intel(DecodeSession::allocate(config, hw, frames, header)?)),
            other => Err(unsupported(other, SessionKind::Decode)),
        }
    }

    /// Vendor of the session
    #[must_use]
    pub fn vendor(&self) -> AdapterVendor {
        AdapterVendor::Intel
    }

    /// The session
    #[must_use]
    pub fn session(&self) -> &DecodeSession {
        match self {
            Self::Intel(s) => s,
        }
    }
}

/// Vendor-tagged post-process session
pub enum Vpp {
    /// Intel post-processor
    Intel(VppSession),
}

impl Vpp {
    /// Allocate the post-processor for `config.adapter`
    pub fn allocate(
        config: CodecConfig,
        hw: Box<dyn HardwareSession>,
        frames: Box<dyn FrameAllocator>,
    ) -> Result<Self> {
        match config.adapter {
            AdapterVendor::Intel => Ok(Self::Intel(VppSession::allocate(config, hw, frames)?)),
            other => Err(unsupported(other, SessionKind::Vpp)),
        }
    }

    /// Vendor of the session
    #[must_use]
    pub fn vendor(&self) -> AdapterVendor {
        AdapterVendor::Intel
    }

    /// The session
    #[must_use]
    pub fn session(&self) -> &VppSession {
        match self {
            Self::Intel(s) => s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CodecKind, VppConfig};
    use crate::sim::{sequence_header, SimulatedSession};
    use lamco_surface::SystemAllocator;

    fn config(adapter: AdapterVendor) -> CodecConfig {
        CodecConfig::builder()
            .adapter(adapter)
            .resolution(64, 64)
            .output_size_max(4096)
            .build()
    }

    fn hw() -> Box<dyn HardwareSession> {
        Box::new(SimulatedSession::new())
    }

    fn frames() -> Box<dyn FrameAllocator> {
        Box::new(SystemAllocator::new())
    }

    #[test]
    fn test_support_matrix() {
        for kind in [SessionKind::Encode, SessionKind::Decode, SessionKind::Vpp] {
            assert!(kind.supported_by(AdapterVendor::Intel));
            assert!(!kind.supported_by(AdapterVendor::Amd));
            assert!(!kind.supported_by(AdapterVendor::MsvcDebugger));
        }
        assert!(SessionKind::Encode.supported_by(AdapterVendor::Nvidia));
        assert!(!SessionKind::Vpp.supported_by(AdapterVendor::Nvidia));
    }

    #[test]
    fn test_encoders_by_vendor() {
        let intel = Encoder::allocate(config(AdapterVendor::Intel), hw(), frames()).expect("intel");
        assert_eq!(intel.vendor(), AdapterVendor::Intel);
        assert_eq!(intel.session().config().adapter, AdapterVendor::Intel);

        let nvidia = Encoder::allocate(config(AdapterVendor::Nvidia), hw(), frames()).expect("nvidia");
        assert_eq!(nvidia.vendor(), AdapterVendor::Nvidia);
        let session = nvidia.into_session();
        assert!(session.can_accept());
    }

    #[test]
    fn test_unsupported_vendors() {
        let vendor = AdapterVendor::from_id(0x1002).expect("known id");
        let err = Encoder::allocate(config(vendor), hw(), frames()).err().expect("amd");
        assert!(matches!(err, CodecError::UnsupportedVendor { session: "encode", .. }));

        let header = sequence_header(CodecKind::Avc, 64, 64);
        let err = Decoder::allocate(config(AdapterVendor::Nvidia), hw(), frames(), &header)
            .err()
            .expect("nvidia decode");
        match err {
            CodecError::UnsupportedVendor { vendor, session } => {
                assert_eq!(session, "decode");
                assert!(vendor.contains("0x10DE"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = Vpp::allocate(config(AdapterVendor::MsvcDebugger), hw(), frames())
            .err()
            .expect("debugger vpp");
        assert!(matches!(err, CodecError::UnsupportedVendor { session: "vpp", .. }));
    }

    #[test]
    fn test_intel_decode_and_vpp() {
        let header = sequence_header(CodecKind::Avc, 64, 64);
        let decoder = Decoder::allocate(config(AdapterVendor::Intel), hw(), frames(), &header).expect("decoder");
        assert_eq!(decoder.vendor(), AdapterVendor::Intel);
        assert!(decoder.session().input_available());

        let vpp = Vpp::allocate(
            CodecConfig {
                vpp: VppConfig {
                    out_width: 32,
                    out_height: 32,
                    ..VppConfig::default()
                },
                ..config(AdapterVendor::Intel)
            },
            hw(),
            frames(),
        )
        .expect("vpp");
        assert_eq!(vpp.session().chain().len(), 1);
    }
}
