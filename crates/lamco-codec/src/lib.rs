//! # lamco-codec
//!
//! Hardware video encode, decode and post-process sessions built on the
//! bounded frame memory of [`lamco_surface`].
//!
//! A session owns a device handle ([`HardwareSession`]), one or more
//! fixed [`SurfacePool`](lamco_surface::SurfacePool)s and, where the
//! configured output differs from the working format, a
//! [`PostProcessChain`]. Producers and consumers run on different threads;
//! every call takes `&self`.
//!
//! # Architecture
//!
//! ```text
//!   producer thread                         consumer thread
//! ┌──────────────────┐                  ┌──────────────────────┐
//! │ dequeue_input    │                  │ dequeue_output       │
//! │ write picture    │                  │ read bitstream       │
//! │ queue_input      │                  │ release_output       │
//! └────────┬─────────┘                  └──────────▲───────────┘
//!          │                                       │
//!          ▼                                       │
//! ┌──────────────────┐   ┌──────────────┐   ┌──────┴───────────┐
//! │ input ring       │──►│ chain        │──►│ device encode    │
//! │ (SurfacePool)    │   │ resize / CSC │   │ into output arena│
//! └──────────────────┘   └──────────────┘   └──────────────────┘
//! ```
//!
//! Decoding runs the same path in reverse: bitstream is reassembled into
//! whole units, decoded into a work pool, optionally post-processed, and
//! handed out through a [`SafeQueue`](lamco_surface::SafeQueue).
//!
//! # Quick Start
//!
//! ```rust
//! use lamco_codec::prelude::*;
//! use lamco_codec::sim::SimulatedSession;
//!
//! # fn main() -> lamco_codec::Result<()> {
//! let config = CodecConfig::builder()
//!     .codec(CodecKind::Avc)
//!     .resolution(64, 64)
//!     .output_size_max(8192)
//!     .build();
//! let session = EncodeSession::allocate(
//!     config,
//!     Box::new(SimulatedSession::new()),
//!     Box::new(SystemAllocator::new()),
//! )?;
//!
//! if let Some(input) = session.dequeue_input_buffer()? {
//!     input.write_luma(&[0x80; 64 * 64]);
//!     session.queue_input_buffer(input)?;
//! }
//! if let Some(frame) = session.dequeue_output_buffer(None)? {
//!     let bytes = session.output_bytes(&frame)?;
//!     assert!(!bytes.is_empty());
//!     session.release_output_buffer(frame);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Status Handling
//!
//! Backpressure is part of normal operation: a full ring, an exhausted
//! arena or a busy chain surface show up as `Ok(false)` or `Ok(None)`.
//! An `Err` is a configuration problem, malformed input, a hardware fault
//! or API misuse; see [`ErrorKind`].
//!
//! # Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `pump` | Yes | Tokio output pump for encode sessions |
//! | `full` | No | All features |

#![cfg_attr(docsrs, feature(doc_cfg))]

// =============================================================================
// CORE MODULES
// =============================================================================

pub mod chain;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod factory;
pub mod hardware;
pub mod multilayer;
pub mod params;
pub mod rate;
pub mod retry;
pub mod sim;
pub mod vpp;

#[cfg(feature = "pump")]
#[cfg_attr(docsrs, doc(cfg(feature = "pump")))]
pub mod pump;

// =============================================================================
// RE-EXPORTS - PRIMARY API
// =============================================================================

pub use chain::{ChainDescriptor, ChainRun, ChainStats, PostProcessChain};
pub use config::{
    AdapterVendor, CodecConfig, CodecConfigBuilder, CodecKind, ColorFormat, MemoryType, Mirror,
    RateControlMode, Rotation, SliceMode, VppConfig,
};
pub use decoder::{DecodeSession, DecodeStats, DecodedFrame};
pub use encoder::{EncodeSession, EncodeStats, EncodedFrame, EncoderCore, FlowControl, InputBuffer};
pub use error::{CodecError, ErrorKind, Result};
pub use factory::{Decoder, Encoder, SessionKind, Vpp};
pub use hardware::{ApiVersion, HardwareSession, HwStatus, SyncStatus};
pub use multilayer::MultiLayerEncoder;
pub use rate::QualityController;
pub use retry::RetryPolicy;
pub use vpp::{VppInput, VppOutput, VppSession, VppStats};

#[cfg(feature = "pump")]
pub use pump::{EncodedPacket, OutputPump, PumpConfig};

// =============================================================================
// CRATE-LEVEL ITEMS
// =============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {
    pub use crate::config::{AdapterVendor, CodecConfig, CodecKind, ColorFormat, MemoryType, RateControlMode};
    pub use crate::decoder::DecodeSession;
    pub use crate::encoder::EncodeSession;
    pub use crate::error::{CodecError, Result};
    pub use crate::hardware::HardwareSession;
    pub use crate::vpp::VppSession;
    pub use lamco_surface::prelude::*;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
