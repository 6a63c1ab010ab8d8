//! # lamco-hwcodec
//!
//! Hardware video codec sessions and the frame memory they run on.
//!
//! This crate provides a unified interface to the lamco codec libraries:
//!
//! - **[`surface`]** - frame allocators, surface pools, output arena and queues
//! - **[`codec`]** - encode, decode and post-process sessions, multi-layer encoding
//!
//! # Features
//!
//! All features are enabled by default. You can selectively enable only what you need:
//!
//! ```toml
//! # Use everything (default)
//! lamco-hwcodec = "0.1"
//!
//! # Frame memory only
//! lamco-hwcodec = { version = "0.1", default-features = false, features = ["surface"] }
//!
//! # All features including sub-crate features
//! lamco-hwcodec = { version = "0.1", features = ["full"] }
//! ```
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `surface` | Yes | Frame allocators and surface pools |
//! | `codec` | Yes | Codec sessions (implies `surface`) |
//! | `full` | No | All features from all sub-crates |
//!
//! # Quick Start
//!
//! ## Decode a Stream
//!
//! ```rust,ignore
//! use lamco_hwcodec::prelude::*;
//!
//! fn decode(hw: Box<dyn HardwareSession>, header: &[u8], units: &[&[u8]]) -> lamco_hwcodec::codec::Result<()> {
//!     let config = CodecConfig::decode(CodecKind::Hevc, 1920, 1080);
//!     let session = DecodeSession::allocate(config, hw, Box::new(SystemAllocator::new()), header)?;
//!
//!     for unit in units {
//!         // `false` means no work surface was free: drain, then resubmit the same unit
//!         while !session.queue_input_buffer(Some(*unit))? {
//!             drain(&session)?;
//!         }
//!         drain(&session)?;
//!     }
//!     while !session.queue_input_buffer(None)? {
//!         drain(&session)?;
//!     }
//!     drain(&session)
//! }
//!
//! fn drain(session: &DecodeSession) -> lamco_hwcodec::codec::Result<()> {
//!     while let Some(frame) = session.dequeue_output_buffer()? {
//!         // ... display frame.mapping
//!         session.release_output_buffer(frame.handle)?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         lamco-hwcodec                           │
//! ├───────────────────────────────┬─────────────────────────────────┤
//! │         lamco-codec           │         lamco-surface           │
//! │                               │                                 │
//! │  EncodeSession                │  FrameAllocator                 │
//! │  DecodeSession                │  SurfacePool                    │
//! │  VppSession                   │  ArenaAllocator                 │
//! │  PostProcessChain             │  SafeQueue                      │
//! │  MultiLayerEncoder            │                                 │
//! └───────────────┬───────────────┴────────────────┬────────────────┘
//!                 │                                │
//!                 ▼                                ▼
//!        HardwareSession trait          host heap / device textures
//! ```
//!
//! # Related Crates
//!
//! You can also use the individual crates directly:
//!
//! - [`lamco-surface`](https://crates.io/crates/lamco-surface) - Frame memory only
//! - [`lamco-codec`](https://crates.io/crates/lamco-codec) - Codec sessions

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// RE-EXPORTS
// =============================================================================

/// Frame memory for hardware codecs.
///
/// - Host-heap and device-texture frame allocators
/// - Fixed surface pools with hardware lock tracking
/// - First-fit arena for encoded output
/// - Cross-thread FIFO
///
/// See [`lamco_surface`] documentation for details.
#[cfg(feature = "surface")]
#[cfg_attr(docsrs, doc(cfg(feature = "surface")))]
pub use lamco_surface as surface;

/// Encode, decode and post-process sessions.
///
/// See [`lamco_codec`] documentation for details.
#[cfg(feature = "codec")]
#[cfg_attr(docsrs, doc(cfg(feature = "codec")))]
pub use lamco_codec as codec;

// =============================================================================
// PRELUDE - Common types for convenience
// =============================================================================

/// Prelude module with commonly used types.
///
/// ```rust
/// use lamco_hwcodec::prelude::*;
/// ```
pub mod prelude {
    #[cfg(feature = "surface")]
    pub use lamco_surface::{FrameAllocator, FrameInfo, PixelFormat, SurfaceError, SurfacePool, SystemAllocator};

    #[cfg(feature = "codec")]
    pub use lamco_codec::{
        CodecConfig, CodecError, CodecKind, DecodeSession, EncodeSession, HardwareSession, MultiLayerEncoder,
        VppSession,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    #[cfg(feature = "codec")]
    fn test_codec_reexport() {
        let config = codec::CodecConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    #[cfg(feature = "codec")]
    fn test_decode_loop_resubmits() {
        use codec::sim::{pack_frame, sequence_header, SimulatedSession};
        use crate::prelude::*;

        let mut data = sequence_header(CodecKind::Avc, 64, 64);
        for fill in 1..=3u8 {
            data.extend(pack_frame(&[fill; 32]));
        }
        let config = CodecConfig {
            async_depth: 1,
            ..CodecConfig::decode(CodecKind::Avc, 0, 0)
        };
        let session = DecodeSession::allocate(
            config,
            Box::new(SimulatedSession::new().with_suggested_surfaces(1)),
            Box::new(SystemAllocator::new()),
            &data,
        )
        .expect("session");

        let mut fills = Vec::new();
        let mut drain = |session: &DecodeSession| {
            while let Some(frame) = session.dequeue_output_buffer().expect("dequeue") {
                fills.push(frame.mapping.as_ref().expect("mapping").read_luma(1)[0]);
                session.release_output_buffer(frame.handle).expect("release");
            }
        };

        let mut refused = 0;
        while !session.queue_input_buffer(Some(&data)).expect("queue") {
            refused += 1;
            drain(&session);
        }
        drain(&session);
        while !session.queue_input_buffer(None).expect("flush") {
            drain(&session);
        }
        drain(&session);

        assert!(refused > 0);
        assert_eq!(fills, vec![1, 2, 3]);
    }

    #[test]
    #[cfg(feature = "surface")]
    fn test_surface_reexport() {
        let arena = surface::ArenaAllocator::new(64);
        assert!(arena.alloc(16).is_some());
    }
}
