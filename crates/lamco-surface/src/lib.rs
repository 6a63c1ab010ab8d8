//! # lamco-surface
//!
//! Frame memory primitives for hardware video codec pipelines.
//!
//! Hardware encoders, decoders and post-processors work on a small, fixed
//! set of frame buffers ("surfaces") that they lock and release
//! asynchronously. This crate provides the pieces that track that memory:
//!
//! - **[`allocator`]** - [`FrameAllocator`] trait with host-heap and device-texture backends
//! - **[`pool`]** - fixed surface pools with in-use and hardware-lock tracking
//! - **[`arena`]** - first-fit byte arena for encoded output
//! - **[`queue`]** - blocking and non-blocking cross-thread FIFO
//! - **[`format`]** - pixel formats, plane layouts and alignment helpers
//!
//! # Quick Start
//!
//! ```rust
//! use lamco_surface::prelude::*;
//!
//! # fn main() -> lamco_surface::Result<()> {
//! let frames = SystemAllocator::new();
//! let request = AllocRequest::new(
//!     FrameInfo::new(PixelFormat::Nv12, 1280, 720),
//!     4,
//!     MemType::SystemMemory | MemType::FromEncode | MemType::Internal,
//! );
//! let pool = SurfacePool::allocate(&frames, &request)?;
//!
//! // Hardware holds surface 0
//! pool.get(SurfaceId(0)).expect("surface").hw_lock();
//! assert_eq!(pool.find_free(), Some(SurfaceId(1)));
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `gpu` | Yes | Device texture allocator and host texture device |
//! | `full` | No | All features |

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod allocator;
pub mod arena;
pub mod error;
pub mod format;
pub mod pool;
pub mod queue;

// =============================================================================
// Re-exports
// =============================================================================

#[cfg(feature = "gpu")]
pub use allocator::{GpuAllocator, GpuDevice, HostTextureDevice};
pub use allocator::{
    AllocRequest, AllocResponse, FrameAllocator, FrameData, FrameStorage, MemId, MemType,
    NativeHandle, SystemAllocator, TextureId,
};
pub use arena::{ArenaAllocator, ArenaSlot, ArenaStats};
pub use error::{Result, SurfaceError};
pub use format::{align16, align32, CropRect, FrameInfo, PixelFormat, PlaneLayout};
pub use pool::{
    FrameSurface, PoolId, PoolStats, SurfaceId, SurfaceLock, SurfacePool, SurfaceRef, SyncToken,
};
pub use queue::SafeQueue;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {
    #[cfg(feature = "gpu")]
    pub use crate::allocator::{GpuAllocator, HostTextureDevice};
    pub use crate::allocator::{
        AllocRequest, AllocResponse, FrameAllocator, MemId, MemType, NativeHandle,
        SystemAllocator,
    };
    pub use crate::arena::{ArenaAllocator, ArenaSlot};
    pub use crate::error::{Result, SurfaceError};
    pub use crate::format::{FrameInfo, PixelFormat};
    pub use crate::pool::{FrameSurface, SurfaceId, SurfacePool, SurfaceRef, SyncToken};
    pub use crate::queue::SafeQueue;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
