//! Error types for surface and allocator operations
//!
//! Provides typed errors that codec sessions can match and classify.

use thiserror::Error;

use crate::allocator::MemId;
use crate::format::PixelFormat;

/// Errors that can occur while allocating, mapping or tracking frame memory
///
/// All allocator and pool operations return `Result<T, SurfaceError>`.
/// Running out of *free surfaces* is not an error: the pool reports fewer
/// surfaces than requested and the caller applies backpressure.
///
/// # Examples
///
/// ```rust
/// use lamco_surface::allocator::{AllocRequest, FrameAllocator, MemType, SystemAllocator};
/// use lamco_surface::format::{FrameInfo, PixelFormat};
/// use lamco_surface::SurfaceError;
///
/// let allocator = SystemAllocator::new();
/// let request = AllocRequest::new(
///     FrameInfo::new(PixelFormat::P8, 64, 64),
///     2,
///     MemType::SystemMemory | MemType::Internal,
/// );
///
/// match allocator.alloc_frames(&request) {
///     Err(SurfaceError::UnsupportedFormat(format)) => {
///         eprintln!("cannot place {format} in system memory");
///     }
///     other => panic!("unexpected: {other:?}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum SurfaceError {
    /// Pixel format has no layout in this allocator
    #[error("Unsupported pixel format: {0}")]
    UnsupportedFormat(PixelFormat),

    /// Request memory-type flags are not served by this allocator
    ///
    /// The system allocator needs `SystemMemory`; the device allocator
    /// needs one of the `From*` origin flags.
    #[error("Unsupported memory type: {0}")]
    UnsupportedMemoryType(String),

    /// Memory id table is full
    ///
    /// Id tables are sized at construction and never grow.
    #[error("Not enough buffer: requested {requested} ids, {available} available")]
    NotEnoughBuffer {
        /// Ids requested
        requested: usize,
        /// Ids still free in the table
        available: usize,
    },

    /// Memory id does not belong to this allocator
    #[error("Invalid memory id: {0}")]
    InvalidMemId(MemId),

    /// Frame header tag mismatch
    ///
    /// The memory block does not carry the tag written at allocation time.
    #[error("Invalid handle: frame header tag mismatch")]
    InvalidHandle,

    /// Device memory has no CPU-visible mapping
    #[error("Memory {0} is not mappable")]
    NotMappable(MemId),

    /// Lookup of a response, surface or texture failed
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid caller-supplied parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Backend failed to create memory
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),
}

/// Result type for surface operations
///
/// This is a convenience alias for `Result<T, SurfaceError>`.
pub type Result<T> = std::result::Result<T, SurfaceError>;

// Helper implementations for common error patterns
impl SurfaceError {
    /// Create a not-found error
    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid parameter error
    pub(crate) fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Create an unsupported memory type error
    pub(crate) fn unsupported_memory(msg: impl Into<String>) -> Self {
        Self::UnsupportedMemoryType(msg.into())
    }

    /// Create an allocation failure
    #[allow(dead_code)]
    pub(crate) fn allocation_failed(msg: impl Into<String>) -> Self {
        Self::AllocationFailed(msg.into())
    }
}
