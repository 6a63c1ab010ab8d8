//! Frame memory allocators
//!
//! A [`FrameAllocator`] hands out memory ids for codec frames and maps them
//! for CPU access. Two backends are provided:
//!
//! - [`SystemAllocator`] - heap frames with a tagged header in front of the pixels
//! - [`GpuAllocator`] - device textures, with CPU staging copies for
//!   post-process input and output frames (feature `gpu`)
//!
//! # Request idempotence
//!
//! Hardware decoders query their allocator again during init. Requests the
//! crate issues itself carry [`MemType::Internal`]; a decode-originated
//! request *without* that marker is answered with the previous response
//! instead of allocating a second set of frames.

use std::fmt;
use std::sync::Arc;

use enumflags2::{bitflags, BitFlags};
use parking_lot::Mutex;

use crate::error::Result;
use crate::format::{FrameInfo, PlaneLayout};

#[cfg(feature = "gpu")]
pub mod gpu;
pub mod system;

#[cfg(feature = "gpu")]
pub use gpu::{GpuAllocator, GpuDevice, HostTextureDevice, TextureAccess, TextureDesc};
pub use system::SystemAllocator;

/// Memory id assigned by an allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemId(u32);

impl MemId {
    /// Wrap a raw id
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw id value
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mid#{}", self.0)
    }
}

/// Memory type and origin flags carried by an allocation request
#[bitflags]
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    /// Host heap memory
    SystemMemory = 1 << 0,
    /// Device memory
    VideoMemory = 1 << 1,
    /// Render target of a hardware decoder
    DecoderTarget = 1 << 2,
    /// Request originates from an encoder
    FromEncode = 1 << 3,
    /// Request originates from a decoder
    FromDecode = 1 << 4,
    /// Post-process input frames
    FromVppIn = 1 << 5,
    /// Post-process output frames
    FromVppOut = 1 << 6,
    /// Issued by this crate rather than by hardware init
    Internal = 1 << 7,
}

/// Describes the frames a session needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocRequest {
    /// Frame format and geometry
    pub info: FrameInfo,
    /// Minimum frames the hardware can work with
    pub num_frame_min: usize,
    /// Frames to allocate
    pub num_frame_suggested: usize,
    /// Memory type and origin
    pub mem_type: BitFlags<MemType>,
}

impl AllocRequest {
    /// Request `count` frames of `info`
    #[must_use]
    pub fn new(info: FrameInfo, count: usize, mem_type: impl Into<BitFlags<MemType>>) -> Self {
        Self {
            info,
            num_frame_min: count,
            num_frame_suggested: count,
            mem_type: mem_type.into(),
        }
    }

    /// Whether this is a decoder init re-query that must reuse the last response
    #[must_use]
    pub fn is_decoder_requery(&self) -> bool {
        self.mem_type.contains(MemType::FromDecode) && !self.mem_type.contains(MemType::Internal)
    }
}

/// Memory ids returned for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocResponse {
    /// Assigned ids, one per frame
    pub mids: Vec<MemId>,
    /// Frame format and geometry as allocated
    pub info: FrameInfo,
    /// Memory type the frames were allocated with
    pub mem_type: BitFlags<MemType>,
}

impl AllocResponse {
    /// Number of frames
    #[must_use]
    pub fn len(&self) -> usize {
        self.mids.len()
    }

    /// Whether no frames were allocated
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mids.is_empty()
    }
}

/// Shared byte storage behind a frame
///
/// Clones share the same bytes. `base` marks where pixel data starts.
#[derive(Clone)]
pub struct FrameStorage {
    bytes: Arc<Mutex<Vec<u8>>>,
    base: usize,
}

impl FrameStorage {
    /// Zeroed storage of `len` bytes with pixels at offset 0
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0; len])),
            base: 0,
        }
    }

    /// Same bytes, pixels starting at `base`
    #[must_use]
    pub(crate) fn with_base(&self, base: usize) -> Self {
        Self {
            bytes: Arc::clone(&self.bytes),
            base,
        }
    }

    /// Pixel bytes available after `base`
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.lock().len().saturating_sub(self.base)
    }

    /// Whether there are no pixel bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `other` shares the same bytes
    #[must_use]
    pub fn same_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }

    /// Run `f` over the pixel bytes
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let bytes = self.bytes.lock();
        f(&bytes[self.base.min(bytes.len())..])
    }

    /// Run `f` over the pixel bytes, mutably
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut bytes = self.bytes.lock();
        let start = self.base.min(bytes.len());
        f(&mut bytes[start..])
    }

    /// Copy `data` in at `offset`, truncating at the end of storage
    ///
    /// Returns the number of bytes written.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> usize {
        self.with_bytes_mut(|bytes| {
            if offset >= bytes.len() {
                return 0;
            }
            let n = data.len().min(bytes.len() - offset);
            bytes[offset..offset + n].copy_from_slice(&data[..n]);
            n
        })
    }

    /// Copy up to `len` bytes out from `offset`
    #[must_use]
    pub fn read_at(&self, offset: usize, len: usize) -> Vec<u8> {
        self.with_bytes(|bytes| {
            if offset >= bytes.len() {
                return Vec::new();
            }
            let end = (offset + len).min(bytes.len());
            bytes[offset..end].to_vec()
        })
    }

    /// Copy every pixel byte from `src`, truncating to the shorter length
    pub fn copy_from(&self, src: &Self) {
        if self.same_storage(src) {
            return;
        }
        let data = src.with_bytes(<[u8]>::to_vec);
        self.write_at(0, &data);
    }
}

impl fmt::Debug for FrameStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameStorage")
            .field("base", &self.base)
            .field("len", &self.len())
            .finish()
    }
}

/// CPU mapping of a locked frame
#[derive(Debug, Clone)]
pub struct FrameData {
    /// Frame that was locked
    pub mem_id: MemId,
    /// Geometry of the mapped frame
    pub info: FrameInfo,
    /// Plane offsets and pitch
    pub layout: PlaneLayout,
    /// Pixel storage
    pub storage: FrameStorage,
}

impl FrameData {
    /// Bytes from the start of the luma (or B) plane
    #[must_use]
    pub fn read_luma(&self, len: usize) -> Vec<u8> {
        self.storage.read_at(self.layout.y, len)
    }

    /// Overwrite the start of the luma (or B) plane
    pub fn write_luma(&self, data: &[u8]) -> usize {
        self.storage.write_at(self.layout.y, data)
    }
}

/// Device texture identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

/// Native handle for a frame, as exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeHandle {
    /// Host frame, addressed by id and plane byte offset
    System {
        /// Frame id
        mem_id: MemId,
        /// Offset of the exposed plane from the first pixel
        offset: usize,
    },
    /// Device texture
    Texture(TextureId),
    /// Device linear buffer
    Buffer(TextureId),
}

/// Allocates, maps and frees frame memory
///
/// Implementations are shared between sessions, post-process stages and
/// the hardware collaborator, so every method takes `&self`.
pub trait FrameAllocator: Send + Sync {
    /// Allocate the frames described by `request`
    fn alloc_frames(&self, request: &AllocRequest) -> Result<AllocResponse>;

    /// Map a frame for CPU access
    fn lock(&self, mid: MemId) -> Result<FrameData>;

    /// End CPU access started by [`lock`](Self::lock)
    fn unlock(&self, mid: MemId) -> Result<()>;

    /// Native handle for a frame
    fn get_handle(&self, mid: MemId) -> Result<NativeHandle>;

    /// Release every frame of `response`
    fn free_frames(&self, response: &AllocResponse) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;

    #[test]
    fn test_decoder_requery() {
        let info = FrameInfo::new(PixelFormat::Nv12, 64, 64);
        let internal = AllocRequest::new(
            info,
            4,
            MemType::SystemMemory | MemType::FromDecode | MemType::Internal,
        );
        assert!(!internal.is_decoder_requery());

        let requery = AllocRequest::new(info, 4, MemType::SystemMemory | MemType::FromDecode);
        assert!(requery.is_decoder_requery());

        let encode = AllocRequest::new(info, 4, MemType::SystemMemory | MemType::FromEncode);
        assert!(!encode.is_decoder_requery());
    }

    #[test]
    fn test_storage_shares_bytes() {
        let storage = FrameStorage::zeroed(16);
        let view = storage.with_base(8);
        assert_eq!(view.len(), 8);
        assert_eq!(view.write_at(0, b"abcdefghijk"), 8);
        assert_eq!(storage.read_at(8, 3), b"abc");
        assert!(storage.same_storage(&view));
        assert!(view.read_at(100, 1).is_empty());
    }

    #[test]
    fn test_storage_copy() {
        let a = FrameStorage::zeroed(4);
        let b = FrameStorage::zeroed(8);
        b.write_at(0, b"12345678");
        a.copy_from(&b);
        assert_eq!(a.read_at(0, 4), b"1234");
    }
}
