//! Host-memory frame allocator
//!
//! Each frame is one heap block: a tagged header describing the frame,
//! padded to 32 bytes, followed by the pixel bytes. Width and height are
//! rounded up to 32 before sizing.

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{AllocRequest, AllocResponse, FrameAllocator, FrameData, FrameStorage, MemId, MemType, NativeHandle};
use crate::error::{Result, SurfaceError};
use crate::format::{align32, CropRect, FrameInfo, PixelFormat, PlaneLayout};

/// Default id table size
pub const DEFAULT_MID_CAPACITY: usize = 512;

const SYS_TAG: u32 = u32::from_le_bytes(*b"SYSM");
const HEADER_WORDS: usize = 8;
const HEADER_SPAN: usize = align32((HEADER_WORDS * 4) as u32) as usize;

// Header layout, little-endian u32 words:
// tag, pixel bytes, fourcc, width, height, crop w, crop h, memory type bits
struct FrameHeader {
    tag: u32,
    size: u32,
    fourcc: u32,
    width: u32,
    height: u32,
    crop_w: u32,
    crop_h: u32,
    mem_type: u32,
}

impl FrameHeader {
    fn encode(&self) -> [u8; HEADER_WORDS * 4] {
        let words = [
            self.tag,
            self.size,
            self.fourcc,
            self.width,
            self.height,
            self.crop_w,
            self.crop_h,
            self.mem_type,
        ];
        let mut out = [0u8; HEADER_WORDS * 4];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let word = |i: usize| -> Option<u32> {
            let raw = bytes.get(i * 4..i * 4 + 4)?;
            Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        };
        Some(Self {
            tag: word(0)?,
            size: word(1)?,
            fourcc: word(2)?,
            width: word(3)?,
            height: word(4)?,
            crop_w: word(5)?,
            crop_h: word(6)?,
            mem_type: word(7)?,
        })
    }
}

struct SystemState {
    // Slot i holds mid i + 1.
    frames: Vec<Option<FrameStorage>>,
    next: usize,
    responses: Vec<AllocResponse>,
}

/// Heap-backed [`FrameAllocator`]
///
/// Ids are handed out sequentially from a fixed table and never reused.
pub struct SystemAllocator {
    state: Mutex<SystemState>,
    capacity: usize,
}

impl Default for SystemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemAllocator {
    /// Create an allocator with the default id table size
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MID_CAPACITY)
    }

    /// Create an allocator with room for `capacity` ids
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        debug!("Creating system allocator with {} ids", capacity);
        Self {
            state: Mutex::new(SystemState {
                frames: vec![None; capacity],
                next: 0,
                responses: Vec::new(),
            }),
            capacity,
        }
    }

    fn slot(mid: MemId) -> Option<usize> {
        (mid.raw() as usize).checked_sub(1)
    }

    fn storage(&self, mid: MemId) -> Result<FrameStorage> {
        let state = self.state.lock();
        Self::slot(mid)
            .and_then(|i| state.frames.get(i))
            .and_then(Option::clone)
            .ok_or(SurfaceError::InvalidMemId(mid))
    }
}

impl FrameAllocator for SystemAllocator {
    fn alloc_frames(&self, request: &AllocRequest) -> Result<AllocResponse> {
        let mut state = self.state.lock();

        if request.is_decoder_requery() {
            trace!("Decoder re-query, returning previous response");
            return state
                .responses
                .last()
                .cloned()
                .ok_or_else(|| SurfaceError::not_found("no previous allocation to reuse"));
        }

        if !request.mem_type.contains(MemType::SystemMemory) {
            return Err(SurfaceError::unsupported_memory(format!(
                "{:?}",
                request.mem_type
            )));
        }

        let info = request.info;
        let width = align32(info.width);
        let height = align32(info.height);
        let nbytes = info
            .format
            .frame_size(width, height)
            .ok_or(SurfaceError::UnsupportedFormat(info.format))?;

        let count = request.num_frame_suggested;
        if state.next + count >= self.capacity {
            return Err(SurfaceError::NotEnoughBuffer {
                requested: count,
                available: self.capacity - state.next,
            });
        }

        let header = FrameHeader {
            tag: SYS_TAG,
            size: nbytes as u32,
            fourcc: info.format.fourcc(),
            width,
            height,
            crop_w: info.crop.w,
            crop_h: info.crop.h,
            mem_type: u32::from(request.mem_type.bits()),
        }
        .encode();

        let start = state.next;
        let mut mids = Vec::with_capacity(count);
        for i in start..start + count {
            let storage = FrameStorage::zeroed(HEADER_SPAN + nbytes);
            storage.write_at(0, &header);
            state.frames[i] = Some(storage);
            mids.push(MemId::new((i + 1) as u32));
        }
        state.next += count;

        let response = AllocResponse {
            mids,
            info,
            mem_type: request.mem_type,
        };
        state.responses.push(response.clone());

        debug!(
            "Allocated {} {} frames ({}x{}, {} bytes each)",
            count, info.format, width, height, nbytes
        );
        Ok(response)
    }

    fn lock(&self, mid: MemId) -> Result<FrameData> {
        let storage = self.storage(mid)?;
        let header = storage
            .with_bytes(FrameHeader::decode)
            .ok_or(SurfaceError::InvalidHandle)?;
        if header.tag != SYS_TAG {
            return Err(SurfaceError::InvalidHandle);
        }

        let format = PixelFormat::from_fourcc(header.fourcc).ok_or(SurfaceError::InvalidHandle)?;
        let layout = PlaneLayout::for_format(format, header.width, header.height)
            .ok_or(SurfaceError::UnsupportedFormat(format))?;
        let info = FrameInfo::new(format, header.width, header.height)
            .with_crop(CropRect::full(header.crop_w, header.crop_h));

        Ok(FrameData {
            mem_id: mid,
            info,
            layout,
            storage: storage.with_base(HEADER_SPAN),
        })
    }

    fn unlock(&self, mid: MemId) -> Result<()> {
        self.storage(mid).map(|_| ())
    }

    fn get_handle(&self, mid: MemId) -> Result<NativeHandle> {
        let data = self.lock(mid)?;
        Ok(NativeHandle::System {
            mem_id: mid,
            offset: data.layout.handle_offset(data.info.format),
        })
    }

    fn free_frames(&self, response: &AllocResponse) -> Result<()> {
        let mut state = self.state.lock();

        let known = response
            .mids
            .first()
            .and_then(|mid| Self::slot(*mid))
            .and_then(|i| state.frames.get(i))
            .is_some_and(Option::is_some);
        if !known {
            return Err(SurfaceError::not_found("response was not allocated here"));
        }

        for mid in &response.mids {
            if let Some(slot) = Self::slot(*mid).and_then(|i| state.frames.get_mut(i)) {
                *slot = None;
            }
        }
        state.responses.retain(|r| r != response);

        debug!("Freed {} system frames", response.len());
        Ok(())
    }
}

impl Drop for SystemAllocator {
    fn drop(&mut self) {
        let live = self.state.get_mut().frames.iter().filter(|f| f.is_some()).count();
        if live > 0 {
            warn!("System allocator dropped with {} live frames", live);
        } else {
            debug!("System allocator dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(format: PixelFormat, count: usize) -> AllocRequest {
        AllocRequest::new(
            FrameInfo::new(format, 64, 48),
            count,
            MemType::SystemMemory | MemType::Internal,
        )
    }

    #[test]
    fn test_alloc_and_lock_nv12() {
        let allocator = SystemAllocator::new();
        let response = allocator
            .alloc_frames(&request(PixelFormat::Nv12, 3))
            .expect("alloc");
        assert_eq!(response.len(), 3);
        assert_eq!(response.mids[0], MemId::new(1));

        let data = allocator.lock(response.mids[1]).expect("lock");
        // 48 rounds up to 64.
        assert_eq!(data.info.height, 64);
        assert_eq!(data.info.crop.h, 48);
        assert_eq!(data.layout.pitch, 64);
        assert_eq!(data.layout.u, Some(64 * 64));
        assert_eq!(data.storage.len(), 64 * 64 * 3 / 2);

        data.write_luma(b"luma");
        let again = allocator.lock(response.mids[1]).expect("lock again");
        assert_eq!(again.read_luma(4), b"luma");
        allocator.unlock(response.mids[1]).expect("unlock");
    }

    #[test]
    fn test_decoder_requery_returns_previous() {
        let allocator = SystemAllocator::new();
        let first = allocator
            .alloc_frames(&AllocRequest::new(
                FrameInfo::new(PixelFormat::Nv12, 64, 64),
                4,
                MemType::SystemMemory | MemType::FromDecode | MemType::Internal,
            ))
            .expect("alloc");

        let requery = AllocRequest::new(
            FrameInfo::new(PixelFormat::Nv12, 64, 64),
            8,
            MemType::SystemMemory | MemType::FromDecode,
        );
        let second = allocator.alloc_frames(&requery).expect("requery");
        assert_eq!(first, second);
    }

    #[test]
    fn test_unsupported_requests() {
        let allocator = SystemAllocator::new();
        let err = allocator
            .alloc_frames(&request(PixelFormat::P8, 1))
            .expect_err("P8");
        assert!(matches!(err, SurfaceError::UnsupportedFormat(PixelFormat::P8)));

        let video = AllocRequest::new(
            FrameInfo::new(PixelFormat::Nv12, 64, 64),
            1,
            MemType::VideoMemory | MemType::FromEncode,
        );
        let err = allocator.alloc_frames(&video).expect_err("video memory");
        assert!(matches!(err, SurfaceError::UnsupportedMemoryType(_)));
    }

    #[test]
    fn test_capacity_exhausted() {
        let allocator = SystemAllocator::with_capacity(4);
        allocator
            .alloc_frames(&request(PixelFormat::Nv12, 3))
            .expect("three fit");
        let err = allocator
            .alloc_frames(&request(PixelFormat::Nv12, 1))
            .expect_err("table full");
        assert!(matches!(err, SurfaceError::NotEnoughBuffer { requested: 1, .. }));
    }

    #[test]
    fn test_handle_plane() {
        let allocator = SystemAllocator::new();
        let rgb = allocator
            .alloc_frames(&request(PixelFormat::Rgb4, 1))
            .expect("rgb");
        let uyvy = allocator
            .alloc_frames(&request(PixelFormat::Uyvy, 1))
            .expect("uyvy");

        assert_eq!(
            allocator.get_handle(rgb.mids[0]).expect("handle"),
            NativeHandle::System {
                mem_id: rgb.mids[0],
                offset: 0
            }
        );
        assert_eq!(
            allocator.get_handle(uyvy.mids[0]).expect("handle"),
            NativeHandle::System {
                mem_id: uyvy.mids[0],
                offset: 1
            }
        );
    }

    #[test]
    fn test_corrupt_header() {
        let allocator = SystemAllocator::new();
        let response = allocator
            .alloc_frames(&request(PixelFormat::Nv12, 1))
            .expect("alloc");

        let raw = allocator.storage(response.mids[0]).expect("storage");
        raw.write_at(0, b"XXXX");

        let err = allocator.lock(response.mids[0]).expect_err("bad tag");
        assert!(matches!(err, SurfaceError::InvalidHandle));
    }

    #[test]
    fn test_free() {
        let allocator = SystemAllocator::new();
        let response = allocator
            .alloc_frames(&request(PixelFormat::Nv12, 2))
            .expect("alloc");

        allocator.free_frames(&response).expect("free");
        assert!(matches!(
            allocator.lock(response.mids[0]),
            Err(SurfaceError::InvalidMemId(_))
        ));
        assert!(matches!(
            allocator.free_frames(&response),
            Err(SurfaceError::NotFound(_))
        ));
    }
}
