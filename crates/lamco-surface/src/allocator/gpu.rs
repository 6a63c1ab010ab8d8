//! Device texture allocator
//!
//! Frames live in device textures created through a [`GpuDevice`]. The CPU
//! never touches a device texture directly: post-process input and output
//! frames get a staging shadow texture, and lock/unlock copy between the two.
//!
//! Whether staging is readable or writable is fixed per allocator:
//!
//! - `lock_to_read` - lock copies texture to staging, then maps staging
//! - otherwise - lock maps staging, unlock copies staging back to the texture
//!
//! [`HostTextureDevice`] keeps textures in host memory and stands in for a
//! real device on CPU-only hosts and in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use enumflags2::BitFlags;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{AllocRequest, AllocResponse, FrameAllocator, FrameData, FrameStorage, MemId, MemType, NativeHandle, TextureId};
use crate::error::{Result, SurfaceError};
use crate::format::{FrameInfo, PixelFormat, PlaneLayout};

/// Default id table size
pub const DEFAULT_MAX_MIDS: usize = 4096;

/// How a texture may be accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureAccess {
    /// Device only, not mappable
    Device,
    /// CPU-readable staging copy
    StagingRead,
    /// CPU-writable staging copy
    StagingWrite,
    /// Linear buffer with CPU read access
    CpuBuffer,
}

impl TextureAccess {
    /// Whether the CPU may map this texture
    #[must_use]
    pub const fn is_mappable(self) -> bool {
        !matches!(self, Self::Device)
    }
}

/// Texture creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    /// Pixel format
    pub format: PixelFormat,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Access mode
    pub access: TextureAccess,
}

impl TextureDesc {
    /// Bytes backing this texture
    #[must_use]
    pub fn byte_size(&self) -> usize {
        match self.format {
            PixelFormat::P8 => self.width as usize * self.height as usize,
            format => format.frame_size(self.width, self.height).unwrap_or(0),
        }
    }
}

/// Native GPU texture primitives
pub trait GpuDevice: Send + Sync {
    /// Create a texture or buffer
    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId>;

    /// Copy the whole of `src` into `dst`
    fn copy_texture(&self, dst: TextureId, src: TextureId) -> Result<()>;

    /// Map a CPU-accessible texture
    fn map(&self, texture: TextureId) -> Result<FrameStorage>;

    /// End a mapping started by [`map`](Self::map)
    fn unmap(&self, texture: TextureId) -> Result<()>;

    /// Destroy a texture
    fn release(&self, texture: TextureId) -> Result<()>;
}

struct HostTexture {
    desc: TextureDesc,
    storage: FrameStorage,
    mapped: bool,
}

/// [`GpuDevice`] keeping textures in host memory
#[derive(Default)]
pub struct HostTextureDevice {
    textures: Mutex<HashMap<TextureId, HostTexture>>,
    next_id: AtomicU32,
}

impl HostTextureDevice {
    /// Create an empty device
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live textures
    #[must_use]
    pub fn texture_count(&self) -> usize {
        self.textures.lock().len()
    }

    /// Copy of a texture's bytes, regardless of access mode
    pub fn snapshot(&self, texture: TextureId) -> Result<Vec<u8>> {
        let textures = self.textures.lock();
        let tex = textures
            .get(&texture)
            .ok_or_else(|| SurfaceError::not_found(format!("texture {}", texture.0)))?;
        Ok(tex.storage.with_bytes(<[u8]>::to_vec))
    }

    /// Overwrite the start of a texture's bytes, regardless of access mode
    pub fn upload(&self, texture: TextureId, data: &[u8]) -> Result<usize> {
        let textures = self.textures.lock();
        let tex = textures
            .get(&texture)
            .ok_or_else(|| SurfaceError::not_found(format!("texture {}", texture.0)))?;
        Ok(tex.storage.write_at(0, data))
    }
}

impl GpuDevice for HostTextureDevice {
    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId> {
        let size = desc.byte_size();
        if size == 0 {
            return Err(SurfaceError::allocation_failed(format!(
                "zero-sized {} texture",
                desc.format
            )));
        }
        let id = TextureId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.textures.lock().insert(
            id,
            HostTexture {
                desc: *desc,
                storage: FrameStorage::zeroed(size),
                mapped: false,
            },
        );
        Ok(id)
    }

    fn copy_texture(&self, dst: TextureId, src: TextureId) -> Result<()> {
        let textures = self.textures.lock();
        let (Some(d), Some(s)) = (textures.get(&dst), textures.get(&src)) else {
            return Err(SurfaceError::not_found("copy source or destination texture"));
        };
        d.storage.copy_from(&s.storage);
        Ok(())
    }

    fn map(&self, texture: TextureId) -> Result<FrameStorage> {
        let mut textures = self.textures.lock();
        let tex = textures
            .get_mut(&texture)
            .ok_or_else(|| SurfaceError::not_found(format!("texture {}", texture.0)))?;
        if !tex.desc.access.is_mappable() {
            return Err(SurfaceError::invalid_parameter(format!(
                "texture {} is device-only",
                texture.0
            )));
        }
        tex.mapped = true;
        Ok(tex.storage.clone())
    }

    fn unmap(&self, texture: TextureId) -> Result<()> {
        let mut textures = self.textures.lock();
        let tex = textures
            .get_mut(&texture)
            .ok_or_else(|| SurfaceError::not_found(format!("texture {}", texture.0)))?;
        if !tex.mapped {
            return Err(SurfaceError::invalid_parameter(format!(
                "texture {} is not mapped",
                texture.0
            )));
        }
        tex.mapped = false;
        Ok(())
    }

    fn release(&self, texture: TextureId) -> Result<()> {
        self.textures
            .lock()
            .remove(&texture)
            .map(|_| ())
            .ok_or_else(|| SurfaceError::not_found(format!("texture {}", texture.0)))
    }
}

struct GpuFrame {
    texture: TextureId,
    staging: Option<TextureId>,
    desc: TextureDesc,
}

impl GpuFrame {
    fn is_buffer(&self) -> bool {
        self.desc.access == TextureAccess::CpuBuffer
    }
}

struct GpuState {
    // Slot i holds mid i + 1.
    frames: Vec<GpuFrame>,
    responses: Vec<AllocResponse>,
}

const TEXTURE_FORMATS: [PixelFormat; 5] = [
    PixelFormat::Nv12,
    PixelFormat::Rgb4,
    PixelFormat::Ayuv,
    PixelFormat::Yuy2,
    PixelFormat::P8,
];

/// Texture-backed [`FrameAllocator`]
pub struct GpuAllocator {
    device: Arc<dyn GpuDevice>,
    state: Mutex<GpuState>,
    max_mids: usize,
    lock_to_read: bool,
}

impl GpuAllocator {
    /// Create an allocator on `device`
    ///
    /// With `lock_to_read`, staging copies are refreshed from the device on
    /// lock; otherwise they are flushed to the device on unlock.
    #[must_use]
    pub fn new(device: Arc<dyn GpuDevice>, lock_to_read: bool) -> Self {
        Self::with_max_mids(device, lock_to_read, DEFAULT_MAX_MIDS)
    }

    /// Create an allocator with room for `max_mids` ids
    #[must_use]
    pub fn with_max_mids(device: Arc<dyn GpuDevice>, lock_to_read: bool, max_mids: usize) -> Self {
        debug!(
            "Creating GPU allocator (lock_to_read: {}, max ids: {})",
            lock_to_read, max_mids
        );
        Self {
            device,
            state: Mutex::new(GpuState {
                frames: Vec::new(),
                responses: Vec::new(),
            }),
            max_mids,
            lock_to_read,
        }
    }

    /// Whether staging copies are refreshed on lock
    #[must_use]
    pub fn lock_to_read(&self) -> bool {
        self.lock_to_read
    }

    /// Device texture behind `mid`
    pub fn texture(&self, mid: MemId) -> Result<TextureId> {
        self.with_frame(mid, |frame| frame.texture)
    }

    fn with_frame<R>(&self, mid: MemId, f: impl FnOnce(&GpuFrame) -> R) -> Result<R> {
        let state = self.state.lock();
        (mid.raw() as usize)
            .checked_sub(1)
            .and_then(|i| state.frames.get(i))
            .map(f)
            .ok_or(SurfaceError::InvalidMemId(mid))
    }

    fn layout(desc: &TextureDesc) -> Option<PlaneLayout> {
        match desc.format {
            PixelFormat::Nv12 => PlaneLayout::for_format(PixelFormat::Nv12, desc.width, desc.height),
            PixelFormat::P8 => Some(PlaneLayout {
                y: 0,
                u: None,
                v: None,
                a: None,
                pitch: desc.width as usize,
            }),
            _ => None,
        }
    }

    fn create_frame(&self, info: &FrameInfo, mem_type: BitFlags<MemType>) -> Result<GpuFrame> {
        let buffer = info.format == PixelFormat::P8;
        let desc = TextureDesc {
            format: info.format,
            width: info.width,
            height: info.height,
            access: if buffer {
                TextureAccess::CpuBuffer
            } else {
                TextureAccess::Device
            },
        };
        let texture = self.device.create_texture(&desc)?;

        let staging = if !buffer && mem_type.intersects(MemType::FromVppIn | MemType::FromVppOut) {
            let access = if self.lock_to_read {
                TextureAccess::StagingRead
            } else {
                TextureAccess::StagingWrite
            };
            Some(self.device.create_texture(&TextureDesc { access, ..desc })?)
        } else {
            None
        };

        Ok(GpuFrame {
            texture,
            staging,
            desc,
        })
    }
}

impl FrameAllocator for GpuAllocator {
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

        let origins = MemType::FromVppIn | MemType::FromVppOut | MemType::FromDecode | MemType::FromEncode;
        if !request.mem_type.intersects(origins) {
            return Err(SurfaceError::unsupported_memory(format!(
                "{:?}",
                request.mem_type
            )));
        }
        if !TEXTURE_FORMATS.contains(&request.info.format) {
            return Err(SurfaceError::UnsupportedFormat(request.info.format));
        }

        // State stays locked from the capacity check until the frames are in.
        let count = request.num_frame_suggested;
        let start = state.frames.len();
        if start + count > self.max_mids {
            return Err(SurfaceError::NotEnoughBuffer {
                requested: count,
                available: self.max_mids - start,
            });
        }

        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            created.push(self.create_frame(&request.info, request.mem_type)?);
        }

        state.frames.extend(created);
        let mids = (start..start + count)
            .map(|i| MemId::new((i + 1) as u32))
            .collect();
        let response = AllocResponse {
            mids,
            info: request.info,
            mem_type: request.mem_type,
        };
        state.responses.push(response.clone());

        debug!(
            "Allocated {} {} textures ({}x{})",
            count, request.info.format, request.info.width, request.info.height
        );
        Ok(response)
    }

    fn lock(&self, mid: MemId) -> Result<FrameData> {
        let (texture, staging, desc) =
            self.with_frame(mid, |frame| (frame.texture, frame.staging, frame.desc))?;
        let layout = Self::layout(&desc).ok_or(SurfaceError::UnsupportedFormat(desc.format))?;

        let storage = match staging {
            Some(staging) => {
                if self.lock_to_read {
                    self.device.copy_texture(staging, texture)?;
                }
                self.device.map(staging)?
            }
            None if desc.access == TextureAccess::CpuBuffer => self.device.map(texture)?,
            None => return Err(SurfaceError::NotMappable(mid)),
        };

        Ok(FrameData {
            mem_id: mid,
            info: FrameInfo::new(desc.format, desc.width, desc.height),
            layout,
            storage,
        })
    }

    fn unlock(&self, mid: MemId) -> Result<()> {
        let (texture, staging, buffer) =
            self.with_frame(mid, |frame| (frame.texture, frame.staging, frame.is_buffer()))?;
        match staging {
            Some(staging) => {
                self.device.unmap(staging)?;
                if !self.lock_to_read {
                    self.device.copy_texture(texture, staging)?;
                }
                Ok(())
            }
            None if buffer => self.device.unmap(texture),
            None => Err(SurfaceError::NotMappable(mid)),
        }
    }

    fn get_handle(&self, mid: MemId) -> Result<NativeHandle> {
        self.with_frame(mid, |frame| {
            if frame.is_buffer() {
                NativeHandle::Buffer(frame.texture)
            } else {
                NativeHandle::Texture(frame.texture)
            }
        })
    }

    fn free_frames(&self, response: &AllocResponse) -> Result<()> {
        // Textures are released with the allocator.
        trace!("free_frames on GPU allocator: {} ids", response.len());
        Ok(())
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        let frames = std::mem::take(&mut self.state.get_mut().frames);
        debug!("Releasing {} GPU frames", frames.len());
        for frame in frames {
            for texture in std::iter::once(frame.texture).chain(frame.staging) {
                if let Err(e) = self.device.release(texture) {
                    debug!("Texture release failed: {}", e);
                }
            }
        }
    }
}
