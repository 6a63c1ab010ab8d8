//! Surface Pool
//!
//! A fixed array of frame surfaces drawn from one allocation, plus a status
//! map recording which surfaces are held by the caller.
//!
//! A surface is *free* when hardware holds no lock on it and it is not
//! marked in use. The free scan walks the array in order and takes the
//! first matches; it does not rotate or balance. The scan and every status
//! mutation share one lock.
//!
//! # Examples
//!
//! ```rust
//! use lamco_surface::allocator::{AllocRequest, MemType, SystemAllocator};
//! use lamco_surface::format::{FrameInfo, PixelFormat};
//! use lamco_surface::pool::SurfacePool;
//!
//! # fn main() -> lamco_surface::Result<()> {
//! let frames = SystemAllocator::new();
//! let request = AllocRequest::new(
//!     FrameInfo::new(PixelFormat::Nv12, 64, 64),
//!     4,
//!     MemType::SystemMemory | MemType::Internal,
//! );
//! let pool = SurfacePool::allocate(&frames, &request)?;
//!
//! let id = pool.find_free().expect("fresh pool has free surfaces");
//! pool.mark_in_use(id, None)?;
//! assert_eq!(pool.free_surfaces(4).len(), 3);
//!
//! pool.release(id)?;
//! assert_eq!(pool.stats().free, 4);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::allocator::{AllocRequest, AllocResponse, FrameAllocator, FrameData, MemId, MemType};
use crate::error::{Result, SurfaceError};
use crate::format::FrameInfo;

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_SYNC_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Unique pool identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u32);

impl PoolId {
    fn next() -> Self {
        Self(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Index of a surface inside its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub usize);

/// A surface addressed across pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceRef {
    /// Owning pool
    pub pool: PoolId,
    /// Surface within the pool
    pub surface: SurfaceId,
}

impl fmt::Display for SurfaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool{}/surface{}", self.pool.0, self.surface.0)
    }
}

/// Completion token for one outstanding hardware operation
///
/// Not `Clone`: a token is consumed by exactly one synchronize call.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SyncToken(u64);

impl SyncToken {
    /// Mint a fresh, process-unique token
    #[must_use]
    pub fn mint() -> Self {
        Self(NEXT_SYNC_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw token value
    #[must_use]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Shared view of a surface's hardware lock count
///
/// Handed to the hardware collaborator so it can drop its lock when the
/// operation completes.
#[derive(Debug, Clone)]
pub struct SurfaceLock(Arc<AtomicU16>);

impl SurfaceLock {
    /// Drop one hardware lock
    pub fn release(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// One frame buffer owned by a pool
pub struct FrameSurface {
    id: SurfaceId,
    pool: PoolId,
    info: FrameInfo,
    mem_id: MemId,
    mapping: Option<FrameData>,
    hw_locks: Arc<AtomicU16>,
}

impl FrameSurface {
    /// Index inside the pool
    #[must_use]
    pub fn id(&self) -> SurfaceId {
        self.id
    }

    /// Cross-pool reference
    #[must_use]
    pub fn surface_ref(&self) -> SurfaceRef {
        SurfaceRef {
            pool: self.pool,
            surface: self.id,
        }
    }

    /// Frame geometry
    #[must_use]
    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    /// Backing memory id
    #[must_use]
    pub fn mem_id(&self) -> MemId {
        self.mem_id
    }

    /// Persistent CPU mapping, for host-memory surfaces
    #[must_use]
    pub fn mapping(&self) -> Option<&FrameData> {
        self.mapping.as_ref()
    }

    /// Take one hardware lock
    pub fn hw_lock(&self) {
        self.hw_locks.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one hardware lock
    pub fn hw_unlock(&self) {
        self.lock_handle().release();
    }

    /// Current hardware lock count
    #[must_use]
    pub fn lock_count(&self) -> u16 {
        self.hw_locks.load(Ordering::Acquire)
    }

    /// Shared handle on the lock count
    #[must_use]
    pub fn lock_handle(&self) -> SurfaceLock {
        SurfaceLock(Arc::clone(&self.hw_locks))
    }
}

impl fmt::Debug for FrameSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSurface")
            .field("id", &self.id)
            .field("mem_id", &self.mem_id)
            .field("info", &self.info)
            .field("hw_locks", &self.lock_count())
            .finish()
    }
}

/// Caller-side state of one surface
#[derive(Debug, Default)]
pub struct SurfaceStatus {
    /// Held by the caller
    pub in_use: bool,
    /// Outstanding operation producing this surface
    pub sync: Option<SyncToken>,
    /// Surface this one was derived from
    pub chained: Option<SurfaceRef>,
}

/// Pool statistics
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Surfaces in the pool
    pub total: usize,
    /// Surfaces marked in use
    pub in_use: usize,
    /// Surfaces with a hardware lock
    pub hw_locked: usize,
    /// Surfaces neither in use nor locked
    pub free: usize,
}

/// Fixed-size pool of frame surfaces
pub struct SurfacePool {
    id: PoolId,
    surfaces: Vec<FrameSurface>,
    status: Mutex<HashMap<SurfaceId, SurfaceStatus>>,
    response: AllocResponse,
}

impl SurfacePool {
    /// Allocate frames for `request` and wrap them in a pool
    pub fn allocate(frames: &dyn FrameAllocator, request: &AllocRequest) -> Result<Self> {
        let response = frames.alloc_frames(request)?;
        Self::from_response(frames, response)
    }

    /// Wrap already-allocated frames in a pool
    ///
    /// Host-memory frames are mapped once here and stay mapped.
    pub fn from_response(frames: &dyn FrameAllocator, response: AllocResponse) -> Result<Self> {
        if response.is_empty() {
            return Err(SurfaceError::invalid_parameter("allocation has no frames"));
        }

        let id = PoolId::next();
        let map_system = response.mem_type.contains(MemType::SystemMemory);
        let mut surfaces = Vec::with_capacity(response.len());
        for (index, &mem_id) in response.mids.iter().enumerate() {
            let mapping = if map_system {
                Some(frames.lock(mem_id)?)
            } else {
                None
            };
            surfaces.push(FrameSurface {
                id: SurfaceId(index),
                pool: id,
                info: response.info,
                mem_id,
                mapping,
                hw_locks: Arc::new(AtomicU16::new(0)),
            });
        }

        debug!(
            "Created surface pool {:?} with {} {} surfaces",
            id,
            surfaces.len(),
            response.info.format
        );

        Ok(Self {
            id,
            surfaces,
            status: Mutex::new(HashMap::new()),
            response,
        })
    }

    /// Pool identifier
    #[must_use]
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Number of surfaces
    #[must_use]
    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    /// Whether the pool has no surfaces
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    /// Frame geometry shared by every surface
    #[must_use]
    pub fn info(&self) -> &FrameInfo {
        &self.response.info
    }

    /// The allocation backing this pool
    #[must_use]
    pub fn response(&self) -> &AllocResponse {
        &self.response
    }

    /// Surface by id
    #[must_use]
    pub fn get(&self, id: SurfaceId) -> Option<&FrameSurface> {
        self.surfaces.get(id.0)
    }

    /// Surface by id, or `NotFound`
    pub fn surface(&self, id: SurfaceId) -> Result<&FrameSurface> {
        self.get(id)
            .ok_or_else(|| SurfaceError::not_found(format!("surface {} in pool {:?}", id.0, self.id)))
    }

    /// Whether `r` points into this pool
    #[must_use]
    pub fn owns(&self, r: SurfaceRef) -> bool {
        r.pool == self.id && r.surface.0 < self.surfaces.len()
    }

    /// All surfaces, in array order
    pub fn iter(&self) -> impl Iterator<Item = &FrameSurface> {
        self.surfaces.iter()
    }

    fn is_free(surface: &FrameSurface, status: &HashMap<SurfaceId, SurfaceStatus>) -> bool {
        surface.lock_count() == 0 && !status.get(&surface.id).is_some_and(|s| s.in_use)
    }

    /// Up to `k` free surfaces, first by array position
    ///
    /// Fewer than `k` (possibly none) means the caller must wait.
    #[must_use]
    pub fn free_surfaces(&self, k: usize) -> Vec<SurfaceId> {
        let status = self.status.lock();
        self.surfaces
            .iter()
            .filter(|s| Self::is_free(s, &status))
            .take(k)
            .map(FrameSurface::id)
            .collect()
    }

    /// First free surface
    #[must_use]
    pub fn find_free(&self) -> Option<SurfaceId> {
        self.free_surfaces(1).into_iter().next()
    }

    /// Find and mark a free surface in one step
    pub fn acquire_free(&self) -> Option<SurfaceId> {
        let mut status = self.status.lock();
        let id = self
            .surfaces
            .iter()
            .find(|s| Self::is_free(s, &status))
            .map(FrameSurface::id)?;
        status.entry(id).or_default().in_use = true;
        Some(id)
    }

    /// Whether any surface is free
    #[must_use]
    pub fn has_free(&self) -> bool {
        self.find_free().is_some()
    }

    /// Mark a surface held, recording the operation that produces it
    pub fn mark_in_use(&self, id: SurfaceId, sync: Option<SyncToken>) -> Result<()> {
        self.surface(id)?;
        let mut status = self.status.lock();
        let entry = status.entry(id).or_default();
        entry.in_use = true;
        entry.sync = sync;
        trace!("Surface {:?}/{} in use", self.id, id.0);
        Ok(())
    }

    /// Record the surface `id` was derived from
    pub fn link(&self, id: SurfaceId, chained: SurfaceRef) -> Result<()> {
        self.surface(id)?;
        self.status.lock().entry(id).or_default().chained = Some(chained);
        Ok(())
    }

    /// Take the pending completion token of a surface
    pub fn take_sync(&self, id: SurfaceId) -> Option<SyncToken> {
        self.status.lock().get_mut(&id).and_then(|s| s.sync.take())
    }

    /// Put back a token that could not be consumed yet
    pub fn restore_sync(&self, id: SurfaceId, token: SyncToken) {
        self.status.lock().entry(id).or_default().sync = Some(token);
    }

    /// Whether the caller holds the surface
    #[must_use]
    pub fn is_in_use(&self, id: SurfaceId) -> bool {
        self.status.lock().get(&id).is_some_and(|s| s.in_use)
    }

    /// Return a held surface to the pool
    ///
    /// Returns the surface it was derived from, if any. Releasing a surface
    /// that is not held is `NotFound`.
    pub fn release(&self, id: SurfaceId) -> Result<Option<SurfaceRef>> {
        let mut status = self.status.lock();
        match status.remove(&id) {
            Some(s) if s.in_use => {
                if s.sync.is_some() {
                    warn!("Surface {:?}/{} released with an unsynced operation", self.id, id.0);
                }
                trace!("Surface {:?}/{} released", self.id, id.0);
                Ok(s.chained)
            }
            other => {
                if let Some(s) = other {
                    status.insert(id, s);
                }
                Err(SurfaceError::not_found(format!(
                    "surface {} in pool {:?} is not in use",
                    id.0, self.id
                )))
            }
        }
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let status = self.status.lock();
        let mut stats = PoolStats {
            total: self.surfaces.len(),
            ..PoolStats::default()
        };
        for surface in &self.surfaces {
            let in_use = status.get(&surface.id).is_some_and(|s| s.in_use);
            let locked = surface.lock_count() > 0;
            stats.in_use += usize::from(in_use);
            stats.hw_locked += usize::from(locked);
            stats.free += usize::from(!in_use && !locked);
        }
        stats
    }

    /// Release the pool's frames back to `frames`
    pub fn free_frames(&self, frames: &dyn FrameAllocator) -> Result<()> {
        frames.free_frames(&self.response)
    }
}

impl fmt::Debug for SurfacePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfacePool")
            .field("id", &self.id)
            .field("len", &self.surfaces.len())
            .field("info", &self.response.info)
            .finish()
    }
}

impl Drop for SurfacePool {
    fn drop(&mut self) {
        debug!("Dropping surface pool {:?}", self.id);
    }
}
