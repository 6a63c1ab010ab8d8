//! Post-Process Session
//!
//! Standalone resize, color conversion, rotation and mirroring over the
//! post-process chain. Callers borrow input surfaces by handle, fill them
//! and queue them back; processed surfaces come out of a blocking queue.
//!
//! When every chain stage is busy, a queued input is parked and retried as
//! soon as an output is released.
//!
//! # Examples
//!
//! ```rust
//! use std::time::Duration;
//! use lamco_codec::config::{CodecConfig, VppConfig};
//! use lamco_codec::sim::SimulatedSession;
//! use lamco_codec::vpp::VppSession;
//! use lamco_surface::SystemAllocator;
//!
//! # fn main() -> lamco_codec::Result<()> {
//! let config = CodecConfig {
//!     width: 64,
//!     height: 64,
//!     vpp: VppConfig {
//!         out_width: 32,
//!         out_height: 32,
//!         ..VppConfig::default()
//!     },
//!     ..CodecConfig::default()
//! };
//! let session = VppSession::allocate(
//!     config,
//!     Box::new(SimulatedSession::new()),
//!     Box::new(SystemAllocator::new()),
//! )?;
//!
//! let input = session.dequeue_input_buffer()?.expect("free input");
//! session.queue_input_buffer(input.handle)?;
//! let output = session
//!     .dequeue_output_buffer(Duration::from_millis(10))?
//!     .expect("processed frame");
//! assert_eq!(output.info.crop.w, 32);
//! session.release_output_buffer(output.handle)?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use lamco_surface::{
    AllocRequest, CropRect, FrameAllocator, FrameData, FrameInfo, MemType, NativeHandle, SafeQueue, SurfaceId,
    SurfacePool, SurfaceRef, SyncToken,
};

use crate::chain::{ChainDescriptor, ChainRun, PostProcessChain};
use crate::config::CodecConfig;
use crate::error::{CodecError, Result};
use crate::hardware::{check_version, sync_blocking, HardwareSession};

/// An input surface lent to the caller
#[derive(Debug, Clone)]
pub struct VppInput {
    /// Pool slot
    pub surface: SurfaceId,

    /// Handle to pass back to `queue_input_buffer`
    pub handle: NativeHandle,

    /// CPU mapping, when the surface can be mapped
    pub mapping: Option<FrameData>,
}

/// A processed surface
#[derive(Debug, Clone)]
pub struct VppOutput {
    /// Handle to pass back to `release_output_buffer`
    pub handle: NativeHandle,

    /// Surface geometry
    pub info: FrameInfo,

    /// CPU mapping, for host-memory surfaces
    pub mapping: Option<FrameData>,
}

/// Post-process session statistics
#[derive(Debug, Clone, Default)]
pub struct VppStats {
    /// Inputs submitted to the chain
    pub frames_in: u64,

    /// Outputs handed to the caller
    pub frames_out: u64,

    /// Submissions parked because the chain had no free surface
    pub deferred: u64,

    /// Input requests skipped because the device still held the surface
    pub input_busy: u64,
}

fn crop_of(rect: [u32; 4], width: u32, height: u32) -> CropRect {
    let [x, y, w, h] = rect;
    if w == 0 || h == 0 {
        CropRect::full(width, height)
    } else {
        CropRect { x, y, w, h }
    }
}

/// Standalone post-process session
pub struct VppSession {
    frames: Box<dyn FrameAllocator>,
    config: CodecConfig,
    hw: Mutex<Box<dyn HardwareSession>>,
    input: SurfacePool,
    chain: PostProcessChain,
    by_handle: HashMap<NativeHandle, SurfaceId>,
    free_inputs: SafeQueue<SurfaceId>,
    lent: Mutex<HashSet<SurfaceId>>,
    pending: Mutex<VecDeque<SurfaceId>>,
    outputs: SafeQueue<(SurfaceRef, SyncToken)>,
    released: Mutex<HashMap<NativeHandle, SurfaceRef>>,
    stats: Mutex<VppStats>,
    closed: AtomicBool,
}

impl VppSession {
    /// Build the chain `config` calls for and allocate input surfaces
    ///
    /// A configuration that needs no stage is rejected.
    pub fn allocate(
        config: CodecConfig,
        mut hw: Box<dyn HardwareSession>,
        frames: Box<dyn FrameAllocator>,
    ) -> Result<Self> {
        info!("Creating post-process session with config: {:?}", config);
        config
            .validate()
            .map_err(|issues| CodecError::invalid_config(issues.join(", ")))?;
        check_version(hw.as_ref())?;

        let input_info = FrameInfo::new(config.input_format.pixel_format(), config.width, config.height)
            .with_crop(crop_of(config.vpp.in_crop, config.width, config.height))
            .aligned16();
        let (out_w, out_h) = (config.vpp_out_width(), config.vpp_out_height());
        let output_info = FrameInfo::new(config.output_format.pixel_format(), out_w, out_h)
            .with_crop(crop_of(config.vpp.out_crop, out_w, out_h))
            .aligned16();

        let desc = ChainDescriptor {
            input: input_info,
            output: output_info,
            rotation: config.vpp.rotation,
            mirror: config.vpp.mirror,
            depth: config.async_depth,
            memory: config.memory_type.mem_type().into(),
        };
        let chain = PostProcessChain::build(&mut *hw, frames.as_ref(), &desc)?;
        if chain.is_empty() {
            return Err(CodecError::invalid_config(
                "post-process input and output are identical; no stage to run",
            ));
        }

        let input = SurfacePool::allocate(
            frames.as_ref(),
            &AllocRequest::new(
                input_info,
                config.async_depth,
                config.memory_type.mem_type() | MemType::FromVppIn | MemType::Internal,
            ),
        )?;

        let free_inputs = SafeQueue::new();
        let mut by_handle = HashMap::with_capacity(input.len());
        for surface in input.iter() {
            by_handle.insert(frames.get_handle(surface.mem_id())?, surface.id());
            free_inputs.push(surface.id());
        }

        debug!("Post-process chain {:?} over {} inputs", chain.kinds(), input.len());

        Ok(Self {
            frames,
            config,
            hw: Mutex::new(hw),
            input,
            chain,
            by_handle,
            free_inputs,
            lent: Mutex::new(HashSet::new()),
            pending: Mutex::new(VecDeque::new()),
            outputs: SafeQueue::new(),
            released: Mutex::new(HashMap::new()),
            stats: Mutex::new(VppStats::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Session configuration
    #[must_use]
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// The stage chain
    #[must_use]
    pub fn chain(&self) -> &PostProcessChain {
        &self.chain
    }

    /// Get statistics
    #[must_use]
    pub fn stats(&self) -> VppStats {
        self.stats.lock().clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CodecError::not_initialized("post-process session is closed"));
        }
        Ok(())
    }

    /// Borrow a free input surface
    ///
    /// `None` when every input is lent out, parked, or still held by the
    /// device.
    pub fn dequeue_input_buffer(&self) -> Result<Option<VppInput>> {
        self.ensure_open()?;
        let Some(id) = self.free_inputs.try_pop() else {
            return Ok(None);
        };

        let surface = self.input.surface(id)?;
        if surface.lock_count() > 0 {
            self.free_inputs.push(id);
            self.stats.lock().input_busy += 1;
            trace!("Input {:?} still held by the device", id);
            return Ok(None);
        }

        let lent = (|| -> Result<VppInput> {
            let mapping = match surface.mapping() {
                Some(mapping) => Some(mapping.clone()),
                None => Some(self.frames.lock(surface.mem_id())?),
            };
            Ok(VppInput {
                surface: id,
                handle: self.frames.get_handle(surface.mem_id())?,
                mapping,
            })
        })();
        match lent {
            Ok(input) => {
                self.lent.lock().insert(id);
                Ok(Some(input))
            }
            Err(e) => {
                self.free_inputs.push(id);
                Err(e)
            }
        }
    }

    /// Submit a filled input by handle
    ///
    /// `Ok(false)` means the input was accepted but parked until an output
    /// is released. Only inputs currently lent by `dequeue_input_buffer` are
    /// accepted.
    pub fn queue_input_buffer(&self, handle: NativeHandle) -> Result<bool> {
        self.ensure_open()?;
        let Some(&id) = self.by_handle.get(&handle) else {
            warn!("Queue of unknown post-process input {:?}", handle);
            return Err(CodecError::not_found(format!("post-process input {handle:?}")));
        };
        if !self.lent.lock().remove(&id) {
            warn!("Queue of post-process input {:?} that is not lent out", id);
            return Err(CodecError::not_found(format!("lent post-process input {handle:?}")));
        }

        let surface = self.input.surface(id)?;
        if surface.mapping().is_none() {
            self.frames.unlock(surface.mem_id())?;
        }

        let mut pending = self.pending.lock();
        self.retry_pending(&mut pending)?;
        if pending.is_empty() && self.process(id)? {
            return Ok(true);
        }
        pending.push_back(id);
        trace!("Parked post-process input {:?} ({} pending)", id, pending.len());
        Ok(false)
    }

    fn process(&self, id: SurfaceId) -> Result<bool> {
        let input = self.input.surface(id)?;
        let mut hw = self.hw.lock();
        match self.chain.run_stage1(&mut **hw, self.frames.as_ref(), input, None)? {
            ChainRun::Complete { output, sync } => {
                self.outputs.push((output, sync));
                // Reusable once the device drops its lock on it.
                self.free_inputs.push(id);
                self.stats.lock().frames_in += 1;
                Ok(true)
            }
            ChainRun::MoreSurface(_) => {
                self.stats.lock().deferred += 1;
                Ok(false)
            }
        }
    }

    fn retry_pending(&self, pending: &mut VecDeque<SurfaceId>) -> Result<()> {
        while let Some(&id) = pending.front() {
            if !self.process(id)? {
                break;
            }
            pending.pop_front();
        }
        Ok(())
    }

    /// Wait up to `timeout` for a processed surface
    pub fn dequeue_output_buffer(&self, timeout: Duration) -> Result<Option<VppOutput>> {
        self.ensure_open()?;
        {
            let mut pending = self.pending.lock();
            self.retry_pending(&mut pending)?;
        }

        let Some((output, token)) = self.outputs.wait_pop_timeout(timeout) else {
            return Ok(None);
        };

        let resolved = sync_blocking(&mut **self.hw.lock(), token).and_then(|_| {
            let surface = self
                .chain
                .surface(output)
                .ok_or_else(|| CodecError::not_found(format!("chain surface {output}")))?;
            Ok(VppOutput {
                handle: self.frames.get_handle(surface.mem_id())?,
                info: *surface.info(),
                mapping: surface.mapping().cloned(),
            })
        });

        match resolved {
            Ok(frame) => {
                self.released.lock().insert(frame.handle, output);
                self.stats.lock().frames_out += 1;
                Ok(Some(frame))
            }
            Err(e) => {
                if let Err(release) = self.chain.release_surface(output) {
                    debug!("Chain surface already released: {}", release);
                }
                Err(e)
            }
        }
    }

    /// Return a processed surface and retry parked inputs
    pub fn release_output_buffer(&self, handle: NativeHandle) -> Result<()> {
        let Some(output) = self.released.lock().remove(&handle) else {
            warn!("Release of unknown post-process output {:?}", handle);
            return Err(CodecError::not_found(format!("post-process output {handle:?}")));
        };
        self.chain.release_surface(output)?;

        let mut pending = self.pending.lock();
        self.retry_pending(&mut pending)
    }

    /// Release every queued and held output and free the pools
    ///
    /// Calling this twice is a no-op.
    pub fn deallocate(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.outputs.shutdown();
        self.free_inputs.shutdown();

        let mut drained = 0;
        while let Some((output, token)) = self.outputs.wait_pop() {
            sync_blocking(&mut **self.hw.lock(), token)?;
            self.chain.release_surface(output)?;
            drained += 1;
        }
        let held: Vec<SurfaceRef> = self.released.lock().drain().map(|(_, r)| r).collect();
        for output in &held {
            self.chain.release_surface(*output)?;
        }
        let parked = std::mem::take(&mut *self.pending.lock());
        self.lent.lock().clear();

        self.input.free_frames(self.frames.as_ref())?;
        self.chain.free(self.frames.as_ref())?;

        debug!(
            "Post-process session closed: {} queued, {} held, {} parked",
            drained,
            held.len(),
            parked.len()
        );
        Ok(())
    }
}

impl Drop for VppSession {
    fn drop(&mut self) {
        if let Err(e) = self.deallocate() {
            warn!("Post-process session teardown failed: {}", e);
        }
        debug!("Dropping post-process session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColorFormat, Rotation, VppConfig};
    use crate::params::StageKind;
    use crate::sim::SimulatedSession;
    use lamco_surface::{SystemAllocator, TextureId};

    const WAIT: Duration = Duration::from_millis(20);

    fn config(width: u32, height: u32, vpp: VppConfig) -> CodecConfig {
        CodecConfig {
            width,
            height,
            async_depth: 2,
            vpp,
            ..CodecConfig::default()
        }
    }

    fn downscale() -> VppConfig {
        VppConfig {
            out_width: 32,
            out_height: 32,
            ..VppConfig::default()
        }
    }

    fn session(config: CodecConfig) -> VppSession {
        VppSession::allocate(config, Box::new(SimulatedSession::new()), Box::new(SystemAllocator::new()))
            .expect("session")
    }

    #[test]
    fn test_identity_is_rejected() {
        let err = VppSession::allocate(
            config(64, 64, VppConfig::default()),
            Box::new(SimulatedSession::new()),
            Box::new(SystemAllocator::new()),
        )
        .err()
        .expect("no stages");
        assert!(matches!(err, CodecError::InvalidConfig(_)));
    }

    #[test]
    fn test_downscale_samples_nearest() {
        let session = session(config(64, 64, downscale()));
        assert_eq!(session.chain().kinds(), vec![StageKind::ResizeCsc]);

        let input = session.dequeue_input_buffer().expect("dequeue").expect("input");
        let row: Vec<u8> = (0..64).collect();
        input.mapping.as_ref().expect("mapping").write_luma(&row);
        assert!(session.queue_input_buffer(input.handle).expect("queue"));

        let output = session.dequeue_output_buffer(WAIT).expect("dequeue").expect("output");
        assert_eq!((output.info.crop.w, output.info.crop.h), (32, 32));
        let luma = output.mapping.as_ref().expect("mapping").read_luma(4);
        assert_eq!(luma, vec![0, 2, 4, 6]);
        session.release_output_buffer(output.handle).expect("release");
        assert_eq!(session.stats().frames_out, 1);
    }

    #[test]
    fn test_rotation_swaps_output() {
        let session = session(config(
            64,
            32,
            VppConfig {
                rotation: Some(Rotation::Deg90),
                ..VppConfig::default()
            },
        ));
        assert_eq!(session.chain().kinds(), vec![StageKind::Rotate(Rotation::Deg90)]);

        let input = session.dequeue_input_buffer().expect("dequeue").expect("input");
        assert!(session.queue_input_buffer(input.handle).expect("queue"));
        let output = session.dequeue_output_buffer(WAIT).expect("dequeue").expect("output");
        assert_eq!((output.info.crop.w, output.info.crop.h), (32, 64));
        session.release_output_buffer(output.handle).expect("release");
    }

    #[test]
    fn test_color_conversion_stage() {
        let session = session(CodecConfig {
            output_format: ColorFormat::Argb,
            ..config(64, 64, VppConfig::default())
        });
        assert_eq!(session.chain().len(), 1);
        let input = session.dequeue_input_buffer().expect("dequeue").expect("input");
        assert!(session.queue_input_buffer(input.handle).expect("queue"));
        let output = session.dequeue_output_buffer(WAIT).expect("dequeue").expect("output");
        assert_eq!(output.info.format, lamco_surface::PixelFormat::Rgb4);
        session.release_output_buffer(output.handle).expect("release");
    }

    #[test]
    fn test_backpressure_parks_input() {
        let session = session(config(64, 64, downscale()));

        let a = session.dequeue_input_buffer().expect("dequeue").expect("input");
        assert!(session.queue_input_buffer(a.handle).expect("queue"));
        let first = session.dequeue_output_buffer(WAIT).expect("dequeue").expect("output");

        let b = session.dequeue_input_buffer().expect("dequeue").expect("input");
        assert!(session.queue_input_buffer(b.handle).expect("queue"));
        let second = session.dequeue_output_buffer(WAIT).expect("dequeue").expect("output");

        let c = session.dequeue_input_buffer().expect("dequeue").expect("input");
        assert!(!session.queue_input_buffer(c.handle).expect("parked"));
        assert!(session.dequeue_output_buffer(Duration::from_millis(1)).expect("dequeue").is_none());
        assert!(session.stats().deferred >= 1);

        session.release_output_buffer(first.handle).expect("release");
        let third = session.dequeue_output_buffer(WAIT).expect("dequeue").expect("output");
        session.release_output_buffer(second.handle).expect("release");
        session.release_output_buffer(third.handle).expect("release");
        assert_eq!(session.stats().frames_in, 3);
    }

    #[test]
    fn test_unknown_handles() {
        let session = session(config(64, 64, downscale()));
        let bogus = NativeHandle::Texture(TextureId(7));
        assert!(matches!(session.queue_input_buffer(bogus), Err(CodecError::NotFound(_))));
        assert!(matches!(session.release_output_buffer(bogus), Err(CodecError::NotFound(_))));
    }

    #[test]
    fn test_requeue_does_not_lend_twice() {
        let session = session(config(64, 64, downscale()));
        let a = session.dequeue_input_buffer().expect("dequeue").expect("input");
        assert!(session.queue_input_buffer(a.handle).expect("queue"));
        assert!(matches!(session.queue_input_buffer(a.handle), Err(CodecError::NotFound(_))));

        let output = session.dequeue_output_buffer(WAIT).expect("dequeue").expect("output");
        session.release_output_buffer(output.handle).expect("release");

        let first = session.dequeue_input_buffer().expect("dequeue").expect("input");
        let second = session.dequeue_input_buffer().expect("dequeue").expect("input");
        assert_ne!(first.surface, second.surface);
        assert!(session.dequeue_input_buffer().expect("dequeue").is_none());
    }

    #[test]
    fn test_queue_without_dequeue_rejected() {
        let session = session(config(64, 64, downscale()));
        let a = session.dequeue_input_buffer().expect("dequeue").expect("input");
        let b = session.dequeue_input_buffer().expect("dequeue").expect("input");
        assert!(session.queue_input_buffer(a.handle).expect("queue"));

        // `a` went back to the free list; queuing it again without a dequeue fails
        assert!(matches!(session.queue_input_buffer(a.handle), Err(CodecError::NotFound(_))));
        assert!(session.queue_input_buffer(b.handle).expect("queue"));
        assert_eq!(session.stats().frames_in, 2);
    }

    #[test]
    fn test_deallocate_with_held_output() {
        let session = session(config(64, 64, downscale()));
        let input = session.dequeue_input_buffer().expect("dequeue").expect("input");
        assert!(session.queue_input_buffer(input.handle).expect("queue"));
        let _held = session.dequeue_output_buffer(WAIT).expect("dequeue").expect("output");

        let again = session.dequeue_input_buffer().expect("dequeue").expect("input");
        assert!(session.queue_input_buffer(again.handle).expect("queue"));

        session.deallocate().expect("deallocate");
        assert!(matches!(
            session.dequeue_input_buffer(),
            Err(CodecError::NotInitialized(_))
        ));
    }
}
