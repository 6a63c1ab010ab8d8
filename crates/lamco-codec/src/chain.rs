//! Post-Process Chain
//!
//! An ordered list of post-process stages between a producer (caller input
//! or decoder output) and a consumer (encoder or caller). Each stage owns a
//! pool of output surfaces.
//!
//! Stages are added only when needed:
//!
//! 1. **Resize/CSC** when format, width or height differ
//! 2. **Rotate** when a rotation is requested
//! 3. **Mirror** when mirroring is requested
//!
//! Identical input and output descriptors produce an empty chain.
//!
//! # Pipelined execution
//!
//! [`PostProcessChain::run_stage1`] reserves an output surface in *every*
//! stage before submitting anything, so a run never stalls halfway. Each
//! stage output is marked in use and linked to the surface it was produced
//! from; [`PostProcessChain::release_surface`] walks those links back so
//! intermediates are returned together with the final surface.

use std::fmt;

use enumflags2::BitFlags;
use lamco_surface::{
    AllocRequest, CropRect, FrameAllocator, FrameInfo, FrameSurface, MemType, SurfaceId,
    SurfacePool, SurfaceRef, SyncToken,
};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::{Mirror, Rotation};
use crate::error::{CodecError, Result};
use crate::hardware::{sync_blocking, HardwareSession, HwStatus, StageId};
use crate::params::{StageKind, VppParams};
use crate::retry::RetryPolicy;

/// Shape of a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainDescriptor {
    /// What the producer delivers
    pub input: FrameInfo,
    /// What the consumer expects
    pub output: FrameInfo,
    /// Rotation stage
    pub rotation: Option<Rotation>,
    /// Mirror stage
    pub mirror: Option<Mirror>,
    /// Output surfaces per stage
    pub depth: usize,
    /// Memory type of stage pools
    pub memory: BitFlags<MemType>,
}

/// Outcome of [`PostProcessChain::run_stage1`]
#[derive(Debug)]
pub enum ChainRun {
    /// Every stage was submitted
    Complete {
        /// Final stage output
        output: SurfaceRef,
        /// Token of the final stage
        sync: SyncToken,
    },
    /// A stage had no free surface; the input token is handed back
    MoreSurface(Option<SyncToken>),
}

/// Chain statistics
#[derive(Debug, Clone, Default)]
pub struct ChainStats {
    /// Stages in the chain
    pub stages: usize,
    /// Completed runs
    pub runs: u64,
    /// Runs refused for lack of surfaces
    pub backpressure: u64,
    /// Surfaces returned through `release_surface`
    pub released: u64,
}

struct Stage {
    kind: StageKind,
    id: StageId,
    input: FrameInfo,
    pool: SurfacePool,
}

/// Ordered post-process stages with per-stage output pools
pub struct PostProcessChain {
    stages: Vec<Stage>,
    retry: RetryPolicy,
    stats: Mutex<ChainStats>,
}

impl PostProcessChain {
    /// Build the stages `desc` calls for
    ///
    /// Each stage is initialized on `hw` and gets `desc.depth` output
    /// surfaces, aligned to 16, allocated from `frames`.
    pub fn build(
        hw: &mut dyn HardwareSession,
        frames: &dyn FrameAllocator,
        desc: &ChainDescriptor,
    ) -> Result<Self> {
        let mut plan = Vec::new();
        let mut current = desc.input;

        if desc.input.differs_in_shape(&desc.output) {
            plan.push((StageKind::ResizeCsc, current, desc.output));
            current = desc.output;
        }
        if let Some(rotation) = desc.rotation {
            let rotated = match rotation {
                Rotation::Deg90 | Rotation::Deg270 => FrameInfo::new(current.format, current.height, current.width)
                    .with_crop(CropRect::full(current.crop.h, current.crop.w)),
                Rotation::Deg180 => current,
            };
            plan.push((StageKind::Rotate(rotation), current, rotated));
            current = rotated;
        }
        if let Some(mirror) = desc.mirror {
            plan.push((StageKind::Mirror(mirror), current, current));
        }

        let mut stages = Vec::with_capacity(plan.len());
        for (kind, input, output) in plan {
            let id = hw.init_vpp(&VppParams::new(kind, input, output))?;
            let request = AllocRequest::new(
                output.aligned16(),
                desc.depth,
                desc.memory | MemType::FromVppOut | MemType::Internal,
            );
            let pool = SurfacePool::allocate(frames, &request)?;
            debug!("Chain stage {:?}: {}x{} -> {}x{}", kind, input.width, input.height, output.width, output.height);
            stages.push(Stage {
                kind,
                id,
                input,
                pool,
            });
        }

        let stats = ChainStats {
            stages: stages.len(),
            ..ChainStats::default()
        };
        Ok(Self {
            stages,
            retry: RetryPolicy::default(),
            stats: Mutex::new(stats),
        })
    }

    /// Replace the busy-retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Number of stages
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the chain has no stages
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage operations in order
    #[must_use]
    pub fn kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind).collect()
    }

    /// Geometry the first stage expects
    #[must_use]
    pub fn query_input_info(&self) -> Option<FrameInfo> {
        self.stages.first().map(|s| s.input)
    }

    /// Geometry of the final stage output
    #[must_use]
    pub fn output_info(&self) -> Option<FrameInfo> {
        self.stages.last().map(|s| *s.pool.info())
    }

    /// Whether every stage has a free output surface
    #[must_use]
    pub fn has_free_surfaces(&self) -> bool {
        !self.stages.is_empty() && self.stages.iter().all(|s| s.pool.has_free())
    }

    /// Surface behind a chain reference
    #[must_use]
    pub fn surface(&self, r: SurfaceRef) -> Option<&FrameSurface> {
        self.stages
            .iter()
            .find(|s| s.pool.owns(r))
            .and_then(|s| s.pool.get(r.surface))
    }

    /// Run every stage from `input`, reserving all outputs up front
    ///
    /// `input_sync` is the token of the operation that produced `input`; it
    /// is waited on before the first stage is submitted. Intermediate
    /// stages are synced before the next one starts.
    pub fn run_stage1(
        &self,
        hw: &mut dyn HardwareSession,
        frames: &dyn FrameAllocator,
        input: &FrameSurface,
        input_sync: Option<SyncToken>,
    ) -> Result<ChainRun> {
        if self.stages.is_empty() {
            return Err(CodecError::not_initialized("post-process chain has no stages"));
        }

        let mut reserved = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            match stage.pool.acquire_free() {
                Some(id) => reserved.push(id),
                None => {
                    self.abandon(&reserved);
                    self.stats.lock().backpressure += 1;
                    trace!("Chain stage {:?} has no free surface", stage.kind);
                    return Ok(ChainRun::MoreSurface(input_sync));
                }
            }
        }

        if let Some(token) = input_sync {
            if let Err(e) = sync_blocking(hw, token) {
                self.abandon(&reserved);
                return Err(e);
            }
        }

        match self.submit_all(hw, frames, input, &reserved) {
            Ok((output, sync)) => {
                self.stats.lock().runs += 1;
                Ok(ChainRun::Complete { output, sync })
            }
            Err(e) => {
                self.abandon(&reserved);
                Err(e)
            }
        }
    }

    fn submit_all(
        &self,
        hw: &mut dyn HardwareSession,
        frames: &dyn FrameAllocator,
        input: &FrameSurface,
        reserved: &[SurfaceId],
    ) -> Result<(SurfaceRef, SyncToken)> {
        let mut src = input;
        let mut pending: Option<SyncToken> = None;

        for (stage, &id) in self.stages.iter().zip(reserved) {
            if let Some(token) = pending.take() {
                sync_blocking(hw, token)?;
            }
            let dst = stage.pool.surface(id)?;
            let token = match self
                .retry
                .run("run_vpp_async", || hw.run_vpp_async(stage.id, src, dst, frames))?
            {
                HwStatus::Done(token) => token,
                other => {
                    warn!("Chain stage {:?} refused a reserved surface: {:?}", stage.kind, other);
                    return Err(CodecError::PoolExhausted(format!(
                        "stage {:?} rejected its reserved surface",
                        stage.kind
                    )));
                }
            };
            stage.pool.link(id, src.surface_ref())?;
            pending = Some(token);
            src = dst;
        }

        let sync = pending.ok_or_else(|| CodecError::not_initialized("post-process chain has no stages"))?;
        Ok((src.surface_ref(), sync))
    }

    fn abandon(&self, reserved: &[SurfaceId]) {
        for (stage, &id) in self.stages.iter().zip(reserved) {
            if let Err(e) = stage.pool.release(id) {
                debug!("Reserved chain surface already released: {}", e);
            }
        }
    }

    /// Blocking single-surface run
    ///
    /// Uses the first surface of every stage without reserving it and
    /// syncs each stage before the next. Returns the final surface.
    #[deprecated(note = "use run_stage1, which reserves surfaces and pipelines stages")]
    pub fn run(
        &self,
        hw: &mut dyn HardwareSession,
        frames: &dyn FrameAllocator,
        input: &FrameSurface,
    ) -> Result<SurfaceRef> {
        let mut src = input;
        for stage in &self.stages {
            let dst = stage.pool.surface(SurfaceId(0))?;
            match self
                .retry
                .run("run_vpp_async", || hw.run_vpp_async(stage.id, src, dst, frames))?
            {
                HwStatus::Done(token) => {
                    sync_blocking(hw, token)?;
                }
                _ => {
                    return Err(CodecError::PoolExhausted(format!(
                        "stage {:?} has no output surface",
                        stage.kind
                    )));
                }
            }
            src = dst;
        }
        Ok(src.surface_ref())
    }

    /// Release a final surface and every intermediate it depends on
    pub fn release_surface(&self, r: SurfaceRef) -> Result<()> {
        if self.stages.is_empty() {
            return Err(CodecError::not_initialized("post-process chain has no stages"));
        }

        let mut current = Some(r);
        let mut released = 0u64;
        while let Some(r) = current {
            let Some(stage) = self.stages.iter().find(|s| s.pool.owns(r)) else {
                break;
            };
            current = stage.pool.release(r.surface)?;
            released += 1;
        }

        if released == 0 {
            return Err(CodecError::not_found(format!("{r} is not a chain surface")));
        }
        self.stats.lock().released += released;
        Ok(())
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> ChainStats {
        self.stats.lock().clone()
    }

    /// Free every stage pool's frames
    pub fn free(&self, frames: &dyn FrameAllocator) -> Result<()> {
        for stage in &self.stages {
            stage.pool.free_frames(frames)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PostProcessChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostProcessChain")
            .field("stages", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedSession;
    use lamco_surface::{PixelFormat, SystemAllocator};

    fn desc(input: FrameInfo, output: FrameInfo) -> ChainDescriptor {
        ChainDescriptor {
            input,
            output,
            rotation: None,
            mirror: None,
            depth: 2,
            memory: MemType::SystemMemory.into(),
        }
    }

    fn source(frames: &SystemAllocator, info: FrameInfo) -> SurfacePool {
        let request = AllocRequest::new(info, 1, MemType::SystemMemory | MemType::FromVppIn | MemType::Internal);
        SurfacePool::allocate(frames, &request).expect("source pool")
    }

    #[test]
    fn test_stage_selection() {
        let frames = SystemAllocator::new();
        let mut hw = SimulatedSession::new();
        let nv12 = FrameInfo::new(PixelFormat::Nv12, 64, 64);

        let same = PostProcessChain::build(&mut hw, &frames, &desc(nv12, nv12)).expect("chain");
        assert_eq!(same.len(), 0);
        assert!(same.query_input_info().is_none());

        let resized = FrameInfo::new(PixelFormat::Nv12, 32, 32);
        assert_eq!(
            PostProcessChain::build(&mut hw, &frames, &desc(nv12, resized)).expect("chain").len(),
            1
        );

        let rgb = FrameInfo::new(PixelFormat::Rgb4, 64, 64);
        let full = ChainDescriptor {
            rotation: Some(Rotation::Deg90),
            mirror: Some(Mirror::Vertical),
            ..desc(nv12, rgb)
        };
        let chain = PostProcessChain::build(&mut hw, &frames, &full).expect("chain");
        assert_eq!(
            chain.kinds(),
            vec![
                StageKind::ResizeCsc,
                StageKind::Rotate(Rotation::Deg90),
                StageKind::Mirror(Mirror::Vertical)
            ]
        );
        assert_eq!(chain.query_input_info(), Some(nv12));
    }

    #[test]
    fn test_rotation_swaps_dimensions() {
        let frames = SystemAllocator::new();
        let mut hw = SimulatedSession::new();
        let wide = FrameInfo::new(PixelFormat::Nv12, 64, 32);
        let chain = PostProcessChain::build(
            &mut hw,
            &frames,
            &ChainDescriptor {
                rotation: Some(Rotation::Deg270),
                ..desc(wide, wide)
            },
        )
        .expect("chain");
        let out = chain.output_info().expect("output");
        assert_eq!((out.width, out.height), (32, 64));
    }

    #[test]
    fn test_run_stage1_links_and_releases() {
        let frames = SystemAllocator::new();
        let mut hw = SimulatedSession::new();
        let input = FrameInfo::new(PixelFormat::Nv12, 64, 64);
        let src_pool = source(&frames, input);
        let chain = PostProcessChain::build(
            &mut hw,
            &frames,
            &ChainDescriptor {
                mirror: Some(Mirror::Horizontal),
                ..desc(input, FrameInfo::new(PixelFormat::Nv12, 32, 32))
            },
        )
        .expect("chain");
        let src = src_pool.get(SurfaceId(0)).expect("src");

        let ChainRun::Complete { output, sync } =
            chain.run_stage1(&mut hw, &frames, src, None).expect("run")
        else {
            panic!("expected Complete");
        };
        assert!(chain.surface(output).is_some());
        sync_blocking(&mut hw, sync).expect("sync");

        // Two stages, each holding one surface.
        chain.release_surface(output).expect("release");
        assert_eq!(chain.stats().released, 2);
        assert!(matches!(chain.release_surface(output), Err(CodecError::Surface(_))));
    }

    #[test]
    fn test_backpressure_returns_token() {
        let frames = SystemAllocator::new();
        let mut hw = SimulatedSession::new();
        let input = FrameInfo::new(PixelFormat::Nv12, 64, 64);
        let src_pool = source(&frames, input);
        let chain = PostProcessChain::build(
            &mut hw,
            &frames,
            &ChainDescriptor {
                depth: 1,
                ..desc(input, FrameInfo::new(PixelFormat::Rgb4, 64, 64))
            },
        )
        .expect("chain");
        let src = src_pool.get(SurfaceId(0)).expect("src");

        let ChainRun::Complete { output, sync } =
            chain.run_stage1(&mut hw, &frames, src, None).expect("run")
        else {
            panic!("expected Complete");
        };
        sync_blocking(&mut hw, sync).expect("sync");

        let token = SyncToken::mint();
        let raw = token.raw();
        match chain.run_stage1(&mut hw, &frames, src, Some(token)).expect("run") {
            ChainRun::MoreSurface(Some(back)) => assert_eq!(back.raw(), raw),
            other => panic!("expected MoreSurface, got {other:?}"),
        }
        assert_eq!(chain.stats().backpressure, 1);

        chain.release_surface(output).expect("release");
        assert!(matches!(
            chain.run_stage1(&mut hw, &frames, src, None),
            Ok(ChainRun::Complete { .. })
        ));
    }

    #[test]
    fn test_release_errors() {
        let frames = SystemAllocator::new();
        let mut hw = SimulatedSession::new();
        let info = FrameInfo::new(PixelFormat::Nv12, 64, 64);
        let src_pool = source(&frames, info);
        let foreign = src_pool.get(SurfaceId(0)).expect("src").surface_ref();

        let empty = PostProcessChain::build(&mut hw, &frames, &desc(info, info)).expect("chain");
        assert!(matches!(empty.release_surface(foreign), Err(CodecError::NotInitialized(_))));

        let chain = PostProcessChain::build(
            &mut hw,
            &frames,
            &desc(info, FrameInfo::new(PixelFormat::Nv12, 16, 16)),
        )
        .expect("chain");
        assert!(matches!(chain.release_surface(foreign), Err(CodecError::NotFound(_))));
    }

    #[test]
    #[allow(deprecated)]
    fn test_blocking_run() {
        let frames = SystemAllocator::new();
        let mut hw = SimulatedSession::new();
        let input = FrameInfo::new(PixelFormat::Nv12, 8, 2);
        let src_pool = source(&frames, input);
        let src = src_pool.get(SurfaceId(0)).expect("src");
        src.mapping().expect("mapped").write_luma(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let chain = PostProcessChain::build(
            &mut hw,
            &frames,
            &ChainDescriptor {
                mirror: Some(Mirror::Horizontal),
                ..desc(input, input)
            },
        )
        .expect("chain");

        let out = chain.run(&mut hw, &frames, src).expect("run");
        let surface = chain.surface(out).expect("surface");
        assert_eq!(surface.lock_count(), 0);
        assert_eq!(
            surface.mapping().expect("mapped").read_luma(8),
            vec![8, 7, 6, 5, 4, 3, 2, 1]
        );
    }
}
