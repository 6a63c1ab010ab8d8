//! Encode Session
//!
//! A fixed-depth ring of input surfaces between one producer thread and one
//! consumer thread, with encoded output carved out of a byte arena.
//!
//! # Flow
//!
//! ```text
//! producer                      consumer
//! ────────                      ────────
//! dequeue_input_buffer()        dequeue_output_buffer()
//!   fill pixels                   ├─ run(): submit ring[read]
//! queue_input_buffer()            ├─ sync
//!   write += 1                    └─ read += 1, adjust QP
//!                               release_output_buffer()
//! ```
//!
//! The producer owns the `write` counter and the consumer owns `read`.
//! `write - read` never exceeds the ring depth, and at most one input
//! buffer is outside the session at any time.
//!
//! # Examples
//!
//! ```rust
//! use lamco_codec::config::CodecConfig;
//! use lamco_codec::encoder::EncodeSession;
//! use lamco_codec::sim::SimulatedSession;
//! use lamco_surface::SystemAllocator;
//!
//! # fn main() -> lamco_codec::Result<()> {
//! let config = CodecConfig::builder()
//!     .resolution(64, 64)
//!     .async_depth(2)
//!     .output_size_max(16 * 1024)
//!     .build();
//! let session = EncodeSession::allocate(
//!     config,
//!     Box::new(SimulatedSession::new()),
//!     Box::new(SystemAllocator::new()),
//! )?;
//!
//! let input = session.dequeue_input_buffer()?.expect("free input");
//! input.write_luma(&[128; 64]);
//! assert!(session.queue_input_buffer(input)?);
//!
//! let frame = session.dequeue_output_buffer(None)?.expect("encoded frame");
//! assert!(frame.len() > 0);
//! session.release_output_buffer(frame);
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use enumflags2::BitFlags;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use lamco_surface::{
    AllocRequest, AllocResponse, ArenaAllocator, ArenaSlot, FrameAllocator, FrameData, FrameInfo, MemId, MemType,
    NativeHandle, SurfaceId, SurfacePool, SyncToken,
};

use crate::chain::{ChainDescriptor, ChainRun, PostProcessChain};
use crate::config::{CodecConfig, RateControlMode};
use crate::error::{CodecError, Result};
use crate::hardware::{check_version, sync_blocking, EncodeCtrl, HardwareSession, HwStatus, OutputTarget, SyncStatus};
use crate::params::EncodeParams;
use crate::rate::QualityController;
use crate::retry::RetryPolicy;

// =============================================================================
// Buffers
// =============================================================================

/// An input surface handed to the producer
///
/// Obtained from `dequeue_input_buffer` and returned with
/// `queue_input_buffer`. Dropping it without queueing keeps the input
/// slot reserved until the session is closed.
#[derive(Debug)]
pub struct InputBuffer {
    /// Ring slot
    pub surface: SurfaceId,

    /// Allocator id of the surface
    pub mem_id: MemId,

    /// Native handle of the surface
    pub handle: NativeHandle,

    /// CPU mapping, when the surface can be mapped
    pub mapping: Option<FrameData>,

    index: u64,
}

impl InputBuffer {
    /// Frame number this buffer will be encoded as
    #[must_use]
    pub fn frame_index(&self) -> u64 {
        self.index
    }

    /// Copy `data` into the start of the luma plane
    ///
    /// Returns the number of bytes written; zero without a mapping.
    pub fn write_luma(&self, data: &[u8]) -> usize {
        self.mapping.as_ref().map_or(0, |m| m.write_luma(data))
    }
}

/// An encoded frame living in the session's output arena
#[derive(Debug)]
pub struct EncodedFrame {
    slot: ArenaSlot,
    len: usize,
    index: u64,
    qp: u8,
}

impl EncodedFrame {
    /// Encoded size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the frame produced no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Input frame number
    #[must_use]
    pub fn frame_index(&self) -> u64 {
        self.index
    }

    /// QP the frame was submitted with
    #[must_use]
    pub fn qp(&self) -> u8 {
        self.qp
    }

    /// Arena range reserved for the frame
    #[must_use]
    pub fn slot(&self) -> ArenaSlot {
        self.slot
    }
}

/// Rate hints used by per-frame QP control
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowControl {
    /// Frames per second
    pub fps: f32,

    /// Available throughput (kbps)
    pub throughput_kbps: u32,
}

/// Device-side encode progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeStatus {
    /// Frames the device has encoded
    pub num_frames: u64,

    /// QP the next frame will use
    pub qp: u8,
}

/// Encode session statistics
#[derive(Debug, Clone, Default)]
pub struct EncodeStats {
    /// Inputs queued by the producer
    pub frames_queued: u64,

    /// Frames returned to the consumer
    pub frames_encoded: u64,

    /// Inputs the device absorbed without output
    pub frames_absorbed: u64,

    /// Encoded bytes returned
    pub bytes_out: u64,

    /// Input requests refused because the ring was full
    pub input_backpressure: u64,

    /// Submissions deferred because the output arena was full
    pub output_backpressure: u64,

    /// Output waits that timed out
    pub sync_timeouts: u64,
}

impl EncodeStats {
    /// Mean encoded frame size in bytes
    #[must_use]
    pub fn average_frame_size(&self) -> u64 {
        if self.frames_encoded == 0 {
            return 0;
        }
        self.bytes_out / self.frames_encoded
    }
}

// =============================================================================
// Core
// =============================================================================

struct PendingFrame {
    slot: ArenaSlot,
    token: SyncToken,
    index: u64,
    qp: u8,
}

enum Submitted {
    Pending(SyncToken),
    Absorbed,
    Blocked,
}

struct ConsumerState {
    pending: Option<PendingFrame>,
    controller: QualityController,
    flow: FlowControl,
    stats: EncodeStats,
}

/// Encode engine without an owned allocator
///
/// [`EncodeSession`] pairs this with its allocator. The multi-layer
/// coordinator drives several cores over one shared allocator and one
/// shared input allocation.
pub struct EncoderCore {
    config: CodecConfig,
    params: EncodeParams,
    depth: usize,
    hw: Mutex<Box<dyn HardwareSession>>,
    input: SurfacePool,
    owns_input: bool,
    chain: Option<PostProcessChain>,
    arena: Arc<ArenaAllocator>,
    write: AtomicU64,
    read: AtomicU64,
    input_locked: AtomicBool,
    input_backpressure: AtomicU64,
    consumer: Mutex<ConsumerState>,
    user_data: Mutex<VecDeque<Vec<u8>>>,
    retry: RetryPolicy,
    closed: AtomicBool,
}

impl EncoderCore {
    /// Frame geometry of the input ring for `config`
    #[must_use]
    pub fn input_info(config: &CodecConfig) -> FrameInfo {
        FrameInfo::new(config.input_format.pixel_format(), config.width, config.height).aligned16()
    }

    /// Allocation flags of the input ring for `config`
    #[must_use]
    pub fn input_mem_type(config: &CodecConfig) -> BitFlags<MemType> {
        config.memory_type.mem_type() | MemType::FromEncode | MemType::FromVppIn | MemType::Internal
    }

    /// Validate `config`, initialize the device and allocate the ring
    pub fn allocate(config: CodecConfig, hw: Box<dyn HardwareSession>, frames: &dyn FrameAllocator) -> Result<Self> {
        info!("Creating encode session with config: {:?}", config);
        Self::prepare(&config, hw.as_ref())?;

        let request = AllocRequest::new(Self::input_info(&config), config.async_depth, Self::input_mem_type(&config));
        let response = frames.alloc_frames(&request)?;
        Self::with_input(config, hw, frames, response, true)
    }

    /// Like [`allocate`](Self::allocate), over caller-owned input frames
    ///
    /// The ring depth is the number of frames in `response`. The frames
    /// are not freed on [`deallocate`](Self::deallocate).
    pub fn allocate_shared(
        config: CodecConfig,
        hw: Box<dyn HardwareSession>,
        frames: &dyn FrameAllocator,
        response: AllocResponse,
    ) -> Result<Self> {
        info!("Creating shared-input encode session with config: {:?}", config);
        Self::prepare(&config, hw.as_ref())?;
        Self::with_input(config, hw, frames, response, false)
    }

    fn prepare(config: &CodecConfig, hw: &dyn HardwareSession) -> Result<()> {
        config
            .validate()
            .map_err(|issues| CodecError::invalid_config(issues.join(", ")))?;
        check_version(hw)
    }

    fn with_input(
        config: CodecConfig,
        mut hw: Box<dyn HardwareSession>,
        frames: &dyn FrameAllocator,
        response: AllocResponse,
        owns_input: bool,
    ) -> Result<Self> {
        let params = EncodeParams::for_vendor(&config)?;
        let input = SurfacePool::from_response(frames, response)?;
        let depth = input.len();

        let chain = if input.info().differs_in_shape(&params.info) {
            let desc = ChainDescriptor {
                input: *input.info(),
                output: params.info,
                rotation: None,
                mirror: None,
                depth,
                memory: config.memory_type.mem_type().into(),
            };
            Some(PostProcessChain::build(&mut *hw, frames, &desc)?)
        } else {
            None
        };

        hw.init_encoder(&params)?;

        let size = config.output_size_max;
        let arena = Arc::new(ArenaAllocator::new(size.saturating_mul(depth + 1)));
        let initial_qp = config.const_qp[0];

        debug!(
            "Encode ring of {} {} surfaces, {} chain stages, {} byte output arena",
            depth,
            input.info().format,
            chain.as_ref().map_or(0, PostProcessChain::len),
            arena.capacity()
        );

        Ok(Self {
            consumer: Mutex::new(ConsumerState {
                pending: None,
                controller: QualityController::new(initial_qp),
                flow: FlowControl {
                    fps: config.fps as f32,
                    throughput_kbps: config.bitrate_kbps,
                },
                stats: EncodeStats::default(),
            }),
            config,
            params,
            depth,
            hw: Mutex::new(hw),
            input,
            owns_input,
            chain,
            arena,
            write: AtomicU64::new(0),
            read: AtomicU64::new(0),
            input_locked: AtomicBool::new(false),
            input_backpressure: AtomicU64::new(0),
            user_data: Mutex::new(VecDeque::new()),
            retry: RetryPolicy::default(),
            closed: AtomicBool::new(false),
        })
    }

    /// Override the busy-retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Session configuration
    #[must_use]
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Device parameters derived from the configuration
    #[must_use]
    pub fn params(&self) -> &EncodeParams {
        &self.params
    }

    /// Ring depth
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether inputs pass through a post-process chain
    #[must_use]
    pub fn has_chain(&self) -> bool {
        self.chain.is_some()
    }

    /// Hardware timeline of the underlying device session
    pub(crate) fn timeline(&self) -> crate::hardware::TimelineId {
        self.hw.lock().timeline()
    }

    pub(crate) fn disjoin(&self) -> Result<()> {
        self.hw.lock().disjoin()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CodecError::not_initialized("encode session is closed"));
        }
        Ok(())
    }

    fn in_flight(&self) -> u64 {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        write.saturating_sub(read)
    }

    /// Whether `dequeue_input_buffer` would currently hand out a buffer
    #[must_use]
    pub fn can_accept(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && !self.input_locked.load(Ordering::Acquire)
            && self.in_flight() < self.depth as u64
            && self
                .input
                .get(self.ring_slot(self.write.load(Ordering::Acquire)))
                .is_some_and(|s| s.lock_count() == 0)
    }

    fn ring_slot(&self, counter: u64) -> SurfaceId {
        SurfaceId((counter % self.depth as u64) as usize)
    }

    // =========================================================================
    // Producer side
    // =========================================================================

    /// Hand out the next free input surface
    ///
    /// `None` when the ring is full, an input is already outstanding, or
    /// the device still holds the surface.
    pub fn dequeue_input_buffer(&self, frames: &dyn FrameAllocator) -> Result<Option<InputBuffer>> {
        self.reserve_input(frames, true)
    }

    /// Reserve the next input slot without mapping it
    ///
    /// Used for layers that share another layer's already-filled frame.
    pub(crate) fn dequeue_input_unmapped(&self, frames: &dyn FrameAllocator) -> Result<Option<InputBuffer>> {
        self.reserve_input(frames, false)
    }

    fn reserve_input(&self, frames: &dyn FrameAllocator, map: bool) -> Result<Option<InputBuffer>> {
        self.ensure_open()?;

        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        if write - read >= self.depth as u64 {
            self.input_backpressure.fetch_add(1, Ordering::Relaxed);
            trace!("Encode ring full ({} in flight)", write - read);
            return Ok(None);
        }

        if self
            .input_locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("Input buffer {} already dequeued", write);
            return Ok(None);
        }

        match self.expose(frames, write, map) {
            Ok(Some(buffer)) => Ok(Some(buffer)),
            other => {
                self.input_locked.store(false, Ordering::Release);
                other
            }
        }
    }

    fn expose(&self, frames: &dyn FrameAllocator, write: u64, map: bool) -> Result<Option<InputBuffer>> {
        let id = self.ring_slot(write);
        let surface = self.input.surface(id)?;
        if surface.lock_count() > 0 {
            trace!("Input surface {:?} still held by the device", id);
            return Ok(None);
        }

        let mapping = match surface.mapping() {
            Some(mapping) => Some(mapping.clone()),
            None if map => Some(frames.lock(surface.mem_id())?),
            None => None,
        };

        Ok(Some(InputBuffer {
            surface: id,
            mem_id: surface.mem_id(),
            handle: frames.get_handle(surface.mem_id())?,
            mapping,
            index: write,
        }))
    }

    /// Return a filled input to the ring
    ///
    /// `false` if `buffer` is not the outstanding input.
    pub fn queue_input_buffer(&self, frames: &dyn FrameAllocator, buffer: InputBuffer) -> Result<bool> {
        self.ensure_open()?;

        if !self.input_locked.load(Ordering::Acquire) {
            warn!("Input buffer {} queued without being dequeued", buffer.index);
            return Ok(false);
        }

        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        if write - read >= self.depth as u64 || buffer.index != write {
            warn!("Stale input buffer {} (next is {})", buffer.index, write);
            return Ok(false);
        }

        self.unmap(frames, &buffer)?;
        self.write.store(write + 1, Ordering::Release);
        self.input_locked.store(false, Ordering::Release);
        trace!("Queued input {}", write);
        Ok(true)
    }

    /// Give back a dequeued input without encoding it
    pub fn abandon_input_buffer(&self, frames: &dyn FrameAllocator, buffer: InputBuffer) -> Result<()> {
        let unmapped = self.unmap(frames, &buffer);
        if buffer.index == self.write.load(Ordering::Acquire) {
            self.input_locked.store(false, Ordering::Release);
        }
        unmapped
    }

    fn unmap(&self, frames: &dyn FrameAllocator, buffer: &InputBuffer) -> Result<()> {
        let surface = self.input.surface(buffer.surface)?;
        if surface.mapping().is_none() && buffer.mapping.is_some() {
            frames.unlock(buffer.mem_id)?;
        }
        Ok(())
    }

    // =========================================================================
    // Consumer side
    // =========================================================================

    /// Submit the oldest queued input to the device
    ///
    /// `true` once a submission is pending; `false` when there is nothing
    /// to submit or the session is backpressured.
    pub fn run(&self, frames: &dyn FrameAllocator) -> Result<bool> {
        self.ensure_open()?;
        let mut consumer = self.consumer.lock();
        self.run_locked(frames, &mut consumer)
    }

    fn run_locked(&self, frames: &dyn FrameAllocator, consumer: &mut ConsumerState) -> Result<bool> {
        if consumer.pending.is_some() {
            return Ok(true);
        }

        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        if read > write {
            return Err(CodecError::IoState { read, write });
        }
        if read == write {
            return Ok(false);
        }

        let Some(slot) = self.arena.alloc(self.config.output_size_max) else {
            consumer.stats.output_backpressure += 1;
            trace!("Output arena full, deferring frame {}", read);
            return Ok(false);
        };

        let qp = if self.params.per_frame_qp {
            consumer.controller.qp()
        } else {
            self.config.const_qp[0]
        };
        let ctrl = EncodeCtrl { qp, frame_index: read };
        let target = OutputTarget {
            arena: Arc::clone(&self.arena),
            slot,
        };

        let submitted = {
            let mut hw = self.hw.lock();
            self.submit(&mut **hw, frames, self.ring_slot(read), &ctrl, &target)
        };

        match submitted {
            Ok(Submitted::Pending(token)) => {
                consumer.pending = Some(PendingFrame {
                    slot,
                    token,
                    index: read,
                    qp,
                });
                Ok(true)
            }
            Ok(Submitted::Absorbed) => {
                self.arena.dealloc(slot);
                self.read.store(read + 1, Ordering::Release);
                consumer.stats.frames_absorbed += 1;
                trace!("Frame {} absorbed by the device", read);
                Ok(false)
            }
            Ok(Submitted::Blocked) => {
                self.arena.dealloc(slot);
                Ok(false)
            }
            Err(e) => {
                self.arena.dealloc(slot);
                Err(e)
            }
        }
    }

    fn submit(
        &self,
        hw: &mut dyn HardwareSession,
        frames: &dyn FrameAllocator,
        id: SurfaceId,
        ctrl: &EncodeCtrl,
        target: &OutputTarget,
    ) -> Result<Submitted> {
        let input = self.input.surface(id)?;

        let (surface, chained) = match &self.chain {
            Some(chain) => match chain.run_stage1(hw, frames, input, None)? {
                ChainRun::Complete { output, sync } => {
                    sync_blocking(hw, sync)?;
                    let surface = chain
                        .surface(output)
                        .ok_or_else(|| CodecError::not_found(format!("chain surface {output}")))?;
                    (surface, Some((chain, output)))
                }
                ChainRun::MoreSurface(_) => return Ok(Submitted::Blocked),
            },
            None => (input, None),
        };

        let status = self
            .retry
            .run("encode_frame_async", || hw.encode_frame_async(ctrl, surface, frames, target));

        // The device keeps its own lock on the surface until the encode syncs.
        if let Some((chain, output)) = chained {
            chain.release_surface(output)?;
        }

        Ok(match status? {
            HwStatus::Done(token) => Submitted::Pending(token),
            HwStatus::MoreData => Submitted::Absorbed,
            other => {
                debug!("Encoder deferred frame {}: {:?}", ctrl.frame_index, other);
                Submitted::Blocked
            }
        })
    }

    /// Wait for the next encoded frame
    ///
    /// Submits the oldest queued input first if nothing is pending. `None`
    /// when no input is queued, the session is backpressured, or `timeout`
    /// elapses; a timed-out frame stays pending for the next call.
    pub fn dequeue_output_buffer(
        &self,
        frames: &dyn FrameAllocator,
        timeout: Option<Duration>,
    ) -> Result<Option<EncodedFrame>> {
        self.ensure_open()?;
        self.next_output(frames, timeout)
    }

    fn next_output(&self, frames: &dyn FrameAllocator, timeout: Option<Duration>) -> Result<Option<EncodedFrame>> {
        let mut consumer = self.consumer.lock();
        if !self.run_locked(frames, &mut consumer)? {
            return Ok(None);
        }
        let Some(PendingFrame { slot, token, index, qp }) = consumer.pending.take() else {
            return Ok(None);
        };

        let status = self.hw.lock().sync_operation(token, timeout);
        match status {
            Ok(SyncStatus::Pending(token)) => {
                consumer.pending = Some(PendingFrame { slot, token, index, qp });
                consumer.stats.sync_timeouts += 1;
                Ok(None)
            }
            Ok(SyncStatus::Complete { bytes }) => {
                self.read.fetch_add(1, Ordering::AcqRel);
                let len = bytes.min(slot.len);

                if self.config.rc_mode == RateControlMode::Auto && self.params.per_frame_qp {
                    let max = QualityController::target_max(consumer.flow.throughput_kbps, consumer.flow.fps);
                    let next = consumer.controller.adjust(len, max);
                    trace!("Frame {}: {} bytes against {} budget, next QP {}", index, len, max, next);
                }

                consumer.stats.frames_encoded += 1;
                consumer.stats.bytes_out += len as u64;
                Ok(Some(EncodedFrame { slot, len, index, qp }))
            }
            Err(e) => {
                warn!("Encode of frame {} failed: {}", index, e);
                self.read.fetch_add(1, Ordering::AcqRel);
                self.arena.dealloc(slot);
                Err(e)
            }
        }
    }

    /// Run `f` over the bytes of an encoded frame
    pub fn with_output<R>(&self, frame: &EncodedFrame, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let slot = ArenaSlot {
            offset: frame.slot.offset,
            len: frame.len,
        };
        Ok(self.arena.with_bytes(slot, f)?)
    }

    /// Copy of the bytes of an encoded frame
    pub fn output_bytes(&self, frame: &EncodedFrame) -> Result<Vec<u8>> {
        Ok(self.arena.read(frame.slot, frame.len)?)
    }

    /// Return an encoded frame's arena space
    pub fn release_output_buffer(&self, frame: EncodedFrame) -> bool {
        let released = self.arena.dealloc(frame.slot);
        if !released {
            warn!("Encoded frame {} was not live in the arena", frame.index);
        }
        released
    }

    // =========================================================================
    // Side channels
    // =========================================================================

    /// Queue an opaque payload for the consumer
    pub fn queue_user_data(&self, data: &[u8]) {
        self.user_data.lock().push_back(data.to_vec());
    }

    /// Oldest queued payload
    pub fn dequeue_user_data(&self) -> Option<Vec<u8>> {
        self.user_data.lock().pop_front()
    }

    /// Current rate hints
    #[must_use]
    pub fn flow_control(&self) -> FlowControl {
        self.consumer.lock().flow
    }

    /// Replace the rate hints used by per-frame QP control
    pub fn set_flow_control(&self, fps: f32, throughput_kbps: u32) -> Result<()> {
        if fps.is_nan() || fps <= 0.0 {
            return Err(CodecError::invalid_config(format!("flow control fps must be > 0, got {fps}")));
        }
        self.consumer.lock().flow = FlowControl { fps, throughput_kbps };
        debug!("Flow control: {} fps, {} kbps", fps, throughput_kbps);
        Ok(())
    }

    /// Frames encoded by the device and the QP of the next frame
    pub fn encode_status(&self) -> Result<EncodeStatus> {
        let consumer = self.consumer.lock();
        let stat = self.hw.lock().encode_stat()?;
        let qp = if self.params.per_frame_qp {
            consumer.controller.qp()
        } else {
            self.config.const_qp[0]
        };
        Ok(EncodeStatus {
            num_frames: stat.num_frames,
            qp,
        })
    }

    /// Get statistics
    #[must_use]
    pub fn stats(&self) -> EncodeStats {
        let mut stats = self.consumer.lock().stats.clone();
        stats.frames_queued = self.write.load(Ordering::Acquire);
        stats.input_backpressure = self.input_backpressure.load(Ordering::Relaxed);
        stats
    }

    /// Drain queued inputs and free session-owned frames
    ///
    /// Encoded frames still held by the caller stay readable until the
    /// session is dropped. Calling this twice is a no-op.
    pub fn deallocate(&self, frames: &dyn FrameAllocator) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut drained = 0;
        while self.in_flight() > 0 {
            match self.next_output(frames, None)? {
                Some(frame) => {
                    self.arena.dealloc(frame.slot);
                    drained += 1;
                }
                None => {
                    warn!("Encoder stalled with {} queued inputs", self.in_flight());
                    break;
                }
            }
        }

        if self.owns_input {
            self.input.free_frames(frames)?;
        }
        if let Some(chain) = &self.chain {
            chain.free(frames)?;
        }

        debug!("Encode session closed, {} frames drained", drained);
        Ok(())
    }
}

impl Drop for EncoderCore {
    fn drop(&mut self) {
        debug!(
            "Dropping encode session ({} queued, {} read)",
            self.write.load(Ordering::Relaxed),
            self.read.load(Ordering::Relaxed)
        );
    }
}

// =============================================================================
// Session
// =============================================================================

/// Encode session owning its frame allocator
///
/// All methods take `&self`; one producer thread and one consumer thread
/// may share the session through an `Arc`.
pub struct EncodeSession {
    frames: Box<dyn FrameAllocator>,
    core: EncoderCore,
}

impl EncodeSession {
    /// Validate `config`, initialize `hw` and allocate the input ring
    pub fn allocate(
        config: CodecConfig,
        hw: Box<dyn HardwareSession>,
        frames: Box<dyn FrameAllocator>,
    ) -> Result<Self> {
        let core = EncoderCore::allocate(config, hw, frames.as_ref())?;
        Ok(Self { frames, core })
    }

    /// Encode from caller-allocated input frames
    ///
    /// `response` must come from `frames`; it is not freed by the session.
    pub fn allocate_external(
        config: CodecConfig,
        hw: Box<dyn HardwareSession>,
        frames: Box<dyn FrameAllocator>,
        response: AllocResponse,
    ) -> Result<Self> {
        let core = EncoderCore::allocate_shared(config, hw, frames.as_ref(), response)?;
        Ok(Self { frames, core })
    }

    /// Override the busy-retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.core.retry = retry;
        self
    }

    /// Underlying engine
    #[must_use]
    pub fn core(&self) -> &EncoderCore {
        &self.core
    }

    /// Frame allocator
    #[must_use]
    pub fn frames(&self) -> &dyn FrameAllocator {
        self.frames.as_ref()
    }

    /// Session configuration
    #[must_use]
    pub fn config(&self) -> &CodecConfig {
        self.core.config()
    }

    /// See [`EncoderCore::can_accept`]
    #[must_use]
    pub fn can_accept(&self) -> bool {
        self.core.can_accept()
    }

    /// See [`EncoderCore::dequeue_input_buffer`]
    pub fn dequeue_input_buffer(&self) -> Result<Option<InputBuffer>> {
        self.core.dequeue_input_buffer(self.frames.as_ref())
    }

    /// See [`EncoderCore::queue_input_buffer`]
    pub fn queue_input_buffer(&self, buffer: InputBuffer) -> Result<bool> {
        self.core.queue_input_buffer(self.frames.as_ref(), buffer)
    }

    /// See [`EncoderCore::run`]
    pub fn run(&self) -> Result<bool> {
        self.core.run(self.frames.as_ref())
    }

    /// See [`EncoderCore::dequeue_output_buffer`]
    pub fn dequeue_output_buffer(&self, timeout: Option<Duration>) -> Result<Option<EncodedFrame>> {
        self.core.dequeue_output_buffer(self.frames.as_ref(), timeout)
    }

    /// See [`EncoderCore::with_output`]
    pub fn with_output<R>(&self, frame: &EncodedFrame, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.core.with_output(frame, f)
    }

    /// See [`EncoderCore::output_bytes`]
    pub fn output_bytes(&self, frame: &EncodedFrame) -> Result<Vec<u8>> {
        self.core.output_bytes(frame)
    }

    /// See [`EncoderCore::release_output_buffer`]
    pub fn release_output_buffer(&self, frame: EncodedFrame) -> bool {
        self.core.release_output_buffer(frame)
    }

    /// See [`EncoderCore::queue_user_data`]
    pub fn queue_user_data(&self, data: &[u8]) {
        self.core.queue_user_data(data);
    }

    /// See [`EncoderCore::dequeue_user_data`]
    pub fn dequeue_user_data(&self) -> Option<Vec<u8>> {
        self.core.dequeue_user_data()
    }

    /// See [`EncoderCore::flow_control`]
    #[must_use]
    pub fn flow_control(&self) -> FlowControl {
        self.core.flow_control()
    }

    /// See [`EncoderCore::set_flow_control`]
    pub fn set_flow_control(&self, fps: f32, throughput_kbps: u32) -> Result<()> {
        self.core.set_flow_control(fps, throughput_kbps)
    }

    /// See [`EncoderCore::encode_status`]
    pub fn encode_status(&self) -> Result<EncodeStatus> {
        self.core.encode_status()
    }

    /// Get statistics
    #[must_use]
    pub fn stats(&self) -> EncodeStats {
        self.core.stats()
    }

    /// See [`EncoderCore::deallocate`]
    pub fn deallocate(&self) -> Result<()> {
        self.core.deallocate(self.frames.as_ref())
    }
}

impl Drop for EncodeSession {
    fn drop(&mut self) {
        if let Err(e) = self.core.deallocate(self.frames.as_ref()) {
            warn!("Encode session teardown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::config::ColorFormat;
    use crate::hardware::ApiVersion;
    use crate::sim::{parse_unit, SimulatedSession, Unit};
    use lamco_surface::{GpuAllocator, HostTextureDevice, SystemAllocator};

    fn config(depth: usize) -> CodecConfig {
        CodecConfig::builder()
            .resolution(64, 64)
            .async_depth(depth)
            .output_size_max(4096)
            .build()
    }

    fn session(config: CodecConfig) -> EncodeSession {
        EncodeSession::allocate(config, Box::new(SimulatedSession::new()), Box::new(SystemAllocator::new()))
            .expect("session")
    }

    fn push(session: &EncodeSession, fill: u8) -> bool {
        match session.dequeue_input_buffer().expect("dequeue") {
            Some(input) => {
                input.write_luma(&[fill; 256]);
                session.queue_input_buffer(input).expect("queue")
            }
            None => false,
        }
    }

    #[test]
    fn test_encoded_output_carries_input() {
        let session = session(config(2));
        assert!(push(&session, 0x5A));

        let frame = session.dequeue_output_buffer(None).expect("output").expect("frame");
        assert_eq!(frame.frame_index(), 0);
        assert!(!frame.is_empty());

        let bytes = session.output_bytes(&frame).expect("bytes");
        let (unit, len) = parse_unit(&bytes).expect("parse").expect("unit");
        assert!(matches!(unit, Unit::Header(_)));
        match parse_unit(&bytes[len..]).expect("parse") {
            Some((Unit::Frame(payload), _)) => assert!(payload[..64].iter().all(|&b| b == 0x5A)),
            other => panic!("expected frame unit, got {other:?}"),
        }

        assert!(session.release_output_buffer(frame));
        assert_eq!(session.stats().frames_encoded, 1);
    }

    #[test]
    fn test_ring_backpressure() {
        let session = session(config(2));
        assert!(push(&session, 1));
        assert!(push(&session, 2));
        assert!(!session.can_accept());
        assert!(session.dequeue_input_buffer().expect("dequeue").is_none());
        assert_eq!(session.stats().input_backpressure, 1);

        let frame = session.dequeue_output_buffer(None).expect("output").expect("frame");
        session.release_output_buffer(frame);
        assert!(session.can_accept());
        assert!(push(&session, 3));
    }

    #[test]
    fn test_single_outstanding_input() {
        let session = session(config(4));
        let first = session.dequeue_input_buffer().expect("dequeue").expect("input");
        assert!(session.dequeue_input_buffer().expect("dequeue").is_none());
        assert!(session.queue_input_buffer(first).expect("queue"));

        let second = session.dequeue_input_buffer().expect("dequeue").expect("input");
        assert_eq!(second.frame_index(), 1);
        assert_eq!(second.surface, SurfaceId(1));
        assert!(session.queue_input_buffer(second).expect("queue"));
    }

    #[test]
    fn test_run_without_input() {
        let session = session(config(2));
        assert!(!session.run().expect("run"));
        assert!(session.dequeue_output_buffer(None).expect("output").is_none());
    }

    #[test]
    fn test_auto_qp_climbs_over_budget() {
        // 1 kbps at 30 fps leaves a 5 byte budget
        let session = session(CodecConfig {
            bitrate_kbps: 1,
            ..config(2)
        });
        for i in 0..3 {
            assert!(push(&session, i));
            let frame = session.dequeue_output_buffer(None).expect("output").expect("frame");
            assert_eq!(frame.qp(), 24 + i);
            session.release_output_buffer(frame);
        }

        let status = session.encode_status().expect("status");
        assert_eq!(status.num_frames, 3);
        assert_eq!(status.qp, 27);
    }

    #[test]
    fn test_auto_qp_drops_under_budget() {
        let session = session(config(2));
        session.set_flow_control(30.0, 100_000).expect("flow");
        assert!(push(&session, 7));
        let frame = session.dequeue_output_buffer(None).expect("output").expect("frame");
        session.release_output_buffer(frame);
        assert_eq!(session.encode_status().expect("status").qp, 23);
    }

    #[test]
    fn test_constant_qp_is_fixed() {
        let session = session(CodecConfig {
            rc_mode: RateControlMode::Cqp,
            bitrate_kbps: 1,
            ..config(2)
        });
        for i in 0..3 {
            assert!(push(&session, i));
            let frame = session.dequeue_output_buffer(None).expect("output").expect("frame");
            assert_eq!(frame.qp(), 24);
            session.release_output_buffer(frame);
        }
        assert_eq!(session.encode_status().expect("status").qp, 24);
    }

    #[test]
    fn test_busy_device_is_retried() {
        let hw = SimulatedSession::new();
        let control = hw.control();
        let session = EncodeSession::allocate(config(2), Box::new(hw), Box::new(SystemAllocator::new()))
            .expect("session")
            .with_retry(RetryPolicy::yielding());

        control.inject_busy(3);
        assert!(push(&session, 9));
        let frame = session.dequeue_output_buffer(None).expect("output").expect("frame");
        assert_eq!(control.pending_busy(), 0);
        assert_eq!(control.submissions(), 1);
        session.release_output_buffer(frame);
    }

    #[test]
    fn test_sync_timeout_keeps_frame_pending() {
        let hw = SimulatedSession::new().with_sync_latency(Duration::from_millis(50));
        let session = EncodeSession::allocate(config(2), Box::new(hw), Box::new(SystemAllocator::new()))
            .expect("session");

        assert!(push(&session, 4));
        assert!(session
            .dequeue_output_buffer(Some(Duration::from_millis(1)))
            .expect("output")
            .is_none());
        assert_eq!(session.stats().sync_timeouts, 1);

        let frame = session.dequeue_output_buffer(None).expect("output").expect("frame");
        assert_eq!(frame.frame_index(), 0);
        session.release_output_buffer(frame);
    }

    #[test]
    fn test_output_arena_backpressure() {
        let session = session(config(2));
        let mut held = Vec::new();
        for i in 0..3 {
            assert!(push(&session, i));
            held.push(session.dequeue_output_buffer(None).expect("output").expect("frame"));
        }

        assert!(push(&session, 3));
        assert!(session.dequeue_output_buffer(None).expect("output").is_none());
        assert_eq!(session.stats().output_backpressure, 1);

        session.release_output_buffer(held.remove(0));
        let frame = session.dequeue_output_buffer(None).expect("output").expect("frame");
        assert_eq!(frame.frame_index(), 3);
    }

    #[test]
    fn test_user_data_fifo() {
        let session = session(config(2));
        session.queue_user_data(b"first");
        session.queue_user_data(b"second");
        assert_eq!(session.dequeue_user_data().as_deref(), Some(&b"first"[..]));
        assert_eq!(session.dequeue_user_data().as_deref(), Some(&b"second"[..]));
        assert!(session.dequeue_user_data().is_none());
    }

    #[test]
    fn test_flow_control() {
        let session = session(config(2));
        assert_eq!(session.flow_control().throughput_kbps, 8000);
        session.set_flow_control(60.0, 3000).expect("flow");
        assert_eq!(
            session.flow_control(),
            FlowControl {
                fps: 60.0,
                throughput_kbps: 3000
            }
        );
        assert!(session.set_flow_control(0.0, 3000).is_err());
    }

    #[test]
    fn test_argb_input_is_converted() {
        let session = session(CodecConfig {
            input_format: ColorFormat::Argb,
            ..config(2)
        });
        assert!(session.core().has_chain());
        assert!(push(&session, 0x33));
        let frame = session.dequeue_output_buffer(None).expect("output").expect("frame");
        assert!(frame.len() > 0);
        session.release_output_buffer(frame);
    }

    #[test]
    fn test_gpu_input_is_flushed_on_queue() {
        let device = Arc::new(HostTextureDevice::new());
        let frames = GpuAllocator::new(device.clone(), false);
        let session = EncodeSession::allocate(
            CodecConfig {
                memory_type: crate::config::MemoryType::InternalGpu,
                ..config(2)
            },
            Box::new(SimulatedSession::new()),
            Box::new(frames),
        )
        .expect("session");

        let input = session.dequeue_input_buffer().expect("dequeue").expect("input");
        let NativeHandle::Texture(texture) = input.handle else {
            panic!("expected texture handle, got {:?}", input.handle);
        };
        input.write_luma(&[0xC3; 32]);
        assert!(session.queue_input_buffer(input).expect("queue"));
        assert_eq!(device.snapshot(texture).expect("snapshot")[..32], [0xC3; 32]);

        let frame = session.dequeue_output_buffer(None).expect("output").expect("frame");
        session.release_output_buffer(frame);
    }

    #[test]
    fn test_rejects_old_runtime() {
        let hw = SimulatedSession::new().with_version(ApiVersion::new(1, 17));
        let err = EncodeSession::allocate(config(2), Box::new(hw), Box::new(SystemAllocator::new()))
            .err()
            .expect("old runtime");
        assert!(matches!(err, CodecError::UnsupportedVersion { major: 1, minor: 17 }));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let err = EncodeSession::allocate(
            CodecConfig { width: 0, ..config(2) },
            Box::new(SimulatedSession::new()),
            Box::new(SystemAllocator::new()),
        )
        .err()
        .expect("invalid");
        assert!(matches!(err, CodecError::InvalidConfig(_)));
    }

    #[test]
    fn test_deallocate_drains_and_closes() {
        let session = session(config(2));
        assert!(push(&session, 1));
        assert!(push(&session, 2));
        session.deallocate().expect("deallocate");

        assert_eq!(session.stats().frames_encoded, 2);
        assert!(matches!(
            session.dequeue_input_buffer(),
            Err(CodecError::NotInitialized(_))
        ));
        session.deallocate().expect("second deallocate");
    }

    #[test]
    fn test_producer_consumer_threads() {
        let session = Arc::new(session(config(3)));
        let producer = {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                let mut sent = 0u8;
                while sent < 10 {
                    if push(&session, sent) {
                        sent += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut indices = Vec::new();
        while indices.len() < 10 {
            match session.dequeue_output_buffer(Some(Duration::from_millis(10))).expect("output") {
                Some(frame) => {
                    indices.push(frame.frame_index());
                    session.release_output_buffer(frame);
                }
                None => thread::yield_now(),
            }
        }
        producer.join().expect("producer");

        assert_eq!(indices, (0..10).collect::<Vec<_>>());
    }
}
