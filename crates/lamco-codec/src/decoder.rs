//! Decode Session
//!
//! Bitstream in, decoded surfaces out. Input bytes are decoded straight
//! from the caller's buffer; only a trailing partial unit is copied into
//! the carry-over cache and joined with the next call's bytes.
//!
//! Decoded surfaces stay checked out until the caller releases their
//! handle. Holding handles starves the work pool.
//!
//! # Examples
//!
//! ```rust
//! use lamco_codec::config::{CodecConfig, CodecKind};
//! use lamco_codec::decoder::DecodeSession;
//! use lamco_codec::sim::{pack_frame, sequence_header, SimulatedSession};
//! use lamco_surface::SystemAllocator;
//!
//! # fn main() -> lamco_codec::Result<()> {
//! let mut stream = sequence_header(CodecKind::Avc, 64, 64);
//! stream.extend(pack_frame(&[7; 100]));
//!
//! let session = DecodeSession::allocate(
//!     CodecConfig::decode(CodecKind::Avc, 0, 0),
//!     Box::new(SimulatedSession::new()),
//!     Box::new(SystemAllocator::new()),
//!     &stream,
//! )?;
//! assert_eq!(session.config().width, 64);
//!
//! assert!(session.queue_input_buffer(Some(&stream))?);
//! let frame = session.dequeue_output_buffer()?.expect("decoded frame");
//! session.release_output_buffer(frame.handle)?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use enumflags2::BitFlags;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use lamco_surface::{
    AllocRequest, FrameAllocator, FrameData, FrameInfo, FrameSurface, MemType, NativeHandle, PixelFormat, SafeQueue,
    SurfaceError, SurfaceId, SurfacePool, SurfaceRef, SyncToken,
};

use crate::chain::{ChainDescriptor, ChainRun, PostProcessChain};
use crate::config::{CodecConfig, CodecKind, ColorFormat};
use crate::error::{CodecError, Result};
use crate::hardware::{check_version, sync_blocking, Bitstream, DecodeOutput, HardwareSession, HwStatus, IoQuery};
use crate::params::DecodeParams;
use crate::retry::RetryPolicy;

/// A decoded surface handed to the caller
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Handle to pass back to `release_output_buffer`
    pub handle: NativeHandle,

    /// Surface geometry
    pub info: FrameInfo,

    /// CPU mapping, for host-memory surfaces
    pub mapping: Option<FrameData>,
}

/// Decode session statistics
#[derive(Debug, Clone, Default)]
pub struct DecodeStats {
    /// Bytes accepted from the caller
    pub bytes_in: u64,

    /// Frames produced by the device
    pub frames_decoded: u64,

    /// Frames handed to the caller
    pub frames_output: u64,

    /// Frames dropped because post-processing had no free surface
    pub frames_dropped: u64,

    /// Input calls refused for lack of a work or chain surface
    pub no_surface: u64,

    /// Largest carry-over cache fill (bytes)
    pub cache_peak: usize,

    /// Trailing bytes discarded at end of stream
    pub discarded_bytes: u64,
}

#[derive(Debug)]
struct DecodedSurface {
    work: SurfaceId,
    view: Option<SurfaceRef>,
    token: Option<SyncToken>,
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    work: SurfaceId,
    view: Option<SurfaceRef>,
}

#[derive(Debug)]
struct Reassembly {
    cache: Vec<u8>,
    capacity: usize,
    // Position in the caller's buffer to resume from after returning false.
    old_offset: usize,
}

enum LoopEnd {
    NeedData,
    NoSurface,
}

/// Hardware decode session
pub struct DecodeSession {
    frames: Box<dyn FrameAllocator>,
    config: CodecConfig,
    hw: Mutex<Box<dyn HardwareSession>>,
    work: SurfacePool,
    chain: Option<PostProcessChain>,
    reassembly: Mutex<Reassembly>,
    outputs: SafeQueue<DecodedSurface>,
    released: Mutex<HashMap<NativeHandle, Outstanding>>,
    stats: Mutex<DecodeStats>,
    retry: RetryPolicy,
    closed: AtomicBool,
}

impl DecodeSession {
    /// Parse `header`, size the work pool and initialize the decoder
    ///
    /// The stream dimensions replace `config.width` and `config.height`.
    /// `header` is only inspected; feed it again through
    /// `queue_input_buffer`.
    pub fn allocate(
        config: CodecConfig,
        mut hw: Box<dyn HardwareSession>,
        frames: Box<dyn FrameAllocator>,
        header: &[u8],
    ) -> Result<Self> {
        info!("Creating decode session with config: {:?}", config);
        check_version(hw.as_ref())?;

        let mut config = config;
        let stream = hw.decode_header(&mut Bitstream::new(header), config.codec)?;
        config.width = stream.width;
        config.height = stream.height;
        config
            .validate()
            .map_err(|issues| CodecError::invalid_config(issues.join(", ")))?;

        let format = if config.codec == CodecKind::Jpeg && config.output_format == ColorFormat::Argb {
            PixelFormat::Rgb4
        } else {
            stream.format
        };
        let request = hw.query_io_surface(
            IoQuery::Decode,
            FrameInfo::new(format, stream.width, stream.height),
            config.async_depth,
        )?;
        if request.suggested < config.async_depth {
            return Err(SurfaceError::NotEnoughBuffer {
                requested: config.async_depth,
                available: request.suggested,
            }
            .into());
        }

        // Chain pools come first so the decoder's re-query sees the work pool.
        let output = FrameInfo::new(
            if format == PixelFormat::Rgb4 {
                format
            } else {
                config.output_format.pixel_format()
            },
            config.vpp_out_width(),
            config.vpp_out_height(),
        )
        .aligned16();
        let desc = ChainDescriptor {
            input: request.info,
            output,
            rotation: config.vpp.rotation,
            mirror: config.vpp.mirror,
            depth: request.suggested + 2,
            memory: config.memory_type.mem_type().into(),
        };
        let chain = PostProcessChain::build(&mut *hw, frames.as_ref(), &desc)?;
        let chain = (!chain.is_empty()).then_some(chain);

        let mut memory: BitFlags<MemType> = config.memory_type.mem_type() | MemType::FromDecode | MemType::Internal;
        if config.memory_type.is_gpu() {
            memory |= MemType::DecoderTarget;
        }
        if chain.is_some() {
            memory |= MemType::FromVppIn;
        }
        let work = SurfacePool::allocate(
            frames.as_ref(),
            &AllocRequest::new(request.info, request.suggested, memory),
        )?;

        hw.init_decoder(
            &DecodeParams {
                codec: config.codec,
                info: request.info,
                async_depth: request.suggested,
                memory,
            },
            frames.as_ref(),
        )?;

        debug!(
            "Decoding {}x{} {:?} into {} work surfaces, {} chain stages",
            stream.width,
            stream.height,
            config.codec,
            work.len(),
            chain.as_ref().map_or(0, PostProcessChain::len)
        );

        Ok(Self {
            frames,
            reassembly: Mutex::new(Reassembly {
                cache: Vec::new(),
                capacity: config.decode_cache_bytes,
                old_offset: 0,
            }),
            config,
            hw: Mutex::new(hw),
            work,
            chain,
            outputs: SafeQueue::new(),
            released: Mutex::new(HashMap::new()),
            stats: Mutex::new(DecodeStats::default()),
            retry: RetryPolicy::yielding(),
            closed: AtomicBool::new(false),
        })
    }

    /// Override the busy-retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Configuration with the stream's dimensions
    #[must_use]
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Whether decoded surfaces pass through a post-process chain
    #[must_use]
    pub fn has_chain(&self) -> bool {
        self.chain.is_some()
    }

    /// Whether a free work surface exists
    #[must_use]
    pub fn input_available(&self) -> bool {
        self.work.has_free()
    }

    /// Get statistics
    #[must_use]
    pub fn stats(&self) -> DecodeStats {
        self.stats.lock().clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CodecError::not_initialized("decode session is closed"));
        }
        Ok(())
    }

    // =========================================================================
    // Input
    // =========================================================================

    /// Decode `data`, or flush at end of stream when `data` is `None` or empty
    ///
    /// `Ok(false)` asks the caller to submit the same buffer again, after
    /// releasing outputs if the work pool is exhausted.
    pub fn queue_input_buffer(&self, data: Option<&[u8]>) -> Result<bool> {
        self.ensure_open()?;
        match data {
            Some(data) if !data.is_empty() => self.decode_bytes(data),
            _ => self.flush(),
        }
    }

    fn decode_bytes(&self, data: &[u8]) -> Result<bool> {
        let mut reasm = self.reassembly.lock();

        let mut start = reasm.old_offset;
        if start > data.len() {
            warn!("Resubmitted buffer is shorter than the resume offset {}", start);
            start = 0;
        }
        if start == 0 {
            self.stats.lock().bytes_in += data.len() as u64;
        }
        let new = &data[start..];

        if reasm.cache.is_empty() {
            let mut bitstream = Bitstream::new(new);
            let end = self.decode_loop(&mut bitstream)?;
            let consumed = bitstream.offset;

            if let LoopEnd::NoSurface = end {
                reasm.old_offset = start + consumed;
                return Ok(false);
            }

            let rest = &new[consumed..];
            if rest.len() > reasm.capacity {
                reasm.old_offset = 0;
                return Err(CodecError::invalid_bitstream(format!(
                    "{} byte remainder exceeds the {} byte decode cache",
                    rest.len(),
                    reasm.capacity
                )));
            }
            reasm.cache.extend_from_slice(rest);
            reasm.old_offset = 0;
            self.note_cache(reasm.cache.len());
            return Ok(true);
        }

        let room = reasm.capacity.saturating_sub(reasm.cache.len());
        let take = new.len().min(room);
        reasm.cache.extend_from_slice(&new[..take]);
        self.note_cache(reasm.cache.len());

        let mut bitstream = Bitstream::new(&reasm.cache);
        let end = self.decode_loop(&mut bitstream);
        let consumed = bitstream.offset;
        reasm.cache.drain(..consumed);
        let end = end?;

        match end {
            LoopEnd::NoSurface => {
                reasm.old_offset = start + take;
                Ok(false)
            }
            LoopEnd::NeedData if take < new.len() => {
                if consumed == 0 {
                    reasm.old_offset = 0;
                    return Err(CodecError::invalid_bitstream(format!(
                        "unit does not fit the {} byte decode cache",
                        reasm.capacity
                    )));
                }
                trace!("Decode cache full, resuming at byte {}", start + take);
                reasm.old_offset = start + take;
                Ok(false)
            }
            LoopEnd::NeedData => {
                reasm.old_offset = 0;
                Ok(true)
            }
        }
    }

    fn note_cache(&self, len: usize) {
        let mut stats = self.stats.lock();
        stats.cache_peak = stats.cache_peak.max(len);
    }

    fn decode_loop(&self, bitstream: &mut Bitstream<'_>) -> Result<LoopEnd> {
        loop {
            if bitstream.remaining_len() == 0 {
                return Ok(LoopEnd::NeedData);
            }

            match self.submit(Some(&mut *bitstream))? {
                Some(true) => {}
                Some(false) => return Ok(LoopEnd::NeedData),
                None => {
                    self.stats.lock().no_surface += 1;
                    return Ok(LoopEnd::NoSurface);
                }
            }
        }
    }

    // Some(true): a frame was emitted. Some(false): the device wants more
    // data. None: no work surface was accepted.
    fn submit(&self, mut bitstream: Option<&mut Bitstream<'_>>) -> Result<Option<bool>> {
        // A decoded frame needs a chain surface; hold the bytes until one frees up.
        if self.chain.as_ref().is_some_and(|chain| !chain.has_free_surfaces()) {
            trace!("Post-process chain has no free surface");
            return Ok(None);
        }

        for worker in self.work.free_surfaces(self.work.len()) {
            let status = {
                let mut hw = self.hw.lock();
                self.retry.run("decode_frame_async", || {
                    hw.decode_frame_async(bitstream.as_deref_mut(), &self.work, worker)
                })?
            };

            match status {
                HwStatus::Done(output) => {
                    self.emit(output)?;
                    return Ok(Some(true));
                }
                HwStatus::MoreData => return Ok(Some(false)),
                other => trace!("Work surface {:?} refused: {:?}", worker, other),
            }
        }
        Ok(None)
    }

    fn emit(&self, output: DecodeOutput) -> Result<()> {
        let DecodeOutput { surface, token } = output;
        self.stats.lock().frames_decoded += 1;

        let Some(chain) = &self.chain else {
            self.work.mark_in_use(surface, Some(token))?;
            self.outputs.push(DecodedSurface {
                work: surface,
                view: None,
                token: None,
            });
            trace!("Decoded into {:?}", surface);
            return Ok(());
        };

        self.work.mark_in_use(surface, None)?;
        let input = self.work.surface(surface)?;
        let mut hw = self.hw.lock();
        match chain.run_stage1(&mut **hw, self.frames.as_ref(), input, Some(token)) {
            Ok(ChainRun::Complete { output, sync }) => {
                self.outputs.push(DecodedSurface {
                    work: surface,
                    view: Some(output),
                    token: Some(sync),
                });
                trace!("Decoded into {:?}, post-processed into {}", surface, output);
                Ok(())
            }
            Ok(ChainRun::MoreSurface(token)) => {
                if let Some(token) = token {
                    sync_blocking(&mut **hw, token)?;
                }
                self.work.release(surface)?;
                self.stats.lock().frames_dropped += 1;
                warn!("Dropped decoded frame: post-process chain has no free surface");
                Err(CodecError::PoolExhausted(
                    "post-process chain has no free surface; release decoded frames".to_string(),
                ))
            }
            Err(e) => {
                if let Err(release) = self.work.release(surface) {
                    debug!("Work surface already released: {}", release);
                }
                Err(e)
            }
        }
    }

    fn flush(&self) -> Result<bool> {
        {
            let mut reasm = self.reassembly.lock();
            if !reasm.cache.is_empty() {
                let mut bitstream = Bitstream::new(&reasm.cache);
                let end = self.decode_loop(&mut bitstream);
                let consumed = bitstream.offset;
                reasm.cache.drain(..consumed);
                if let LoopEnd::NoSurface = end? {
                    return Ok(false);
                }
                if !reasm.cache.is_empty() {
                    warn!("Discarding {} trailing bytes at end of stream", reasm.cache.len());
                    self.stats.lock().discarded_bytes += reasm.cache.len() as u64;
                    reasm.cache.clear();
                }
            }
            reasm.old_offset = 0;
        }

        loop {
            match self.submit(None)? {
                Some(true) => {}
                Some(false) => {
                    debug!("Decoder drained");
                    return Ok(true);
                }
                None => return Ok(false),
            }
        }
    }

    // =========================================================================
    // Output
    // =========================================================================

    /// Next decoded frame, without blocking for one to appear
    pub fn dequeue_output_buffer(&self) -> Result<Option<DecodedFrame>> {
        self.ensure_open()?;
        let Some(item) = self.outputs.try_pop() else {
            return Ok(None);
        };
        let outstanding = Outstanding {
            work: item.work,
            view: item.view,
        };

        match self.resolve(item) {
            Ok(frame) => {
                self.released.lock().insert(frame.handle, outstanding);
                self.stats.lock().frames_output += 1;
                Ok(Some(frame))
            }
            Err(e) => {
                self.give_back(outstanding);
                Err(e)
            }
        }
    }

    fn resolve(&self, item: DecodedSurface) -> Result<DecodedFrame> {
        if let Some(token) = item.token.or_else(|| self.work.take_sync(item.work)) {
            sync_blocking(&mut **self.hw.lock(), token)?;
        }

        let surface = self.visible_surface(item.work, item.view)?;
        Ok(DecodedFrame {
            handle: self.frames.get_handle(surface.mem_id())?,
            info: *surface.info(),
            mapping: surface.mapping().cloned(),
        })
    }

    fn visible_surface(&self, work: SurfaceId, view: Option<SurfaceRef>) -> Result<&FrameSurface> {
        match (view, &self.chain) {
            (Some(r), Some(chain)) => chain
                .surface(r)
                .ok_or_else(|| CodecError::not_found(format!("chain surface {r}"))),
            _ => Ok(self.work.surface(work)?),
        }
    }

    /// Return a decoded frame's surfaces to their pools
    pub fn release_output_buffer(&self, handle: NativeHandle) -> Result<()> {
        let Some(outstanding) = self.released.lock().remove(&handle) else {
            warn!("Release of unknown decoded handle {:?}", handle);
            return Err(CodecError::not_found(format!("decoded handle {handle:?}")));
        };
        self.work.release(outstanding.work)?;
        if let (Some(view), Some(chain)) = (outstanding.view, &self.chain) {
            chain.release_surface(view)?;
        }
        trace!("Released decoded surface {:?}", outstanding.work);
        Ok(())
    }

    fn give_back(&self, outstanding: Outstanding) {
        if let Err(e) = self.work.release(outstanding.work) {
            debug!("Work surface already released: {}", e);
        }
        if let (Some(view), Some(chain)) = (outstanding.view, &self.chain) {
            if let Err(e) = chain.release_surface(view) {
                debug!("Chain surface already released: {}", e);
            }
        }
    }

    /// Release every pending and outstanding output and free the pools
    ///
    /// Calling this twice is a no-op.
    pub fn deallocate(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.outputs.shutdown();

        let mut drained = 0;
        while let Some(item) = self.outputs.wait_pop() {
            let token = item.token.or_else(|| self.work.take_sync(item.work));
            if let Some(token) = token {
                sync_blocking(&mut **self.hw.lock(), token)?;
            }
            self.give_back(Outstanding {
                work: item.work,
                view: item.view,
            });
            drained += 1;
        }

        let outstanding: Vec<Outstanding> = self.released.lock().drain().map(|(_, o)| o).collect();
        for o in &outstanding {
            self.give_back(*o);
        }

        self.work.free_frames(self.frames.as_ref())?;
        if let Some(chain) = &self.chain {
            chain.free(self.frames.as_ref())?;
        }

        debug!(
            "Decode session closed: {} queued and {} held outputs released",
            drained,
            outstanding.len()
        );
        Ok(())
    }
}

impl Drop for DecodeSession {
    fn drop(&mut self) {
        if let Err(e) = self.deallocate() {
            warn!("Decode session teardown failed: {}", e);
        }
        debug!("Dropping decode session");
    }
}
