//! Simulated Hardware
//!
//! [`SimulatedSession`] is a deterministic, in-memory [`HardwareSession`]
//! used by the test suites and the demo. It keeps the contract a real
//! runtime has with the session layer (asynchronous submission, per-token
//! surface locks, busy statuses, shared timelines) while producing a
//! trivially parseable bitstream.
//!
//! # Container format
//!
//! Every unit is `00 00 00 01 | kind:u8 | len:u32le | payload`:
//!
//! | Kind | Payload |
//! |------|---------|
//! | 1 | Sequence header: `width:u32le height:u32le codec_fourcc:u32le` |
//! | 2 | Frame: raw luma bytes |
//!
//! Encode writes a sequence header at the start of every GOP followed by a
//! frame unit whose payload shrinks as QP grows. Decode copies frame
//! payloads into the luma plane of the work surface.
//!
//! # Examples
//!
//! ```rust
//! use lamco_codec::config::CodecKind;
//! use lamco_codec::hardware::{Bitstream, HardwareSession};
//! use lamco_codec::sim::{self, SimulatedSession};
//!
//! # fn main() -> lamco_codec::Result<()> {
//! let mut stream = sim::sequence_header(CodecKind::Avc, 320, 240);
//! stream.extend(sim::pack_frame(b"luma"));
//!
//! let mut hw = SimulatedSession::new();
//! let mut bs = Bitstream::new(&stream);
//! let info = hw.decode_header(&mut bs, CodecKind::Avc)?;
//! assert_eq!((info.width, info.height), (320, 240));
//! assert_eq!(bs.remaining(), sim::pack_frame(b"luma").as_slice());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lamco_surface::{
    AllocRequest, AllocResponse, FrameAllocator, FrameData, FrameInfo, FrameSurface, MemType,
    PixelFormat, SurfaceId, SurfaceLock, SurfacePool, SyncToken,
};
use tracing::{debug, trace};

use crate::config::{CodecKind, Mirror, Rotation, MAX_QP};
use crate::error::{CodecError, Result};
use crate::hardware::{
    ApiVersion, Bitstream, DecodeOutput, EncodeCtrl, EncodeStat, HardwareSession, HwStatus,
    IoQuery, OutputTarget, StageId, StreamInfo, SurfaceRequest, SyncStatus, TimelineId,
};
use crate::params::{DecodeParams, EncodeParams, StageKind, VppParams};

/// Unit start code
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Sequence header unit kind
pub const UNIT_HEADER: u8 = 1;

/// Frame unit kind
pub const UNIT_FRAME: u8 = 2;

/// Bytes before a unit payload
pub const UNIT_PREFIX_LEN: usize = 9;

/// Runtime version reported by default
pub const DEFAULT_VERSION: ApiVersion = ApiVersion::new(1, 19);

/// Pack one unit
#[must_use]
pub fn pack_unit(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut unit = Vec::with_capacity(UNIT_PREFIX_LEN + payload.len());
    unit.extend_from_slice(&START_CODE);
    unit.push(kind);
    unit.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    unit.extend_from_slice(payload);
    unit
}

/// Sequence header unit for a `width` x `height` stream
#[must_use]
pub fn sequence_header(codec: CodecKind, width: u32, height: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&width.to_le_bytes());
    payload.extend_from_slice(&height.to_le_bytes());
    payload.extend_from_slice(&codec.fourcc().to_le_bytes());
    pack_unit(UNIT_HEADER, &payload)
}

/// Frame unit carrying `luma`
#[must_use]
pub fn pack_frame(luma: &[u8]) -> Vec<u8> {
    pack_unit(UNIT_FRAME, luma)
}

/// A parsed unit and its total length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit<'a> {
    /// Sequence header payload
    Header(&'a [u8]),
    /// Frame payload
    Frame(&'a [u8]),
}

/// Parse the unit at the start of `data`
///
/// Returns `Ok(None)` when the unit is not complete yet.
pub fn parse_unit(data: &[u8]) -> Result<Option<(Unit<'_>, usize)>> {
    if data.len() < UNIT_PREFIX_LEN {
        if START_CODE.starts_with(&data[..data.len().min(START_CODE.len())]) {
            return Ok(None);
        }
        return Err(CodecError::invalid_bitstream("missing start code"));
    }
    if data[..4] != START_CODE {
        return Err(CodecError::invalid_bitstream("missing start code"));
    }

    let kind = data[4];
    let len = u32::from_le_bytes([data[5], data[6], data[7], data[8]]) as usize;
    let total = UNIT_PREFIX_LEN + len;
    if data.len() < total {
        return Ok(None);
    }

    let payload = &data[UNIT_PREFIX_LEN..total];
    let unit = match kind {
        UNIT_HEADER => Unit::Header(payload),
        UNIT_FRAME => Unit::Frame(payload),
        other => {
            return Err(CodecError::invalid_bitstream(format!("unknown unit kind {other}")));
        }
    };
    Ok(Some((unit, total)))
}

/// Shared knobs and counters of a [`SimulatedSession`]
///
/// Stays valid after the session is moved into a codec session.
#[derive(Debug, Default)]
pub struct SimControl {
    busy: AtomicU32,
    submissions: AtomicU64,
    syncs: AtomicU64,
}

impl SimControl {
    /// Answer the next `n` submissions with `DeviceBusy`
    pub fn inject_busy(&self, n: u32) {
        self.busy.fetch_add(n, Ordering::AcqRel);
    }

    /// Busy answers not yet given
    #[must_use]
    pub fn pending_busy(&self) -> u32 {
        self.busy.load(Ordering::Acquire)
    }

    /// Submissions accepted so far
    #[must_use]
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Acquire)
    }

    /// Tokens completed so far
    #[must_use]
    pub fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::Acquire)
    }

    fn take_busy(&self) -> bool {
        self.busy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Debug)]
struct Operation {
    locks: Vec<SurfaceLock>,
    bytes: usize,
    ready_at: Instant,
}

#[derive(Debug)]
struct EncoderState {
    params: EncodeParams,
    frames: u64,
    bytes: u64,
}

/// Deterministic in-memory hardware runtime
#[derive(Debug)]
pub struct SimulatedSession {
    version: ApiVersion,
    own_timeline: TimelineId,
    parent: Option<TimelineId>,
    latency: Duration,
    suggested: Option<usize>,
    control: Arc<SimControl>,
    operations: HashMap<u64, Operation>,
    encoder: Option<EncoderState>,
    decoder: Option<AllocResponse>,
    stream: Option<StreamInfo>,
    stages: HashMap<StageId, VppParams>,
}

impl Default for SimulatedSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSession {
    /// Session reporting [`DEFAULT_VERSION`] with instant completion
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: DEFAULT_VERSION,
            own_timeline: TimelineId::next(),
            parent: None,
            latency: Duration::ZERO,
            suggested: None,
            control: Arc::new(SimControl::default()),
            operations: HashMap::new(),
            encoder: None,
            decoder: None,
            stream: None,
            stages: HashMap::new(),
        }
    }

    /// Report `version` instead of the default
    #[must_use]
    pub fn with_version(mut self, version: ApiVersion) -> Self {
        self.version = version;
        self
    }

    /// Complete operations `latency` after submission
    #[must_use]
    pub fn with_sync_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Suggest `count` surfaces from every query
    #[must_use]
    pub fn with_suggested_surfaces(mut self, count: usize) -> Self {
        self.suggested = Some(count);
        self
    }

    /// Shared knobs and counters
    #[must_use]
    pub fn control(&self) -> Arc<SimControl> {
        Arc::clone(&self.control)
    }

    /// Timeline joined through [`HardwareSession::join`]
    #[must_use]
    pub fn parent_timeline(&self) -> Option<TimelineId> {
        self.parent
    }

    /// Operations submitted and not yet synced
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.operations.len()
    }

    fn submit(&mut self, surfaces: &[&FrameSurface], bytes: usize) -> SyncToken {
        let locks = surfaces
            .iter()
            .map(|s| {
                s.hw_lock();
                s.lock_handle()
            })
            .collect();
        let token = SyncToken::mint();
        self.operations.insert(
            token.raw(),
            Operation {
                locks,
                bytes,
                ready_at: Instant::now() + self.latency,
            },
        );
        self.control.submissions.fetch_add(1, Ordering::AcqRel);
        token
    }

    fn frame_payload_len(info: &FrameInfo, qp: u8) -> usize {
        let base = (info.crop.w as usize * info.crop.h as usize / 16).max(64);
        (base * (usize::from(MAX_QP) + 1 - usize::from(qp.min(MAX_QP))) / 52).max(1)
    }

    fn mapping_of(surface: &FrameSurface, frames: &dyn FrameAllocator) -> Option<FrameData> {
        surface
            .mapping()
            .cloned()
            .or_else(|| frames.lock(surface.mem_id()).ok())
    }
}

/// Source coordinate for destination pixel `(dx, dy)`
fn source_coord(kind: StageKind, dx: usize, dy: usize, src: (usize, usize), dst: (usize, usize)) -> (usize, usize) {
    let (sw, sh) = src;
    let (dw, dh) = dst;
    let (sx, sy) = match kind {
        StageKind::ResizeCsc => (dx * sw / dw.max(1), dy * sh / dh.max(1)),
        StageKind::Rotate(Rotation::Deg90) => (dy, sh.saturating_sub(1 + dx)),
        StageKind::Rotate(Rotation::Deg180) => (sw.saturating_sub(1 + dx), sh.saturating_sub(1 + dy)),
        StageKind::Rotate(Rotation::Deg270) => (sw.saturating_sub(1 + dy), dx),
        StageKind::Mirror(Mirror::Horizontal) => (sw.saturating_sub(1 + dx), dy),
        StageKind::Mirror(Mirror::Vertical) => (dx, sh.saturating_sub(1 + dy)),
    };
    (sx.min(sw.saturating_sub(1)), sy.min(sh.saturating_sub(1)))
}

fn bytes_per_pixel(data: &FrameData) -> usize {
    (data.layout.pitch / data.info.width.max(1) as usize).max(1)
}

/// Nearest-sample transform of the first plane from `src` into `dst`
fn transform(kind: StageKind, src: &FrameData, src_info: &FrameInfo, dst: &FrameData, dst_info: &FrameInfo) {
    let src_dims = (src_info.crop.w as usize, src_info.crop.h as usize);
    let dst_dims = (dst_info.crop.w as usize, dst_info.crop.h as usize);
    let src_bpp = bytes_per_pixel(src);
    let dst_bpp = bytes_per_pixel(dst);
    let pixels = src.storage.with_bytes(<[u8]>::to_vec);

    dst.storage.with_bytes_mut(|out| {
        for dy in 0..dst_dims.1 {
            for dx in 0..dst_dims.0 {
                let (sx, sy) = source_coord(kind, dx, dy, src_dims, dst_dims);
                let si = src.layout.y + sy * src.layout.pitch + sx * src_bpp;
                let Some(&sample) = pixels.get(si) else {
                    continue;
                };
                let di = dst.layout.y + dy * dst.layout.pitch + dx * dst_bpp;
                if let Some(px) = out.get_mut(di..di + dst_bpp) {
                    px.fill(sample);
                }
            }
        }
    });
}

impl HardwareSession for SimulatedSession {
    fn version(&self) -> ApiVersion {
        self.version
    }

    fn timeline(&self) -> TimelineId {
        self.parent.unwrap_or(self.own_timeline)
    }

    fn join(&mut self, parent: TimelineId) -> Result<()> {
        if parent == self.own_timeline {
            return Err(CodecError::incompatible("session cannot join its own timeline"));
        }
        debug!("Joining timeline {:?}", parent);
        self.parent = Some(parent);
        Ok(())
    }

    fn disjoin(&mut self) -> Result<()> {
        match self.parent.take() {
            Some(parent) => {
                debug!("Leaving timeline {:?}", parent);
                Ok(())
            }
            None => Err(CodecError::not_initialized("session is not joined to a timeline")),
        }
    }

    fn query_io_surface(&mut self, query: IoQuery, info: FrameInfo, async_depth: usize) -> Result<SurfaceRequest> {
        let min = match query {
            IoQuery::Encode => 1,
            IoQuery::Decode => async_depth.max(1),
        };
        Ok(SurfaceRequest {
            info: info.aligned16(),
            min,
            suggested: self.suggested.unwrap_or(async_depth + 2),
        })
    }

    fn init_encoder(&mut self, params: &EncodeParams) -> Result<()> {
        if params.info.format != PixelFormat::Nv12 {
            return Err(CodecError::hardware("init_encoder", -3));
        }
        debug!("Simulated encoder: {:?} {}x{}", params.codec, params.info.crop.w, params.info.crop.h);
        self.encoder = Some(EncoderState {
            params: params.clone(),
            frames: 0,
            bytes: 0,
        });
        Ok(())
    }

    fn decode_header(&mut self, bitstream: &mut Bitstream<'_>, codec: CodecKind) -> Result<StreamInfo> {
        let (payload, len) = match parse_unit(bitstream.remaining()) {
            Ok(Some((Unit::Header(payload), len))) => (payload, len),
            Ok(Some((Unit::Frame(_), _))) => {
                return Err(CodecError::malformed_header("stream does not start with a sequence header"));
            }
            Ok(None) => return Err(CodecError::malformed_header("truncated sequence header")),
            Err(e) => return Err(CodecError::malformed_header(e.to_string())),
        };
        if payload.len() != 12 {
            return Err(CodecError::malformed_header(format!(
                "sequence header is {} bytes, expected 12",
                payload.len()
            )));
        }

        let word = |i: usize| u32::from_le_bytes([payload[i], payload[i + 1], payload[i + 2], payload[i + 3]]);
        let (width, height, fourcc) = (word(0), word(4), word(8));
        if width == 0 || height == 0 {
            return Err(CodecError::malformed_header("zero frame dimensions"));
        }
        if CodecKind::from_fourcc(fourcc) != Some(codec) {
            return Err(CodecError::malformed_header(format!("stream is not {codec:?}")));
        }

        bitstream.advance(len);
        let info = StreamInfo {
            codec,
            width,
            height,
            format: PixelFormat::Nv12,
        };
        self.stream = Some(info);
        Ok(info)
    }

    fn init_decoder(&mut self, params: &DecodeParams, frames: &dyn FrameAllocator) -> Result<()> {
        let mut mem_type = params.memory;
        mem_type.remove(MemType::Internal);
        mem_type.insert(MemType::FromDecode);
        let request = AllocRequest::new(params.info, params.async_depth, mem_type);
        let response = frames.alloc_frames(&request)?;
        debug!("Simulated decoder reuses {} work surfaces", response.len());
        self.decoder = Some(response);
        Ok(())
    }

    fn init_vpp(&mut self, params: &VppParams) -> Result<StageId> {
        let id = StageId::next();
        trace!("Simulated VPP stage {:?}: {:?}", id, params.kind);
        self.stages.insert(id, *params);
        Ok(id)
    }

    fn encode_frame_async(
        &mut self,
        ctrl: &EncodeCtrl,
        input: &FrameSurface,
        frames: &dyn FrameAllocator,
        target: &OutputTarget,
    ) -> Result<HwStatus<SyncToken>> {
        if self.control.take_busy() {
            return Ok(HwStatus::DeviceBusy);
        }
        let Some(state) = self.encoder.as_ref() else {
            return Err(CodecError::not_initialized("encoder"));
        };
        let params = &state.params;

        let mut unit = Vec::new();
        if params.gop == 0 || state.frames % u64::from(params.gop) == 0 {
            unit.extend(sequence_header(params.codec, params.info.crop.w, params.info.crop.h));
        }

        let len = Self::frame_payload_len(&params.info, ctrl.qp);
        let mut payload = Self::mapping_of(input, frames)
            .map(|m| m.read_luma(len))
            .unwrap_or_default();
        let seed = ctrl.frame_index as u8;
        while payload.len() < len {
            payload.push(seed.wrapping_add(payload.len() as u8));
        }
        unit.extend(pack_frame(&payload));

        let written = target.arena.write(target.slot, &unit)?;
        let token = self.submit(&[input], written);

        if let Some(state) = self.encoder.as_mut() {
            state.frames += 1;
            state.bytes += written as u64;
        }
        trace!("Simulated encode of frame {} at QP {}: {} bytes", ctrl.frame_index, ctrl.qp, written);
        Ok(HwStatus::Done(token))
    }

    fn decode_frame_async(
        &mut self,
        bitstream: Option<&mut Bitstream<'_>>,
        pool: &SurfacePool,
        worker: SurfaceId,
    ) -> Result<HwStatus<DecodeOutput>> {
        if self.control.take_busy() {
            return Ok(HwStatus::DeviceBusy);
        }
        if self.decoder.is_none() {
            return Err(CodecError::not_initialized("decoder"));
        }
        // Nothing is buffered inside the simulated decoder.
        let Some(bitstream) = bitstream else {
            return Ok(HwStatus::MoreData);
        };

        let surface = pool.surface(worker)?;
        if surface.lock_count() > 0 {
            return Ok(HwStatus::MoreSurface);
        }

        loop {
            match parse_unit(bitstream.remaining())? {
                None => return Ok(HwStatus::MoreData),
                Some((Unit::Header(_), len)) => bitstream.advance(len),
                Some((Unit::Frame(payload), len)) => {
                    if let Some(mapping) = surface.mapping() {
                        mapping.write_luma(payload);
                    }
                    bitstream.advance(len);
                    let token = self.submit(&[surface], 0);
                    return Ok(HwStatus::Done(DecodeOutput {
                        surface: worker,
                        token,
                    }));
                }
            }
        }
    }

    fn run_vpp_async(
        &mut self,
        stage: StageId,
        input: &FrameSurface,
        output: &FrameSurface,
        frames: &dyn FrameAllocator,
    ) -> Result<HwStatus<SyncToken>> {
        if self.control.take_busy() {
            return Ok(HwStatus::DeviceBusy);
        }
        let Some(params) = self.stages.get(&stage).copied() else {
            return Err(CodecError::not_initialized(format!("post-process stage {stage:?}")));
        };
        if output.lock_count() > 0 {
            return Ok(HwStatus::MoreSurface);
        }

        if let (Some(src), Some(dst)) = (Self::mapping_of(input, frames), Self::mapping_of(output, frames)) {
            transform(params.kind, &src, input.info(), &dst, output.info());
            if output.mapping().is_none() {
                frames.unlock(output.mem_id())?;
            }
        }

        Ok(HwStatus::Done(self.submit(&[input, output], 0)))
    }

    fn sync_operation(&mut self, token: SyncToken, timeout: Option<Duration>) -> Result<SyncStatus> {
        let Some(ready_at) = self.operations.get(&token.raw()).map(|op| op.ready_at) else {
            return Err(CodecError::not_found(format!("sync token {}", token.raw())));
        };

        let now = Instant::now();
        if ready_at > now {
            let wait = ready_at - now;
            match timeout {
                Some(limit) if limit < wait => {
                    thread::sleep(limit);
                    return Ok(SyncStatus::Pending(token));
                }
                _ => thread::sleep(wait),
            }
        }

        let Some(op) = self.operations.remove(&token.raw()) else {
            return Err(CodecError::not_found(format!("sync token {}", token.raw())));
        };
        for lock in &op.locks {
            lock.release();
        }
        self.control.syncs.fetch_add(1, Ordering::AcqRel);
        Ok(SyncStatus::Complete { bytes: op.bytes })
    }

    fn encode_stat(&self) -> Result<EncodeStat> {
        let state = self
            .encoder
            .as_ref()
            .ok_or_else(|| CodecError::not_initialized("encoder"))?;
        Ok(EncodeStat {
            num_frames: state.frames,
            num_cached_frames: 0,
            num_bytes: state.bytes,
        })
    }
}

impl Drop for SimulatedSession {
    fn drop(&mut self) {
        if !self.operations.is_empty() {
            debug!("Simulated session dropped with {} unsynced operations", self.operations.len());
        }
    }
}
