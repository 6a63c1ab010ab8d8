//! Hardware Collaborator
//!
//! The [`HardwareSession`] trait is the seam between the session layer and
//! a vendor media runtime. Sessions own one collaborator each, submit work
//! through it asynchronously and wait on the returned [`SyncToken`]s.
//!
//! Submissions return [`HwStatus`]: transient statuses (`DeviceBusy`,
//! `ParamChanged`) are retried by [`RetryPolicy`](crate::retry::RetryPolicy),
//! `MoreData` and `MoreSurface` are flow control, and fatal failures come
//! back as [`CodecError::Hardware`](crate::CodecError::Hardware).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lamco_surface::{
    ArenaAllocator, ArenaSlot, FrameAllocator, FrameInfo, FrameSurface, PixelFormat, SurfaceId,
    SurfacePool, SyncToken,
};

use crate::config::CodecKind;
use crate::error::{CodecError, Result};
use crate::params::{DecodeParams, EncodeParams, VppParams};

/// Status code for a sync that timed out without a deadline
pub const ERR_SYNC_TIMEOUT: i32 = -20;

static NEXT_TIMELINE: AtomicU64 = AtomicU64::new(1);
static NEXT_STAGE: AtomicU64 = AtomicU64::new(1);

/// Media runtime API version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
}

impl ApiVersion {
    /// Oldest runtime the sessions accept
    pub const MIN: Self = Self::new(1, 18);

    /// Construct a version
    #[must_use]
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Whether this version is at least [`ApiVersion::MIN`]
    #[must_use]
    pub fn is_supported(self) -> bool {
        self >= Self::MIN
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Outcome of an asynchronous submission
#[derive(Debug)]
pub enum HwStatus<T> {
    /// Work accepted
    Done(T),
    /// Device is busy; resubmit later
    DeviceBusy,
    /// Input absorbed without producing output
    MoreData,
    /// No free output surface
    MoreSurface,
    /// Stream parameters changed; resubmit
    ParamChanged,
}

impl<T> HwStatus<T> {
    /// Whether resubmitting the same work may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DeviceBusy | Self::ParamChanged)
    }
}

/// Read cursor over caller-provided bitstream bytes
#[derive(Debug)]
pub struct Bitstream<'a> {
    data: &'a [u8],
    /// Bytes consumed so far
    pub offset: usize,
}

impl<'a> Bitstream<'a> {
    /// Cursor at the start of `data`
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Unconsumed bytes
    #[must_use]
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.offset.min(self.data.len())..]
    }

    /// Number of unconsumed bytes
    #[must_use]
    pub fn remaining_len(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }

    /// Mark `n` more bytes consumed
    pub fn advance(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.data.len());
    }
}

/// Which component a surface query is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoQuery {
    /// Encoder input
    Encode,
    /// Decoder output
    Decode,
}

/// Surface count and geometry reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceRequest {
    /// Frame geometry
    pub info: FrameInfo,
    /// Fewest surfaces the component can run with
    pub min: usize,
    /// Surfaces the component would like
    pub suggested: usize,
}

/// Per-frame encode control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeCtrl {
    /// Quantization parameter for this frame
    pub qp: u8,
    /// Position of the frame in the input sequence
    pub frame_index: u64,
}

/// Where the encoder writes its bitstream
#[derive(Debug, Clone)]
pub struct OutputTarget {
    /// Session output arena
    pub arena: Arc<ArenaAllocator>,
    /// Reserved slot
    pub slot: ArenaSlot,
}

/// Surface produced by a decode submission
#[derive(Debug)]
pub struct DecodeOutput {
    /// Decoded surface in the work pool
    pub surface: SurfaceId,
    /// Completion token
    pub token: SyncToken,
}

/// Result of waiting on a token
#[derive(Debug)]
pub enum SyncStatus {
    /// Operation finished; `bytes` is the encoded length for encode tokens
    Complete {
        /// Bytes produced
        bytes: usize,
    },
    /// Timed out; the token is handed back
    Pending(SyncToken),
}

/// Stream parameters parsed from a sequence header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    /// Codec of the stream
    pub codec: CodecKind,
    /// Coded width
    pub width: u32,
    /// Coded height
    pub height: u32,
    /// Decoded pixel format
    pub format: PixelFormat,
}

/// Encoder counters reported by the runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeStat {
    /// Frames encoded
    pub num_frames: u64,
    /// Frames that were cached without output
    pub num_cached_frames: u64,
    /// Bitstream bytes produced
    pub num_bytes: u64,
}

/// Hardware scheduling timeline
///
/// Sessions joined to one timeline share a scheduler on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimelineId(u64);

impl TimelineId {
    /// Allocate a fresh timeline id
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_TIMELINE.fetch_add(1, Ordering::Relaxed))
    }
}

/// Post-process stage handle returned by [`HardwareSession::init_vpp`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageId(u64);

impl StageId {
    /// Allocate a fresh stage id
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_STAGE.fetch_add(1, Ordering::Relaxed))
    }
}

/// Vendor media runtime session
///
/// Work is submitted asynchronously; every `Done` status carries a token
/// that must be passed to [`sync_operation`](Self::sync_operation) exactly
/// once. Input surfaces carry a hardware lock from submission until their
/// token completes.
pub trait HardwareSession: Send {
    /// Runtime API version
    fn version(&self) -> ApiVersion;

    /// Timeline this session schedules on
    fn timeline(&self) -> TimelineId;

    /// Share `parent`'s timeline
    fn join(&mut self, parent: TimelineId) -> Result<()>;

    /// Return to a private timeline
    fn disjoin(&mut self) -> Result<()>;

    /// Surfaces the component needs for `info` frames at `async_depth`
    fn query_io_surface(&mut self, query: IoQuery, info: FrameInfo, async_depth: usize) -> Result<SurfaceRequest>;

    /// Initialize the encoder
    fn init_encoder(&mut self, params: &EncodeParams) -> Result<()>;

    /// Parse a sequence header, consuming it from `bitstream`
    fn decode_header(&mut self, bitstream: &mut Bitstream<'_>, codec: CodecKind) -> Result<StreamInfo>;

    /// Initialize the decoder
    ///
    /// The runtime may query `frames` again for its work surfaces.
    fn init_decoder(&mut self, params: &DecodeParams, frames: &dyn FrameAllocator) -> Result<()>;

    /// Initialize one post-process stage
    fn init_vpp(&mut self, params: &VppParams) -> Result<StageId>;

    /// Submit one frame for encoding into `target`
    fn encode_frame_async(
        &mut self,
        ctrl: &EncodeCtrl,
        input: &FrameSurface,
        frames: &dyn FrameAllocator,
        target: &OutputTarget,
    ) -> Result<HwStatus<SyncToken>>;

    /// Submit bitstream for decoding into `worker`
    ///
    /// `None` flushes buffered frames at end of stream.
    fn decode_frame_async(
        &mut self,
        bitstream: Option<&mut Bitstream<'_>>,
        pool: &SurfacePool,
        worker: SurfaceId,
    ) -> Result<HwStatus<DecodeOutput>>;

    /// Submit one post-process stage from `input` to `output`
    fn run_vpp_async(
        &mut self,
        stage: StageId,
        input: &FrameSurface,
        output: &FrameSurface,
        frames: &dyn FrameAllocator,
    ) -> Result<HwStatus<SyncToken>>;

    /// Wait for `token`; `None` waits indefinitely
    fn sync_operation(&mut self, token: SyncToken, timeout: Option<Duration>) -> Result<SyncStatus>;

    /// Encoder counters
    fn encode_stat(&self) -> Result<EncodeStat>;
}

/// Check the runtime version of `hw`
pub(crate) fn check_version(hw: &dyn HardwareSession) -> Result<()> {
    let version = hw.version();
    if version.is_supported() {
        Ok(())
    } else {
        Err(CodecError::UnsupportedVersion {
            major: version.major,
            minor: version.minor,
        })
    }
}

/// Wait for `token` without a timeout
pub(crate) fn sync_blocking(hw: &mut dyn HardwareSession, token: SyncToken) -> Result<usize> {
    match hw.sync_operation(token, None)? {
        SyncStatus::Complete { bytes } => Ok(bytes),
        SyncStatus::Pending(_) => Err(CodecError::hardware("sync_operation", ERR_SYNC_TIMEOUT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_gate() {
        assert!(ApiVersion::new(1, 18).is_supported());
        assert!(ApiVersion::new(2, 0).is_supported());
        assert!(!ApiVersion::new(1, 17).is_supported());
        assert_eq!(ApiVersion::new(1, 19).to_string(), "1.19");
    }

    #[test]
    fn test_bitstream_cursor() {
        let data = [1u8, 2, 3, 4];
        let mut bs = Bitstream::new(&data);
        bs.advance(3);
        assert_eq!(bs.remaining(), &[4]);
        bs.advance(10);
        assert_eq!(bs.remaining_len(), 0);
        assert!(bs.remaining().is_empty());
    }

    #[test]
    fn test_transient_status() {
        assert!(HwStatus::<()>::DeviceBusy.is_transient());
        assert!(HwStatus::<()>::ParamChanged.is_transient());
        assert!(!HwStatus::<()>::MoreData.is_transient());
        assert!(!HwStatus::Done(()).is_transient());
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(TimelineId::next(), TimelineId::next());
        assert_ne!(StageId::next(), StageId::next());
    }
}
