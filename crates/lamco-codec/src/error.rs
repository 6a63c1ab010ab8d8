//! Error types for codec sessions
//!
//! Steady-state resource exhaustion (no free surface, no arena gap, chain
//! backpressure) is reported through `Ok(false)` / `Ok(None)` returns, not
//! through these errors. An `Err` means configuration, malformed input, a
//! hardware fault, or misuse of the session API.

use thiserror::Error;

use lamco_surface::SurfaceError;

/// Errors that can occur during codec session operations
///
/// # Examples
///
/// ```rust
/// use lamco_codec::{CodecError, ErrorKind};
///
/// let err = CodecError::UnsupportedVersion { major: 1, minor: 17 };
/// assert_eq!(err.kind(), ErrorKind::Configuration);
/// assert!(!err.is_recoverable());
/// ```
#[derive(Error, Debug)]
pub enum CodecError {
    /// Frame memory operation failed
    #[error("Surface error: {0}")]
    Surface(#[from] SurfaceError),

    /// Invalid configuration
    ///
    /// Produced by [`CodecConfig::validate`](crate::CodecConfig::validate)
    /// failures and incompatible option combinations.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Adapter vendor has no backend for this session type
    #[error("Unsupported vendor {vendor} for {session}")]
    UnsupportedVendor {
        /// Vendor name
        vendor: String,
        /// Session kind requested
        session: &'static str,
    },

    /// Hardware runtime is older than required
    #[error("Unsupported hardware API version {major}.{minor} (need 1.18 or newer)")]
    UnsupportedVersion {
        /// Reported major version
        major: u16,
        /// Reported minor version
        minor: u16,
    },

    /// Stream header could not be parsed
    #[error("Malformed stream header: {0}")]
    MalformedHeader(String),

    /// Bitstream cannot be reassembled or decoded
    #[error("Invalid bitstream: {0}")]
    InvalidBitstream(String),

    /// Hardware operation failed
    #[error("Hardware error in {op}: code {code}")]
    Hardware {
        /// Operation that failed
        op: &'static str,
        /// Vendor status code
        code: i32,
    },

    /// Device stayed busy for every permitted attempt
    #[error("Retries exhausted in {op} after {attempts} attempts")]
    RetriesExhausted {
        /// Operation being retried
        op: &'static str,
        /// Attempts made
        attempts: u32,
    },

    /// Session or chain used before it was set up
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// Handle or surface is unknown to the session
    #[error("Not found: {0}")]
    NotFound(String),

    /// Ring indices are inconsistent
    #[error("I/O state error: read index {read} ahead of write index {write}")]
    IoState {
        /// Consumer index
        read: u64,
        /// Producer index
        write: u64,
    },

    /// Requested features cannot be combined
    #[error("Incompatible parameters: {0}")]
    Incompatible(String),

    /// A pool that should have had room did not
    #[error("Surface pool exhausted: {0}")]
    PoolExhausted(String),

    /// Background output pump ended abnormally
    #[error("Output pump failed: {0}")]
    Pump(String),
}

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

/// Coarse classification of a [`CodecError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Device busy or parameters changed; retrying may succeed
    Transient,
    /// No room in a pool; wait for outputs to be released
    Backpressure,
    /// Bad configuration, vendor, version or allocation
    Configuration,
    /// Bitstream or header could not be understood
    Malformed,
    /// Hardware fault
    Hardware,
    /// API misuse: unknown handles, bad ordering
    Usage,
}

impl CodecError {
    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RetriesExhausted { .. } => ErrorKind::Transient,
            Self::PoolExhausted(_) => ErrorKind::Backpressure,
            Self::Surface(e) => match e {
                SurfaceError::NotFound(_) | SurfaceError::InvalidMemId(_) => ErrorKind::Usage,
                _ => ErrorKind::Configuration,
            },
            Self::InvalidConfig(_)
            | Self::UnsupportedVendor { .. }
            | Self::UnsupportedVersion { .. }
            | Self::Incompatible(_) => ErrorKind::Configuration,
            Self::MalformedHeader(_) | Self::InvalidBitstream(_) => ErrorKind::Malformed,
            Self::Hardware { .. } => ErrorKind::Hardware,
            Self::NotInitialized(_) | Self::NotFound(_) | Self::IoState { .. } | Self::Pump(_) => ErrorKind::Usage,
        }
    }

    /// Whether the session can keep running after this error
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::Backpressure | ErrorKind::Usage
        )
    }

    /// Stable integer code for structured logging
    ///
    /// - 1xx: configuration
    /// - 2xx: input
    /// - 3xx: hardware
    /// - 4xx: session usage
    #[must_use]
    pub fn error_code(&self) -> u32 {
        match self {
            Self::InvalidConfig(_) => 100,
            Self::UnsupportedVendor { .. } => 101,
            Self::UnsupportedVersion { .. } => 102,
            Self::Incompatible(_) => 103,
            Self::Surface(_) => 104,
            Self::MalformedHeader(_) => 200,
            Self::InvalidBitstream(_) => 201,
            Self::Hardware { .. } => 300,
            Self::RetriesExhausted { .. } => 301,
            Self::PoolExhausted(_) => 302,
            Self::NotInitialized(_) => 400,
            Self::NotFound(_) => 401,
            Self::IoState { .. } => 402,
            Self::Pump(_) => 403,
        }
    }

    /// Create an invalid config error
    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a not-found error
    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a not-initialized error
    pub(crate) fn not_initialized(msg: impl Into<String>) -> Self {
        Self::NotInitialized(msg.into())
    }

    /// Create an incompatible-parameters error
    pub(crate) fn incompatible(msg: impl Into<String>) -> Self {
        Self::Incompatible(msg.into())
    }

    /// Create an invalid bitstream error
    pub(crate) fn invalid_bitstream(msg: impl Into<String>) -> Self {
        Self::InvalidBitstream(msg.into())
    }

    /// Create a malformed header error
    pub(crate) fn malformed_header(msg: impl Into<String>) -> Self {
        Self::MalformedHeader(msg.into())
    }

    /// Create a hardware error
    pub(crate) fn hardware(op: &'static str, code: i32) -> Self {
        Self::Hardware { op, code }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lamco_surface::PixelFormat;

    #[test]
    fn test_error_display() {
        let err = CodecError::hardware("encode_frame_async", -17);
        assert_eq!(err.to_string(), "Hardware error in encode_frame_async: code -17");

        let err = CodecError::IoState { read: 5, write: 4 };
        assert_eq!(
            err.to_string(),
            "I/O state error: read index 5 ahead of write index 4"
        );
    }

    #[test]
    fn test_from_surface_error() {
        let err: CodecError = SurfaceError::UnsupportedFormat(PixelFormat::P8).into();
        assert!(matches!(err, CodecError::Surface(_)));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            CodecError::RetriesExhausted {
                op: "sync",
                attempts: 3
            }
            .kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            CodecError::invalid_bitstream("overflow").kind(),
            ErrorKind::Malformed
        );
        assert_eq!(CodecError::not_found("handle").kind(), ErrorKind::Usage);
        assert!(CodecError::not_found("handle").is_recoverable());
        assert!(!CodecError::hardware("sync", -1).is_recoverable());
    }

    #[test]
    fn test_error_codes_unique() {
        let errors = [
            CodecError::invalid_config("x"),
            CodecError::incompatible("x"),
            CodecError::malformed_header("x"),
            CodecError::invalid_bitstream("x"),
            CodecError::hardware("x", 0),
            CodecError::not_initialized("x"),
            CodecError::not_found("x"),
            CodecError::PoolExhausted("x".into()),
            CodecError::Pump("x".into()),
        ];
        let mut codes: Vec<u32> = errors.iter().map(CodecError::error_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
