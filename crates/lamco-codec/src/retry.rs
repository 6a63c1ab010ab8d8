//! Busy-retry policy for hardware submissions
//!
//! Runtimes report `DeviceBusy` while their internal queues are full and
//! `ParamChanged` after a mid-stream reconfiguration. Both mean "submit the
//! same work again". [`RetryPolicy`] owns that loop so callers see only
//! terminal statuses.
//!
//! # Examples
//!
//! ```rust
//! use std::time::Duration;
//! use lamco_codec::hardware::HwStatus;
//! use lamco_codec::retry::RetryPolicy;
//!
//! let policy = RetryPolicy::bounded(3, Duration::ZERO);
//! let mut busy = 2;
//! let status = policy.run("encode", || {
//!     if busy > 0 {
//!         busy -= 1;
//!         Ok(HwStatus::DeviceBusy)
//!     } else {
//!         Ok(HwStatus::Done(42))
//!     }
//! });
//! assert!(matches!(status, Ok(HwStatus::Done(42))));
//! ```

use std::thread;
use std::time::Duration;

use tracing::trace;

use crate::error::{CodecError, Result};
use crate::hardware::HwStatus;

/// Retry behaviour for transient hardware statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up; `None` retries forever (default: None)
    pub max_attempts: Option<u32>,

    /// Sleep between attempts; zero yields the thread instead (default: 1ms)
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff: Duration::from_millis(1),
        }
    }
}

impl RetryPolicy {
    /// Unbounded retries that yield instead of sleeping
    #[must_use]
    pub fn yielding() -> Self {
        Self {
            max_attempts: None,
            backoff: Duration::ZERO,
        }
    }

    /// At most `attempts` submissions
    #[must_use]
    pub fn bounded(attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: Some(attempts),
            backoff,
        }
    }

    /// Call `submit` until it returns a non-transient status
    ///
    /// Errors from `submit` are returned immediately. Exhausting a finite
    /// attempt budget is [`CodecError::RetriesExhausted`].
    pub fn run<T>(
        &self,
        op: &'static str,
        mut submit: impl FnMut() -> Result<HwStatus<T>>,
    ) -> Result<HwStatus<T>> {
        let mut attempts: u32 = 0;
        loop {
            let status = submit()?;
            attempts = attempts.saturating_add(1);
            if !status.is_transient() {
                return Ok(status);
            }

            if self.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(CodecError::RetriesExhausted { op, attempts });
            }

            trace!("{} not accepted yet, attempt {}", op, attempts);
            self.pause();
        }
    }

    fn pause(&self) {
        if self.backoff.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(self.backoff);
        }
    }
}
