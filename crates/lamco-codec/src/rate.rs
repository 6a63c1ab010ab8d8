//! Per-frame QP Control
//!
//! In Auto rate-control mode the device runs at constant QP and the session
//! steers that QP frame by frame toward a byte budget derived from the
//! target bitrate and frame rate.
//!
//! The rule is a one-step hill climb: a frame at or above budget raises QP
//! by one (coarser, smaller frames), a frame below budget lowers it by one.
//! QP is clamped to `0..=51`.
//!
//! # Usage
//!
//! ```rust
//! use lamco_codec::rate::QualityController;
//!
//! let mut controller = QualityController::new(26);
//! let budget = QualityController::target_max(8000, 30.0);
//!
//! // Oversized frame
//! controller.adjust(budget + 1, budget);
//! assert_eq!(controller.qp(), 27);
//!
//! // Undersized frame
//! controller.adjust(budget / 2, budget);
//! assert_eq!(controller.qp(), 26);
//! ```

use std::collections::VecDeque;

use crate::config::MAX_QP;

/// Frames kept for averages
const HISTORY_LEN: usize = 120;

/// One adjusted frame
#[derive(Debug, Clone, Copy)]
struct FrameRecord {
    /// Encoded size (bytes)
    len: usize,

    /// QP the frame was encoded with
    qp: u8,
}

/// QP hill-climb controller
#[derive(Debug, Clone)]
pub struct QualityController {
    /// QP for the next frame
    qp: u8,

    /// QP after construction or reset
    initial_qp: u8,

    /// Recent frames
    history: VecDeque<FrameRecord>,

    /// Statistics
    stats: QualityStats,
}

impl QualityController {
    /// Controller starting at `initial_qp`, clamped to 51
    #[must_use]
    pub fn new(initial_qp: u8) -> Self {
        let qp = initial_qp.min(MAX_QP);
        Self {
            qp,
            initial_qp: qp,
            history: VecDeque::with_capacity(HISTORY_LEN),
            stats: QualityStats::default(),
        }
    }

    /// Per-frame byte budget for `kbps` at `fps`
    ///
    /// `ceil(kbps * 128 / fps)`; a non-positive frame rate yields no budget
    /// limit.
    #[must_use]
    pub fn target_max(kbps: u32, fps: f32) -> usize {
        if fps <= 0.0 {
            return usize::MAX;
        }
        (f64::from(kbps) * 128.0 / f64::from(fps)).ceil() as usize
    }

    /// QP for the next frame
    #[must_use]
    pub fn qp(&self) -> u8 {
        self.qp
    }

    /// Record a frame of `len` bytes against a budget of `max` bytes
    ///
    /// Returns the QP for the next frame.
    pub fn adjust(&mut self, len: usize, max: usize) -> u8 {
        self.history.push_back(FrameRecord { len, qp: self.qp });
        while self.history.len() > HISTORY_LEN {
            self.history.pop_front();
        }

        self.stats.frames += 1;
        self.stats.total_bytes += len as u64;

        if len >= max {
            if self.qp < MAX_QP {
                self.qp += 1;
                self.stats.qp_increases += 1;
            }
        } else if self.qp > 0 {
            self.qp -= 1;
            self.stats.qp_decreases += 1;
        }

        self.qp
    }

    /// Mean encoded size over the recent history
    #[must_use]
    pub fn average_frame_size(&self) -> usize {
        if self.history.is_empty() {
            return 0;
        }
        self.history.iter().map(|r| r.len).sum::<usize>() / self.history.len()
    }

    /// Mean QP over the recent history
    #[must_use]
    pub fn average_qp(&self) -> f64 {
        if self.history.is_empty() {
            return f64::from(self.qp);
        }
        self.history.iter().map(|r| f64::from(r.qp)).sum::<f64>() / self.history.len() as f64
    }

    /// Get statistics
    #[must_use]
    pub fn stats(&self) -> &QualityStats {
        &self.stats
    }

    /// Return to the initial QP and clear history
    pub fn reset(&mut self) {
        self.qp = self.initial_qp;
        self.history.clear();
        self.stats = QualityStats::default();
    }
}

/// QP control statistics
#[derive(Debug, Clone, Default)]
pub struct QualityStats {
    /// Frames recorded
    pub frames: u64,

    /// Total bytes encoded
    pub total_bytes: u64,

    /// Number of QP increases
    pub qp_increases: u64,

    /// Number of QP decreases
    pub qp_decreases: u64,
}

impl QualityStats {
    /// Fraction of frames that raised QP
    #[must_use]
    pub fn over_budget_rate(&self) -> f64 {
        if self.frames == 0 {
            return 0.0;
        }
        self.qp_increases as f64 / self.frames as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_max() {
        // 8000 kbps at 30 fps: 1_024_000 / 30 = 34133.33
        assert_eq!(QualityController::target_max(8000, 30.0), 34_134);
        assert_eq!(QualityController::target_max(3000, 60.0), 6400);
        assert_eq!(QualityController::target_max(1000, 0.0), usize::MAX);
    }

    #[test]
    fn test_raises_monotonically_to_cap() {
        let mut controller = QualityController::new(48);
        let mut last = controller.qp();
        for _ in 0..10 {
            let qp = controller.adjust(100, 100);
            assert!(qp >= last);
            last = qp;
        }
        assert_eq!(controller.qp(), MAX_QP);
        assert_eq!(controller.stats().qp_increases, 3);
    }

    #[test]
    fn test_lowers_monotonically_to_floor() {
        let mut controller = QualityController::new(3);
        let mut last = controller.qp();
        for _ in 0..10 {
            let qp = controller.adjust(10, 100);
            assert!(qp <= last);
            last = qp;
        }
        assert_eq!(controller.qp(), 0);
        assert_eq!(controller.stats().qp_decreases, 3);
    }

    #[test]
    fn test_initial_qp_clamped() {
        assert_eq!(QualityController::new(80).qp(), MAX_QP);
    }

    #[test]
    fn test_averages_and_reset() {
        let mut controller = QualityController::new(20);
        controller.adjust(100, 50);
        controller.adjust(300, 50);
        assert_eq!(controller.average_frame_size(), 200);
        assert!((controller.average_qp() - 20.5).abs() < f64::EPSILON);
        assert!((controller.stats().over_budget_rate() - 1.0).abs() < f64::EPSILON);

        controller.reset();
        assert_eq!(controller.qp(), 20);
        assert_eq!(controller.stats().frames, 0);
        assert_eq!(controller.average_frame_size(), 0);
    }
}
