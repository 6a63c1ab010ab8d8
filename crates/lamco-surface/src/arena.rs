//! Output Arena
//!
//! A fixed-capacity byte arena that hands out `(offset, len)` slots for
//! encoded bitstreams. Placement is first-fit over the ordered table of
//! live slots: the gap before the first slot, the gaps between slots, and
//! the tail after the last slot are checked in that order.
//!
//! Freed gaps are never merged and the arena never grows or compacts. One
//! lock serializes every operation.
//!
//! # Examples
//!
//! ```rust
//! use lamco_surface::arena::ArenaAllocator;
//!
//! let arena = ArenaAllocator::new(1024);
//! let a = arena.alloc(512).expect("fits");
//! let b = arena.alloc(512).expect("fits");
//! assert!(arena.alloc(1).is_none());
//!
//! arena.write(a, b"frame").expect("in bounds");
//! assert!(arena.dealloc(a));
//! assert_eq!(arena.alloc(256).map(|s| s.offset), Some(0));
//! # let _ = b;
//! ```

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Result, SurfaceError};

/// A live range in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaSlot {
    /// Byte offset from the arena start
    pub offset: usize,
    /// Length in bytes
    pub len: usize,
}

impl ArenaSlot {
    /// One past the last byte
    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Arena statistics
#[derive(Debug, Clone, Default)]
pub struct ArenaStats {
    /// Total bytes
    pub capacity: usize,
    /// Bytes covered by live slots
    pub used: usize,
    /// Number of live slots
    pub live_slots: usize,
    /// Successful allocations
    pub allocations: u64,
    /// Allocations that found no gap
    pub failed_allocations: u64,
}

impl ArenaStats {
    /// Fraction of capacity in use (0.0-1.0)
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.used as f64 / self.capacity as f64
        }
    }
}

struct ArenaInner {
    buffer: Vec<u8>,
    // Sorted by offset.
    table: Vec<ArenaSlot>,
    allocations: u64,
    failed_allocations: u64,
}

/// Fixed-capacity first-fit byte arena
pub struct ArenaAllocator {
    inner: Mutex<ArenaInner>,
    capacity: usize,
}

impl ArenaAllocator {
    /// Create an arena of `capacity` bytes
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        debug!("Creating output arena: {} bytes", capacity);
        Self {
            inner: Mutex::new(ArenaInner {
                buffer: vec![0; capacity],
                table: Vec::new(),
                allocations: 0,
                failed_allocations: 0,
            }),
            capacity,
        }
    }

    /// Total bytes
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserve `len` bytes at the first gap that fits
    ///
    /// Returns `None` when no gap is large enough or `len` is zero.
    pub fn alloc(&self, len: usize) -> Option<ArenaSlot> {
        if len == 0 {
            return None;
        }

        let mut inner = self.inner.lock();
        let Some((index, offset)) = Self::find_gap(&inner.table, len, self.capacity) else {
            inner.failed_allocations += 1;
            trace!("Arena has no gap for {} bytes", len);
            return None;
        };

        let slot = ArenaSlot { offset, len };
        inner.table.insert(index, slot);
        inner.allocations += 1;
        trace!("Arena alloc {:?}", slot);
        Some(slot)
    }

    // Returns the table index to insert at and the chosen offset.
    fn find_gap(table: &[ArenaSlot], len: usize, capacity: usize) -> Option<(usize, usize)> {
        let Some(first) = table.first() else {
            return (len <= capacity).then_some((0, 0));
        };

        if first.offset >= len {
            return Some((0, 0));
        }

        for (i, pair) in table.windows(2).enumerate() {
            if pair[1].offset - pair[0].end() >= len {
                return Some((i + 1, pair[0].end()));
            }
        }

        let last_end = table.last().map_or(0, ArenaSlot::end);
        (last_end + len <= capacity).then_some((table.len(), last_end))
    }

    /// Release the slot starting at `slot.offset`
    ///
    /// Returns whether a live slot was found.
    pub fn dealloc(&self, slot: ArenaSlot) -> bool {
        let mut inner = self.inner.lock();
        match inner.table.iter().position(|s| s.offset == slot.offset) {
            Some(index) => {
                inner.table.remove(index);
                trace!("Arena dealloc {:?}", slot);
                true
            }
            None => false,
        }
    }

    /// Forget every live slot
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        debug!("Resetting arena with {} live slots", inner.table.len());
        inner.table.clear();
    }

    fn check_bounds(&self, slot: ArenaSlot) -> Result<()> {
        if slot.end() > self.capacity {
            return Err(SurfaceError::invalid_parameter(format!(
                "slot {}..{} exceeds arena capacity {}",
                slot.offset,
                slot.end(),
                self.capacity
            )));
        }
        Ok(())
    }

    /// Run `f` over the bytes of `slot`
    pub fn with_bytes<R>(&self, slot: ArenaSlot, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.check_bounds(slot)?;
        let inner = self.inner.lock();
        Ok(f(&inner.buffer[slot.offset..slot.end()]))
    }

    /// Run `f` over the bytes of `slot`, mutably
    pub fn with_bytes_mut<R>(&self, slot: ArenaSlot, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.check_bounds(slot)?;
        let mut inner = self.inner.lock();
        Ok(f(&mut inner.buffer[slot.offset..slot.end()]))
    }

    /// Copy `data` into the start of `slot`
    ///
    /// Returns the number of bytes written, truncated to the slot length.
    pub fn write(&self, slot: ArenaSlot, data: &[u8]) -> Result<usize> {
        self.with_bytes_mut(slot, |bytes| {
            let n = data.len().min(bytes.len());
            bytes[..n].copy_from_slice(&data[..n]);
            n
        })
    }

    /// Copy the first `len` bytes of `slot` out
    pub fn read(&self, slot: ArenaSlot, len: usize) -> Result<Vec<u8>> {
        self.with_bytes(slot, |bytes| bytes[..len.min(bytes.len())].to_vec())
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        let inner = self.inner.lock();
        ArenaStats {
            capacity: self.capacity,
            used: inner.table.iter().map(|s| s.len).sum(),
            live_slots: inner.table.len(),
            allocations: inner.allocations,
            failed_allocations: inner.failed_allocations,
        }
    }
}

impl std::fmt::Debug for ArenaAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ArenaAllocator")
            .field("capacity", &self.capacity)
            .field("table", &inner.table)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_order() {
        let arena = ArenaAllocator::new(100);
        let a = arena.alloc(30).expect("a");
        let b = arena.alloc(30).expect("b");
        let c = arena.alloc(30).expect("c");
        assert_eq!((a.offset, b.offset, c.offset), (0, 30, 60));

        // Middle gap is reused before the tail.
        assert!(arena.dealloc(b));
        let d = arena.alloc(20).expect("d");
        assert_eq!(d.offset, 30);

        // Leftover 10-byte gap after d, then the 10-byte tail.
        assert_eq!(arena.alloc(10).map(|s| s.offset), Some(50));
        assert_eq!(arena.alloc(10).map(|s| s.offset), Some(90));
        assert!(arena.alloc(1).is_none());
    }

    #[test]
    fn test_head_gap_exact_fit() {
        let arena = ArenaAllocator::new(64);
        let a = arena.alloc(16).expect("a");
        let _b = arena.alloc(16).expect("b");
        assert!(arena.dealloc(a));

        // A gap exactly the requested size at the head is usable.
        assert_eq!(arena.alloc(16).map(|s| s.offset), Some(0));
    }

    #[test]
    fn test_cycles_keep_capacity() {
        let arena = ArenaAllocator::new(4096);
        for _ in 0..1000 {
            let slot = arena.alloc(1024).expect("cycle");
            assert!(arena.dealloc(slot));
        }
        let full = arena.alloc(4096).expect("full capacity");
        assert_eq!(full.offset, 0);
        assert_eq!(arena.stats().live_slots, 1);
    }

    #[test]
    fn test_zero_and_oversize() {
        let arena = ArenaAllocator::new(8);
        assert!(arena.alloc(0).is_none());
        assert!(arena.alloc(9).is_none());
        assert_eq!(arena.stats().failed_allocations, 1);
    }

    #[test]
    fn test_dealloc_unknown() {
        let arena = ArenaAllocator::new(8);
        assert!(!arena.dealloc(ArenaSlot { offset: 4, len: 4 }));
    }

    #[test]
    fn test_reset() {
        let arena = ArenaAllocator::new(32);
        arena.alloc(32).expect("fill");
        assert!(arena.alloc(1).is_none());
        arena.reset();
        assert!(arena.alloc(32).is_some());
    }

    #[test]
    fn test_bytes_access() {
        let arena = ArenaAllocator::new(16);
        let slot = arena.alloc(4).expect("slot");
        assert_eq!(arena.write(slot, b"abcdef").expect("write"), 4);
        assert_eq!(arena.read(slot, 8).expect("read"), b"abcd");

        let outside = ArenaSlot { offset: 12, len: 8 };
        assert!(arena.read(outside, 1).is_err());
    }

    #[test]
    fn test_stats() {
        let arena = ArenaAllocator::new(100);
        arena.alloc(25).expect("a");
        arena.alloc(25).expect("b");
        let stats = arena.stats();
        assert_eq!(stats.used, 50);
        assert!((stats.utilization() - 0.5).abs() < f64::EPSILON);
    }
}
