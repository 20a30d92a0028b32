//! # Cache-Line Flusher
//!
//! Coalesces `clflush`es while a walk mutates page-table entries. Paging
//! hardware that does not snoop the CPU caches (an IOMMU, or EPT walked by
//! another coherency domain) only observes a PTE store once its cache line
//! has been written back, so every mutation must be followed by a flush — but
//! adjacent entries share cache lines, and flushing per store would be
//! wasted work. The flusher keeps at most one dirty line and writes it back
//! when the walk moves to a different line, when it is forced, or when the
//! flusher goes out of scope.
//!
//! The flusher knows nothing about the TLB. The walker forces it before any
//! invalidation that depends on a prior store being globally visible.

use crate::entry::PtEntry;

/// Bytes per cache line assumed for flush coalescing. `clflush` operates on
/// the line containing the address, so over-estimating only costs extra
/// flushes, never correctness.
pub const CACHE_LINE_SIZE: u64 = 64;

/// Write back the cache line containing `line` and fence.
///
/// The fence orders the `clflush` against later stores and the TLB
/// invalidation that follows it.
#[cfg(not(test))]
#[inline]
fn flush_line(line: u64) {
    unsafe {
        core::arch::asm!(
            "clflush [{0}]",
            "mfence",
            in(reg) line,
            options(nostack, preserves_flags),
        );
    }
}

#[cfg(test)]
fn flush_line(line: u64) {
    use crate::test_trace::{self, Event};
    test_trace::record(Event::CacheFlush(line));
    test_trace::record(Event::Fence);
}

/// Scope-bound coalescer of PTE cache-line write-backs.
///
/// Constructed with the address space's `needs_cache_flushes` answer; when
/// the paging hardware is cache-coherent every method is a no-op and the
/// whole object compiles down to nothing.
pub struct CacheLineFlusher {
    /// Line-aligned address of the dirty cache line, or 0 when clean.
    dirty_line: u64,
    perform_flushes: bool,
}

impl CacheLineFlusher {
    #[must_use]
    pub const fn new(perform_flushes: bool) -> Self {
        Self {
            dirty_line: 0,
            perform_flushes,
        }
    }

    /// Note that the entry behind `entry` was just stored.
    ///
    /// If the entry lies on the currently dirty line nothing happens; an
    /// entry on a different line forces the pending line out first.
    pub fn flush_pt_entry(&mut self, entry: *const PtEntry) {
        if !self.perform_flushes {
            return;
        }

        let entry_line = entry as u64 & !(CACHE_LINE_SIZE - 1);
        if entry_line != self.dirty_line {
            self.force_flush();
            self.dirty_line = entry_line;
        }
    }

    /// Write back the pending line, if any, immediately.
    ///
    /// Callers must invoke this before a TLB invalidation that depends on a
    /// prior store: remapping hardware must never observe the old entry after
    /// its translation was shot down.
    pub fn force_flush(&mut self) {
        if self.dirty_line != 0 {
            flush_line(self.dirty_line);
            self.dirty_line = 0;
        }
    }
}

impl Drop for CacheLineFlusher {
    fn drop(&mut self) {
        self.force_flush();
    }
}
