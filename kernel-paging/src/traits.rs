//! # Extension Points
//!
//! The walker is generic over two seams so one tree implementation serves
//! kernel, user and second-stage address spaces alike:
//!
//! - [`PagingPolicy`]: flag encoding/decoding, address validation, per-level
//!   large-page support, cache-coherency of the paging hardware, and the TLB
//!   invalidation primitive.
//! - [`FrameSource`]: where page-table frames come from and how a physical
//!   frame becomes a usable pointer in the kernel's view.

use crate::addresses::{PhysAddr, VirtAddr};
use crate::entry::{MmuFlags, PageTable, PtEntry, PtFlags};
use crate::level::PageTableLevel;

/// Architecture- and address-space-specific behavior of one page-table tree.
///
/// An implementation specializes the shared walker for a concrete kind of
/// address space (kernel vs user, regular vs nested paging). Encoding methods
/// are pure; [`tlb_invalidate`](Self::tlb_invalidate) is the only one with a
/// side effect.
pub trait PagingPolicy {
    /// The level the walk starts at. Four-level paging roots at the PML4.
    fn top_level(&self) -> PageTableLevel {
        PageTableLevel::Pml4
    }

    /// Whether `vaddr` may appear in this address space (canonical form,
    /// range, page alignment).
    fn check_vaddr(&self, vaddr: VirtAddr) -> bool;

    /// Whether `paddr` may be the target of a mapping (range, page
    /// alignment).
    fn check_paddr(&self, paddr: PhysAddr) -> bool;

    /// Reject flag combinations the hardware or the address-space kind
    /// forbids.
    fn allowed_flags(&self, flags: MmuFlags) -> bool;

    /// Whether a terminal mapping may live at `level`.
    fn supports_large(&self, level: PageTableLevel) -> bool;

    /// Whether the paging hardware reads PTEs without snooping the CPU
    /// caches, requiring explicit cache-line write-back after every store.
    fn needs_cache_flushes(&self) -> bool;

    /// Entry flag bits for a terminal mapping of `flags` at `level`.
    ///
    /// The walker adds `PRESENT` itself, and `LARGE` when it installs the
    /// entry above the leaf.
    fn terminal_flags(&self, level: PageTableLevel, flags: MmuFlags) -> PtFlags;

    /// Entry flag bits for an intermediate (next-table) entry.
    fn intermediate_flags(&self) -> PtFlags;

    /// Flag bits to stamp on all 512 child entries when the large mapping
    /// carrying `large_flags` at `level` is shattered into the level below.
    ///
    /// When the source is a 1 GiB mapping the result must keep `LARGE` so
    /// the children are 2 MiB mappings; when the source is 2 MiB the result
    /// must drop it (bit 7 is PAT in a 4 KiB PTE).
    fn split_flags(&self, level: PageTableLevel, large_flags: PtFlags) -> PtFlags;

    /// Decode the entry that terminated a lookup back into [`MmuFlags`]; the
    /// inverse of [`terminal_flags`](Self::terminal_flags).
    fn pt_flags_to_mmu_flags(&self, entry: PtEntry, level: PageTableLevel) -> MmuFlags;

    /// Invalidate the translation of `vaddr` at `level` on every CPU this
    /// address space may be live on.
    ///
    /// `is_global` marks a kernel-half address whose translation survives
    /// CR3 reloads; `was_terminal` tells whether the replaced entry mapped
    /// memory directly (a non-terminal replacement may require flushing the
    /// paging-structure caches more broadly). Implementations may coalesce
    /// invalidations across CPUs.
    fn tlb_invalidate(
        &self,
        level: PageTableLevel,
        vaddr: VirtAddr,
        is_global: bool,
        was_terminal: bool,
    );
}

/// Supply and reclamation of page-table frames.
///
/// The walker allocates a frame whenever a descent needs a table that does
/// not exist yet and frees it again once an unmap leaves it empty. Backing
/// allocators are expected to be kernel PMMs; allocation may block, and
/// [`free_table`](Self::free_table) never fails.
pub trait FrameSource {
    /// Allocate one zeroed, 4 KiB-aligned physical frame for a page table.
    ///
    /// Returns `None` when physical memory is exhausted; the walker converts
    /// that into an out-of-memory error (or a large-page over-unmap, where
    /// the operation permits it).
    fn alloc_table(&mut self) -> Option<PhysAddr>;

    /// Return a frame previously handed out by
    /// [`alloc_table`](Self::alloc_table).
    fn free_table(&mut self, paddr: PhysAddr);

    /// Materialize the table frame at `paddr` in the kernel's view.
    ///
    /// # Safety
    /// - `paddr` must be a live table frame of this source (the root frame
    ///   included).
    /// - The caller must hold the address-space lock; the returned reference
    ///   is unique only under it.
    unsafe fn table_mut<'a>(&self, paddr: PhysAddr) -> &'a mut PageTable;
}
