//! # x86-64 Page-Table Management
//!
//! Installs, removes and re-permissions virtual-to-physical mappings in a
//! four-level x86-64 paging tree, keeping the in-memory entries, the CPU
//! caches (on paging hardware that does not snoop them) and the TLB
//! consistent with one another.
//!
//! ## The walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! Each level holds 512 eight-byte entries. A present entry either maps
//! memory directly — every PT entry, or a PD/PDPT entry with `PS=1` (2 MiB /
//! 1 GiB) — or points at the next table down.
//!
//! ## What you get
//!
//! - [`AddressSpace`]: one page-table tree behind one lock, with range
//!   operations in pages: [`map_pages`](AddressSpace::map_pages),
//!   [`map_pages_contiguous`](AddressSpace::map_pages_contiguous),
//!   [`unmap_pages`](AddressSpace::unmap_pages),
//!   [`protect_pages`](AddressSpace::protect_pages),
//!   [`query_vaddr`](AddressSpace::query_vaddr) and
//!   [`destroy`](AddressSpace::destroy).
//! - Opportunistic large pages: contiguous, aligned ranges terminate at the
//!   PD or PDPT level; partial unmaps and re-protects shatter a large page
//!   and keep the remainder intact.
//! - On-demand intermediate tables, freed again the moment an unmap leaves
//!   them empty, with out-of-memory rollback mid-map.
//! - Batched cache-line write-back ([`CacheLineFlusher`]) for address spaces
//!   whose paging hardware is not cache-coherent, sequenced strictly before
//!   the dependent TLB shootdown.
//! - Two seams ([`PagingPolicy`], [`FrameSource`]) so the same walker serves
//!   kernel, user and second-stage trees; [`KernelMmu`] is the regular
//!   CR3-rooted policy.
//!
//! What you do **not** get: a physical allocator, multi-CPU shootdown
//! transport, demand paging, or any say over which ranges to map. This crate
//! is mechanism only.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

mod address_space;
mod addresses;
mod cursor;
mod entry;
mod flush;
mod level;
mod mmu;
mod traits;
mod walker;

#[cfg(test)]
pub(crate) mod test_trace;

pub use crate::address_space::AddressSpace;
pub use crate::addresses::{KERNEL_BASE, MemoryAddress, PhysAddr, VirtAddr, is_kernel_address};
pub use crate::cursor::MappingCursor;
pub use crate::entry::{ENTRIES_PER_TABLE, MmuFlags, PageTable, PtEntry, PtFlags};
pub use crate::flush::{CACHE_LINE_SIZE, CacheLineFlusher};
pub use crate::level::{PAGE_SIZE, PageTableLevel};
pub use crate::mmu::KernelMmu;
pub use crate::traits::{FrameSource, PagingPolicy};

/// Errors surfaced by the range operations on an [`AddressSpace`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PagingError {
    /// A virtual address, physical address or flag combination failed
    /// validation. Nothing was changed.
    #[error("invalid address or flags")]
    InvalidArgs,
    /// A map request overlaps an existing mapping. Already-installed pages
    /// of the request were rolled back.
    #[error("range overlaps an existing mapping")]
    AlreadyExists,
    /// The frame source could not supply an intermediate table. The mapped
    /// prefix was rolled back.
    #[error("out of memory for page tables")]
    OutOfMemory,
    /// The queried address has no translation.
    #[error("no mapping for the address")]
    NotFound,
}
