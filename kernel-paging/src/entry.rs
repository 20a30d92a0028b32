//! # Page-Table Entries
//!
//! The architectural 64-bit entry word ([`PtEntry`]), the flag-bit sets the
//! flag policy traffics in ([`PtFlags`]), the hardware-independent mapping
//! flags callers pass in ([`MmuFlags`]), and the 4 KiB table of 512 entries
//! ([`PageTable`]).
//!
//! ## Entry forms
//!
//! A present entry is one of:
//!
//! - a **terminal** mapping: every present PT entry, or a PD/PDPT entry with
//!   `PS=1` (2 MiB / 1 GiB large page);
//! - an **intermediate** pointer: a present entry with `PS=0` above the leaf,
//!   holding the 4 KiB-aligned base of the next table down.
//!
//! Bit 7 is `PS` at the PD and PDPT levels and PAT in 4 KiB PTEs; the flag
//! policy never emits PAT, so [`PtEntry::large`] is meaningful exactly where
//! the walk consults it (above the leaf).

use crate::addresses::PhysAddr;
use crate::level::PageTableLevel;
use bitfield_struct::bitfield;

/// Number of entries in a table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Mask selecting the 4 KiB-aligned next-table base out of an intermediate
/// entry (bits 51:12).
const TABLE_FRAME_MASK: u64 = 0x000f_ffff_ffff_f000;

/// One 64-bit entry of any paging level.
///
/// Reference: AMD APM / Intel SDM paging structures (x86-64).
#[bitfield(u64)]
pub struct PtEntry {
    /// **Present** (bit 0): valid entry if set.
    pub present: bool,
    /// **Writable** (bit 1): write permission, intersected across the walk.
    pub writable: bool,
    /// **User/Supervisor** (bit 2): user-mode access if set.
    pub user: bool,
    /// **Page Write-Through** (PWT, bit 3).
    pub write_through: bool,
    /// **Page Cache Disable** (PCD, bit 4).
    pub cache_disable: bool,
    /// **Accessed** (bit 5): set by the CPU on first access.
    pub accessed: bool,
    /// **Dirty** (bit 6): set by the CPU on first write (leaf forms only).
    pub dirty: bool,
    /// **Page Size** (bit 7): terminal large mapping at PD/PDPT; PAT in a
    /// 4 KiB PTE.
    pub large: bool,
    /// **Global** (bit 8): TLB entry survives CR3 reload (leaf forms only).
    pub global: bool,
    /// OS-available (bits 9..11): not interpreted by hardware.
    #[bits(3)]
    pub os_available_low: u8,
    /// Physical frame bits 51:12. Terminal large forms widen the low end of
    /// this range into the frame; extract through [`Self::frame`].
    #[bits(40)]
    frame_51_12: u64,
    /// OS-available (bits 52..58).
    #[bits(7)]
    pub os_available_high: u8,
    /// Protection key / OS use (bits 59..62).
    #[bits(4)]
    pub protection_key: u8,
    /// **No-Execute** (NX, bit 63).
    pub no_execute: bool,
}

impl PtEntry {
    /// Whether this entry maps memory directly at `level` rather than
    /// pointing at a lower table.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self, level: PageTableLevel) -> bool {
        matches!(level, PageTableLevel::Pt) || self.large()
    }

    /// Physical base of the region a terminal entry maps at `level`.
    #[inline]
    #[must_use]
    pub fn frame(self, level: PageTableLevel) -> PhysAddr {
        debug_assert!(self.present());
        PhysAddr::from_u64(self.into_bits() & level.frame_mask())
    }

    /// Physical base of the next table down. Only meaningful for present
    /// non-terminal entries.
    #[inline]
    #[must_use]
    pub fn table_addr(self) -> PhysAddr {
        debug_assert!(self.present() && !self.large());
        PhysAddr::from_u64(self.into_bits() & TABLE_FRAME_MASK)
    }

    /// The architectural flag bits of this entry, frame bits stripped.
    #[inline]
    #[must_use]
    pub fn flags(self) -> PtFlags {
        PtFlags::from_bits_truncate(self.into_bits())
    }
}

bitflags::bitflags! {
    /// Architectural flag bits composed into entries by the flag policy.
    ///
    /// Bit positions match [`PtEntry`]; an entry word is `frame | flags`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct PtFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// `PS`: terminal large mapping at PD/PDPT.
        const LARGE         = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PtFlags {
    /// The flag bits carried over when a large page is shattered into the
    /// next level down: permissions, cache policy and the `PS` bit itself
    /// (so splitting a 1 GiB entry yields 2 MiB entries).
    pub const LARGE_FLAGS_MASK: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::USER)
        .union(Self::WRITE_THROUGH)
        .union(Self::CACHE_DISABLE)
        .union(Self::ACCESSED)
        .union(Self::DIRTY)
        .union(Self::LARGE)
        .union(Self::GLOBAL)
        .union(Self::NO_EXECUTE);
}

bitflags::bitflags! {
    /// Hardware-independent mapping flags accepted by the top-level calls.
    ///
    /// The flag policy translates these into [`PtFlags`] per level and back
    /// again for queries.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct MmuFlags: u32 {
        const READ            = 1 << 0;
        const WRITE           = 1 << 1;
        const EXECUTE         = 1 << 2;
        const USER            = 1 << 3;
        /// Disable caching entirely (MMIO and friends).
        const UNCACHED        = 1 << 4;
        /// Prefer write-combining; policies without PAT programming may
        /// degrade this to uncached.
        const WRITE_COMBINING = 1 << 5;
    }
}

/// A page table at any level: 512 entries, one 4 KiB frame.
///
/// Entry accesses are volatile — the paging unit walks these words behind the
/// compiler's back, so loads and stores must not be elided or torn.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// A table with every entry absent.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PtEntry::new(); ENTRIES_PER_TABLE],
        }
    }

    /// Clear every entry.
    pub fn zero(&mut self) {
        for index in 0..ENTRIES_PER_TABLE {
            unsafe { self.entry_ptr(index).write_volatile(PtEntry::new()) };
        }
    }

    /// Read the entry at `index`.
    #[inline]
    #[must_use]
    pub fn load(&self, index: usize) -> PtEntry {
        debug_assert!(index < ENTRIES_PER_TABLE);
        unsafe { (self.entries.as_ptr().add(index)).read_volatile() }
    }

    /// Raw pointer to the entry slot at `index`. The caller stores through it
    /// volatilely and hands the same pointer to the cache-line flusher.
    #[inline]
    pub fn entry_ptr(&mut self, index: usize) -> *mut PtEntry {
        debug_assert!(index < ENTRIES_PER_TABLE);
        unsafe { self.entries.as_mut_ptr().add(index) }
    }

    /// Whether no entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        (0..ENTRIES_PER_TABLE).all(|index| !self.load(index).present())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_masks_per_level() {
        let raw = 0x0000_0000_c064_3000u64 | PtFlags::PRESENT.bits() | PtFlags::LARGE.bits();
        let e = PtEntry::from_bits(raw);
        assert_eq!(e.frame(PageTableLevel::Pt).as_u64(), 0xc064_3000);
        assert_eq!(e.frame(PageTableLevel::Pd).as_u64(), 0xc060_0000);
        assert_eq!(e.frame(PageTableLevel::Pdpt).as_u64(), 0xc000_0000);
    }

    #[test]
    fn terminal_predicate() {
        let leaf = PtEntry::new().with_present(true);
        assert!(leaf.is_terminal(PageTableLevel::Pt));
        assert!(!leaf.is_terminal(PageTableLevel::Pd));

        let large = leaf.with_large(true);
        assert!(large.is_terminal(PageTableLevel::Pd));
        assert!(large.is_terminal(PageTableLevel::Pdpt));
    }

    #[test]
    fn table_addr_strips_flags() {
        let raw = 0x0000_0000_0123_4000u64
            | (PtFlags::PRESENT | PtFlags::WRITABLE | PtFlags::USER | PtFlags::NO_EXECUTE).bits();
        assert_eq!(PtEntry::from_bits(raw).table_addr().as_u64(), 0x0123_4000);
    }

    #[test]
    fn zeroed_table_is_empty() {
        let mut table = PageTable::zeroed();
        assert!(table.is_empty());
        unsafe {
            table
                .entry_ptr(17)
                .write_volatile(PtEntry::new().with_present(true));
        }
        assert!(!table.is_empty());
        table.zero();
        assert!(table.is_empty());
    }
}
