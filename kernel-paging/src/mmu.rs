//! # Regular-Paging Policy
//!
//! [`KernelMmu`] is the [`PagingPolicy`] for ordinary CR3-rooted paging:
//! canonical 48-bit virtual addresses, 2 MiB and 1 GiB large pages, global
//! kernel mappings, and cache-coherent table walks (no clflush traffic).
//!
//! Nested/second-stage policies plug into the same walker with their own
//! encodings; nothing here is consulted by the walk itself.

use crate::addresses::{KERNEL_BASE, PhysAddr, VirtAddr};
use crate::entry::{MmuFlags, PtEntry, PtFlags};
use crate::level::{PAGE_SIZE, PageTableLevel};
use crate::traits::PagingPolicy;

/// Highest physical address bit the entry format can carry.
const MAX_PADDR_BITS: u32 = 52;

/// Flag policy and TLB primitive for regular kernel/user paging.
pub struct KernelMmu;

impl PagingPolicy for KernelMmu {
    fn check_vaddr(&self, vaddr: VirtAddr) -> bool {
        let v = vaddr.as_u64();
        // Canonical form: bits 63:47 all equal bit 47.
        let canonical = v < 0x0000_8000_0000_0000 || v >= KERNEL_BASE;
        canonical && vaddr.is_aligned_to(PAGE_SIZE)
    }

    fn check_paddr(&self, paddr: PhysAddr) -> bool {
        paddr.as_u64() < (1 << MAX_PADDR_BITS) && paddr.is_aligned_to(PAGE_SIZE)
    }

    fn allowed_flags(&self, flags: MmuFlags) -> bool {
        // Unreadable mappings don't exist on x86; everything implies read.
        flags.contains(MmuFlags::READ)
    }

    fn supports_large(&self, level: PageTableLevel) -> bool {
        // 1 GiB pages assume pdpe1gb; gate on CPUID when running on hardware
        // old enough to lack it.
        matches!(level, PageTableLevel::Pd | PageTableLevel::Pdpt)
    }

    fn needs_cache_flushes(&self) -> bool {
        false
    }

    fn terminal_flags(&self, _level: PageTableLevel, flags: MmuFlags) -> PtFlags {
        let mut out = PtFlags::empty();
        if flags.contains(MmuFlags::WRITE) {
            out |= PtFlags::WRITABLE;
        }
        if flags.contains(MmuFlags::USER) {
            out |= PtFlags::USER;
        } else {
            // Supervisor-only mappings are shared across address spaces and
            // kept through CR3 reloads.
            out |= PtFlags::GLOBAL;
        }
        if !flags.contains(MmuFlags::EXECUTE) {
            out |= PtFlags::NO_EXECUTE;
        }
        if flags.contains(MmuFlags::UNCACHED) {
            out |= PtFlags::CACHE_DISABLE;
        } else if flags.contains(MmuFlags::WRITE_COMBINING) {
            // Without PAT programming the closest memory type is UC-.
            out |= PtFlags::CACHE_DISABLE | PtFlags::WRITE_THROUGH;
        }
        out
    }

    fn intermediate_flags(&self) -> PtFlags {
        // Permissions narrow at the leaf; intermediate entries stay
        // permissive so re-protects never have to touch them.
        PtFlags::PRESENT | PtFlags::WRITABLE | PtFlags::USER
    }

    fn split_flags(&self, level: PageTableLevel, large_flags: PtFlags) -> PtFlags {
        debug_assert!(matches!(
            level,
            PageTableLevel::Pd | PageTableLevel::Pdpt
        ));
        let mut out = large_flags;
        if level == PageTableLevel::Pd {
            // The children are 4 KiB PTEs, where bit 7 means PAT.
            out.remove(PtFlags::LARGE);
        }
        out
    }

    fn pt_flags_to_mmu_flags(&self, entry: PtEntry, _level: PageTableLevel) -> MmuFlags {
        let mut out = MmuFlags::READ;
        if entry.writable() {
            out |= MmuFlags::WRITE;
        }
        if entry.user() {
            out |= MmuFlags::USER;
        }
        if !entry.no_execute() {
            out |= MmuFlags::EXECUTE;
        }
        if entry.cache_disable() {
            if entry.write_through() {
                out |= MmuFlags::WRITE_COMBINING;
            } else {
                out |= MmuFlags::UNCACHED;
            }
        }
        out
    }

    #[cfg(not(test))]
    fn tlb_invalidate(
        &self,
        _level: PageTableLevel,
        vaddr: VirtAddr,
        _is_global: bool,
        _was_terminal: bool,
    ) {
        // invlpg drops the final translation and the paging-structure cache
        // entries leading to it, which covers the non-terminal case too.
        // Remote CPUs are the embedder's problem (IPI shootdown lives above
        // this crate).
        unsafe {
            core::arch::asm!(
                "invlpg [{0}]",
                in(reg) vaddr.as_u64(),
                options(nostack, preserves_flags),
            );
        }
    }

    #[cfg(test)]
    fn tlb_invalidate(
        &self,
        level: PageTableLevel,
        vaddr: VirtAddr,
        is_global: bool,
        was_terminal: bool,
    ) {
        crate::test_trace::record(crate::test_trace::Event::TlbInvalidate {
            level,
            vaddr: vaddr.as_u64(),
            is_global,
            was_terminal,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vaddr_must_be_canonical_and_aligned() {
        let mmu = KernelMmu;
        assert!(mmu.check_vaddr(VirtAddr::from_u64(0x0000_7fff_ffff_f000)));
        assert!(mmu.check_vaddr(VirtAddr::from_u64(0xffff_8000_0000_0000)));
        assert!(!mmu.check_vaddr(VirtAddr::from_u64(0x0000_8000_0000_0000)));
        assert!(!mmu.check_vaddr(VirtAddr::from_u64(0xfffe_8000_0000_0000)));
        assert!(!mmu.check_vaddr(VirtAddr::from_u64(0x1234)));
    }

    #[test]
    fn paddr_must_fit_the_entry_format() {
        let mmu = KernelMmu;
        assert!(mmu.check_paddr(PhysAddr::from_u64(0x40_0000)));
        assert!(!mmu.check_paddr(PhysAddr::from_u64(0x40_0800)));
        assert!(!mmu.check_paddr(PhysAddr::from_u64(1 << 52)));
    }

    #[test]
    fn terminal_flags_round_trip() {
        let mmu = KernelMmu;
        for flags in [
            MmuFlags::READ,
            MmuFlags::READ | MmuFlags::WRITE,
            MmuFlags::READ | MmuFlags::EXECUTE,
            MmuFlags::READ | MmuFlags::WRITE | MmuFlags::USER,
            MmuFlags::READ | MmuFlags::WRITE | MmuFlags::UNCACHED,
        ] {
            let pt = mmu.terminal_flags(PageTableLevel::Pt, flags);
            let entry = PtEntry::from_bits(pt.bits()).with_present(true);
            assert_eq!(
                mmu.pt_flags_to_mmu_flags(entry, PageTableLevel::Pt),
                flags,
                "{flags:?}"
            );
        }
    }

    #[test]
    fn kernel_mappings_are_global_user_ones_are_not() {
        let mmu = KernelMmu;
        let kernel = mmu.terminal_flags(PageTableLevel::Pt, MmuFlags::READ | MmuFlags::WRITE);
        assert!(kernel.contains(PtFlags::GLOBAL));
        let user = mmu.terminal_flags(
            PageTableLevel::Pt,
            MmuFlags::READ | MmuFlags::WRITE | MmuFlags::USER,
        );
        assert!(!user.contains(PtFlags::GLOBAL));
        assert!(user.contains(PtFlags::USER));
    }

    #[test]
    fn splitting_keeps_the_large_bit_exactly_one_level() {
        let mmu = KernelMmu;
        let huge = PtFlags::PRESENT | PtFlags::WRITABLE | PtFlags::LARGE;
        // 1 GiB → 2 MiB children stay large.
        assert!(
            mmu.split_flags(PageTableLevel::Pdpt, huge)
                .contains(PtFlags::LARGE)
        );
        // 2 MiB → 4 KiB children must not carry PS (it would read as PAT).
        assert!(
            !mmu.split_flags(PageTableLevel::Pd, huge)
                .contains(PtFlags::LARGE)
        );
    }

    #[test]
    fn write_requires_read() {
        let mmu = KernelMmu;
        assert!(mmu.allowed_flags(MmuFlags::READ | MmuFlags::WRITE));
        assert!(!mmu.allowed_flags(MmuFlags::WRITE));
        assert!(!mmu.allowed_flags(MmuFlags::empty()));
    }
}
