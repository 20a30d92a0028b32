//! # Recursive Range Operators
//!
//! The heart of the crate: map, unmap, re-protect and query walk the tree
//! from the top level towards the leaf, one table entry at a time, sharing a
//! [`MappingCursor`] that records how much of the range is still outstanding.
//!
//! The operators lean on three rules:
//!
//! - **Every store goes through [`Walker::update_entry`] /
//!   [`Walker::unmap_entry`]**, which order PTE store → cache-line flush →
//!   TLB invalidation. Replacing a present entry forces the pending flush
//!   before the shootdown so non-coherent paging hardware can never observe
//!   the stale entry after its translation died.
//! - **Large pages are opportunistic.** Mapping installs a terminal entry
//!   above the leaf whenever alignment and remaining size allow; unmapping
//!   and re-protecting shatter one on a partial hit, and degrade to
//!   unmapping it whole when the shatter cannot get memory. The caller owns
//!   the range it names, so unmapping too much of it is tolerated.
//! - **Empty tables do not linger.** When an unmap clears the last entry of
//!   a sub-table, the parent entry is cleared and the frame returned in the
//!   same walk.

use log::{debug, trace};

use crate::addresses::{PhysAddr, VirtAddr, is_kernel_address};
use crate::cursor::MappingCursor;
use crate::entry::{ENTRIES_PER_TABLE, MmuFlags, PageTable, PtEntry, PtFlags};
use crate::flush::CacheLineFlusher;
use crate::level::PageTableLevel;
use crate::traits::{FrameSource, PagingPolicy};
use crate::PagingError;

/// One walk over a single address space's tree.
///
/// Borrows the pieces the operators need from the locked address-space
/// state; constructing one is free and they are built per operation.
pub(crate) struct Walker<'a, P: PagingPolicy, F: FrameSource> {
    pub(crate) policy: &'a P,
    pub(crate) frames: &'a mut F,
    /// Count of intermediate table frames owned by the address space.
    pub(crate) pages: &'a mut u64,
}

impl<P: PagingPolicy, F: FrameSource> Walker<'_, P, F> {
    /// View the table frame at `paddr`.
    pub(crate) fn table<'t>(&self, paddr: PhysAddr) -> &'t mut PageTable {
        // Safety: the walker only follows frames reachable from the root of
        // the locked address space, all of which came from `frames`.
        unsafe { self.frames.table_mut(paddr) }
    }

    /// Store `paddr | flags | PRESENT` into `table[index]`.
    ///
    /// If the slot previously held a present entry, the pending cache line
    /// is forced out and the old translation shot down.
    fn update_entry(
        &self,
        clf: &mut CacheLineFlusher,
        level: PageTableLevel,
        vaddr: VirtAddr,
        table: &mut PageTable,
        index: usize,
        paddr: PhysAddr,
        flags: PtFlags,
        was_terminal: bool,
    ) {
        debug_assert!(paddr.is_aligned_to(PageTableLevel::Pt.page_size()));

        let slot = table.entry_ptr(index);
        let old = unsafe { slot.read_volatile() };

        let entry = PtEntry::from_bits(paddr.as_u64() | flags.bits() | PtFlags::PRESENT.bits());
        unsafe { slot.write_volatile(entry) };
        clf.flush_pt_entry(slot);

        if old.present() {
            // The flush must be globally visible before the invalidation, or
            // non-coherent remapping hardware can re-fetch the old entry.
            clf.force_flush();
            self.policy
                .tlb_invalidate(level, vaddr, is_kernel_address(vaddr), was_terminal);
        }
    }

    /// Clear `table[index]`, invalidating the old translation if one was
    /// present.
    fn unmap_entry(
        &self,
        clf: &mut CacheLineFlusher,
        level: PageTableLevel,
        vaddr: VirtAddr,
        table: &mut PageTable,
        index: usize,
        was_terminal: bool,
    ) {
        let slot = table.entry_ptr(index);
        let old = unsafe { slot.read_volatile() };

        unsafe { slot.write_volatile(PtEntry::new()) };
        clf.flush_pt_entry(slot);

        if old.present() {
            clf.force_flush();
            self.policy
                .tlb_invalidate(level, vaddr, is_kernel_address(vaddr), was_terminal);
        }
    }

    /// Shatter the large mapping in `table[index]` into a fresh table of 512
    /// entries one level down, preserving the effective translation.
    ///
    /// `vaddr` must be the `page_size(level)`-aligned base of the mapping.
    fn split_large_page(
        &mut self,
        level: PageTableLevel,
        vaddr: VirtAddr,
        table: &mut PageTable,
        index: usize,
    ) -> Result<(), PagingError> {
        debug_assert!(level != PageTableLevel::Pt, "tried splitting a leaf");
        debug_assert!(level.is_aligned(vaddr.as_u64()));

        let entry = table.load(index);
        debug_assert!(entry.present() && entry.large());

        let sub_phys = self
            .frames
            .alloc_table()
            .ok_or(PagingError::OutOfMemory)?;
        debug!("splitting {level:?} entry at {vaddr} into table {sub_phys}");

        let base = entry.frame(level);
        let flags = self
            .policy
            .split_flags(level, entry.flags() & PtFlags::LARGE_FLAGS_MASK);

        let mut clf = CacheLineFlusher::new(self.policy.needs_cache_flushes());

        // If the source was a 1 GiB mapping, `flags` still carries LARGE and
        // the children become 2 MiB mappings.
        let lower = level.lower();
        let ps = lower.page_size();
        let sub = self.table(sub_phys);
        for i in 0..ENTRIES_PER_TABLE {
            let offset = i as u64 * ps;
            self.update_entry(
                &mut clf,
                lower,
                vaddr + offset,
                sub,
                i,
                base + offset,
                flags,
                false,
            );
        }

        self.update_entry(
            &mut clf,
            level,
            vaddr,
            table,
            index,
            sub_phys,
            self.policy.intermediate_flags(),
            true,
        );
        *self.pages += 1;
        Ok(())
    }

    /// Unmap the range described by `cursor` underneath `table`.
    ///
    /// Returns whether any entry was cleared at this level or below.
    pub(crate) fn remove_mapping(
        &mut self,
        table: &mut PageTable,
        level: PageTableLevel,
        cursor: &mut MappingCursor,
    ) -> bool {
        trace!(
            "remove level={level:?} vaddr={} size={:#x}",
            cursor.vaddr, cursor.size
        );

        if level == PageTableLevel::Pt {
            return self.remove_mapping_leaf(table, cursor);
        }

        let mut clf = CacheLineFlusher::new(self.policy.needs_cache_flushes());
        let mut unmapped = false;
        let ps = level.page_size();

        for index in level.index_of(cursor.vaddr)..ENTRIES_PER_TABLE {
            if cursor.size == 0 {
                break;
            }

            let mut entry = table.load(index);
            if !entry.present() {
                cursor.skip_entry(level);
                continue;
            }

            if entry.large() {
                // A request covering the whole mapping just drops it.
                if level.is_aligned(cursor.vaddr.as_u64()) && cursor.size >= ps {
                    self.unmap_entry(&mut clf, level, cursor.vaddr, table, index, true);
                    unmapped = true;

                    cursor.vaddr += ps;
                    cursor.size -= ps;
                    continue;
                }
                // Partial hit: shatter so the remainder survives. If the
                // split can't get memory, unmap the whole entry and let a
                // later fault rebuild the rest.
                let page_vaddr = cursor.vaddr.align_down(ps);
                if self
                    .split_large_page(level, page_vaddr, table, index)
                    .is_err()
                {
                    self.unmap_entry(&mut clf, level, cursor.vaddr, table, index, true);
                    unmapped = true;

                    cursor.skip_entry(level);
                    continue;
                }
                entry = table.load(index);
            }

            let sub_phys = entry.table_addr();
            let entry_vaddr = cursor.vaddr;
            // Decide reclamation eligibility from the pre-descent cursor: if
            // the request was about to pass over this entry's whole range,
            // the sub-table is disposable without looking inside it.
            let covers_entry =
                level.is_aligned(entry_vaddr.as_u64()) && cursor.size >= ps;

            let lower_unmapped =
                self.remove_mapping(self.table(sub_phys), level.lower(), cursor);

            let mut free_sub_table = covers_entry;
            if !free_sub_table && lower_unmapped {
                // The scan is authoritative; the fast path above only skips
                // it when the outcome is forced.
                free_sub_table = self.table(sub_phys).is_empty();
            }
            if free_sub_table {
                debug!("freeing empty {:?} table {sub_phys}", level.lower());
                self.unmap_entry(&mut clf, level, entry_vaddr, table, index, false);
                self.frames.free_table(sub_phys);
                *self.pages -= 1;
                unmapped = true;
            }

            debug_assert!(cursor.size == 0 || level.is_aligned(cursor.vaddr.as_u64()));
        }

        unmapped
    }

    /// [`remove_mapping`](Self::remove_mapping) at the leaf: every present
    /// entry is terminal and exactly one page wide.
    fn remove_mapping_leaf(&mut self, table: &mut PageTable, cursor: &mut MappingCursor) -> bool {
        debug_assert!(PageTableLevel::Pt.is_aligned(cursor.size));

        let mut clf = CacheLineFlusher::new(self.policy.needs_cache_flushes());
        let mut unmapped = false;
        let ps = PageTableLevel::Pt.page_size();

        for index in PageTableLevel::Pt.index_of(cursor.vaddr)..ENTRIES_PER_TABLE {
            if cursor.size == 0 {
                break;
            }

            if table.load(index).present() {
                self.unmap_entry(&mut clf, PageTableLevel::Pt, cursor.vaddr, table, index, true);
                unmapped = true;
            }
            cursor.vaddr += ps;
            cursor.size -= ps;
        }

        unmapped
    }

    /// Map the range described by `cursor` underneath `table`.
    ///
    /// On error the cursor marks how far the walk got; the top-level caller
    /// is responsible for unmapping the prefix that did get installed.
    /// Intermediate frames never undo their own work — partial rollback in
    /// the middle of the recursion would double-unmap.
    pub(crate) fn add_mapping(
        &mut self,
        table: &mut PageTable,
        flags: MmuFlags,
        level: PageTableLevel,
        cursor: &mut MappingCursor,
    ) -> Result<(), PagingError> {
        trace!(
            "add level={level:?} vaddr={} paddr={} size={:#x}",
            cursor.vaddr, cursor.paddr, cursor.size
        );

        if level == PageTableLevel::Pt {
            return self.add_mapping_leaf(table, flags, cursor);
        }

        let intermediate = self.policy.intermediate_flags();
        let terminal = self.policy.terminal_flags(level, flags);
        let supports_large = self.policy.supports_large(level);

        let mut clf = CacheLineFlusher::new(self.policy.needs_cache_flushes());
        let ps = level.page_size();

        for index in level.index_of(cursor.vaddr)..ENTRIES_PER_TABLE {
            if cursor.size == 0 {
                break;
            }

            let mut entry = table.load(index);
            if entry.present() && entry.large() {
                return Err(PagingError::AlreadyExists);
            }

            // Candidate for a fresh large mapping?
            if supports_large
                && !entry.present()
                && level.is_aligned(cursor.vaddr.as_u64())
                && level.is_aligned(cursor.paddr.as_u64())
                && cursor.size >= ps
            {
                self.update_entry(
                    &mut clf,
                    level,
                    cursor.vaddr,
                    table,
                    index,
                    cursor.paddr,
                    terminal | PtFlags::LARGE,
                    false,
                );
                cursor.paddr += ps;
                cursor.vaddr += ps;
                cursor.size -= ps;
                continue;
            }

            if !entry.present() {
                let sub_phys = self
                    .frames
                    .alloc_table()
                    .ok_or(PagingError::OutOfMemory)?;
                debug!("new {:?} table {sub_phys}", level.lower());

                self.update_entry(
                    &mut clf,
                    level,
                    cursor.vaddr,
                    table,
                    index,
                    sub_phys,
                    intermediate,
                    false,
                );
                *self.pages += 1;
                entry = table.load(index);
            }

            self.add_mapping(self.table(entry.table_addr()), flags, level.lower(), cursor)?;
        }

        Ok(())
    }

    /// [`add_mapping`](Self::add_mapping) at the leaf.
    fn add_mapping_leaf(
        &mut self,
        table: &mut PageTable,
        flags: MmuFlags,
        cursor: &mut MappingCursor,
    ) -> Result<(), PagingError> {
        debug_assert!(PageTableLevel::Pt.is_aligned(cursor.size));

        let terminal = self.policy.terminal_flags(PageTableLevel::Pt, flags);
        let mut clf = CacheLineFlusher::new(self.policy.needs_cache_flushes());
        let ps = PageTableLevel::Pt.page_size();

        for index in PageTableLevel::Pt.index_of(cursor.vaddr)..ENTRIES_PER_TABLE {
            if cursor.size == 0 {
                break;
            }

            if table.load(index).present() {
                return Err(PagingError::AlreadyExists);
            }

            self.update_entry(
                &mut clf,
                PageTableLevel::Pt,
                cursor.vaddr,
                table,
                index,
                cursor.paddr,
                terminal,
                false,
            );
            cursor.paddr += ps;
            cursor.vaddr += ps;
            cursor.size -= ps;
        }

        Ok(())
    }

    /// Re-protect the range described by `cursor` underneath `table`.
    ///
    /// Holes are tolerated (skipped), tables are never created or freed, and
    /// nothing below can fail the caller: a large page that cannot be
    /// shattered is unmapped whole and refilled later by the fault path.
    pub(crate) fn update_mapping(
        &mut self,
        table: &mut PageTable,
        flags: MmuFlags,
        level: PageTableLevel,
        cursor: &mut MappingCursor,
    ) {
        trace!(
            "protect level={level:?} vaddr={} size={:#x}",
            cursor.vaddr, cursor.size
        );

        if level == PageTableLevel::Pt {
            return self.update_mapping_leaf(table, flags, cursor);
        }

        let terminal = self.policy.terminal_flags(level, flags);
        let mut clf = CacheLineFlusher::new(self.policy.needs_cache_flushes());
        let ps = level.page_size();

        for index in level.index_of(cursor.vaddr)..ENTRIES_PER_TABLE {
            if cursor.size == 0 {
                break;
            }

            let mut entry = table.load(index);
            if !entry.present() {
                cursor.skip_entry(level);
                continue;
            }

            if entry.large() {
                // Fully covered: rewrite in place, frame preserved.
                if level.is_aligned(cursor.vaddr.as_u64()) && cursor.size >= ps {
                    self.update_entry(
                        &mut clf,
                        level,
                        cursor.vaddr,
                        table,
                        index,
                        entry.frame(level),
                        terminal | PtFlags::LARGE,
                        true,
                    );
                    cursor.vaddr += ps;
                    cursor.size -= ps;
                    continue;
                }
                // Partial: shatter, or failing that drop the mapping whole
                // and let the fault path bring it back with new permissions.
                let page_vaddr = cursor.vaddr.align_down(ps);
                if self
                    .split_large_page(level, page_vaddr, table, index)
                    .is_err()
                {
                    self.unmap_entry(&mut clf, level, cursor.vaddr, table, index, true);
                    cursor.skip_entry(level);
                    continue;
                }
                entry = table.load(index);
            }

            self.update_mapping(self.table(entry.table_addr()), flags, level.lower(), cursor);

            debug_assert!(cursor.size == 0 || level.is_aligned(cursor.vaddr.as_u64()));
        }
    }

    /// [`update_mapping`](Self::update_mapping) at the leaf.
    fn update_mapping_leaf(
        &mut self,
        table: &mut PageTable,
        flags: MmuFlags,
        cursor: &mut MappingCursor,
    ) {
        debug_assert!(PageTableLevel::Pt.is_aligned(cursor.size));

        let terminal = self.policy.terminal_flags(PageTableLevel::Pt, flags);
        let mut clf = CacheLineFlusher::new(self.policy.needs_cache_flushes());
        let ps = PageTableLevel::Pt.page_size();

        for index in PageTableLevel::Pt.index_of(cursor.vaddr)..ENTRIES_PER_TABLE {
            if cursor.size == 0 {
                break;
            }

            let entry = table.load(index);
            if entry.present() {
                self.update_entry(
                    &mut clf,
                    PageTableLevel::Pt,
                    cursor.vaddr,
                    table,
                    index,
                    entry.frame(PageTableLevel::Pt),
                    terminal,
                    true,
                );
            }
            cursor.vaddr += ps;
            cursor.size -= ps;
        }
    }

    /// Find the entry and level that translate `vaddr`.
    ///
    /// Read-only: no flushes, no shootdowns.
    pub(crate) fn get_mapping(
        &self,
        table: &PageTable,
        vaddr: VirtAddr,
        level: PageTableLevel,
    ) -> Result<(PageTableLevel, PtEntry), PagingError> {
        let entry = table.load(level.index_of(vaddr));
        if !entry.present() {
            return Err(PagingError::NotFound);
        }
        if entry.is_terminal(level) {
            return Ok((level, entry));
        }
        self.get_mapping(self.table(entry.table_addr()), vaddr, level.lower())
    }

    /// Free empty tables along the path of `vaddr`, bottom-up.
    ///
    /// Companion to the top-level mapping rollback: a walk that failed
    /// mid-descent may have created a chain of tables it never populated.
    /// The prefix unmap cannot see them (nothing under them was mapped), so
    /// the failure path is pruned explicitly to keep the frame count honest
    /// and the tree free of empty linked tables.
    pub(crate) fn prune_empty_tables(
        &mut self,
        table: &mut PageTable,
        level: PageTableLevel,
        vaddr: VirtAddr,
    ) {
        if level == PageTableLevel::Pt {
            return;
        }

        let index = level.index_of(vaddr);
        let entry = table.load(index);
        if !entry.present() || entry.large() {
            return;
        }

        let sub_phys = entry.table_addr();
        self.prune_empty_tables(self.table(sub_phys), level.lower(), vaddr);

        if self.table(sub_phys).is_empty() {
            debug!("pruning empty {:?} table {sub_phys}", level.lower());
            let mut clf = CacheLineFlusher::new(self.policy.needs_cache_flushes());
            self.unmap_entry(&mut clf, level, vaddr, table, index, false);
            self.frames.free_table(sub_phys);
            *self.pages -= 1;
        }
    }
}
