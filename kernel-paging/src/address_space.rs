//! # Address Space
//!
//! One page-table tree behind one lock. The tree is rooted at an externally
//! allocated, zeroed top-level frame; intermediate tables come and go on
//! demand through the [`FrameSource`], and a [`PagingPolicy`] supplies the
//! flag encoding and TLB primitive that specialize the shared walker for
//! this particular kind of address space.
//!
//! Every public operation validates its arguments, takes the lock for the
//! whole walk, and drives one cursor to exhaustion. Failures mid-map are
//! rolled back before the lock is released, so concurrent readers through
//! the same lock never observe a half-installed range.

use log::trace;
use spin::Mutex;

use crate::PagingError;
use crate::addresses::{PhysAddr, VirtAddr};
use crate::cursor::MappingCursor;
use crate::entry::MmuFlags;
use crate::level::{PAGE_SIZE, PageTableLevel};
use crate::traits::{FrameSource, PagingPolicy};
use crate::walker::Walker;

/// Mutable tree state guarded by the address-space lock.
struct AspaceState<F> {
    frames: F,
    /// Physical address of the top-level table.
    root: PhysAddr,
    /// Intermediate table frames currently allocated below the root.
    pages: u64,
}

/// A four-level translation tree plus the policy that specializes it.
///
/// Construction does not touch the tree: the caller supplies the physical
/// address of a zeroed root frame it allocated (and will stay responsible
/// for until [`destroy`](Self::destroy)).
pub struct AddressSpace<P: PagingPolicy, F: FrameSource> {
    policy: P,
    state: Mutex<AspaceState<F>>,
}

impl<P: PagingPolicy, F: FrameSource> AddressSpace<P, F> {
    /// Bind a policy and frame source to the zeroed root table at `root`.
    pub fn new(policy: P, frames: F, root: PhysAddr) -> Self {
        debug_assert!(root.is_aligned_to(PAGE_SIZE));
        Self {
            policy,
            state: Mutex::new(AspaceState {
                frames,
                root,
                pages: 0,
            }),
        }
    }

    /// Physical address of the root table (what CR3 would be loaded with).
    pub fn root_phys(&self) -> PhysAddr {
        self.state.lock().root
    }

    /// Number of intermediate table frames currently in use.
    pub fn pages(&self) -> u64 {
        self.state.lock().pages
    }

    /// Map `phys.len()` pages at `vaddr` from a list of (not necessarily
    /// contiguous) page frames.
    ///
    /// On failure of the k-th page the first k are unmapped again and the
    /// error returned; the tree is left as it was before the call.
    pub fn map_pages(
        &self,
        vaddr: VirtAddr,
        phys: &[PhysAddr],
        flags: MmuFlags,
    ) -> Result<usize, PagingError> {
        trace!("map_pages vaddr={vaddr} count={} flags={flags:?}", phys.len());

        if !self.policy.check_vaddr(vaddr) {
            return Err(PagingError::InvalidArgs);
        }
        for &paddr in phys {
            if !self.policy.check_paddr(paddr) {
                return Err(PagingError::InvalidArgs);
            }
        }
        if phys.is_empty() {
            return Ok(0);
        }
        if !self.policy.allowed_flags(flags) {
            return Err(PagingError::InvalidArgs);
        }

        let top = self.policy.top_level();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let root = state.root;
        let mut walker = Walker {
            policy: &self.policy,
            frames: &mut state.frames,
            pages: &mut state.pages,
        };

        for (index, &paddr) in phys.iter().enumerate() {
            let page_vaddr = vaddr + index as u64 * PAGE_SIZE;
            let mut cursor = MappingCursor::new(paddr, page_vaddr, PAGE_SIZE);
            if let Err(err) = walker.add_mapping(walker.table(root), flags, top, &mut cursor) {
                Self::rollback(
                    &mut walker,
                    root,
                    top,
                    vaddr,
                    index as u64 * PAGE_SIZE,
                    cursor.vaddr,
                );
                return Err(err);
            }
            debug_assert_eq!(cursor.size, 0);
        }

        Ok(phys.len())
    }

    /// Map `count` pages of the physically contiguous range starting at
    /// `paddr` to `vaddr`.
    ///
    /// Alignment permitting, the range terminates in 2 MiB or 1 GiB entries
    /// instead of page tables full of 4 KiB ones.
    pub fn map_pages_contiguous(
        &self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        count: usize,
        flags: MmuFlags,
    ) -> Result<usize, PagingError> {
        trace!("map_pages_contiguous vaddr={vaddr} paddr={paddr} count={count} flags={flags:?}");

        if !self.policy.check_vaddr(vaddr) || !self.policy.check_paddr(paddr) {
            return Err(PagingError::InvalidArgs);
        }
        if count == 0 {
            return Ok(0);
        }
        if !self.policy.allowed_flags(flags) {
            return Err(PagingError::InvalidArgs);
        }

        let size = count as u64 * PAGE_SIZE;
        let top = self.policy.top_level();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let root = state.root;
        let mut walker = Walker {
            policy: &self.policy,
            frames: &mut state.frames,
            pages: &mut state.pages,
        };

        let mut cursor = MappingCursor::new(paddr, vaddr, size);
        match walker.add_mapping(walker.table(root), flags, top, &mut cursor) {
            Ok(()) => {
                debug_assert_eq!(cursor.size, 0);
                Ok(count)
            }
            Err(err) => {
                Self::rollback(&mut walker, root, top, vaddr, size - cursor.size, cursor.vaddr);
                Err(err)
            }
        }
    }

    /// Unmap `count` pages starting at `vaddr`.
    ///
    /// Holes in the range are fine; unmapping is idempotent. Large pages
    /// straddling the range boundary are split, or unmapped whole if the
    /// split cannot get memory.
    pub fn unmap_pages(&self, vaddr: VirtAddr, count: usize) -> Result<usize, PagingError> {
        trace!("unmap_pages vaddr={vaddr} count={count}");

        if !self.policy.check_vaddr(vaddr) {
            return Err(PagingError::InvalidArgs);
        }
        if count == 0 {
            return Ok(0);
        }

        let top = self.policy.top_level();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let root = state.root;
        let mut walker = Walker {
            policy: &self.policy,
            frames: &mut state.frames,
            pages: &mut state.pages,
        };

        let mut cursor = MappingCursor::unbacked(vaddr, count as u64 * PAGE_SIZE);
        walker.remove_mapping(walker.table(root), top, &mut cursor);
        debug_assert_eq!(cursor.size, 0);

        Ok(count)
    }

    /// Change the permissions of `count` pages starting at `vaddr` without
    /// touching their frames.
    ///
    /// Unmapped pages in the range are skipped. A large page only partially
    /// covered is split first; if the split cannot get memory the page is
    /// dropped entirely for the fault path to restore.
    pub fn protect_pages(
        &self,
        vaddr: VirtAddr,
        count: usize,
        flags: MmuFlags,
    ) -> Result<(), PagingError> {
        trace!("protect_pages vaddr={vaddr} count={count} flags={flags:?}");

        if !self.policy.check_vaddr(vaddr) {
            return Err(PagingError::InvalidArgs);
        }
        if count == 0 {
            return Ok(());
        }
        if !self.policy.allowed_flags(flags) {
            return Err(PagingError::InvalidArgs);
        }

        let top = self.policy.top_level();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let root = state.root;
        let mut walker = Walker {
            policy: &self.policy,
            frames: &mut state.frames,
            pages: &mut state.pages,
        };

        let mut cursor = MappingCursor::unbacked(vaddr, count as u64 * PAGE_SIZE);
        walker.update_mapping(walker.table(root), flags, top, &mut cursor);
        debug_assert_eq!(cursor.size, 0);

        Ok(())
    }

    /// Translate `vaddr` (any byte, not just a page base) to its physical
    /// address and effective mapping flags.
    pub fn query_vaddr(&self, vaddr: VirtAddr) -> Result<(PhysAddr, MmuFlags), PagingError> {
        trace!("query_vaddr vaddr={vaddr}");

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let root = state.root;
        let walker = Walker {
            policy: &self.policy,
            frames: &mut state.frames,
            pages: &mut state.pages,
        };

        let (level, entry) = walker.get_mapping(walker.table(root), vaddr, self.policy.top_level())?;

        // Decode the in-page offset for whichever level the walk stopped at.
        let paddr = PhysAddr::from_u64(
            entry.frame(level).as_u64() | (vaddr.as_u64() & (level.page_size() - 1)),
        );
        Ok((paddr, self.policy.pt_flags_to_mmu_flags(entry, level)))
    }

    /// Tear down the address space, releasing the root frame.
    ///
    /// The caller guarantees `[base, base + size)` — the range this address
    /// space was responsible for — holds no mappings any more; debug builds
    /// verify that against the root table. Entries outside the range may
    /// belong to a table shared with another address space and are not
    /// checked.
    pub fn destroy(self, base: VirtAddr, size: u64) {
        let mut state = self.state.into_inner();

        #[cfg(not(debug_assertions))]
        let _ = (base, size);
        #[cfg(debug_assertions)]
        if size > 0 {
            let top = self.policy.top_level();
            let table = unsafe { state.frames.table_mut(state.root) };
            let mut start = top.index_of(base);
            let mut end = top.index_of(base + (size - 1));
            // Skip a first table shared across the range boundary; include
            // the last one if the range fills it out.
            if !top.is_aligned(base.as_u64()) {
                start += 1;
            }
            if top.is_aligned(base.as_u64().wrapping_add(size)) {
                end += 1;
            }
            for index in start..end {
                debug_assert!(
                    !table.load(index).present(),
                    "destroying an address space with live mappings (root index {index})"
                );
            }
        }

        let root = state.root;
        state.frames.free_table(root);
    }

    /// Undo a failed map: unmap the `mapped` bytes that were installed
    /// starting at `base`, then prune any empty tables left on the path of
    /// the address the walk failed at.
    ///
    /// Cannot itself fail (unmapping allocates nothing), so the error that
    /// triggered it stays the only error the caller sees.
    fn rollback(
        walker: &mut Walker<'_, P, F>,
        root: PhysAddr,
        top: PageTableLevel,
        base: VirtAddr,
        mapped: u64,
        failed_at: VirtAddr,
    ) {
        if mapped > 0 {
            let mut cursor = MappingCursor::unbacked(base, mapped);
            walker.remove_mapping(walker.table(root), top, &mut cursor);
            debug_assert_eq!(cursor.size, 0);
        }
        walker.prune_empty_tables(walker.table(root), top, failed_at);
    }
}
