//! Test-only capture of the hardware side effects a walk produces.
//!
//! Cache-line write-backs and TLB invalidations are recorded per thread in
//! the order they were issued, so tests can assert the store → clflush →
//! mfence → invalidate sequencing instead of trusting it.

use crate::level::PageTableLevel;
use std::cell::RefCell;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    /// `clflush` of the line-aligned address.
    CacheFlush(u64),
    /// `mfence` following a flush.
    Fence,
    /// A TLB shootdown request handed to the policy.
    TlbInvalidate {
        level: PageTableLevel,
        vaddr: u64,
        is_global: bool,
        was_terminal: bool,
    },
}

std::thread_local! {
    static EVENTS: RefCell<Vec<Event>> = const { RefCell::new(Vec::new()) };
}

pub fn record(event: Event) {
    EVENTS.with(|events| events.borrow_mut().push(event));
}

/// Drain and return everything recorded on this thread so far.
pub fn take() -> Vec<Event> {
    EVENTS.with(|events| core::mem::take(&mut *events.borrow_mut()))
}

/// The invalidations among `events`, in order.
pub fn invalidations(events: &[Event]) -> Vec<Event> {
    events
        .iter()
        .copied()
        .filter(|event| matches!(event, Event::TlbInvalidate { .. }))
        .collect()
}
