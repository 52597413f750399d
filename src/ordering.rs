//! Canonical total orders over entries.
//!
//! Traversal and serialization require a *strict* total order: a
//! comparator that ever answers `Equal` for two distinct entries would
//! make traversal order depend on insertion order. [`strict`] closes that
//! hole by falling back to the content hash.

use std::cmp::Ordering;

use crate::entry::Entry;

/// A deterministic comparator over entries.
pub type SortFn<T> = fn(&Entry<T>, &Entry<T>) -> Ordering;

/// Last-write-wins: order by clock (time, then writer id). Entries whose
/// clock is sealed and unrevealed sort by hash; logs reveal clocks on
/// insert, so inside a log this branch never decides.
pub fn last_write_wins<T>(a: &Entry<T>, b: &Entry<T>) -> Ordering {
    match (a.clock().get(), b.clock().get()) {
        (Some(ca), Some(cb)) => ca.cmp(cb),
        _ => Ordering::Equal,
    }
}

/// Group by causal branch first, then order by clock within a branch.
pub fn sort_by_gid_then_clock<T>(a: &Entry<T>, b: &Entry<T>) -> Ordering {
    a.gid()
        .cmp(&b.gid())
        .then_with(|| last_write_wins(a, b))
}

/// Apply `sort`, forcing strictness: ties are broken by content hash, so
/// the result is `Equal` only for the same entry.
pub fn strict<T>(sort: SortFn<T>, a: &Entry<T>, b: &Entry<T>) -> Ordering {
    match sort(a, b) {
        Ordering::Equal => a.hash().cmp(&b.hash()),
        decided => decided,
    }
}
