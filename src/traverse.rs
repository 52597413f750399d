//! Deterministic, resumable traversal of the entry DAG.
//!
//! The traversal keeps an explicit frontier and always yields the
//! largest remaining entry under the log's canonical order, then pushes
//! that entry's locally known parents. Bounded and partial traversals
//! are therefore deterministic and resumable: taking `n` entries and
//! later continuing yields the same sequence as taking them all at once.

use std::collections::HashSet;
use std::sync::Arc;

use crate::entry::Entry;
use crate::hash::Hash;
use crate::index::EntryIndex;
use crate::ordering::{strict, SortFn};

/// Iterator over entries reachable from a set of roots, in canonical
/// descending order.
pub struct Traversal<'a, T> {
    entries: &'a EntryIndex<T>,
    sort: SortFn<T>,
    visited: HashSet<Hash>,
    frontier: Vec<Arc<Entry<T>>>,
    end: Option<Hash>,
    done: bool,
}

impl<'a, T> Traversal<'a, T> {
    /// Start a traversal from the given roots.
    pub fn new(
        entries: &'a EntryIndex<T>,
        sort: SortFn<T>,
        roots: impl IntoIterator<Item = Arc<Entry<T>>>,
    ) -> Self {
        let mut visited = HashSet::new();
        let mut frontier = Vec::new();
        for root in roots {
            if visited.insert(root.hash()) {
                frontier.push(root);
            }
        }
        Traversal {
            entries,
            sort,
            visited,
            frontier,
            end: None,
            done: false,
        }
    }

    /// Stop after yielding the entry with this hash.
    pub fn until(mut self, end: Hash) -> Self {
        self.end = Some(end);
        self
    }

    fn pop_largest(&mut self) -> Option<Arc<Entry<T>>> {
        let (index, _) = self
            .frontier
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| strict(self.sort, a.as_ref(), b.as_ref()))?;
        Some(self.frontier.swap_remove(index))
    }
}

impl<T> Iterator for Traversal<'_, T> {
    type Item = Arc<Entry<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let entry = self.pop_largest()?;
        if self.end == Some(entry.hash()) {
            self.done = true;
        } else {
            for parent in entry.next() {
                if self.visited.contains(parent) {
                    continue;
                }
                if let Some(parent_entry) = self.entries.get(parent) {
                    self.visited.insert(*parent);
                    self.frontier.push(parent_entry.clone());
                }
            }
        }
        Some(entry)
    }
}
