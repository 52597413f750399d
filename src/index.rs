//! The three indices backing a log.
//!
//! Entries are stored once, as shared `Arc`s in the [`EntryIndex`]; the
//! heads and reverse-adjacency indices hold hashes only. The hash is the
//! only externally visible identity.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::entry::Entry;
use crate::hash::Hash;

/// All locally known entries of one log, by content address.
#[derive(Debug)]
pub struct EntryIndex<T> {
    map: HashMap<Hash, Arc<Entry<T>>>,
}

impl<T> Default for EntryIndex<T> {
    fn default() -> Self {
        EntryIndex {
            map: HashMap::new(),
        }
    }
}

impl<T> EntryIndex<T> {
    /// Look up an entry.
    pub fn get(&self, hash: &Hash) -> Option<&Arc<Entry<T>>> {
        self.map.get(hash)
    }

    /// Whether the entry is known.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.map.contains_key(hash)
    }

    /// Insert an entry. Inserting the same hash twice is a no-op; the
    /// hash is content-derived, so the value cannot differ.
    pub fn insert(&mut self, entry: Arc<Entry<T>>) -> bool {
        use std::collections::hash_map::Entry as MapEntry;
        match self.map.entry(entry.hash()) {
            MapEntry::Occupied(_) => false,
            MapEntry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    /// Remove an entry.
    pub fn remove(&mut self, hash: &Hash) -> Option<Arc<Entry<T>>> {
        self.map.remove(hash)
    }

    /// Number of known entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no entries are known.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate over all known entries, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Entry<T>>> {
        self.map.values()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.map.clear();
    }
}

/// The current frontier: hashes of entries with no known child.
#[derive(Debug, Default, Clone)]
pub struct HeadsIndex {
    set: BTreeSet<Hash>,
}

impl HeadsIndex {
    /// Add a head.
    pub fn put(&mut self, hash: Hash) {
        self.set.insert(hash);
    }

    /// Remove a head.
    pub fn del(&mut self, hash: &Hash) {
        self.set.remove(hash);
    }

    /// Whether the hash is currently a head.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.set.contains(hash)
    }

    /// Replace the whole frontier.
    pub fn reset(&mut self, heads: impl IntoIterator<Item = Hash>) {
        self.set = heads.into_iter().collect();
    }

    /// Iterate over head hashes.
    pub fn iter(&self) -> impl Iterator<Item = &Hash> {
        self.set.iter()
    }

    /// Number of heads.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Whether there are no heads.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Reverse adjacency: parent hash to the set of children referencing it.
///
/// Keys may be dangling (a parent we never fetched); that is what makes
/// tail queries cheap on partially loaded logs.
#[derive(Debug, Default, Clone)]
pub struct NextsIndex {
    map: HashMap<Hash, BTreeSet<Hash>>,
}

impl NextsIndex {
    /// Record that `child` references `parent`.
    pub fn add_edge(&mut self, parent: Hash, child: Hash) {
        self.map.entry(parent).or_default().insert(child);
    }

    /// Forget one edge; drops the key once no children remain.
    pub fn remove_edge(&mut self, parent: &Hash, child: &Hash) {
        if let Some(children) = self.map.get_mut(parent) {
            children.remove(child);
            if children.is_empty() {
                self.map.remove(parent);
            }
        }
    }

    /// Children referencing this hash, if any.
    pub fn children(&self, hash: &Hash) -> Option<&BTreeSet<Hash>> {
        self.map.get(hash)
    }

    /// Whether any known entry references this hash as a parent.
    pub fn has_children(&self, hash: &Hash) -> bool {
        self.map.get(hash).is_some_and(|c| !c.is_empty())
    }

    /// Forget the node entirely (its key, not the edges pointing at it).
    pub fn remove_node(&mut self, hash: &Hash) {
        self.map.remove(hash);
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.map.clear();
    }
}
