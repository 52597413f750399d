//! The log: a hash-linked DAG of entries with G-Set merge semantics.
//!
//! A [`Log`] owns the indices for one replica. `append` extends the
//! frontier with a locally signed entry; `join` unions in entries from
//! another replica and recomputes the frontier. Joins commute and are
//! idempotent: replicas that have seen the same entries hold identical
//! state, regardless of delivery order.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::{self, Debug};
use std::sync::Arc;

use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::access::AccessController;
use crate::clock::{HybridLogicalClock, LamportClock};
use crate::encoding::Encoding;
use crate::entry::{
    ChainId, CreateError, CreateOptions, EncryptionScheme, Entry, VerifyError,
};
use crate::fetch::{fetch_all, FetchError, FetchOptions};
use crate::hash::Hash;
use crate::index::{EntryIndex, HeadsIndex, NextsIndex};
use crate::keys::{Keypair, PublicKey};
use crate::ordering::{last_write_wins, strict, SortFn};
use crate::sealed::{Decrypter, Encrypter, SealError};
use crate::store::BlockStore;
use crate::traverse::Traversal;

/// Bound on log growth: once `max_length` is exceeded, the log prunes
/// itself down to `cut_to_length` entries.
#[derive(Debug, Clone, Copy)]
pub struct TrimOptions {
    /// Prune once the log grows past this.
    pub max_length: usize,
    /// Prune down to this many entries.
    pub cut_to_length: usize,
}

/// Per-log encryption setup.
///
/// Recipients decide which fields of new entries travel sealed; the
/// decrypter is used to reveal sealed fields of incoming entries.
/// Configuring recipients without an encrypter is an error surfaced on
/// the first append.
#[derive(Default)]
pub struct EncryptionConfig {
    /// Capability used to seal fields of new entries.
    pub encrypter: Option<Arc<dyn Encrypter>>,
    /// Capability used to reveal sealed fields of incoming entries.
    pub decrypter: Option<Arc<dyn Decrypter>>,
    /// Recipients of new payloads; empty leaves them plaintext.
    pub payload_recipients: Vec<PublicKey>,
    /// Recipients of new clocks; empty leaves them plaintext.
    pub clock_recipients: Vec<PublicKey>,
    /// Recipients of new signatures; empty leaves them plaintext.
    pub signature_recipients: Vec<PublicKey>,
}

impl EncryptionConfig {
    fn wants_encryption(&self) -> bool {
        !(self.payload_recipients.is_empty()
            && self.clock_recipients.is_empty()
            && self.signature_recipients.is_empty())
    }
}

impl Debug for EncryptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("encrypter", &self.encrypter.is_some())
            .field("decrypter", &self.decrypter.is_some())
            .field("payload_recipients", &self.payload_recipients.len())
            .field("clock_recipients", &self.clock_recipients.len())
            .field("signature_recipients", &self.signature_recipients.len())
            .finish()
    }
}

/// Callback invoked when a multi-branch append leaves some branches
/// without any head: the given chain ids were fully subsumed.
pub type OnGidsShadowed = Box<dyn Fn(&[ChainId]) + Send + Sync>;

/// Configuration for a [`Log`].
pub struct LogOptions<T> {
    /// Log identity; random if not given. Travels in snapshots.
    pub id: Option<Bytes>,
    /// Payload codec.
    pub encoding: Encoding<T>,
    /// Canonical entry order.
    pub sort: SortFn<T>,
    /// Append gate, if any.
    pub access: Option<Arc<dyn AccessController<T>>>,
    /// Field encryption setup.
    pub encryption: EncryptionConfig,
    /// Growth bound, if any.
    pub trim: Option<TrimOptions>,
    /// Branch-consolidation callback, if any.
    pub on_gids_shadowed: Option<OnGidsShadowed>,
}

impl<T> LogOptions<T> {
    /// Options with the given codec and everything else defaulted.
    pub fn new(encoding: Encoding<T>) -> Self {
        LogOptions {
            id: None,
            encoding,
            sort: last_write_wins,
            access: None,
            encryption: EncryptionConfig::default(),
            trim: None,
            on_gids_shadowed: None,
        }
    }
}

impl<T> Debug for LogOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogOptions")
            .field("id", &self.id)
            .field("trim", &self.trim)
            .finish_non_exhaustive()
    }
}

impl<T: Serialize + serde::de::DeserializeOwned> Default for LogOptions<T> {
    fn default() -> Self {
        Self::new(crate::encoding::json_encoding())
    }
}

/// Options for a single append.
pub struct AppendOptions<'a, T> {
    /// Explicit parents instead of the current heads.
    pub next: Option<Vec<Arc<Entry<T>>>>,
    /// Sign with a different identity than the log's.
    pub keypair: Option<&'a Keypair>,
    /// Explicit timestamp; must be ahead of every parent.
    pub timestamp: Option<u64>,
}

impl<T> Default for AppendOptions<'_, T> {
    fn default() -> Self {
        AppendOptions {
            next: None,
            keypair: None,
            timestamp: None,
        }
    }
}

/// Options for [`Log::join`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JoinOptions {
    /// Verify every incoming entry's signature; the join fails without
    /// mutating anything if one is invalid.
    pub verify_signatures: bool,
    /// Prune to this length after merging.
    pub size: Option<usize>,
}

/// What a join did.
#[derive(Debug, Clone, Copy, Default)]
pub struct JoinOutcome {
    /// Number of entries merged in.
    pub merged: usize,
}

/// Errors from [`Log::join`].
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// An incoming entry failed signature verification.
    #[error(transparent)]
    Verify(#[from] VerifyError),
    /// An incoming entry's clock could not be revealed.
    #[error("incoming entry clock could not be revealed: {0}")]
    Seal(#[from] SealError),
}

/// Errors from snapshot and load operations.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// The snapshot block is not in the store.
    #[error("snapshot block {0} not found")]
    Missing(Hash),
    /// The snapshot bytes did not decode.
    #[error("invalid snapshot bytes: {0}")]
    Decode(#[from] postcard::Error),
    /// The block store failed.
    #[error("block store error: {0}")]
    Store(#[source] anyhow::Error),
    /// Fetching referenced entries failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// A fetched entry could not be absorbed.
    #[error(transparent)]
    Join(#[from] JoinError),
}

/// Anything a log can merge from: a frontier plus entry lookup.
pub trait JoinSource<T> {
    /// The source's current frontier.
    fn heads(&self) -> Vec<Arc<Entry<T>>>;
    /// Look up an entry the source holds.
    fn entry(&self, hash: &Hash) -> Option<Arc<Entry<T>>>;
}

// minimal pointer needed to reconstruct a log: everything else is
// reachable by following `next` from the heads
#[derive(Debug, Serialize, Deserialize)]
struct LogSnapshot {
    id: Vec<u8>,
    heads: Vec<Hash>,
}

/// One replica of the log.
pub struct Log<T> {
    id: Bytes,
    keypair: Keypair,
    encoding: Encoding<T>,
    sort: SortFn<T>,
    entries: EntryIndex<T>,
    heads: HeadsIndex,
    nexts: NextsIndex,
    hlc: HybridLogicalClock,
    access: Option<Arc<dyn AccessController<T>>>,
    encryption: EncryptionConfig,
    trim: Option<TrimOptions>,
    on_gids_shadowed: Option<OnGidsShadowed>,
    // memoized results of forward walks from a hash to the frontier
    heads_from: HashMap<Hash, BTreeSet<Hash>>,
}

impl<T> Debug for Log<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Log")
            .field("id", &hex::encode(&self.id))
            .field("len", &self.entries.len())
            .field("heads", &self.heads.len())
            .finish_non_exhaustive()
    }
}

impl<T> JoinSource<T> for Log<T> {
    fn heads(&self) -> Vec<Arc<Entry<T>>> {
        Log::heads(self)
    }

    fn entry(&self, hash: &Hash) -> Option<Arc<Entry<T>>> {
        self.entries.get(hash).cloned()
    }
}

impl<T> Log<T> {
    /// Create an empty log.
    pub fn new(keypair: Keypair, opts: LogOptions<T>) -> Self {
        let id = opts.id.unwrap_or_else(|| {
            let mut bytes = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut bytes);
            Bytes::copy_from_slice(&bytes)
        });
        Log {
            id,
            keypair,
            encoding: opts.encoding,
            sort: opts.sort,
            entries: EntryIndex::default(),
            heads: HeadsIndex::default(),
            nexts: NextsIndex::default(),
            hlc: HybridLogicalClock::new(),
            access: opts.access,
            encryption: opts.encryption,
            trim: opts.trim,
            on_gids_shadowed: opts.on_gids_shadowed,
            heads_from: HashMap::new(),
        }
    }

    /// Load a log by following `next` chains from the given heads,
    /// optionally bounded to the `length` most recent entries.
    pub async fn from_entry<S: BlockStore>(
        store: &S,
        keypair: Keypair,
        heads: &[Hash],
        length: Option<usize>,
        opts: LogOptions<T>,
    ) -> Result<Log<T>, SnapshotError> {
        let mut log = Log::new(keypair, opts);
        let fetched = fetch_all::<T, S>(
            store,
            heads,
            FetchOptions {
                length,
                decrypter: log.encryption.decrypter.clone(),
                ..FetchOptions::default()
            },
        )
        .await?;
        for entry in &fetched {
            entry
                .clock()
                .reveal(log.decrypter())
                .map_err(JoinError::Seal)?;
        }
        for entry in &fetched {
            log.absorb_entry(entry);
        }
        log.recompute_heads();
        Ok(log)
    }

    /// Persist the minimal pointer to this log and return its address.
    pub async fn to_multihash<S: BlockStore>(&self, store: &S) -> Result<Hash, SnapshotError> {
        let snapshot = LogSnapshot {
            id: self.id.to_vec(),
            heads: self.head_hashes(),
        };
        let bytes = postcard::to_stdvec(&snapshot)?;
        store
            .put(Bytes::from(bytes))
            .await
            .map_err(SnapshotError::Store)
    }

    /// Reload a log from a snapshot address produced by
    /// [`Log::to_multihash`].
    pub async fn from_multihash<S: BlockStore>(
        store: &S,
        keypair: Keypair,
        hash: Hash,
        length: Option<usize>,
        mut opts: LogOptions<T>,
    ) -> Result<Log<T>, SnapshotError> {
        let bytes = store
            .get(hash)
            .await
            .map_err(SnapshotError::Store)?
            .ok_or(SnapshotError::Missing(hash))?;
        let snapshot: LogSnapshot = postcard::from_bytes(&bytes)?;
        opts.id = Some(Bytes::from(snapshot.id));
        Self::from_entry(store, keypair, &snapshot.heads, length, opts).await
    }

    /// The log's identity.
    pub fn id(&self) -> &Bytes {
        &self.id
    }

    /// Number of locally known entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry by hash.
    pub fn get(&self, hash: &Hash) -> Option<&Arc<Entry<T>>> {
        self.entries.get(hash)
    }

    /// Whether the entry is locally known.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains(hash)
    }

    /// The current frontier, canonically newest first.
    pub fn heads(&self) -> Vec<Arc<Entry<T>>> {
        let mut heads: Vec<_> = self
            .heads
            .iter()
            .filter_map(|h| self.entries.get(h).cloned())
            .collect();
        heads.sort_by(|a, b| strict(self.sort, b.as_ref(), a.as_ref()));
        heads
    }

    /// Hashes of the current frontier, canonically newest first.
    pub fn head_hashes(&self) -> Vec<Hash> {
        self.heads().iter().map(|e| e.hash()).collect()
    }

    /// All entries, oldest first in canonical order.
    pub fn values(&self) -> Vec<Arc<Entry<T>>> {
        let mut all: Vec<_> =
            Traversal::new(&self.entries, self.sort, self.heads()).collect();
        all.reverse();
        all
    }

    /// Traverse from the given roots in canonical descending order,
    /// optionally bounded by count or by an inclusive end hash.
    pub fn traverse(
        &self,
        roots: impl IntoIterator<Item = Arc<Entry<T>>>,
        amount: Option<usize>,
        end: Option<Hash>,
    ) -> Vec<Arc<Entry<T>>> {
        let mut traversal = Traversal::new(&self.entries, self.sort, roots);
        if let Some(end) = end {
            traversal = traversal.until(end);
        }
        match amount {
            Some(n) => traversal.take(n).collect(),
            None => traversal.collect(),
        }
    }

    /// The boundary of what is locally loaded: entries whose parents are
    /// not all present (roots included), canonically newest first.
    pub fn tails(&self) -> Vec<Arc<Entry<T>>> {
        let mut tails: Vec<_> = self
            .entries
            .iter()
            .filter(|e| {
                e.next().is_empty() || e.next().iter().any(|p| !self.entries.contains(p))
            })
            .cloned()
            .collect();
        tails.sort_by(|a, b| strict(self.sort, b.as_ref(), a.as_ref()));
        tails
    }

    /// Parent hashes referenced locally but not present: what a partial
    /// replica still has to fetch.
    pub fn tail_hashes(&self) -> Vec<Hash> {
        let missing: BTreeSet<Hash> = self
            .entries
            .iter()
            .flat_map(|e| e.next().iter().copied())
            .filter(|p| !self.entries.contains(p))
            .collect();
        missing.into_iter().collect()
    }

    /// The current heads reachable forward from a historical entry:
    /// which heads shadow it. Memoized per starting hash.
    pub fn get_heads(&mut self, from: &Hash) -> Vec<Arc<Entry<T>>> {
        if !self.heads_from.contains_key(from) {
            let mut found = BTreeSet::new();
            let mut visited = HashSet::new();
            let mut stack = vec![*from];
            while let Some(hash) = stack.pop() {
                if !visited.insert(hash) {
                    continue;
                }
                match self.nexts.children(&hash) {
                    Some(children) if !children.is_empty() => {
                        stack.extend(children.iter().copied());
                    }
                    _ => {
                        if self.heads.contains(&hash) {
                            found.insert(hash);
                        }
                    }
                }
            }
            self.heads_from.insert(*from, found);
        }
        let hashes = &self.heads_from[from];
        let mut heads: Vec<_> = hashes
            .iter()
            .filter_map(|h| self.entries.get(h).cloned())
            .collect();
        heads.sort_by(|a, b| strict(self.sort, b.as_ref(), a.as_ref()));
        heads
    }

    /// Append a value, signing it and extending the frontier.
    pub async fn append<S: BlockStore>(
        &mut self,
        store: &S,
        data: &T,
        opts: AppendOptions<'_, T>,
    ) -> Result<Arc<Entry<T>>, CreateError> {
        let keypair = opts
            .keypair
            .cloned()
            .unwrap_or_else(|| self.keypair.clone());
        let parents = match opts.next {
            Some(next) => next,
            None => self.heads(),
        };
        let time = opts.timestamp.unwrap_or_else(|| self.hlc.now());
        let clock = LamportClock::new(keypair.public(), time);

        let scheme = if self.encryption.wants_encryption() {
            let encrypter = self
                .encryption
                .encrypter
                .as_deref()
                .ok_or(CreateError::EncryptionMissing)?;
            Some(EncryptionScheme {
                encrypter,
                payload_recipients: &self.encryption.payload_recipients,
                clock_recipients: &self.encryption.clock_recipients,
                signature_recipients: &self.encryption.signature_recipients,
            })
        } else {
            None
        };

        let entry = Entry::create(
            store,
            &keypair,
            data,
            CreateOptions {
                encoding: self.encoding,
                next: parents.clone(),
                gid: None,
                gid_seed: None,
                clock: Some(clock),
                encryption: scheme,
                access: self.access.as_deref(),
            },
        )
        .await?;

        self.hlc.update(time);
        // explicit parents may not be indexed yet (fast-forward appends)
        for parent in &parents {
            self.absorb_entry(parent);
        }
        self.absorb_entry(&entry);

        // heads the new entry consumed leave the frontier; the rest stay
        let parent_gids: BTreeSet<ChainId> = parents.iter().map(|p| p.gid()).collect();
        for parent in entry.next() {
            self.heads.del(parent);
        }
        self.heads.put(entry.hash());
        self.heads_from.clear();

        if parent_gids.len() > 1 {
            if let Some(callback) = &self.on_gids_shadowed {
                let head_gids: BTreeSet<ChainId> = self
                    .heads
                    .iter()
                    .filter_map(|h| self.entries.get(h))
                    .map(|e| e.gid())
                    .collect();
                let shadowed: Vec<ChainId> = parent_gids
                    .into_iter()
                    .filter(|gid| *gid != entry.gid() && !head_gids.contains(gid))
                    .collect();
                if !shadowed.is_empty() {
                    callback(&shadowed);
                }
            }
        }

        if let Some(trim) = self.trim {
            if self.entries.len() > trim.max_length {
                self.prune(trim.cut_to_length);
            }
        }

        Ok(entry)
    }

    /// Merge another replica's entries into this log.
    ///
    /// Work is bounded to the suffix of history this log has not seen:
    /// the walk back from the source's heads stops at anything already
    /// known. When `verify_signatures` is set, every candidate is checked
    /// before any index is touched, so a bad signature aborts the whole
    /// join without partial state.
    pub fn join(
        &mut self,
        other: &impl JoinSource<T>,
        opts: JoinOptions,
    ) -> Result<JoinOutcome, JoinError> {
        let other_heads = other.heads();

        let mut queue: VecDeque<Arc<Entry<T>>> = other_heads.iter().cloned().collect();
        let mut seen: HashSet<Hash> = HashSet::new();
        let mut incoming: Vec<Arc<Entry<T>>> = Vec::new();
        while let Some(entry) = queue.pop_front() {
            if self.entries.contains(&entry.hash()) || !seen.insert(entry.hash()) {
                continue;
            }
            for parent in entry.next() {
                if self.entries.contains(parent) || seen.contains(parent) {
                    continue;
                }
                if let Some(parent_entry) = other.entry(parent) {
                    queue.push_back(parent_entry);
                }
            }
            incoming.push(entry);
        }

        for entry in &incoming {
            if opts.verify_signatures {
                entry.verify_signature(self.decrypter())?;
            }
            entry.clock().reveal(self.decrypter())?;
        }

        for entry in &incoming {
            self.absorb_entry(entry);
        }

        // frontier: candidates from both head sets survive unless a newly
        // merged entry references them or they already have a known child
        let referenced: HashSet<Hash> = incoming
            .iter()
            .flat_map(|e| e.next().iter().copied())
            .collect();
        let candidates: BTreeSet<Hash> = self
            .heads
            .iter()
            .copied()
            .chain(other_heads.iter().map(|e| e.hash()))
            .collect();
        let new_heads: Vec<Hash> = candidates
            .into_iter()
            .filter(|h| self.entries.contains(h))
            .filter(|h| !referenced.contains(h))
            .filter(|h| !self.nexts.has_children(h))
            .collect();
        self.heads.reset(new_heads);
        self.heads_from.clear();

        debug!(
            merged = incoming.len(),
            heads = self.heads.len(),
            len = self.entries.len(),
            "joined log"
        );

        if let Some(size) = opts.size {
            self.prune(size);
        }

        Ok(JoinOutcome {
            merged: incoming.len(),
        })
    }

    /// Keep only the `target` newest entries in canonical order and
    /// rebuild the indices from that suffix.
    ///
    /// Local-only: peers are not told, and a pruned entry that comes back
    /// through a later join is absorbed again.
    pub fn prune(&mut self, target: usize) {
        if target >= self.entries.len() {
            return;
        }
        let values = self.values();
        let keep: Vec<_> = values[values.len().saturating_sub(target)..].to_vec();

        self.entries.clear();
        self.nexts.clear();
        for entry in &keep {
            self.entries.insert(entry.clone());
            for parent in entry.next() {
                self.nexts.add_edge(*parent, entry.hash());
            }
        }
        let new_heads: Vec<Hash> = keep
            .iter()
            .map(|e| e.hash())
            .filter(|h| !self.nexts.has_children(h))
            .collect();
        self.heads.reset(new_heads);
        self.heads_from.clear();

        debug!(len = self.entries.len(), "pruned log");
    }

    /// Recursively delete the given entries and all their ancestors from
    /// every index.
    pub fn remove_all(&mut self, from: impl IntoIterator<Item = Hash>) {
        let mut stack: Vec<Hash> = from.into_iter().collect();
        while let Some(hash) = stack.pop() {
            if let Some(entry) = self.entries.remove(&hash) {
                self.heads.del(&hash);
                self.nexts.remove_node(&hash);
                for parent in entry.next() {
                    self.nexts.remove_edge(parent, &hash);
                    stack.push(*parent);
                }
            }
        }
        self.heads_from.clear();
    }

    fn decrypter(&self) -> Option<&dyn Decrypter> {
        self.encryption.decrypter.as_deref()
    }

    fn absorb_entry(&mut self, entry: &Arc<Entry<T>>) -> bool {
        if !self.entries.insert(entry.clone()) {
            return false;
        }
        for parent in entry.next() {
            self.nexts.add_edge(*parent, entry.hash());
        }
        if let Some(clock) = entry.clock().get() {
            self.hlc.update(clock.time());
        }
        true
    }

    fn recompute_heads(&mut self) {
        let new_heads: Vec<Hash> = self
            .entries
            .iter()
            .map(|e| e.hash())
            .filter(|h| !self.nexts.has_children(h))
            .collect();
        self.heads.reset(new_heads);
        self.heads_from.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::json_encoding;
    use crate::store::MemBlockStore;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn new_log(keypair: Keypair) -> Log<String> {
        Log::new(keypair, LogOptions::new(json_encoding()))
    }

    fn setup() -> (MemBlockStore, Log<String>) {
        let keypair = Keypair::generate(&mut rand::thread_rng());
        (MemBlockStore::new(), new_log(keypair))
    }

    async fn append(log: &mut Log<String>, store: &MemBlockStore, data: &str) -> Arc<Entry<String>> {
        log.append(store, &data.to_string(), AppendOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_append_updates_heads() {
        let (store, mut log) = setup();
        let a1 = append(&mut log, &store, "helloA1").await;
        assert_eq!(log.len(), 1);
        assert_eq!(log.head_hashes(), vec![a1.hash()]);

        let a2 = append(&mut log, &store, "helloA2").await;
        assert_eq!(log.len(), 2);
        assert_eq!(log.head_hashes(), vec![a2.hash()]);
        assert_eq!(a2.next(), &[a1.hash()]);
    }

    #[tokio::test]
    async fn test_values_ascending() {
        let (store, mut log) = setup();
        for i in 0..5 {
            append(&mut log, &store, &format!("v{i}")).await;
        }
        let values = log.values();
        assert_eq!(values.len(), 5);
        let payloads: Vec<String> = values
            .iter()
            .map(|e| e.payload_value(&json_encoding(), None).unwrap())
            .collect();
        assert_eq!(payloads, vec!["v0", "v1", "v2", "v3", "v4"]);
    }

    #[tokio::test]
    async fn test_tails() {
        let (store, mut log) = setup();
        let first = append(&mut log, &store, "root").await;
        append(&mut log, &store, "child").await;
        // only the root has no parents
        let tails = log.tails();
        assert_eq!(tails.len(), 1);
        assert_eq!(tails[0].hash(), first.hash());
        assert!(log.tail_hashes().is_empty());
    }

    #[tokio::test]
    async fn test_get_heads_forward_walk() {
        let (store, mut log) = setup();
        let first = append(&mut log, &store, "a").await;
        append(&mut log, &store, "b").await;
        let last = append(&mut log, &store, "c").await;

        let heads = log.get_heads(&first.hash());
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].hash(), last.hash());
        // memoized second call agrees
        assert_eq!(log.get_heads(&first.hash())[0].hash(), last.hash());
    }

    #[tokio::test]
    async fn test_traverse_bounded_and_until() {
        let (store, mut log) = setup();
        let mut entries = Vec::new();
        for i in 0..6 {
            entries.push(append(&mut log, &store, &format!("t{i}")).await);
        }
        let heads = log.heads();

        let first_two = log.traverse(heads.clone(), Some(2), None);
        assert_eq!(
            first_two.iter().map(|e| e.hash()).collect::<Vec<_>>(),
            vec![entries[5].hash(), entries[4].hash()]
        );

        let until = log.traverse(heads, None, Some(entries[3].hash()));
        assert_eq!(until.len(), 3);
        assert_eq!(until.last().unwrap().hash(), entries[3].hash());
    }

    #[tokio::test]
    async fn test_prune_keeps_suffix() {
        let (store, mut log) = setup();
        for i in 0..10 {
            append(&mut log, &store, &format!("p{i}")).await;
        }
        log.prune(3);
        assert_eq!(log.len(), 3);
        let payloads: Vec<String> = log
            .values()
            .iter()
            .map(|e| e.payload_value(&json_encoding(), None).unwrap())
            .collect();
        assert_eq!(payloads, vec!["p7", "p8", "p9"]);
        // the oldest survivor's parent is gone but tolerated
        assert_eq!(log.tail_hashes().len(), 1);
        assert_eq!(log.heads().len(), 1);

        // pruning to more than we have is a no-op
        log.prune(100);
        assert_eq!(log.len(), 3);
    }

    #[tokio::test]
    async fn test_trim_policy_prunes_on_append() {
        let keypair = Keypair::generate(&mut rand::thread_rng());
        let store = MemBlockStore::new();
        let mut log: Log<String> = Log::new(
            keypair,
            LogOptions {
                trim: Some(TrimOptions {
                    max_length: 5,
                    cut_to_length: 3,
                }),
                ..LogOptions::new(json_encoding())
            },
        );
        for i in 0..6 {
            log.append(&store, &format!("t{i}"), AppendOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(log.len(), 3);
    }

    #[tokio::test]
    async fn test_remove_all() {
        let (store, mut log) = setup();
        for i in 0..4 {
            append(&mut log, &store, &format!("r{i}")).await;
        }
        let heads = log.head_hashes();
        log.remove_all(heads);
        assert!(log.is_empty());
        assert!(log.heads().is_empty());
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let (store, mut log1) = setup();
        let keypair2 = Keypair::generate(&mut rand::thread_rng());
        let mut log2 = new_log(keypair2);

        append(&mut log1, &store, "a").await;
        append(&mut log2, &store, "b").await;

        let first = log1.join(&log2, JoinOptions::default()).unwrap();
        assert_eq!(first.merged, 1);
        let second = log1.join(&log2, JoinOptions::default()).unwrap();
        assert_eq!(second.merged, 0);
        assert_eq!(log1.len(), 2);
        assert_eq!(log1.heads().len(), 2);
    }

    #[tokio::test]
    async fn test_join_fast_forwards_heads() {
        let (store, mut log1) = setup();
        let keypair2 = Keypair::generate(&mut rand::thread_rng());
        let mut log2 = new_log(keypair2);

        append(&mut log1, &store, "base").await;
        log2.join(&log1, JoinOptions::default()).unwrap();
        // log2 extends the shared history
        let newer = append(&mut log2, &store, "newer").await;

        log1.join(&log2, JoinOptions::default()).unwrap();
        // the old head was superseded
        assert_eq!(log1.head_hashes(), vec![newer.hash()]);
    }

    #[tokio::test]
    async fn test_join_verify_rejects_tampered_entry() {
        let (store, mut log1) = setup();
        let keypair2 = Keypair::generate(&mut rand::thread_rng());
        let mut log2 = new_log(keypair2);
        let good = append(&mut log2, &store, "good").await;

        // a source handing out a forged copy of the entry
        let mut bytes = good.to_bytes().unwrap();
        bytes[1] ^= 0x01;
        let forged = Arc::new(Entry::<String>::from_bytes(&bytes).unwrap());
        struct Forged(Arc<Entry<String>>);
        impl JoinSource<String> for Forged {
            fn heads(&self) -> Vec<Arc<Entry<String>>> {
                vec![self.0.clone()]
            }
            fn entry(&self, hash: &Hash) -> Option<Arc<Entry<String>>> {
                (self.0.hash() == *hash).then(|| self.0.clone())
            }
        }

        let err = log1
            .join(
                &Forged(forged),
                JoinOptions {
                    verify_signatures: true,
                    size: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, JoinError::Verify(_)));
        // nothing was merged
        assert!(log1.is_empty());

        // the honest entry passes
        log1.join(
            &log2,
            JoinOptions {
                verify_signatures: true,
                size: None,
            },
        )
        .unwrap();
        assert_eq!(log1.len(), 1);
    }

    #[tokio::test]
    async fn test_gid_shadow_callback() {
        let shadowed_count = Arc::new(AtomicUsize::new(0));
        let counter = shadowed_count.clone();
        let keypair = Keypair::generate(&mut rand::thread_rng());
        let store = MemBlockStore::new();
        let mut log: Log<String> = Log::new(
            keypair,
            LogOptions {
                on_gids_shadowed: Some(Box::new(move |gids| {
                    counter.fetch_add(gids.len(), AtomicOrdering::SeqCst);
                })),
                ..LogOptions::new(json_encoding())
            },
        );

        let keypair2 = Keypair::generate(&mut rand::thread_rng());
        let mut other = new_log(keypair2);
        append(&mut log, &store, "mine").await;
        append(&mut other, &store, "theirs").await;
        log.join(&other, JoinOptions::default()).unwrap();
        assert_eq!(log.heads().len(), 2);

        // merging both branches consolidates one gid away
        append(&mut log, &store, "merge").await;
        assert_eq!(log.heads().len(), 1);
        assert_eq!(shadowed_count.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_append_with_explicit_parents_keeps_other_heads() {
        let (store, mut log) = setup();
        let a = append(&mut log, &store, "a").await;
        let b = append(&mut log, &store, "b").await;
        // fork off the older entry explicitly
        let forked = log
            .append(
                &store,
                &"fork".to_string(),
                AppendOptions {
                    next: Some(vec![a.clone()]),
                    ..AppendOptions::default()
                },
            )
            .await
            .unwrap();
        let heads = log.head_hashes();
        assert_eq!(heads.len(), 2);
        assert!(heads.contains(&b.hash()));
        assert!(heads.contains(&forked.hash()));
    }
}
