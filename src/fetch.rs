//! Bounded retrieval of entries from the block store.
//!
//! Given a set of starting hashes, [`fetch_all`] walks the DAG backward
//! through `next` pointers with bounded concurrency. Individual fetches
//! that time out or hit a missing block degrade to "entry not included";
//! only outright store failures abort the batch.
//!
//! Bounded mode (`length`) keeps a window of the newest clock times seen
//! so far and stops descending once an entry (and therefore all its
//! strictly older ancestors) can no longer displace the window minimum.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tracing::warn;

use crate::entry::{DecodeError, Entry};
use crate::hash::Hash;
use crate::ordering::{last_write_wins, strict};
use crate::sealed::Decrypter;
use crate::store::BlockStore;

/// Default number of concurrent block fetches.
pub const DEFAULT_CONCURRENCY: usize = 32;
/// Default per-fetch timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from [`fetch_all`].
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The block store failed outright (not a timeout or missing block).
    #[error("block store error: {0}")]
    Store(#[source] anyhow::Error),
    /// A fetched block did not decode into an entry.
    #[error("invalid entry bytes for {hash}: {source}")]
    Decode {
        /// The block that failed to decode.
        hash: Hash,
        /// The decode failure.
        source: DecodeError,
    },
}

/// Options for [`fetch_all`].
pub struct FetchOptions<T> {
    /// Fetch only enough of the graph for the `length` newest entries by
    /// clock; `None` reconstructs all reachable history.
    pub length: Option<usize>,
    /// Hashes to treat as already known and never fetch.
    pub exclude: HashSet<Hash>,
    /// Dynamic exclusion hook, consulted before enqueueing a hash.
    pub should_exclude: Option<Box<dyn Fn(&Hash) -> bool + Send + Sync>>,
    /// Concurrent fetch limit.
    pub concurrency: usize,
    /// Per-fetch timeout; an expired fetch is skipped, not fatal.
    pub timeout: Duration,
    /// Pause before each fetch, to pace load on the store.
    pub delay: Duration,
    /// Capability to reveal sealed clocks for the bounded-fetch window.
    pub decrypter: Option<Arc<dyn Decrypter>>,
    /// Progress callback, invoked for every included entry.
    pub on_fetched: Option<Box<dyn FnMut(&Arc<Entry<T>>) + Send>>,
}

impl<T> Default for FetchOptions<T> {
    fn default() -> Self {
        FetchOptions {
            length: None,
            exclude: HashSet::new(),
            should_exclude: None,
            concurrency: DEFAULT_CONCURRENCY,
            timeout: DEFAULT_TIMEOUT,
            delay: Duration::ZERO,
            decrypter: None,
            on_fetched: None,
        }
    }
}

impl<T> std::fmt::Debug for FetchOptions<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOptions")
            .field("length", &self.length)
            .field("exclude", &self.exclude.len())
            .field("concurrency", &self.concurrency)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Fetch entries reachable from `roots`, newest first.
///
/// Returns entries in canonical descending clock order, truncated to
/// `length` when bounded.
pub async fn fetch_all<T, S: BlockStore>(
    store: &S,
    roots: &[Hash],
    mut opts: FetchOptions<T>,
) -> Result<Vec<Arc<Entry<T>>>, FetchError> {
    let excluded =
        |opts: &FetchOptions<T>, hash: &Hash| opts.should_exclude.as_ref().is_some_and(|f| f(hash));
    let timeout = opts.timeout;
    let delay = opts.delay;

    let mut seen: HashSet<Hash> = opts.exclude.iter().copied().collect();
    let mut queue: VecDeque<Hash> = VecDeque::new();
    for root in roots {
        if seen.contains(root) || excluded(&opts, root) {
            continue;
        }
        seen.insert(*root);
        queue.push_back(*root);
    }

    let mut result: Vec<Arc<Entry<T>>> = Vec::new();
    // min-heap over the newest `length` clock times seen so far
    let mut window: BinaryHeap<Reverse<u64>> = BinaryHeap::new();
    let mut in_flight = FuturesUnordered::new();

    loop {
        while in_flight.len() < opts.concurrency.max(1) {
            let Some(hash) = queue.pop_front() else { break };
            in_flight.push(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                (hash, tokio::time::timeout(timeout, store.get(hash)).await)
            });
        }
        let Some((hash, outcome)) = in_flight.next().await else {
            break;
        };
        let bytes = match outcome {
            Err(_elapsed) => {
                warn!(%hash, "entry fetch timed out, skipping");
                continue;
            }
            Ok(Err(err)) => return Err(FetchError::Store(err)),
            Ok(Ok(None)) => {
                warn!(%hash, "entry missing from store, skipping");
                continue;
            }
            Ok(Ok(Some(bytes))) => bytes,
        };
        let entry = Entry::<T>::from_bytes(&bytes)
            .map_err(|source| FetchError::Decode { hash, source })?;
        let entry = Arc::new(entry);

        let time = entry
            .clock()
            .reveal(opts.decrypter.as_deref())
            .ok()
            .map(|clock| clock.time());

        let (include, descend) = match (opts.length, time) {
            (None, _) => (true, true),
            // no readable clock to window on: include conservatively
            (Some(_), None) => (true, true),
            (Some(n), Some(ts)) => {
                let filling = window.len() < n;
                let floor = window.peek().map(|Reverse(min)| *min);
                // parents are strictly older, so they only matter while
                // the window is still filling or this entry beat its floor
                (
                    filling || floor.is_some_and(|min| ts >= min),
                    filling || floor.is_some_and(|min| ts > min),
                )
            }
        };

        if include {
            if let (Some(n), Some(ts)) = (opts.length, time) {
                window.push(Reverse(ts));
                if window.len() > n {
                    window.pop();
                }
            }
            if let Some(on_fetched) = opts.on_fetched.as_mut() {
                on_fetched(&entry);
            }
            result.push(entry.clone());
        }
        if descend {
            for parent in entry.next() {
                if seen.contains(parent) || excluded(&opts, parent) {
                    continue;
                }
                seen.insert(*parent);
                queue.push_back(*parent);
            }
        }
    }

    result.sort_by(|a, b| strict(last_write_wins, b.as_ref(), a.as_ref()));
    if let Some(n) = opts.length {
        result.truncate(n);
    }
    Ok(result)
}
