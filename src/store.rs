//! The content-addressed block store the log is layered on.
//!
//! The store is a capability consumed by the log: opaque byte blocks in,
//! content addresses out. Everything network- or disk-shaped lives behind
//! this seam.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::hash::Hash;

/// A content-addressed block store.
///
/// `put` must return the blake3 hash of the stored bytes; `get` returns
/// `None` for blocks the store does not have, reserving `Err` for actual
/// read failures.
pub trait BlockStore: Send + Sync {
    /// Durably store a block, returning its content address.
    fn put(&self, bytes: Bytes) -> impl Future<Output = Result<Hash>> + Send;
    /// Fetch a block by content address.
    fn get(&self, hash: Hash) -> impl Future<Output = Result<Option<Bytes>>> + Send;
}

/// In-memory block store, used by tests and local-only logs.
#[derive(Debug, Clone, Default)]
pub struct MemBlockStore {
    blocks: Arc<RwLock<BTreeMap<Hash, Bytes>>>,
}

impl MemBlockStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks held.
    pub async fn len(&self) -> usize {
        self.blocks.read().await.len()
    }

    /// Whether the store holds no blocks.
    pub async fn is_empty(&self) -> bool {
        self.blocks.read().await.is_empty()
    }

    /// Drop a block, simulating a peer that garbage-collected it.
    pub async fn remove(&self, hash: Hash) -> Option<Bytes> {
        self.blocks.write().await.remove(&hash)
    }
}

impl BlockStore for MemBlockStore {
    async fn put(&self, bytes: Bytes) -> Result<Hash> {
        let hash = Hash::new(&bytes);
        self.blocks.write().await.insert(hash, bytes);
        Ok(hash)
    }

    async fn get(&self, hash: Hash) -> Result<Option<Bytes>> {
        Ok(self.blocks.read().await.get(&hash).cloned())
    }
}
