//! # strand
//!
//! A peer-to-peer append-only log with CRDT merge semantics.
//!
//! Each peer holds a partially ordered, hash-linked history of signed,
//! optionally encrypted entries layered on a content-addressed block
//! store. Any two logs sharing history merge deterministically: the
//! entry set is a G-Set, so joins commute, associate and are idempotent,
//! and replicas converge to identical content-addressed state regardless
//! of delivery order.
//!
//! The pieces:
//!
//! - [`Entry`]: immutable, content-addressed, signed node of the DAG.
//! - [`Log`]: one replica; append, join, traversal, pruning, snapshots.
//! - [`LamportClock`] / [`HybridLogicalClock`]: causal timestamps.
//! - [`BlockStore`]: the storage capability the log is layered on.
//! - [`fetch_all`]: bounded concurrent retrieval of remote entries.
//!
//! ```
//! use strand::{AppendOptions, Keypair, Log, LogOptions, MemBlockStore};
//! # fn main() -> anyhow::Result<()> {
//! # let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
//! # rt.block_on(async {
//! let store = MemBlockStore::new();
//! let mut rng = rand::thread_rng();
//! let mut log: Log<String> = Log::new(Keypair::generate(&mut rng), LogOptions::default());
//!
//! log.append(&store, &"hello".to_string(), AppendOptions::default()).await?;
//! assert_eq!(log.heads().len(), 1);
//! # anyhow::Ok(())
//! # })?;
//! # Ok(()) }
//! ```

#![deny(missing_docs)]

pub mod access;
pub mod clock;
pub mod encoding;
pub mod entry;
pub mod fetch;
pub mod hash;
pub mod index;
pub mod keys;
pub mod log;
pub mod ordering;
pub mod sealed;
pub mod store;
pub mod traverse;

pub use access::{AccessController, AllowAll};
pub use clock::{HybridLogicalClock, LamportClock};
pub use encoding::{json_encoding, postcard_encoding, Encoding};
pub use entry::{
    ChainId, CreateError, CreateOptions, EncryptionScheme, Entry, EntrySignature, Payload,
};
pub use fetch::{fetch_all, FetchError, FetchOptions};
pub use hash::Hash;
pub use keys::{Keypair, PublicKey, Signature};
pub use log::{
    AppendOptions, EncryptionConfig, JoinError, JoinOptions, JoinOutcome, JoinSource, Log,
    LogOptions, SnapshotError, TrimOptions,
};
pub use ordering::{last_write_wins, sort_by_gid_then_clock, SortFn};
pub use sealed::{BoxKeys, Decrypter, Encrypter, Envelope, MaybeEncrypted, SealError};
pub use store::{BlockStore, MemBlockStore};
pub use traverse::Traversal;
