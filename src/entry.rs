//! The immutable, content-addressed unit of the log.
//!
//! An entry carries its payload, a Lamport clock, the hashes of its
//! parents and an ed25519 signature over the canonical encoding of all of
//! them. The entry's own hash is a pure function of its wire bytes and is
//! assigned once the entry is durably in the block store.

use std::cmp::Ordering;
use std::fmt::{self, Debug, Display};
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::access::AccessController;
use crate::clock::LamportClock;
use crate::encoding::Encoding;
use crate::hash::Hash;
use crate::keys::{Keypair, PublicKey, Signature};
use crate::sealed::{Decrypter, Encrypter, MaybeEncrypted, SealError, SealedValue};
use crate::store::BlockStore;

/// Identifier of a causal branch.
///
/// Roots mint a fresh one (the hash of random or seeded bytes);
/// descendants inherit from the parent with the longest chain.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainId([u8; 32]);

impl ChainId {
    /// A fresh random chain id.
    pub fn random() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    /// Derive a chain id deterministically from a seed.
    pub fn from_seed(seed: &[u8]) -> Self {
        ChainId(*Hash::new(seed).as_bytes())
    }

    /// Raw bytes of the id.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainId({})", hex::encode(self.0))
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Opaque encoded payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(Bytes);

impl Payload {
    /// Wrap already-encoded payload bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Payload(bytes.into())
    }

    /// The encoded bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.0
    }
}

impl SealedValue for Payload {
    fn to_sealed_bytes(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    fn from_sealed_bytes(bytes: &[u8]) -> Result<Self, SealError> {
        Ok(Payload(Bytes::copy_from_slice(bytes)))
    }
}

/// The signature an entry carries: the writer's key plus the ed25519
/// signature over the canonical signing payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySignature {
    /// Key of the writer that signed the entry.
    pub public_key: PublicKey,
    /// Signature over the canonical signing payload.
    pub signature: Signature,
}

impl SealedValue for EntrySignature {
    fn to_sealed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        out.extend_from_slice(self.public_key.as_bytes());
        out.extend_from_slice(&self.signature.to_bytes());
        out
    }

    fn from_sealed_bytes(bytes: &[u8]) -> Result<Self, SealError> {
        if bytes.len() != 96 {
            return Err(SealError::Decode("signature must be 96 bytes".into()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes[..32]);
        let public_key = PublicKey::from_bytes(&key)
            .map_err(|_| SealError::Decode("invalid signer key".into()))?;
        let mut sig = [0u8; 64];
        sig.copy_from_slice(&bytes[32..]);
        Ok(EntrySignature {
            public_key,
            signature: Signature::from_bytes(&sig),
        })
    }
}

/// Errors from [`Entry::create`].
#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    /// An explicit clock was not strictly ahead of every parent.
    #[error("clock time {clock} is not ahead of parent clock time {parent}")]
    CausalityViolation {
        /// The explicit clock's time.
        clock: u64,
        /// The newest parent time.
        parent: u64,
    },
    /// The access controller rejected the entry.
    #[error("append rejected by access controller")]
    AccessDenied,
    /// Encryption recipients were configured without an encrypter.
    #[error("encryption recipients configured but no encrypter available")]
    EncryptionMissing,
    /// A parent's clock is sealed and has not been revealed.
    #[error("parent entry clock is sealed; reveal it before appending")]
    SealedParentClock,
    /// Sealing a field failed.
    #[error("sealing failed: {0}")]
    Seal(#[from] SealError),
    /// Payload encoding failed.
    #[error("payload encoding failed: {0}")]
    Encoding(#[source] anyhow::Error),
    /// The block store refused or mangled the entry.
    #[error("block store error: {0}")]
    Store(#[source] anyhow::Error),
}

/// Errors from decoding an entry's wire bytes.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The bytes were not a valid entry.
    #[error("invalid entry bytes: {0}")]
    Wire(#[from] postcard::Error),
}

/// Errors from [`Entry::verify_signature`].
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// The signature field could not be revealed.
    #[error("signature field could not be revealed: {0}")]
    Seal(#[from] SealError),
    /// The signature did not check out.
    #[error("invalid signature on entry {0}")]
    BadSignature(Hash),
}

/// Per-field encryption setup for entry creation.
pub struct EncryptionScheme<'a> {
    /// Capability used to seal fields.
    pub encrypter: &'a dyn Encrypter,
    /// Recipients of the payload; empty leaves it plaintext.
    pub payload_recipients: &'a [PublicKey],
    /// Recipients of the clock; empty leaves it plaintext.
    pub clock_recipients: &'a [PublicKey],
    /// Recipients of the signature; empty leaves it plaintext.
    pub signature_recipients: &'a [PublicKey],
}

impl Debug for EncryptionScheme<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionScheme")
            .field("payload_recipients", &self.payload_recipients.len())
            .field("clock_recipients", &self.clock_recipients.len())
            .field("signature_recipients", &self.signature_recipients.len())
            .finish()
    }
}

/// Options for [`Entry::create`].
pub struct CreateOptions<'a, T> {
    /// Payload codec.
    pub encoding: Encoding<T>,
    /// Parent entries. Empty for a root entry.
    pub next: Vec<Arc<Entry<T>>>,
    /// Explicit chain id for a root entry.
    pub gid: Option<ChainId>,
    /// Seed to derive the chain id from, for a root entry.
    pub gid_seed: Option<&'a [u8]>,
    /// Explicit clock; must be strictly ahead of every parent.
    pub clock: Option<LamportClock>,
    /// Per-field encryption, if any.
    pub encryption: Option<EncryptionScheme<'a>>,
    /// Append gate, if any.
    pub access: Option<&'a dyn AccessController<T>>,
}

impl<'a, T> CreateOptions<'a, T> {
    /// Options for a plain entry with the given codec and parents.
    pub fn new(encoding: Encoding<T>, next: Vec<Arc<Entry<T>>>) -> Self {
        CreateOptions {
            encoding,
            next,
            gid: None,
            gid_seed: None,
            clock: None,
            encryption: None,
            access: None,
        }
    }
}

/// An entry in the log.
pub struct Entry<T> {
    gid: ChainId,
    clock: MaybeEncrypted<LamportClock>,
    payload: MaybeEncrypted<Payload>,
    signature: MaybeEncrypted<EntrySignature>,
    next: Vec<Hash>,
    forks: Vec<Hash>,
    max_chain_length: u64,
    // forward-compatibility slots, always zero today
    state: u8,
    reserved: u8,
    hash: Hash,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Entry {
            gid: self.gid,
            clock: self.clock.clone(),
            payload: self.payload.clone(),
            signature: self.signature.clone(),
            next: self.next.clone(),
            forks: self.forks.clone(),
            max_chain_length: self.max_chain_length,
            state: self.state,
            reserved: self.reserved,
            hash: self.hash,
            _marker: PhantomData,
        }
    }
}

impl<T> Debug for Entry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("hash", &self.hash)
            .field("gid", &self.gid)
            .field("clock", &self.clock)
            .field("payload", &self.payload)
            .field("next", &self.next)
            .field("max_chain_length", &self.max_chain_length)
            .finish_non_exhaustive()
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl<T> Eq for Entry<T> {}

// wire form; field order is the serialized layout and must not change
#[derive(Serialize)]
struct WireRef<'a> {
    gid: &'a ChainId,
    payload: &'a MaybeEncrypted<Payload>,
    signature: &'a MaybeEncrypted<EntrySignature>,
    clock: &'a MaybeEncrypted<LamportClock>,
    max_chain_length: [u8; 8],
    state: u8,
    reserved: u8,
    next: &'a [Hash],
    forks: &'a [Hash],
}

#[derive(Deserialize)]
struct WireOwned {
    gid: ChainId,
    payload: MaybeEncrypted<Payload>,
    signature: MaybeEncrypted<EntrySignature>,
    clock: MaybeEncrypted<LamportClock>,
    max_chain_length: [u8; 8],
    state: u8,
    reserved: u8,
    next: Vec<Hash>,
    forks: Vec<Hash>,
}

impl<T> Entry<T> {
    /// Create, sign and persist a new entry.
    ///
    /// The clock defaults to one tick past the newest parent (or zero for
    /// roots); an explicit clock must be strictly ahead of every parent.
    /// The chain id is inherited from the parent with the longest chain,
    /// ties broken by later clock, then smaller id.
    pub async fn create<S: BlockStore>(
        store: &S,
        keypair: &Keypair,
        data: &T,
        opts: CreateOptions<'_, T>,
    ) -> Result<Arc<Entry<T>>, CreateError> {
        let payload_bytes = (opts.encoding.encoder)(data).map_err(CreateError::Encoding)?;

        // parents, deduplicated by hash keeping the last occurrence
        let parents = dedup_by_hash(&opts.next);

        let mut max_parent_time = None;
        for parent in &parents {
            let clock = parent.clock.get().ok_or(CreateError::SealedParentClock)?;
            let time = clock.time();
            max_parent_time = Some(max_parent_time.map_or(time, |m: u64| m.max(time)));
        }

        let clock = match opts.clock {
            Some(clock) => {
                if let Some(parent) = max_parent_time.filter(|&m| clock.time() <= m) {
                    return Err(CreateError::CausalityViolation {
                        clock: clock.time(),
                        parent,
                    });
                }
                clock
            }
            None => LamportClock::new(keypair.public(), max_parent_time.map_or(0, |m| m + 1)),
        };

        let gid = match select_gid(&parents)? {
            Some(inherited) => inherited,
            None => opts
                .gid
                .or_else(|| opts.gid_seed.map(ChainId::from_seed))
                .unwrap_or_else(ChainId::random),
        };

        let max_chain_length = 1 + parents
            .iter()
            .map(|p| p.max_chain_length)
            .max()
            .unwrap_or(0);

        let next: Vec<Hash> = parents.iter().map(|p| p.hash).collect();
        let forks: Vec<Hash> = Vec::new();
        let (state, reserved) = (0u8, 0u8);

        let clock_field = seal_or_plain(
            clock,
            opts.encryption.as_ref().map(|s| (s.encrypter, s.clock_recipients)),
        )?;
        let payload_field = seal_or_plain(
            Payload::new(payload_bytes),
            opts.encryption.as_ref().map(|s| (s.encrypter, s.payload_recipients)),
        )?;

        let signing = signing_payload(
            &gid,
            &payload_field.repr_bytes(),
            &clock_field.repr_bytes(),
            &next,
            &forks,
            state,
            reserved,
        );
        let signature = EntrySignature {
            public_key: keypair.public(),
            signature: keypair.sign(&signing),
        };
        let signature_field = seal_or_plain(
            signature,
            opts.encryption.as_ref().map(|s| (s.encrypter, s.signature_recipients)),
        )?;

        // the hash is a pure function of the wire bytes; computing it up
        // front lets the access gate see the finished entry
        let mut entry = Entry {
            gid,
            clock: clock_field,
            payload: payload_field,
            signature: signature_field,
            next,
            forks,
            max_chain_length,
            state,
            reserved,
            hash: Hash::from_bytes([0u8; 32]),
            _marker: PhantomData,
        };
        let bytes = entry.to_bytes().map_err(CreateError::Store)?;
        entry.hash = Hash::new(&bytes);

        if let Some(access) = opts.access {
            if !access.can_append(&entry) {
                return Err(CreateError::AccessDenied);
            }
        }

        let stored = store
            .put(Bytes::from(bytes))
            .await
            .map_err(CreateError::Store)?;
        if stored != entry.hash {
            return Err(CreateError::Store(anyhow::anyhow!(
                "store returned hash {stored}, expected {}",
                entry.hash
            )));
        }

        Ok(Arc::new(entry))
    }

    /// Decode an entry from its wire bytes. The hash is recomputed from
    /// the bytes themselves, so it cannot be spoofed independently.
    pub fn from_bytes(bytes: &[u8]) -> Result<Entry<T>, DecodeError> {
        let wire: WireOwned = postcard::from_bytes(bytes)?;
        Ok(Entry {
            gid: wire.gid,
            clock: wire.clock,
            payload: wire.payload,
            signature: wire.signature,
            next: wire.next,
            forks: wire.forks,
            max_chain_length: u64::from_le_bytes(wire.max_chain_length),
            state: wire.state,
            reserved: wire.reserved,
            hash: Hash::new(bytes),
            _marker: PhantomData,
        })
    }

    /// Canonical wire bytes of this entry.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let wire = WireRef {
            gid: &self.gid,
            payload: &self.payload,
            signature: &self.signature,
            clock: &self.clock,
            max_chain_length: self.max_chain_length.to_le_bytes(),
            state: self.state,
            reserved: self.reserved,
            next: &self.next,
            forks: &self.forks,
        };
        Ok(postcard::to_stdvec(&wire)?)
    }

    /// Verify the entry's signature against its canonical signing payload.
    ///
    /// The payload and clock stay sealed; only the signature field needs
    /// revealing, since the signature covers the wire representation.
    pub fn verify_signature(&self, keys: Option<&dyn Decrypter>) -> Result<(), VerifyError> {
        let sig = self.signature.reveal(keys)?;
        let signing = signing_payload(
            &self.gid,
            &self.payload.repr_bytes(),
            &self.clock.repr_bytes(),
            &self.next,
            &self.forks,
            self.state,
            self.reserved,
        );
        sig.public_key
            .verify(&signing, &sig.signature)
            .map_err(|_| VerifyError::BadSignature(self.hash))
    }

    /// The content address of this entry.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// The causal branch this entry belongs to.
    pub fn gid(&self) -> ChainId {
        self.gid
    }

    /// Hashes of the parent entries.
    pub fn next(&self) -> &[Hash] {
        &self.next
    }

    /// Reserved fork pointers; always empty today.
    pub fn forks(&self) -> &[Hash] {
        &self.forks
    }

    /// Length of the longest root path ending at this entry.
    pub fn max_chain_length(&self) -> u64 {
        self.max_chain_length
    }

    /// The (maybe sealed) Lamport clock.
    pub fn clock(&self) -> &MaybeEncrypted<LamportClock> {
        &self.clock
    }

    /// The (maybe sealed) payload.
    pub fn payload(&self) -> &MaybeEncrypted<Payload> {
        &self.payload
    }

    /// The (maybe sealed) signature.
    pub fn signature(&self) -> &MaybeEncrypted<EntrySignature> {
        &self.signature
    }

    /// Reveal and decode the payload value.
    pub fn payload_value(
        &self,
        encoding: &Encoding<T>,
        keys: Option<&dyn Decrypter>,
    ) -> anyhow::Result<T> {
        let payload = self.payload.reveal(keys)?;
        (encoding.decoder)(payload.bytes())
    }

    /// Whether this entry is a root (has no parents).
    pub fn is_root(&self) -> bool {
        self.next.is_empty()
    }
}

fn dedup_by_hash<T>(entries: &[Arc<Entry<T>>]) -> Vec<Arc<Entry<T>>> {
    let mut out: Vec<Arc<Entry<T>>> = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(pos) = out.iter().position(|e| e.hash == entry.hash) {
            out.remove(pos);
        }
        out.push(entry.clone());
    }
    out
}

fn seal_or_plain<V: SealedValue>(
    value: V,
    encryption: Option<(&dyn Encrypter, &[PublicKey])>,
) -> Result<MaybeEncrypted<V>, CreateError> {
    match encryption {
        Some((encrypter, recipients)) if !recipients.is_empty() => {
            Ok(MaybeEncrypted::sealed(&value, encrypter, recipients)?)
        }
        _ => Ok(MaybeEncrypted::plain(value)),
    }
}

/// Pick the chain id a child inherits: longest chain first, then later
/// clock, then lexicographically smaller id. This order is load-bearing
/// for convergence; all replicas must agree on it.
fn select_gid<T>(parents: &[Arc<Entry<T>>]) -> Result<Option<ChainId>, CreateError> {
    let mut best: Option<(&Arc<Entry<T>>, u64)> = None;
    for parent in parents {
        let time = parent
            .clock
            .get()
            .ok_or(CreateError::SealedParentClock)?
            .time();
        best = Some(match best {
            None => (parent, time),
            Some((current, current_time)) => {
                let ord = parent
                    .max_chain_length
                    .cmp(&current.max_chain_length)
                    .then(time.cmp(&current_time))
                    .then(current.gid.cmp(&parent.gid));
                if ord == Ordering::Greater {
                    (parent, time)
                } else {
                    (current, current_time)
                }
            }
        });
    }
    Ok(best.map(|(entry, _)| entry.gid))
}

fn signing_payload(
    gid: &ChainId,
    payload: &[u8],
    clock: &[u8],
    next: &[Hash],
    forks: &[Hash],
    state: u8,
    reserved: u8,
) -> Vec<u8> {
    fn chunk(out: &mut Vec<u8>, bytes: &[u8]) {
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(bytes);
    }
    let mut out = Vec::new();
    chunk(&mut out, gid.as_bytes());
    chunk(&mut out, payload);
    chunk(&mut out, clock);
    out.extend_from_slice(&(next.len() as u32).to_be_bytes());
    for hash in next {
        out.extend_from_slice(hash.as_bytes());
    }
    out.extend_from_slice(&(forks.len() as u32).to_be_bytes());
    for hash in forks {
        out.extend_from_slice(hash.as_bytes());
    }
    out.push(state);
    out.push(reserved);
    out
}
