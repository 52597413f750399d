//! Optionally encrypted entry fields.
//!
//! Clock, payload and signature of an entry each travel either in
//! plaintext or sealed to a set of recipients. A sealed field must be
//! explicitly revealed with a [`Decrypter`] before it can be read; there
//! is no accessor that silently hands back undecrypted data. Revealing
//! is idempotent and memoized.
//!
//! Sealing uses `crypto_box` (x25519 + chacha20poly1305) with the
//! recipient keys derived from ed25519 identities, and an ephemeral
//! sender key per envelope.

use std::fmt::{self, Debug};
use std::sync::OnceLock;

use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::ChaChaBox;
use serde::{Deserialize, Serialize};

use crate::keys::{Keypair, PublicKey};

pub(crate) const NONCE_LEN: usize = 24;

/// Errors from sealing or revealing entry fields.
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    /// A sealed field was read without a decryption capability.
    #[error("field is sealed and no decryption capability was provided")]
    NoCapability,
    /// The envelope is not addressed to any key we hold.
    #[error("sealed field is not addressed to us")]
    NotForUs,
    /// Sealing was requested without any recipients.
    #[error("sealing requires at least one recipient")]
    NoRecipients,
    /// The underlying cipher failed.
    #[error("crypto failure: {0}")]
    Crypto(String),
    /// The revealed bytes did not decode into the expected field shape.
    #[error("invalid field bytes: {0}")]
    Decode(String),
}

/// Values that can live inside a [`MaybeEncrypted`] box.
///
/// The byte form is canonical: it is what gets sealed, signed and hashed.
pub trait SealedValue: Sized {
    /// Canonical byte form of the value.
    fn to_sealed_bytes(&self) -> Vec<u8>;
    /// Decode the canonical byte form.
    fn from_sealed_bytes(bytes: &[u8]) -> Result<Self, SealError>;
}

fn public_ed_box(key: &ed25519_dalek::VerifyingKey) -> crypto_box::PublicKey {
    crypto_box::PublicKey::from(key.to_montgomery())
}

fn secret_ed_box(key: &ed25519_dalek::SigningKey) -> crypto_box::SecretKey {
    crypto_box::SecretKey::from(key.to_scalar())
}

/// Capability to seal field bytes for a set of recipients.
pub trait Encrypter: Send + Sync {
    /// Seal `plaintext` so that each of `recipients` can open it.
    fn seal(&self, plaintext: &[u8], recipients: &[PublicKey]) -> Result<Envelope, SealError>;
}

/// Capability to open sealed field bytes.
pub trait Decrypter: Send + Sync {
    /// Open an envelope addressed to one of our keys.
    fn open(&self, envelope: &Envelope) -> Result<Vec<u8>, SealError>;
}

/// Field encryption keyed off an ed25519 identity, via its x25519 form.
pub struct BoxKeys {
    secret: crypto_box::SecretKey,
    public: crypto_box::PublicKey,
}

impl Debug for BoxKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoxKeys({})", hex::encode(self.public.as_bytes()))
    }
}

impl BoxKeys {
    /// Derive the encryption keys belonging to a signing identity.
    pub fn new(keypair: &Keypair) -> Self {
        let secret = secret_ed_box(keypair.signing_key());
        let public = secret.public_key();
        BoxKeys { secret, public }
    }
}

impl Encrypter for BoxKeys {
    fn seal(&self, plaintext: &[u8], recipients: &[PublicKey]) -> Result<Envelope, SealError> {
        if recipients.is_empty() {
            return Err(SealError::NoRecipients);
        }
        let ephemeral = crypto_box::SecretKey::generate(&mut OsRng);
        let ephemeral_public = ephemeral.public_key();
        let mut seals = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let their_box = public_ed_box(recipient.verifying_key());
            let chacha = ChaChaBox::new(&their_box, &ephemeral);
            let nonce = ChaChaBox::generate_nonce(&mut OsRng);
            let mut ciphertext = chacha
                .encrypt(&nonce, plaintext)
                .map_err(|e| SealError::Crypto(format!("{e:?}")))?;
            ciphertext.extend_from_slice(&nonce);
            seals.push(RecipientSeal {
                recipient: *their_box.as_bytes(),
                ciphertext,
            });
        }
        Ok(Envelope {
            ephemeral: *ephemeral_public.as_bytes(),
            seals,
        })
    }
}

impl Decrypter for BoxKeys {
    fn open(&self, envelope: &Envelope) -> Result<Vec<u8>, SealError> {
        let ours = self.public.as_bytes();
        let seal = envelope
            .seals
            .iter()
            .find(|s| &s.recipient == ours)
            .ok_or(SealError::NotForUs)?;
        if seal.ciphertext.len() <= NONCE_LEN {
            return Err(SealError::Crypto("sealed field too short".into()));
        }
        let split = seal.ciphertext.len() - NONCE_LEN;
        let nonce: [u8; NONCE_LEN] = seal.ciphertext[split..]
            .try_into()
            .expect("length checked above");
        let ephemeral_public = crypto_box::PublicKey::from(envelope.ephemeral);
        let chacha = ChaChaBox::new(&ephemeral_public, &self.secret);
        chacha
            .decrypt(&nonce.into(), &seal.ciphertext[..split])
            .map_err(|_| SealError::Crypto("decryption failed".into()))
    }
}

/// Wire form of a sealed field: the sender's ephemeral key plus one
/// ciphertext per recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    ephemeral: [u8; 32],
    seals: Vec<RecipientSeal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RecipientSeal {
    recipient: [u8; 32],
    ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Repr {
    Plain(Vec<u8>),
    Sealed(Envelope),
}

/// An entry field that is either plaintext or sealed.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
pub struct MaybeEncrypted<T> {
    repr: Repr,
    #[serde(skip)]
    cache: OnceLock<T>,
}

impl<T: SealedValue> MaybeEncrypted<T> {
    /// Wrap a plaintext value.
    pub fn plain(value: T) -> Self {
        let repr = Repr::Plain(value.to_sealed_bytes());
        let cache = OnceLock::new();
        let _ = cache.set(value);
        MaybeEncrypted { repr, cache }
    }

    /// Seal a value for the given recipients.
    pub fn sealed(
        value: &T,
        encrypter: &dyn Encrypter,
        recipients: &[PublicKey],
    ) -> Result<Self, SealError> {
        let envelope = encrypter.seal(&value.to_sealed_bytes(), recipients)?;
        Ok(MaybeEncrypted {
            repr: Repr::Sealed(envelope),
            cache: OnceLock::new(),
        })
    }

    /// Whether the field travels sealed.
    pub fn is_sealed(&self) -> bool {
        matches!(self.repr, Repr::Sealed(_))
    }

    /// The revealed value, if it has been revealed (or was plaintext and
    /// already decoded).
    pub fn get(&self) -> Option<&T> {
        self.cache.get()
    }

    /// Reveal the value, decrypting if necessary. Idempotent; the result
    /// is memoized so later `get`/`reveal` calls are free.
    pub fn reveal(&self, keys: Option<&dyn Decrypter>) -> Result<&T, SealError> {
        if let Some(value) = self.cache.get() {
            return Ok(value);
        }
        let bytes = match &self.repr {
            Repr::Plain(bytes) => bytes.clone(),
            Repr::Sealed(envelope) => keys.ok_or(SealError::NoCapability)?.open(envelope)?,
        };
        let value = T::from_sealed_bytes(&bytes)?;
        // a concurrent reveal may have won the race; both decode the same bytes
        let _ = self.cache.set(value);
        Ok(self.cache.get().expect("cache populated above"))
    }

    /// The bytes as they travel on the wire: the plaintext canonical form,
    /// or the serialized envelope. This is what signatures cover.
    pub fn repr_bytes(&self) -> Vec<u8> {
        match &self.repr {
            Repr::Plain(bytes) => bytes.clone(),
            Repr::Sealed(envelope) => {
                postcard::to_stdvec(envelope).expect("envelope serialization is infallible")
            }
        }
    }
}

impl<T: Clone> Clone for MaybeEncrypted<T> {
    fn clone(&self) -> Self {
        let cache = OnceLock::new();
        if let Some(value) = self.cache.get() {
            let _ = cache.set(value.clone());
        }
        MaybeEncrypted {
            repr: self.repr.clone(),
            cache,
        }
    }
}

impl<T> Debug for MaybeEncrypted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Plain(bytes) => write!(f, "Plain({} bytes)", bytes.len()),
            Repr::Sealed(envelope) => write!(f, "Sealed({} recipients)", envelope.seals.len()),
        }
    }
}

impl<T> PartialEq for MaybeEncrypted<T> {
    fn eq(&self, other: &Self) -> bool {
        self.repr == other.repr
    }
}

impl<T> Eq for MaybeEncrypted<T> {}
