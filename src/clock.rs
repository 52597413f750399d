//! Logical clocks: the per-entry Lamport clock and the per-log
//! hybrid logical clock that stamps new appends.

use std::cmp::Ordering;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::keys::PublicKey;
use crate::sealed::{SealError, SealedValue};

/// A Lamport timestamp carried by every entry.
///
/// Totally ordered: first by `time`, ties broken by the byte order of the
/// writer's public key. Immutable once assigned to an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportClock {
    id: PublicKey,
    time: u64,
}

impl LamportClock {
    /// Create a clock for the given writer at the given logical time.
    pub fn new(id: PublicKey, time: u64) -> Self {
        LamportClock { id, time }
    }

    /// The writer this clock belongs to.
    pub fn id(&self) -> &PublicKey {
        &self.id
    }

    /// The logical time.
    pub fn time(&self) -> u64 {
        self.time
    }

    /// A new clock one tick later, same writer.
    pub fn advance(&self) -> Self {
        LamportClock {
            id: self.id,
            time: self.time + 1,
        }
    }

    /// Canonical byte form: key bytes then big-endian time.
    pub fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.id.as_bytes());
        out.extend_from_slice(&self.time.to_be_bytes());
    }
}

impl PartialOrd for LamportClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LamportClock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.id.as_bytes().cmp(other.id.as_bytes()))
    }
}

impl SealedValue for LamportClock {
    fn to_sealed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(40);
        self.write_bytes(&mut out);
        out
    }

    fn from_sealed_bytes(bytes: &[u8]) -> Result<Self, SealError> {
        if bytes.len() != 40 {
            return Err(SealError::Decode("clock must be 40 bytes".into()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes[..32]);
        let id = PublicKey::from_bytes(&key)
            .map_err(|_| SealError::Decode("invalid clock identity".into()))?;
        let mut time = [0u8; 8];
        time.copy_from_slice(&bytes[32..]);
        Ok(LamportClock {
            id,
            time: u64::from_be_bytes(time),
        })
    }
}

/// Timestamp source for a log replica.
///
/// Produces strictly increasing times: each `now()` is at least one tick
/// past both the wall clock and anything previously issued or observed.
/// Folding in remote times via `update` keeps appends causally after
/// everything merged so far, at the cost of wall-clock accuracy under skew.
#[derive(Debug, Clone, Default)]
pub struct HybridLogicalClock {
    last: u64,
}

impl HybridLogicalClock {
    /// A clock that has observed nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next timestamp.
    pub fn now(&mut self) -> u64 {
        let wall = Self::wall_micros();
        let next = wall.max(self.last + 1);
        self.last = next;
        next
    }

    /// Fold in a time observed on a merged entry.
    pub fn update(&mut self, observed: u64) {
        self.last = self.last.max(observed);
    }

    /// The latest time issued or observed.
    pub fn last(&self) -> u64 {
        self.last
    }

    fn wall_micros() -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keypair;

    #[test]
    fn test_clock_order() {
        let mut rng = rand::thread_rng();
        let a = Keypair::generate(&mut rng).public();
        let b = Keypair::generate(&mut rng).public();

        let early = LamportClock::new(a, 1);
        let late = LamportClock::new(b, 2);
        assert!(early < late);

        // ties broken by key bytes
        let ta = LamportClock::new(a, 5);
        let tb = LamportClock::new(b, 5);
        assert_eq!(ta.cmp(&tb), a.as_bytes().cmp(b.as_bytes()));
    }

    #[test]
    fn test_advance() {
        let mut rng = rand::thread_rng();
        let id = Keypair::generate(&mut rng).public();
        let clock = LamportClock::new(id, 7);
        let next = clock.advance();
        assert_eq!(next.time(), 8);
        assert_eq!(next.id(), clock.id());
        assert_eq!(clock.time(), 7);
    }

    #[test]
    fn test_clock_bytes_roundtrip() {
        let mut rng = rand::thread_rng();
        let clock = LamportClock::new(Keypair::generate(&mut rng).public(), 0xdead_beef);
        let bytes = clock.to_sealed_bytes();
        let back = LamportClock::from_sealed_bytes(&bytes).unwrap();
        assert_eq!(clock, back);
    }

    #[test]
    fn test_hlc_strictly_increases() {
        let mut hlc = HybridLogicalClock::new();
        let mut prev = 0;
        for _ in 0..100 {
            let t = hlc.now();
            assert!(t > prev);
            prev = t;
        }
    }

    #[test]
    fn test_hlc_update_moves_past_remote() {
        let mut hlc = HybridLogicalClock::new();
        let local = hlc.now();
        let remote = local + 1_000_000_000;
        hlc.update(remote);
        assert!(hlc.now() > remote);

        // stale observations don't move it backwards
        let latest = hlc.last();
        hlc.update(1);
        assert_eq!(hlc.last(), latest);
    }

    proptest::proptest! {
        #[test]
        fn prop_clock_order_is_time_then_id(
            t1: u64,
            t2: u64,
            seed1: [u8; 32],
            seed2: [u8; 32],
        ) {
            let a = LamportClock::new(Keypair::from_bytes(&seed1).public(), t1);
            let b = LamportClock::new(Keypair::from_bytes(&seed2).public(), t2);
            let expected = (t1, *a.id().as_bytes()).cmp(&(t2, *b.id().as_bytes()));
            proptest::prop_assert_eq!(a.cmp(&b), expected);
            proptest::prop_assert_eq!(b.cmp(&a), expected.reverse());
        }
    }
}
