use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Fixed seed so fingerprints are stable across processes and resumes.
const FINGERPRINT_SEED: u64 = 0x5eed_0f_57a7e5;

/// Fixed-width identity surrogate for a state.
///
/// Two states with equal fingerprints are treated as the same state
/// everywhere except trace reconstruction, which replays concrete
/// transitions. Collisions are statistically negligible at 64 bits but
/// non-zero; eliminating them would require storing full states, which is an
/// explicit non-goal.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Hash a state through its canonical `Hash` stream.
    ///
    /// State types are built on ordered containers, so the hash stream is a
    /// canonical serialization of the variable-value mapping.
    pub fn of<S: Hash>(state: &S) -> Self {
        let mut hasher = XxHash64::with_seed(FINGERPRINT_SEED);
        state.hash(&mut hasher);
        Fingerprint(hasher.finish())
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    #[inline]
    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Fingerprint(u64::from_be_bytes(bytes))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fp:{:016x}", self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for Fingerprint {
    fn from(raw: u64) -> Self {
        Fingerprint(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::Fingerprint;
    use std::collections::BTreeMap;

    #[test]
    fn equal_states_fingerprint_identically() {
        let a = BTreeMap::from([("x".to_string(), 1u64), ("y".to_string(), 2)]);
        let b = BTreeMap::from([("y".to_string(), 2u64), ("x".to_string(), 1)]);
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn distinct_states_fingerprint_differently() {
        let a = BTreeMap::from([("x".to_string(), 1u64)]);
        let b = BTreeMap::from([("x".to_string(), 2u64)]);
        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn byte_round_trip() {
        let fp = Fingerprint(0xdead_beef_0123_4567);
        assert_eq!(Fingerprint::from_be_bytes(fp.to_be_bytes()), fp);
    }
}
