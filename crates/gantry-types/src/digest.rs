use blake2::digest::consts::U32;
use blake2::Blake2b;
use blake2::Digest as _;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

type Blake2b256 = Blake2b<U32>;

/// Content digest algorithm used for chunk addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgo {
    Blake2b256,
    Sha256,
}

impl Default for DigestAlgo {
    fn default() -> Self {
        DigestAlgo::Blake2b256
    }
}

impl DigestAlgo {
    /// Width of the digest this algorithm produces, in bits.
    pub fn bits(&self) -> usize {
        match self {
            DigestAlgo::Blake2b256 | DigestAlgo::Sha256 => 256,
        }
    }
}

/// A 32-byte content digest of one chunk's bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkDigest(pub [u8; 32]);

impl ChunkDigest {
    /// Compute the digest of `data` with the selected algorithm.
    pub fn compute(algo: DigestAlgo, data: &[u8]) -> Self {
        let mut out = [0u8; 32];
        match algo {
            DigestAlgo::Blake2b256 => {
                let mut hasher = Blake2b256::new();
                hasher.update(data);
                out.copy_from_slice(&hasher.finalize());
            }
            DigestAlgo::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                out.copy_from_slice(&hasher.finalize());
            }
        }
        ChunkDigest(out)
    }

    /// Pack the digest into `slot_count` signed 64-bit words, most-significant
    /// slot first.
    ///
    /// Each slot carries 8 digest bytes, big-endian. A digest wider than
    /// `64 * slot_count` bits is truncated; a narrower one is zero-padded in
    /// the trailing slots. Truncation is not an error here — callers warn at
    /// configuration time.
    pub fn pack_into_slots(&self, slot_count: usize) -> Vec<i64> {
        let mut slots = Vec::with_capacity(slot_count);
        for i in 0..slot_count {
            let mut word = [0u8; 8];
            let start = i * 8;
            if start < self.0.len() {
                let end = (start + 8).min(self.0.len());
                word[..end - start].copy_from_slice(&self.0[start..end]);
            }
            slots.push(i64::from_be_bytes(word));
        }
        slots
    }

    /// Inverse of [`pack_into_slots`]: reassemble the packed bytes.
    ///
    /// Returns `8 * slots.len()` bytes — the original digest truncated to the
    /// slot budget, zero-padded if the budget was wider than the digest. Used
    /// by verification tooling to compare against a freshly computed digest.
    ///
    /// [`pack_into_slots`]: ChunkDigest::pack_into_slots
    pub fn unpack_slots(slots: &[i64]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(slots.len() * 8);
        for slot in slots {
            bytes.extend_from_slice(&slot.to_be_bytes());
        }
        bytes
    }

    /// Hex-encode the full digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ChunkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkDigest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ChunkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_deterministic() {
        let data = b"hello world";
        let d1 = ChunkDigest::compute(DigestAlgo::Blake2b256, data);
        let d2 = ChunkDigest::compute(DigestAlgo::Blake2b256, data);
        assert_eq!(d1, d2);
    }

    #[test]
    fn compute_different_data_different_digest() {
        let d1 = ChunkDigest::compute(DigestAlgo::Blake2b256, b"hello");
        let d2 = ChunkDigest::compute(DigestAlgo::Blake2b256, b"world");
        assert_ne!(d1, d2);
    }

    #[test]
    fn algorithms_disagree() {
        let data = b"same data";
        let d1 = ChunkDigest::compute(DigestAlgo::Blake2b256, data);
        let d2 = ChunkDigest::compute(DigestAlgo::Sha256, data);
        assert_ne!(d1, d2);
    }

    #[test]
    fn pack_full_budget_round_trips() {
        let digest = ChunkDigest::compute(DigestAlgo::Sha256, b"round trip");
        let slots = digest.pack_into_slots(4);
        assert_eq!(slots.len(), 4);
        assert_eq!(ChunkDigest::unpack_slots(&slots), digest.0.to_vec());
    }

    #[test]
    fn pack_truncates_to_slot_budget() {
        let digest = ChunkDigest::compute(DigestAlgo::Blake2b256, b"truncate me");
        let slots = digest.pack_into_slots(3);
        assert_eq!(slots.len(), 3);
        // 3 slots carry exactly the first 24 digest bytes.
        assert_eq!(ChunkDigest::unpack_slots(&slots), digest.0[..24].to_vec());
    }

    #[test]
    fn pack_zero_pads_wide_budget() {
        let digest = ChunkDigest([0xAB; 32]);
        let slots = digest.pack_into_slots(5);
        let bytes = ChunkDigest::unpack_slots(&slots);
        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[..32], &digest.0);
        assert_eq!(&bytes[32..], &[0u8; 8]);
    }

    #[test]
    fn pack_is_most_significant_first() {
        let mut raw = [0u8; 32];
        raw[0] = 0x01;
        let slots = ChunkDigest(raw).pack_into_slots(4);
        assert_eq!(slots[0], 0x0100_0000_0000_0000_i64);
        assert_eq!(&slots[1..], &[0, 0, 0]);
    }

    #[test]
    fn pack_stable_across_calls() {
        let digest = ChunkDigest::compute(DigestAlgo::Blake2b256, b"stability");
        assert_eq!(digest.pack_into_slots(3), digest.pack_into_slots(3));
    }

    #[test]
    fn high_bit_maps_to_negative_slot() {
        let digest = ChunkDigest([0xFF; 32]);
        let slots = digest.pack_into_slots(4);
        assert!(slots.iter().all(|&s| s == -1));
        assert_eq!(ChunkDigest::unpack_slots(&slots), vec![0xFF; 32]);
    }

    #[test]
    fn zero_slot_count_packs_nothing() {
        let digest = ChunkDigest([0x42; 32]);
        assert!(digest.pack_into_slots(0).is_empty());
        assert!(ChunkDigest::unpack_slots(&[]).is_empty());
    }

    #[test]
    fn to_hex_length() {
        let digest = ChunkDigest::compute(DigestAlgo::Blake2b256, b"test");
        assert_eq!(digest.to_hex().len(), 64);
    }
}
