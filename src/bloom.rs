//! Approximate-set filter backing the rolling dedup engine.
//!
//! A plain bloom filter with word-packed bits and double hashing
//! (Kirsch-Mitzenmacher). Hashes are seeded xxh3 so the bit layout is
//! identical across process restarts; the snapshot file depends on that.

use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::errors::RelayError;

/// Header fields of the encoded form: num_bits, num_hashes, count.
const ENCODE_HEADER_LEN: usize = 3 * 8;

/// Space-efficient probabilistic set with one-sided false positives.
pub struct BloomFilter {
    /// Bit array packed into 64-bit words
    words: Vec<u64>,
    /// Number of addressable bits (multiple of 64)
    num_bits: u64,
    /// Number of probe positions per key
    num_hashes: u64,
    /// Number of inserts performed
    count: u64,
}

impl BloomFilter {
    /// Create a filter sized for `expected_items` inserts at the given
    /// false-positive probability.
    #[must_use]
    pub fn with_estimates(expected_items: usize, false_positive: f64) -> Self {
        // m = -n * ln(p) / ln(2)^2, rounded up to a whole word
        let ln2_sq = std::f64::consts::LN_2 * std::f64::consts::LN_2;
        let bits = (-(expected_items as f64) * false_positive.ln() / ln2_sq).ceil() as u64;
        let num_bits = bits.div_ceil(64).max(1) * 64;

        // k = (m / n) * ln(2)
        let hashes =
            ((num_bits as f64 / expected_items as f64) * std::f64::consts::LN_2).ceil() as u64;
        let num_hashes = hashes.clamp(1, 16);

        Self {
            words: vec![0u64; (num_bits / 64) as usize],
            num_bits,
            num_hashes,
            count: 0,
        }
    }

    /// Insert a key.
    pub fn insert(&mut self, key: &str) {
        let (h1, h2) = hash_pair(key.as_bytes());
        for i in 0..self.num_hashes {
            let bit = h1.wrapping_add(h2.wrapping_mul(i)) % self.num_bits;
            self.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
        self.count += 1;
    }

    /// Test membership. `false` is definitive; `true` may be a false
    /// positive at the configured rate.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let (h1, h2) = hash_pair(key.as_bytes());
        for i in 0..self.num_hashes {
            let bit = h1.wrapping_add(h2.wrapping_mul(i)) % self.num_bits;
            if self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Number of inserts performed.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Serialize to the snapshot payload form: three big-endian u64 header
    /// fields (num_bits, num_hashes, count) followed by the words, each
    /// big-endian.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENCODE_HEADER_LEN + self.words.len() * 8);
        out.extend_from_slice(&self.num_bits.to_be_bytes());
        out.extend_from_slice(&self.num_hashes.to_be_bytes());
        out.extend_from_slice(&self.count.to_be_bytes());
        for w in &self.words {
            out.extend_from_slice(&w.to_be_bytes());
        }
        out
    }

    /// Deserialize a payload produced by [`BloomFilter::encode`].
    pub fn decode(data: &[u8]) -> Result<Self, RelayError> {
        if data.len() < ENCODE_HEADER_LEN {
            return Err(RelayError::InvalidSnapshot(format!(
                "bloom payload too short: {} bytes",
                data.len()
            )));
        }
        let num_bits = u64::from_be_bytes(data[0..8].try_into().unwrap());
        let num_hashes = u64::from_be_bytes(data[8..16].try_into().unwrap());
        let count = u64::from_be_bytes(data[16..24].try_into().unwrap());

        if num_bits == 0 || num_bits % 64 != 0 {
            return Err(RelayError::InvalidSnapshot(format!(
                "bad bit count {num_bits}"
            )));
        }
        if num_hashes == 0 || num_hashes > 64 {
            return Err(RelayError::InvalidSnapshot(format!(
                "bad hash count {num_hashes}"
            )));
        }
        let body = &data[ENCODE_HEADER_LEN..];
        let expected = (num_bits / 64) as usize * 8;
        if body.len() != expected {
            return Err(RelayError::InvalidSnapshot(format!(
                "bloom payload length {} does not match bit count {}",
                body.len(),
                num_bits
            )));
        }

        let words = body
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
            .collect();

        Ok(Self {
            words,
            num_bits,
            num_hashes,
            count,
        })
    }
}

/// Two independent 64-bit hashes for double hashing.
fn hash_pair(data: &[u8]) -> (u64, u64) {
    (xxh3_64_with_seed(data, 0), xxh3_64_with_seed(data, 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_contains() {
        let mut bf = BloomFilter::with_estimates(1000, 0.001);
        for i in 0..1000 {
            bf.insert(&format!("key_{i}"));
        }
        for i in 0..1000 {
            assert!(bf.contains(&format!("key_{i}")), "key_{i} should be present");
        }
        assert_eq!(bf.count(), 1000);
    }

    #[test]
    fn test_false_positive_rate() {
        let mut bf = BloomFilter::with_estimates(10_000, 0.001);
        for i in 0..10_000 {
            bf.insert(&format!("member_{i}"));
        }

        let mut hits = 0;
        for i in 0..10_000 {
            if bf.contains(&format!("stranger_{i}")) {
                hits += 1;
            }
        }
        // 0.1% nominal; leave generous slack for hash variance
        assert!(hits < 50, "too many false positives: {hits}");
    }

    #[test]
    fn test_empty_filter_contains_nothing() {
        let bf = BloomFilter::with_estimates(100, 0.001);
        assert!(!bf.contains("anything"));
        assert_eq!(bf.count(), 0);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut bf = BloomFilter::with_estimates(500, 0.001);
        for i in 0..500 {
            bf.insert(&format!("persist_{i}"));
        }

        let restored = BloomFilter::decode(&bf.encode()).unwrap();
        assert_eq!(restored.num_bits, bf.num_bits);
        assert_eq!(restored.num_hashes, bf.num_hashes);
        assert_eq!(restored.count(), 500);
        for i in 0..500 {
            assert!(restored.contains(&format!("persist_{i}")));
        }
        assert!(!restored.contains("not_a_member"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(BloomFilter::decode(&[]).is_err());
        assert!(BloomFilter::decode(&[0u8; 10]).is_err());

        // Valid header, truncated body
        let bf = BloomFilter::with_estimates(100, 0.001);
        let mut bytes = bf.encode();
        bytes.truncate(bytes.len() - 8);
        assert!(BloomFilter::decode(&bytes).is_err());
    }
}
