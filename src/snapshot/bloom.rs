//! Bloom filters summarising diff-layer content.
//!
//! Every diff layer indexes its own entries in a `diffed` filter; `prepare`
//! unions the ancestor filters into a `cumulative` one so that a miss lets
//! reads skip every in-memory layer and go straight to disk. Filters are
//! sized for the aggregator layer at its fullest with a 2% false positive
//! target.
//!
//! Keys are reduced to 64-bit mini hashes by reading an 8-byte window of the
//! 32-byte hash at a per-process random offset, so the global population of
//! nodes does not exhibit identical bloom behaviour. Filters therefore must
//! never be serialised or transported across processes.
use crate::constant::{AGGREGATOR_ITEM_LIMIT, BLOOM_TARGET_ERROR};
use alloy_primitives::B256;
use once_cell::sync::Lazy;
use rand::Rng;

/// Byte offset into a 32-byte hash from which the 64-bit bloom key is read.
/// Randomised once per process, in `[0, 24]` so the window always fits.
static BLOOM_HASHER_OFFSET: Lazy<usize> = Lazy::new(|| rand::thread_rng().gen_range(0..=24));

/// Ideal bloom filter bit count for the aggregator item limit at the target
/// error rate.
static BLOOM_BITS: Lazy<u64> = Lazy::new(|| {
    let n = AGGREGATOR_ITEM_LIMIT as f64;
    let ln2 = std::f64::consts::LN_2;
    (n * BLOOM_TARGET_ERROR.ln() / (1.0 / 2f64.powf(ln2)).ln()).ceil() as u64
});

/// Ideal number of bits each entry sets, given the filter size and the item
/// limit.
static BLOOM_FUNCS: Lazy<u64> = Lazy::new(|| {
    let ln2 = std::f64::consts::LN_2;
    ((*BLOOM_BITS as f64 / AGGREGATOR_ITEM_LIMIT as f64) * ln2).round() as u64
});

/// Reduces an account hash to its 64-bit bloom key.
pub fn account_bloom_hash(hash: &B256) -> u64 {
    let offset = *BLOOM_HASHER_OFFSET;
    u64::from_be_bytes(hash.as_slice()[offset..offset + 8].try_into().expect("window fits"))
}

/// Reduces an (account, slot) pair to its 64-bit bloom key.
pub fn storage_bloom_hash(account_hash: &B256, slot_hash: &B256) -> u64 {
    account_bloom_hash(account_hash) ^ account_bloom_hash(slot_hash)
}

/// A fixed-shape bloom filter over 64-bit mini hashes.
#[derive(Clone, Debug)]
pub struct Bloom {
    bits: Vec<u64>,
    m: u64,
    k: u64,
    n: u64,
}

impl Bloom {
    /// Creates an empty filter with the diff-layer shape.
    pub fn new_layer_filter() -> Self {
        Self::with_shape(*BLOOM_BITS, *BLOOM_FUNCS)
    }

    /// Creates an empty filter with an explicit shape.
    pub fn with_shape(m: u64, k: u64) -> Self {
        let m = m.max(64);
        let k = k.max(1);
        Self {
            bits: vec![0u64; m.div_ceil(64) as usize],
            m,
            k,
            n: 0,
        }
    }

    /// Number of bits in the filter.
    pub fn m(&self) -> u64 {
        self.m
    }

    /// Number of bits set per entry.
    pub fn k(&self) -> u64 {
        self.k
    }

    /// Approximate number of entries added (summed across unions).
    pub fn n(&self) -> u64 {
        self.n
    }

    /// Estimated false positive rate at the current fill level.
    pub fn error_rate(&self) -> f64 {
        let k = self.k as f64;
        let n = self.n as f64;
        let m = self.m as f64;
        (1.0 - (-k * (n + 0.5) / (m - 1.0)).exp()).powf(k)
    }

    fn bit_positions(&self, hash: u64) -> impl Iterator<Item = u64> + '_ {
        // Double hashing over the caller's mini hash.
        let h2 = hash.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
        (0..self.k).map(move |i| hash.wrapping_add(i.wrapping_mul(h2)) % self.m)
    }

    /// Adds a mini hash to the filter.
    pub fn add(&mut self, hash: u64) {
        for bit in self.bit_positions(hash).collect::<Vec<_>>() {
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
        self.n += 1;
    }

    /// Whether the mini hash may be present. False means definitely absent.
    pub fn contains(&self, hash: u64) -> bool {
        self.bit_positions(hash)
            .all(|bit| self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }

    /// Unions another filter of the same shape into this one.
    ///
    /// # Panics
    /// Panics if the shapes differ; filters from different processes are
    /// never unionable by construction.
    pub fn union_in_place(&mut self, other: &Bloom) {
        assert_eq!(
            (self.m, self.k),
            (other.m, other.k),
            "bloom filter shapes differ"
        );
        for (word, other_word) in self.bits.iter_mut().zip(&other.bits) {
            *word |= other_word;
        }
        self.n += other.n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let mut bloom = Bloom::new_layer_filter();
        let hashes: Vec<u64> = (0..10_000u64).map(|i| i.wrapping_mul(0x2545f4914f6cdd1d)).collect();
        for h in &hashes {
            bloom.add(*h);
        }
        assert!(hashes.iter().all(|h| bloom.contains(*h)));
    }

    #[test]
    fn false_positive_rate_is_bounded() {
        let mut bloom = Bloom::new_layer_filter();
        for i in 0..AGGREGATOR_ITEM_LIMIT {
            bloom.add(i.wrapping_mul(0x9e3779b97f4a7c15));
        }
        let probes = 50_000u64;
        let hits = (0..probes)
            .filter(|i| bloom.contains(i.wrapping_mul(0xff51afd7ed558ccd) ^ 0xdead_beef))
            .count();
        // The target is 2%; allow generous slack for hash quirks.
        assert!((hits as f64) / (probes as f64) < 0.08, "fp rate too high: {hits}");
    }

    #[test]
    fn union_preserves_membership() {
        let mut a = Bloom::new_layer_filter();
        let mut b = Bloom::new_layer_filter();
        a.add(1);
        a.add(2);
        b.add(3);
        a.union_in_place(&b);
        assert!(a.contains(1) && a.contains(2) && a.contains(3));
        assert_eq!(a.n(), 3);
    }

    #[test]
    #[should_panic(expected = "shapes differ")]
    fn union_of_mismatched_shapes_panics() {
        let mut a = Bloom::with_shape(128, 3);
        let b = Bloom::with_shape(256, 3);
        a.union_in_place(&b);
    }

    #[test]
    fn mini_hashes_cover_account_and_storage() {
        let account = B256::repeat_byte(0x77);
        let slot = B256::repeat_byte(0x99);
        let mut bloom = Bloom::new_layer_filter();
        bloom.add(account_bloom_hash(&account));
        bloom.add(storage_bloom_hash(&account, &slot));
        assert!(bloom.contains(account_bloom_hash(&account)));
        assert!(bloom.contains(storage_bloom_hash(&account, &slot)));
        // The storage key mixes both hashes.
        assert_ne!(
            storage_bloom_hash(&account, &slot),
            account_bloom_hash(&account)
        );
    }
}
