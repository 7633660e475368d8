//! # Membership Digests
//!
//! A pull request tells the peer what we already have, so the peer only
//! answers with what we are missing. Sending every value hash would blow the
//! packet budget within a few hundred nodes, so we send a bloom filter over
//! the hashes instead. False positives cost us a value we will fetch on a
//! later round (the keys are re-randomised every round); false negatives are
//! impossible.
//!
//! ## Partitioning
//!
//! One filter has a fixed bit budget. When the table is large the hash space
//! is split by its top `mask_bits` bits and one [`CrdsFilter`] is built per
//! partition, each in its own pull request. A peer serving a request only
//! considers values whose hash falls inside the request's partition.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{BLOOM_FALSE_RATE, BLOOM_MAX_BITS};
use crate::crypto::hash_prefix_u64;

// ---------------------------------------------------------------------------
// Bloom
// ---------------------------------------------------------------------------

/// A plain bloom filter over 32-byte hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bloom {
    keys: Vec<u64>,
    bits: Vec<u64>,
    num_bits: u64,
    num_set: u64,
}

impl Bloom {
    /// An empty filter with `num_bits` bits (rounded up to a whole word) and
    /// the given hash keys.
    pub fn new(num_bits: usize, keys: Vec<u64>) -> Self {
        let num_bits = num_bits.max(1);
        let words = num_bits.div_ceil(64);
        Self {
            keys,
            bits: vec![0u64; words],
            num_bits: num_bits as u64,
            num_set: 0,
        }
    }

    /// Sizes a filter for `num_items` at `false_rate`, capped at `max_bits`,
    /// with fresh random keys.
    pub fn random<R: Rng + ?Sized>(
        rng: &mut R,
        num_items: usize,
        false_rate: f64,
        max_bits: usize,
    ) -> Self {
        let num_items = num_items.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let ideal_bits = (-(num_items * false_rate.ln()) / (ln2 * ln2)).ceil();
        let num_bits = (ideal_bits.max(1.0) as usize).min(max_bits.max(1));
        let num_keys = ((num_bits as f64 / num_items) * ln2).round().max(1.0) as usize;
        let keys = (0..num_keys).map(|_| rng.gen()).collect();
        Self::new(num_bits, keys)
    }

    /// Adds `hash` to the set.
    pub fn add(&mut self, hash: &[u8; 32]) {
        for key in &self.keys {
            let pos = self.pos(hash, *key);
            let (word, bit) = ((pos / 64) as usize, pos % 64);
            if self.bits[word] & (1 << bit) == 0 {
                self.bits[word] |= 1 << bit;
                self.num_set += 1;
            }
        }
    }

    /// True if `hash` may be in the set. False means definitely absent.
    pub fn contains(&self, hash: &[u8; 32]) -> bool {
        self.keys.iter().all(|key| {
            let pos = self.pos(hash, *key);
            let (word, bit) = ((pos / 64) as usize, pos % 64);
            self.bits
                .get(word)
                .is_some_and(|w| w & (1 << bit) != 0)
        })
    }

    /// Number of bits set.
    pub fn num_set(&self) -> u64 {
        self.num_set
    }

    /// A filter received off the wire may lie about its own shape.
    pub fn is_well_formed(&self) -> bool {
        self.num_bits > 0
            && !self.keys.is_empty()
            && self.bits.len() as u64 == self.num_bits.div_ceil(64)
    }

    fn pos(&self, hash: &[u8; 32], key: u64) -> u64 {
        // Bytes 0..8 are spent on the partition mask; use the next eight.
        let mut chunk = [0u8; 8];
        chunk.copy_from_slice(&hash[8..16]);
        (u64::from_le_bytes(chunk) ^ key) % self.num_bits
    }
}

// ---------------------------------------------------------------------------
// CrdsFilter
// ---------------------------------------------------------------------------

/// One partition of the membership digest carried by a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdsFilter {
    pub filter: Bloom,
    mask: u64,
    mask_bits: u32,
}

impl CrdsFilter {
    /// A filter accepting the whole hash space.
    pub fn new_complete(filter: Bloom) -> Self {
        Self {
            filter,
            mask: u64::MAX,
            mask_bits: 0,
        }
    }

    /// True if `hash` belongs to this filter's partition.
    pub fn test_mask(&self, hash: &[u8; 32]) -> bool {
        let ones = u64::MAX.checked_shr(self.mask_bits).unwrap_or(0);
        (hash_prefix_u64(hash) | ones) == self.mask
    }

    /// True if the caller lacks `hash`: it falls in our partition and the
    /// bloom filter does not contain it.
    pub fn is_missing(&self, hash: &[u8; 32]) -> bool {
        self.test_mask(hash) && !self.filter.contains(hash)
    }

    /// Log2 of the number of partitions the digest was split into.
    pub fn mask_bits(&self) -> u32 {
        self.mask_bits
    }

    /// Rejects filters whose mask or bloom shape is impossible.
    pub fn is_well_formed(&self) -> bool {
        if self.mask_bits >= 64 || !self.filter.is_well_formed() {
            return false;
        }
        let ones = u64::MAX.checked_shr(self.mask_bits).unwrap_or(0);
        (self.mask & ones) == ones
    }

    fn with_partition(filter: Bloom, index: u64, mask_bits: u32) -> Self {
        if mask_bits == 0 {
            return Self::new_complete(filter);
        }
        let ones = u64::MAX >> mask_bits;
        Self {
            filter,
            mask: (index << (64 - mask_bits)) | ones,
            mask_bits,
        }
    }
}

/// Builds the partitioned digest of `hashes`, one filter per partition.
///
/// The partition count is the smallest power of two at which each bloom
/// filter stays within its bit budget at the configured false rate.
pub fn build_filters<'a, R, I>(rng: &mut R, hashes: I, num_items: usize) -> Vec<CrdsFilter>
where
    R: Rng + ?Sized,
    I: IntoIterator<Item = &'a [u8; 32]>,
{
    let max_items = max_items_per_filter(BLOOM_MAX_BITS, BLOOM_FALSE_RATE);
    let mask_bits = mask_bits_for(num_items, max_items);
    let partitions = 1u64 << mask_bits;
    let per_partition = num_items.div_ceil(partitions as usize).max(1);

    let template = Bloom::random(rng, per_partition, BLOOM_FALSE_RATE, BLOOM_MAX_BITS);
    let mut filters: Vec<CrdsFilter> = (0..partitions)
        .map(|index| CrdsFilter::with_partition(template.clone(), index, mask_bits))
        .collect();

    for hash in hashes {
        let index = if mask_bits == 0 {
            0
        } else {
            (hash_prefix_u64(hash) >> (64 - mask_bits)) as usize
        };
        filters[index].filter.add(hash);
    }
    filters
}

/// How many items fit in `max_bits` at `false_rate` with the optimal
/// number of keys.
fn max_items_per_filter(max_bits: usize, false_rate: f64) -> usize {
    let ln2 = std::f64::consts::LN_2;
    let items = (max_bits as f64) * ln2 * ln2 / -false_rate.ln();
    items.floor().max(1.0) as usize
}

fn mask_bits_for(num_items: usize, max_items: usize) -> u32 {
    let ratio = num_items.div_ceil(max_items.max(1)).max(1);
    ratio.next_power_of_two().trailing_zeros().min(16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn hash(i: u64) -> [u8; 32] {
        *blake3::hash(&i.to_le_bytes()).as_bytes()
    }

    #[test]
    fn added_hashes_are_always_found() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut bloom = Bloom::random(&mut rng, 100, 0.1, BLOOM_MAX_BITS);
        for i in 0..100 {
            bloom.add(&hash(i));
        }
        assert!((0..100).all(|i| bloom.contains(&hash(i))));
        assert!(bloom.num_set() > 0);
    }

    #[test]
    fn false_positive_rate_is_reasonable() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut bloom = Bloom::random(&mut rng, 200, 0.1, BLOOM_MAX_BITS);
        for i in 0..200 {
            bloom.add(&hash(i));
        }
        let false_hits = (10_000..12_000).filter(|i| bloom.contains(&hash(*i))).count();
        assert!(false_hits < 600, "false positives: {false_hits}");
    }

    #[test]
    fn complete_filter_accepts_everything() {
        let filter = CrdsFilter::new_complete(Bloom::new(64, vec![1]));
        assert!((0..50).all(|i| filter.test_mask(&hash(i))));
        assert!(filter.is_well_formed());
    }

    #[test]
    fn partitions_cover_hash_space_exactly_once() {
        let mut rng = StdRng::seed_from_u64(3);
        let hashes: Vec<[u8; 32]> = (0..20_000).map(hash).collect();
        let filters = build_filters(&mut rng, hashes.iter(), hashes.len());
        assert!(filters.len() > 1);
        assert!(filters.iter().all(CrdsFilter::is_well_formed));

        for h in hashes.iter().take(500) {
            let owners = filters.iter().filter(|f| f.test_mask(h)).count();
            assert_eq!(owners, 1);
            assert!(filters.iter().any(|f| f.test_mask(h) && f.filter.contains(h)));
        }
    }

    #[test]
    fn small_table_uses_single_filter() {
        let mut rng = StdRng::seed_from_u64(4);
        let hashes: Vec<[u8; 32]> = (0..10).map(hash).collect();
        let filters = build_filters(&mut rng, hashes.iter(), hashes.len());
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].mask_bits(), 0);
        assert!(hashes.iter().all(|h| !filters[0].is_missing(h)));
    }

    #[test]
    fn partition_capacity_matches_bit_budget() {
        // 4096 bits at a 10% false rate hold roughly 850 hashes.
        let items = max_items_per_filter(BLOOM_MAX_BITS, BLOOM_FALSE_RATE);
        assert!((800..900).contains(&items), "{items}");
        assert_eq!(mask_bits_for(items, items), 0);
        assert_eq!(mask_bits_for(items + 1, items), 1);
        assert_eq!(mask_bits_for(items * 5, items), 3);
    }

    #[test]
    fn malformed_filters_are_detected() {
        let mut bloom = Bloom::new(128, vec![7]);
        bloom.bits.pop();
        assert!(!bloom.is_well_formed());
        assert!(!Bloom::new(128, vec![]).is_well_formed());

        let mut filter = CrdsFilter::new_complete(Bloom::new(128, vec![7]));
        filter.mask_bits = 64;
        assert!(!filter.is_well_formed());
    }
}
