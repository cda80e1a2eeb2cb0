//! BIP37 bloom filter.
//!
//! Sized from the element count and false-positive rate the same way as the
//! reference node, so peers see a filter of the expected shape. The filter
//! holds witness programs and public keys (to match outputs paying us) and
//! serialized outpoints (to match spends of our coins).

use bitcoin::p2p::message_bloom::{BloomFlags, FilterLoad};

pub const MAX_FILTER_BYTES: usize = 36_000;
pub const MAX_HASH_FUNCS: u32 = 50;
pub const DEFAULT_FP_RATE: f64 = 0.0005;
const SEED_MULTIPLIER: u32 = 0xFBA4_C795;
const LN2: f64 = std::f64::consts::LN_2;
const LN2_SQUARED: f64 = LN2 * LN2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
}

impl BloomFilter {
    pub fn new(elements: usize, fp_rate: f64, tweak: u32) -> Self {
        let elements = elements.max(1);
        let bits = (-1.0 / LN2_SQUARED * elements as f64 * fp_rate.ln()).min((MAX_FILTER_BYTES * 8) as f64);
        let bytes = ((bits as usize) / 8).max(1);
        // integer division first, as peers compute it
        let hash_funcs = (((bytes * 8) / elements) as f64 * LN2).min(MAX_HASH_FUNCS as f64) as u32;
        Self { data: vec![0; bytes], hash_funcs: hash_funcs.max(1), tweak }
    }

    /// Filter over `elements` with a random tweak.
    pub fn from_elements(elements: &[Vec<u8>], fp_rate: f64) -> Self {
        let mut filter = Self::new(elements.len(), fp_rate, rand::random());
        for e in elements {
            filter.insert(e);
        }
        filter
    }

    fn bit(&self, n: u32, item: &[u8]) -> usize {
        let seed = n.wrapping_mul(SEED_MULTIPLIER).wrapping_add(self.tweak);
        murmur3(seed, item) as usize % (self.data.len() * 8)
    }

    pub fn insert(&mut self, item: &[u8]) {
        for n in 0..self.hash_funcs {
            let bit = self.bit(n, item);
            self.data[bit >> 3] |= 1 << (bit & 7);
        }
    }

    pub fn contains(&self, item: &[u8]) -> bool {
        (0..self.hash_funcs).all(|n| {
            let bit = self.bit(n, item);
            self.data[bit >> 3] & (1 << (bit & 7)) != 0
        })
    }

    /// Rebuild from a `filterload` payload, as a peer would.
    pub fn from_filter_load(load: &FilterLoad) -> Self {
        let data = if load.filter.is_empty() { vec![0] } else { load.filter.clone() };
        Self { data, hash_funcs: load.hash_funcs, tweak: load.tweak }
    }

    pub fn hash_funcs(&self) -> u32 { self.hash_funcs }
    pub fn data(&self) -> &[u8] { &self.data }

    /// `filterload` payload. `BLOOM_UPDATE_ALL` makes peers add outpoints of
    /// matched outputs, so later spends of new coins are caught too.
    pub fn to_filter_load(&self) -> FilterLoad {
        FilterLoad { filter: self.data.clone(), hash_funcs: self.hash_funcs, tweak: self.tweak, flags: BloomFlags::All }
    }
}

/// MurmurHash3 x86 32-bit.
pub fn murmur3(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;
    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, b) in tail.iter().enumerate() {
            k ^= (*b as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }
    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn murmur3_known_vectors() {
        assert_eq!(murmur3(0, b""), 0);
        assert_eq!(murmur3(1, b""), 0x514E_28B7);
        assert_eq!(murmur3(0xffff_ffff, b""), 0x81F1_6F39);
        assert_eq!(murmur3(0, &[0, 0, 0, 0]), 0x2362_F9DE);
    }

    #[test]
    fn reference_filter_shape() {
        let mut f = BloomFilter::new(3, 0.01, 0);
        for item in [
            "99108ad8ed9bb6274d3980bab5a85c048f0950c8",
            "b5a2c786d9ef4658287ced5914b37a1b4aa32eee",
            "b9300670b4c5366e95b2699e8b18bc75e5f729c5",
        ] {
            f.insert(&hex::decode(item).unwrap());
        }
        assert_eq!(f.data(), &[0x61, 0x4e, 0x9b]);
        assert_eq!(f.hash_funcs(), 5);
        assert!(f.contains(&hex::decode("99108ad8ed9bb6274d3980bab5a85c048f0950c8").unwrap()));
        assert!(!f.contains(&hex::decode("19108ad8ed9bb6274d3980bab5a85c048f0950c8").unwrap()));
    }

    #[test]
    fn filter_load_round_trips_membership() {
        let items: Vec<Vec<u8>> = (0u8..10).map(|i| vec![i; 36]).collect();
        let ours = BloomFilter::from_elements(&items, DEFAULT_FP_RATE);
        let theirs = BloomFilter::from_filter_load(&ours.to_filter_load());
        assert_eq!(theirs, ours);
        assert!(items.iter().all(|i| theirs.contains(i)));
    }

    #[test]
    fn elements_always_match() {
        let items: Vec<Vec<u8>> = (0u8..50).map(|i| vec![i; 20]).collect();
        let f = BloomFilter::from_elements(&items, DEFAULT_FP_RATE);
        assert!(items.iter().all(|i| f.contains(i)));
        assert!(f.data().len() <= MAX_FILTER_BYTES);
    }
}
