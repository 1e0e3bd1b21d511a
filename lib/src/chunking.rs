// Copyright 2024 The Ledger Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Content-defined chunking of large values.
//!
//! Boundaries are chosen by a rolling hash over a window of bytes mapped
//! through a per-page keyed substitution table, so equal content on
//! different pages splits at different offsets (an observer cannot
//! fingerprint a page by piece sizes). Within a page, chunking depends only
//! on the content, which lets devices deduplicate the pieces they exchange.

use std::ops::Range;

use blake2::Blake2b512;
use digest::Digest as _;
use rand::Rng as _;
use rand::SeedableRng as _;
use rand_chacha::ChaCha20Rng;

/// Chunks shorter than this are never produced, except at the end of the
/// value.
pub const MIN_CHUNK_SIZE: usize = 4 << 10;

/// Hard upper bound on chunk size; also the largest piece stored without
/// chunking.
pub const MAX_CHUNK_SIZE: usize = 64 << 10;

const WINDOW_SIZE: usize = 8;
// 13 bits of the rolling hash must match, i.e. an expected boundary every
// 8 KiB past the minimum.
const BOUNDARY_MASK: u32 = (1 << 13) - 1;

/// The per-page keyed substitution table feeding the rolling hash.
#[derive(Clone)]
pub struct SplitPermutation {
    table: [u32; 256],
}

impl SplitPermutation {
    /// Derives a table from arbitrary seed material (the page's chunking
    /// key).
    pub fn new(seed: &[u8]) -> Self {
        let mut hasher = Blake2b512::new();
        hasher.update(seed);
        let hash = hasher.finalize();
        let mut rng_seed = [0u8; 32];
        rng_seed.copy_from_slice(&hash[..32]);
        let mut rng = ChaCha20Rng::from_seed(rng_seed);

        let mut table = [0u32; 256];
        for slot in &mut table {
            *slot = rng.random();
        }
        Self { table }
    }

    fn map(&self, byte: u8) -> u32 {
        self.table[usize::from(byte)]
    }
}

impl std::fmt::Debug for SplitPermutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("SplitPermutation").finish_non_exhaustive()
    }
}

/// Splits `data` into chunk ranges covering the whole input.
///
/// Every chunk except the last is between [`MIN_CHUNK_SIZE`] and
/// [`MAX_CHUNK_SIZE`] long. Empty input produces no chunks.
pub fn split(data: &[u8], permutation: &SplitPermutation) -> Vec<Range<usize>> {
    let mut chunks = vec![];
    let mut start = 0;
    let mut window = [0u8; WINDOW_SIZE];
    let mut hash: u32 = 0;

    for (pos, &byte) in data.iter().enumerate() {
        let slot = pos % WINDOW_SIZE;
        let outgoing = window[slot];
        window[slot] = byte;
        // Cyclic polynomial ("buzhash") update over the window.
        hash = hash.rotate_left(1)
            ^ permutation.map(outgoing).rotate_left(WINDOW_SIZE as u32)
            ^ permutation.map(byte);

        let len = pos - start + 1;
        let at_boundary = len >= MIN_CHUNK_SIZE && (hash & BOUNDARY_MASK) == BOUNDARY_MASK;
        if at_boundary || len == MAX_CHUNK_SIZE {
            chunks.push(start..pos + 1);
            start = pos + 1;
        }
    }
    if start < data.len() {
        chunks.push(start..data.len());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_random_data(len: usize) -> Vec<u8> {
        // Simple xorshift so tests do not depend on a RNG seed.
        let mut state: u32 = 0x2545_f491;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state & 0xff) as u8
            })
            .collect()
    }

    #[test]
    fn test_split_covers_input() {
        let permutation = SplitPermutation::new(b"page-key");
        let data = pseudo_random_data(300 << 10);
        let chunks = split(&data, &permutation);

        assert!(!chunks.is_empty());
        let mut pos = 0;
        for chunk in &chunks {
            assert_eq!(chunk.start, pos);
            pos = chunk.end;
        }
        assert_eq!(pos, data.len());
    }

    #[test]
    fn test_split_respects_bounds() {
        let permutation = SplitPermutation::new(b"page-key");
        let data = pseudo_random_data(300 << 10);
        let chunks = split(&data, &permutation);

        assert!(chunks.len() > 1);
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.len() >= MIN_CHUNK_SIZE);
            assert!(chunk.len() <= MAX_CHUNK_SIZE);
        }
        assert!(chunks.last().unwrap().len() <= MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_split_is_deterministic() {
        let permutation = SplitPermutation::new(b"page-key");
        let data = pseudo_random_data(100 << 10);
        assert_eq!(split(&data, &permutation), split(&data, &permutation));
    }

    #[test]
    fn test_split_empty_input() {
        let permutation = SplitPermutation::new(b"page-key");
        assert_eq!(split(b"", &permutation), vec![]);
    }

    #[test]
    fn test_constant_input_hits_max_chunk_size() {
        let permutation = SplitPermutation::new(b"page-key");
        let data = vec![0u8; 3 * MAX_CHUNK_SIZE];
        let chunks = split(&data, &permutation);
        // A constant window produces a constant hash, so either every
        // position past the minimum is a boundary or none is; both shapes
        // stay within the size bounds.
        for chunk in chunks {
            assert!(chunk.len() <= MAX_CHUNK_SIZE);
        }
    }

    #[test]
    fn test_different_pages_split_differently() {
        let data = pseudo_random_data(200 << 10);
        let chunks_a = split(&data, &SplitPermutation::new(b"page-a"));
        let chunks_b = split(&data, &SplitPermutation::new(b"page-b"));
        // The substitution tables are keyed differently, so the boundary
        // positions diverge with overwhelming probability on this much data.
        assert_ne!(chunks_a, chunks_b);
    }
}
