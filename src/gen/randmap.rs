//! Random map
//!
//! A packed bitmap with one bit per minimum-block-size block, marking blocks
//! a random workload has already touched. It is what makes "random but no
//! repeats until the whole file is covered" possible.
//!
//! Picking starts with bounded rejection sampling; once too many draws land
//! on used blocks it falls back to a wrapping linear scan from a random
//! start, so the tail of a nearly-full map is still found in one pass.

use crate::rng::RandSource;

const BITS_PER_WORD: u64 = 64;

/// Random draws attempted before falling back to the linear scan
const MAX_RAND_TRIES: u32 = 16;

/// Returned by [`RandomMap::pick_unused`] when every block has been chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted;

/// Per-file bitmap of blocks already issued
#[derive(Debug, Clone)]
pub struct RandomMap {
    words: Vec<u64>,
    nr_blocks: u64,
    nr_set: u64,
}

impl RandomMap {
    /// Map covering `file_size` bytes at `block_size` granularity.
    pub fn new(file_size: u64, block_size: u64) -> Self {
        let nr_blocks = file_size / block_size.max(1);
        let nr_words = ((nr_blocks + BITS_PER_WORD - 1) / BITS_PER_WORD) as usize;
        Self {
            words: vec![0; nr_words],
            nr_blocks,
            nr_set: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.nr_blocks
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nr_blocks == 0
    }

    #[inline]
    pub fn set_count(&self) -> u64 {
        self.nr_set
    }

    #[inline]
    pub fn is_set(&self, block: u64) -> bool {
        debug_assert!(block < self.nr_blocks);
        self.words[(block / BITS_PER_WORD) as usize] & (1u64 << (block % BITS_PER_WORD)) != 0
    }

    /// Mark a block as issued. Idempotent.
    pub fn mark(&mut self, block: u64) {
        debug_assert!(block < self.nr_blocks);
        let word = &mut self.words[(block / BITS_PER_WORD) as usize];
        let bit = 1u64 << (block % BITS_PER_WORD);
        if *word & bit == 0 {
            *word |= bit;
            self.nr_set += 1;
        }
    }

    /// Draw a block that has not been issued yet.
    ///
    /// The returned block is NOT marked; the caller marks it once the I/O is
    /// actually built (an aborted build must not burn the block).
    pub fn pick_unused(&self, rng: &mut RandSource) -> Result<u64, Exhausted> {
        if self.nr_set >= self.nr_blocks || self.nr_blocks == 0 {
            return Err(Exhausted);
        }

        for _ in 0..MAX_RAND_TRIES {
            let block = rng.next_below(self.nr_blocks);
            if !self.is_set(block) {
                return Ok(block);
            }
        }

        // Dense map: scan whole words from a random start, wrapping once.
        // The lowest clear bit of a word decides it; if that bit is already
        // past nr_blocks, the word holds nothing usable.
        let nr_words = self.words.len();
        let start_word = (rng.next_below(self.nr_blocks) / BITS_PER_WORD) as usize;
        for i in 0..nr_words {
            let wi = (start_word + i) % nr_words;
            let word = self.words[wi];
            if word != u64::MAX {
                let block = wi as u64 * BITS_PER_WORD + (!word).trailing_zeros() as u64;
                if block < self.nr_blocks {
                    return Ok(block);
                }
            }
        }

        Err(Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::{RandKind, RandSource};

    fn rng() -> RandSource {
        RandSource::new(RandKind::Fast, 42)
    }

    #[test]
    fn test_covers_every_block_before_exhaustion() {
        let mut map = RandomMap::new(16 * 1024, 4096);
        assert_eq!(map.len(), 4);
        let mut rng = rng();

        let mut seen = Vec::new();
        for _ in 0..4 {
            let b = map.pick_unused(&mut rng).unwrap();
            assert!(!seen.contains(&b));
            seen.push(b);
            map.mark(b);
        }
        assert_eq!(map.set_count(), 4);
        assert_eq!(map.pick_unused(&mut rng), Err(Exhausted));
    }

    #[test]
    fn test_no_repeats_large_map() {
        let mut map = RandomMap::new(1024 * 4096, 4096);
        let mut rng = rng();
        let mut hit = vec![false; 1024];

        for _ in 0..1024 {
            let b = map.pick_unused(&mut rng).unwrap();
            assert!(!hit[b as usize], "block {} repeated", b);
            hit[b as usize] = true;
            map.mark(b);
        }
        assert!(hit.iter().all(|&h| h));
        assert_eq!(map.pick_unused(&mut rng), Err(Exhausted));
    }

    #[test]
    fn test_mark_is_idempotent() {
        let mut map = RandomMap::new(8 * 4096, 4096);
        map.mark(3);
        map.mark(3);
        assert_eq!(map.set_count(), 1);
        assert!(map.is_set(3));
        assert!(!map.is_set(2));
    }

    #[test]
    fn test_dense_map_finds_last_free_block() {
        let mut map = RandomMap::new(100 * 4096, 4096);
        for b in 0..100 {
            if b != 77 {
                map.mark(b);
            }
        }
        let mut rng = rng();
        // Only block 77 remains; the scan must land on it every time.
        for _ in 0..10 {
            assert_eq!(map.pick_unused(&mut rng), Ok(77));
        }
    }

    #[test]
    fn test_empty_file_is_exhausted() {
        let map = RandomMap::new(0, 4096);
        let mut rng = rng();
        assert_eq!(map.pick_unused(&mut rng), Err(Exhausted));
    }
}
