//! Block-size splitter
//!
//! Chooses the size of each I/O, per direction: either uniform within
//! `[min_bs, max_bs]` or a weighted discrete distribution. Sizes are aligned
//! to the per-direction alignment and clamped to what is left of the file.

use crate::engine::{Ddir, DDIR_COUNT};
use crate::rng::RandSource;

/// One entry of a discrete size distribution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitEntry {
    pub bs: u64,
    /// Weight in percent; entries of a split sum to 100
    pub perc: u32,
}

/// Per-direction size specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BsSpec {
    Range { min: u64, max: u64 },
    Split(Vec<SplitEntry>),
}

impl BsSpec {
    pub fn fixed(bs: u64) -> Self {
        BsSpec::Range { min: bs, max: bs }
    }

    fn min_bs(&self) -> u64 {
        match self {
            BsSpec::Range { min, .. } => *min,
            BsSpec::Split(entries) => entries.iter().map(|e| e.bs).min().unwrap_or(0),
        }
    }

    fn max_bs(&self) -> u64 {
        match self {
            BsSpec::Range { max, .. } => *max,
            BsSpec::Split(entries) => entries.iter().map(|e| e.bs).max().unwrap_or(0),
        }
    }
}

/// Draws a block size per I/O
#[derive(Debug, Clone)]
pub struct BlockSizer {
    specs: [BsSpec; DDIR_COUNT],
    align: [u64; DDIR_COUNT],
    unaligned: bool,
}

impl BlockSizer {
    pub fn new(specs: [BsSpec; DDIR_COUNT], align: [u64; DDIR_COUNT], unaligned: bool) -> Self {
        Self {
            specs,
            align,
            unaligned,
        }
    }

    /// Same fixed size in every direction.
    pub fn fixed(bs: u64) -> Self {
        Self::new(
            [BsSpec::fixed(bs), BsSpec::fixed(bs), BsSpec::fixed(bs)],
            [bs, bs, bs],
            false,
        )
    }

    /// Smallest size any direction can draw; random maps use this as their
    /// block granularity.
    pub fn min_bs(&self) -> u64 {
        self.specs.iter().map(|s| s.min_bs()).filter(|&b| b > 0).min().unwrap_or(0)
    }

    /// Largest size any direction can draw; buffers are carved at this size.
    pub fn max_bs(&self) -> u64 {
        self.specs.iter().map(|s| s.max_bs()).max().unwrap_or(0)
    }

    pub fn min_bs_for(&self, ddir: Ddir) -> u64 {
        self.specs[ddir.index()].min_bs()
    }

    /// Draw the next block size for `ddir` with `remaining` bytes left in
    /// the file. Returns `None` when not even the minimum size fits.
    pub fn next(&self, ddir: Ddir, rng: &mut RandSource, remaining: u64) -> Option<u64> {
        let spec = &self.specs[ddir.index()];
        let min = spec.min_bs();
        if min == 0 || remaining < min {
            return None;
        }

        let mut bs = match spec {
            // Fixed size short-circuits without consuming PRNG state.
            BsSpec::Range { min, max } if min == max => *min,
            BsSpec::Range { min, max } => {
                let drawn = rng.next_in(*min, *max);
                self.aligned(ddir, drawn).max(*min)
            }
            BsSpec::Split(entries) => {
                let roll = rng.next_percent();
                let mut acc = 0u32;
                let mut picked = entries.last().map(|e| e.bs).unwrap_or(0);
                for e in entries {
                    acc += e.perc;
                    if roll < acc {
                        picked = e.bs;
                        break;
                    }
                }
                picked
            }
        };

        if bs > remaining {
            bs = self.aligned(ddir, remaining);
            if bs < min {
                return None;
            }
        }
        Some(bs)
    }

    #[inline]
    fn aligned(&self, ddir: Ddir, bs: u64) -> u64 {
        if self.unaligned {
            return bs;
        }
        let ba = self.align[ddir.index()].max(1);
        (bs / ba) * ba
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::{RandKind, RandSource};

    fn rng() -> RandSource {
        RandSource::new(RandKind::Fast, 7)
    }

    #[test]
    fn test_fixed_size_skips_prng() {
        let sizer = BlockSizer::fixed(4096);
        let mut a = rng();
        let b_state = a.clone();

        assert_eq!(sizer.next(Ddir::Read, &mut a, 1 << 20), Some(4096));
        // PRNG untouched
        let mut b = b_state;
        assert_eq!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn test_range_respects_bounds_and_alignment() {
        let spec = BsSpec::Range {
            min: 4096,
            max: 65536,
        };
        let sizer = BlockSizer::new(
            [spec.clone(), spec.clone(), spec],
            [4096, 4096, 4096],
            false,
        );
        let mut r = rng();
        for _ in 0..1000 {
            let bs = sizer.next(Ddir::Write, &mut r, u64::MAX).unwrap();
            assert!(bs >= 4096 && bs <= 65536);
            assert_eq!(bs % 4096, 0);
        }
    }

    #[test]
    fn test_split_draws_all_weights() {
        let spec = BsSpec::Split(vec![
            SplitEntry { bs: 4096, perc: 70 },
            SplitEntry { bs: 16384, perc: 30 },
        ]);
        let sizer = BlockSizer::new(
            [spec.clone(), spec.clone(), spec],
            [512, 512, 512],
            false,
        );
        let mut r = rng();
        let mut small = 0u32;
        let n = 10_000;
        for _ in 0..n {
            match sizer.next(Ddir::Read, &mut r, u64::MAX).unwrap() {
                4096 => small += 1,
                16384 => {}
                other => panic!("unexpected size {}", other),
            }
        }
        let frac = small as f64 / n as f64;
        assert!(frac > 0.66 && frac < 0.74, "fraction was {}", frac);
    }

    #[test]
    fn test_clamps_to_remaining() {
        let sizer = BlockSizer::fixed(4096);
        let mut r = rng();
        // Not even one block left
        assert_eq!(sizer.next(Ddir::Read, &mut r, 1000), None);
        // Exactly one block
        assert_eq!(sizer.next(Ddir::Read, &mut r, 4096), Some(4096));
    }

    #[test]
    fn test_range_clamp_keeps_alignment() {
        let spec = BsSpec::Range {
            min: 4096,
            max: 65536,
        };
        let sizer = BlockSizer::new(
            [spec.clone(), spec.clone(), spec],
            [4096, 4096, 4096],
            false,
        );
        let mut r = rng();
        // 10000 bytes left: sizes must clamp to 8192 or less, still aligned
        for _ in 0..100 {
            let bs = sizer.next(Ddir::Read, &mut r, 10000).unwrap();
            assert!(bs <= 8192);
            assert_eq!(bs % 4096, 0);
        }
    }

    #[test]
    fn test_min_and_max_bs() {
        let read = BsSpec::Range {
            min: 512,
            max: 8192,
        };
        let write = BsSpec::Split(vec![
            SplitEntry { bs: 4096, perc: 50 },
            SplitEntry {
                bs: 131072,
                perc: 50,
            },
        ]);
        let sizer = BlockSizer::new([read, write, BsSpec::fixed(4096)], [512, 512, 512], false);
        assert_eq!(sizer.min_bs(), 512);
        assert_eq!(sizer.max_bs(), 131072);
    }
}
