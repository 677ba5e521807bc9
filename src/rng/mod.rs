//! Seeded, restartable pseudo-random streams
//!
//! Each worker owns eight independent streams, one per logical use, so that
//! drawing a block size never perturbs the offset sequence. Two generator
//! flavors exist behind one interface: the OS-quality generator and the fast
//! xoshiro generator; the flavor is fixed at worker init from `use_os_rand`.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

/// Generator flavor, selected once per worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandKind {
    /// OS-quality generator (slower, used with `use_os_rand`)
    Os,
    /// Fast xoshiro generator (default)
    Fast,
}

/// One pseudo-random stream
///
/// A tagged sum over the two generator flavors with a common draw interface.
/// The seed is retained so the stream can be restarted for `loops`.
#[derive(Debug, Clone)]
pub enum RandSource {
    Os { rng: StdRng, seed: u64 },
    Fast { rng: Xoshiro256PlusPlus, seed: u64 },
}

impl RandSource {
    pub fn new(kind: RandKind, seed: u64) -> Self {
        match kind {
            RandKind::Os => RandSource::Os {
                rng: StdRng::seed_from_u64(seed),
                seed,
            },
            RandKind::Fast => RandSource::Fast {
                rng: Xoshiro256PlusPlus::seed_from_u64(seed),
                seed,
            },
        }
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        match self {
            RandSource::Os { rng, .. } => rng.next_u32(),
            RandSource::Fast { rng, .. } => rng.next_u32(),
        }
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        match self {
            RandSource::Os { rng, .. } => rng.next_u64(),
            RandSource::Fast { rng, .. } => rng.next_u64(),
        }
    }

    /// Uniform draw in `[0, bound)`. `bound` must be non-zero.
    #[inline]
    pub fn next_below(&mut self, bound: u64) -> u64 {
        debug_assert!(bound > 0);
        // Multiply-shift reduction avoids modulo bias well enough for
        // workload generation while staying branch-free.
        ((self.next_u64() as u128 * bound as u128) >> 64) as u64
    }

    /// Draw in `[lo, hi]` inclusive.
    #[inline]
    pub fn next_in(&mut self, lo: u64, hi: u64) -> u64 {
        debug_assert!(lo <= hi);
        lo + self.next_below(hi - lo + 1)
    }

    /// Percentage draw in `[0, 100)`.
    #[inline]
    pub fn next_percent(&mut self) -> u32 {
        (self.next_below(100)) as u32
    }

    /// Reseed from the stored seed, reproducing the sequence from the start.
    pub fn restart(&mut self) {
        match self {
            RandSource::Os { rng, seed } => *rng = StdRng::seed_from_u64(*seed),
            RandSource::Fast { rng, seed } => *rng = Xoshiro256PlusPlus::seed_from_u64(*seed),
        }
    }

    pub fn seed(&self) -> u64 {
        match self {
            RandSource::Os { seed, .. } | RandSource::Fast { seed, .. } => *seed,
        }
    }
}

/// The logical uses a worker dedicates a stream to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum RandUse {
    Offset = 0,
    BlockSize = 1,
    Verify = 2,
    Trim = 3,
    RwMix = 4,
    NextFile = 5,
    FileSize = 6,
    Buffer = 7,
}

pub const NR_RAND_STREAMS: usize = 8;

/// The per-worker stream set
#[derive(Debug, Clone)]
pub struct RandStreams {
    streams: [RandSource; NR_RAND_STREAMS],
}

impl RandStreams {
    /// Fill all eight streams.
    ///
    /// With `repeatable`, seeds are a fixed function of the base seed and the
    /// stream index so identical (seed, options) runs replay identically.
    /// Otherwise every stream is seeded from OS entropy.
    pub fn fill(kind: RandKind, base_seed: u64, repeatable: bool) -> Self {
        let seed_for = |idx: usize| -> u64 {
            if repeatable {
                // splitmix64 step keeps per-stream seeds decorrelated even
                // for adjacent base seeds.
                let mut z = base_seed
                    .wrapping_add(0x9e3779b97f4a7c15u64.wrapping_mul(idx as u64 + 1));
                z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
                z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
                z ^ (z >> 31)
            } else {
                rand::random::<u64>()
            }
        };

        Self {
            streams: [
                RandSource::new(kind, seed_for(0)),
                RandSource::new(kind, seed_for(1)),
                RandSource::new(kind, seed_for(2)),
                RandSource::new(kind, seed_for(3)),
                RandSource::new(kind, seed_for(4)),
                RandSource::new(kind, seed_for(5)),
                RandSource::new(kind, seed_for(6)),
                RandSource::new(kind, seed_for(7)),
            ],
        }
    }

    #[inline]
    pub fn get(&mut self, which: RandUse) -> &mut RandSource {
        &mut self.streams[which as usize]
    }

    /// Two distinct streams at once (callers drawing a direction need the
    /// mix and trim streams together).
    pub fn get2(&mut self, a: RandUse, b: RandUse) -> (&mut RandSource, &mut RandSource) {
        let (a, b) = (a as usize, b as usize);
        assert_ne!(a, b);
        if a < b {
            let (lo, hi) = self.streams.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.streams.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    /// Restart every stream from its stored seed (used by `loops`).
    pub fn restart(&mut self) {
        for s in &mut self.streams {
            s.restart();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeatable_streams_replay() {
        let mut a = RandStreams::fill(RandKind::Fast, 42, true);
        let mut b = RandStreams::fill(RandKind::Fast, 42, true);

        for _ in 0..100 {
            assert_eq!(
                a.get(RandUse::Offset).next_u64(),
                b.get(RandUse::Offset).next_u64()
            );
        }
    }

    #[test]
    fn test_streams_are_independent() {
        let mut a = RandStreams::fill(RandKind::Fast, 42, true);
        let mut b = RandStreams::fill(RandKind::Fast, 42, true);

        // Drain an unrelated stream on one side; the offset stream must not
        // be perturbed.
        for _ in 0..1000 {
            a.get(RandUse::BlockSize).next_u64();
        }
        for _ in 0..10 {
            assert_eq!(
                a.get(RandUse::Offset).next_u64(),
                b.get(RandUse::Offset).next_u64()
            );
        }
    }

    #[test]
    fn test_restart_replays_sequence() {
        let mut s = RandSource::new(RandKind::Fast, 7);
        let first: Vec<u64> = (0..16).map(|_| s.next_u64()).collect();
        s.restart();
        let second: Vec<u64> = (0..16).map(|_| s.next_u64()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_os_flavor_is_seeded_too() {
        let mut a = RandSource::new(RandKind::Os, 99);
        let mut b = RandSource::new(RandKind::Os, 99);
        assert_eq!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn test_next_below_in_range() {
        let mut s = RandSource::new(RandKind::Fast, 1);
        for _ in 0..10_000 {
            assert!(s.next_below(17) < 17);
        }
    }

    #[test]
    fn test_different_seeds_differ() {
        let mut a = RandSource::new(RandKind::Fast, 1);
        let mut b = RandSource::new(RandKind::Fast, 2);
        let va: Vec<u64> = (0..8).map(|_| a.next_u64()).collect();
        let vb: Vec<u64> = (0..8).map(|_| b.next_u64()).collect();
        assert_ne!(va, vb);
    }
}
