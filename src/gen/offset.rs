//! Offset generator
//!
//! Produces the next file offset for an I/O, honoring sequential cursors,
//! shared read/write cursors, zoned addressing, and random-map exclusion.
//! Returning `None` ends the current phase (file fully covered, or random
//! map exhausted under strict semantics).

use crate::engine::{Ddir, DDIR_COUNT};
use crate::gen::randmap::RandomMap;
use crate::rng::RandSource;

/// How sequential cursors relate across directions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqMode {
    /// Each direction advances its own cursor
    PerDirection,
    /// Read and write share one cursor, touching identical offsets
    Identical,
}

/// Access pattern of a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Sequential(SeqMode),
    Random,
}

/// Per-file offset state, owned by the target file
#[derive(Debug, Clone, Default)]
pub struct Cursor {
    seq_pos: [u64; DDIR_COUNT],
    shared_pos: u64,
    zone_bytes: u64,
    /// Sequential followers left before the next random draw
    seq_left: u32,
    /// Continuation point for those followers
    follow_pos: u64,
}

impl Cursor {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Bytes left ahead of the sequential cursor; random modes address the
    /// whole file.
    pub fn remaining(&self, mode: AccessMode, ddir: Ddir, file_size: u64) -> u64 {
        match mode {
            AccessMode::Random => file_size,
            AccessMode::Sequential(SeqMode::Identical) => {
                file_size.saturating_sub(self.shared_pos)
            }
            AccessMode::Sequential(SeqMode::PerDirection) => {
                file_size.saturating_sub(self.seq_pos[ddir.index()])
            }
        }
    }
}

/// Offset generation policy for one job
#[derive(Debug, Clone)]
pub struct OffsetGen {
    mode: AccessMode,
    /// Zone length; zero disables zoned addressing
    zone_size: u64,
    /// Bytes skipped after each full zone
    zone_skip: u64,
    /// Sequential followers issued per random draw
    seq_nr: u32,
    /// Extra stride added to each sequential advance
    seq_add: u64,
    /// Exhausted random map degrades to repeats instead of ending the phase
    soft_map: bool,
}

impl OffsetGen {
    pub fn new(mode: AccessMode) -> Self {
        Self {
            mode,
            zone_size: 0,
            zone_skip: 0,
            seq_nr: 0,
            seq_add: 0,
            soft_map: false,
        }
    }

    pub fn zoned(mut self, zone_size: u64, zone_skip: u64) -> Self {
        self.zone_size = zone_size;
        self.zone_skip = zone_skip;
        self
    }

    pub fn seq_stride(mut self, seq_nr: u32, seq_add: u64) -> Self {
        self.seq_nr = seq_nr;
        self.seq_add = seq_add;
        self
    }

    pub fn soft_map(mut self, soft: bool) -> Self {
        self.soft_map = soft;
        self
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Next offset for an I/O of `len` bytes against a file of `file_size`.
    ///
    /// `map` is the file's random map when no-repeat semantics are on. The
    /// chosen map blocks are marked here, spanning the whole I/O.
    pub fn next(
        &self,
        cur: &mut Cursor,
        map: Option<&mut RandomMap>,
        rng: &mut RandSource,
        ddir: Ddir,
        len: u64,
        file_size: u64,
    ) -> Option<u64> {
        if len == 0 || len > file_size {
            return None;
        }

        let offset = match self.mode {
            AccessMode::Sequential(seq) => self.next_seq(cur, seq, ddir, len, file_size)?,
            AccessMode::Random => self.next_rand(cur, map, rng, len, file_size)?,
        };

        if self.zone_size > 0 {
            cur.zone_bytes += len;
        }
        Some(offset)
    }

    fn next_seq(
        &self,
        cur: &mut Cursor,
        seq: SeqMode,
        ddir: Ddir,
        len: u64,
        file_size: u64,
    ) -> Option<u64> {
        let pos = match seq {
            SeqMode::Identical => &mut cur.shared_pos,
            SeqMode::PerDirection => &mut cur.seq_pos[ddir.index()],
        };

        // Skip into the next zone once this one is spent.
        if self.zone_size > 0 && cur.zone_bytes >= self.zone_size {
            cur.zone_bytes = 0;
            *pos += self.zone_skip;
            if *pos >= file_size {
                *pos %= file_size;
            }
        }

        if *pos + len > file_size {
            return None;
        }
        let offset = *pos;
        *pos += len + self.seq_add;
        Some(offset)
    }

    fn next_rand(
        &self,
        cur: &mut Cursor,
        map: Option<&mut RandomMap>,
        rng: &mut RandSource,
        len: u64,
        file_size: u64,
    ) -> Option<u64> {
        // Sequential followers of an earlier random draw
        if cur.seq_left > 0 && cur.follow_pos + len <= file_size {
            cur.seq_left -= 1;
            let offset = cur.follow_pos;
            cur.follow_pos += len + self.seq_add;
            return Some(offset);
        }
        cur.seq_left = 0;

        let offset = match map {
            Some(map) => {
                let map_bs = file_size / map.len().max(1);
                match map.pick_unused(rng) {
                    Ok(block) => {
                        // Mark every map block the I/O covers.
                        let first = block;
                        let span = (len + map_bs - 1) / map_bs.max(1);
                        for b in first..(first + span).min(map.len()) {
                            map.mark(b);
                        }
                        let offset = first * map_bs;
                        if offset + len > file_size {
                            return None;
                        }
                        offset
                    }
                    Err(_) if self.soft_map => {
                        // Degrade to plain random with repeats.
                        let blocks = file_size / len;
                        rng.next_below(blocks) * len
                    }
                    Err(_) => return None,
                }
            }
            None => {
                let blocks = file_size / len;
                rng.next_below(blocks) * len
            }
        };

        if self.seq_nr > 1 {
            cur.seq_left = self.seq_nr - 1;
            cur.follow_pos = offset + len + self.seq_add;
        }
        Some(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::{RandKind, RandSource};

    fn rng() -> RandSource {
        RandSource::new(RandKind::Fast, 11)
    }

    #[test]
    fn test_sequential_walks_the_file() {
        let gen = OffsetGen::new(AccessMode::Sequential(SeqMode::PerDirection));
        let mut cur = Cursor::default();
        let mut r = rng();

        let size = 1 << 20;
        let bs = 4096;
        let mut expect = 0;
        while let Some(off) = gen.next(&mut cur, None, &mut r, Ddir::Write, bs, size) {
            assert_eq!(off, expect);
            expect += bs;
        }
        assert_eq!(expect, size);
    }

    #[test]
    fn test_identical_mode_shares_cursor() {
        let gen = OffsetGen::new(AccessMode::Sequential(SeqMode::Identical));
        let mut cur = Cursor::default();
        let mut r = rng();

        let a = gen.next(&mut cur, None, &mut r, Ddir::Read, 4096, 1 << 20).unwrap();
        let b = gen.next(&mut cur, None, &mut r, Ddir::Write, 4096, 1 << 20).unwrap();
        // Directions advance the same cursor instead of both starting at 0.
        assert_eq!(a, 0);
        assert_eq!(b, 4096);
    }

    #[test]
    fn test_random_offsets_are_aligned_and_bounded() {
        let gen = OffsetGen::new(AccessMode::Random);
        let mut cur = Cursor::default();
        let mut r = rng();

        for _ in 0..1000 {
            let off = gen.next(&mut cur, None, &mut r, Ddir::Read, 4096, 1 << 20).unwrap();
            assert_eq!(off % 4096, 0);
            assert!(off + 4096 <= 1 << 20);
        }
    }

    #[test]
    fn test_random_map_phase_ends_when_exhausted() {
        let gen = OffsetGen::new(AccessMode::Random);
        let mut cur = Cursor::default();
        let mut map = RandomMap::new(16 * 1024, 4096);
        let mut r = rng();

        let mut seen = Vec::new();
        for _ in 0..4 {
            let off = gen
                .next(&mut cur, Some(&mut map), &mut r, Ddir::Write, 4096, 16 * 1024)
                .unwrap();
            assert!(!seen.contains(&off));
            seen.push(off);
        }
        // Map exhausted: strict semantics end the phase.
        assert_eq!(
            gen.next(&mut cur, Some(&mut map), &mut r, Ddir::Write, 4096, 16 * 1024),
            None
        );
    }

    #[test]
    fn test_soft_map_repeats_after_exhaustion() {
        let gen = OffsetGen::new(AccessMode::Random).soft_map(true);
        let mut cur = Cursor::default();
        let mut map = RandomMap::new(16 * 1024, 4096);
        let mut r = rng();

        for _ in 0..4 {
            gen.next(&mut cur, Some(&mut map), &mut r, Ddir::Write, 4096, 16 * 1024)
                .unwrap();
        }
        // Exhausted map keeps producing offsets, repeats allowed.
        for _ in 0..10 {
            assert!(gen
                .next(&mut cur, Some(&mut map), &mut r, Ddir::Write, 4096, 16 * 1024)
                .is_some());
        }
    }

    #[test]
    fn test_zoned_sequential_skips_between_zones() {
        // 64k zones, 64k skip: offsets cover 0..64k, then 128k..192k, ...
        let gen = OffsetGen::new(AccessMode::Sequential(SeqMode::PerDirection))
            .zoned(64 * 1024, 64 * 1024);
        let mut cur = Cursor::default();
        let mut r = rng();

        let bs = 4096u64;
        let size = 1u64 << 20;
        let mut offsets = Vec::new();
        while let Some(off) = gen.next(&mut cur, None, &mut r, Ddir::Read, bs, size) {
            offsets.push(off);
            if offsets.len() > 1000 {
                break;
            }
        }
        // First zone is sequential
        assert_eq!(offsets[0], 0);
        assert_eq!(offsets[15], 15 * bs);
        // Zone boundary: after 16 blocks (64k), skip 64k forward
        assert_eq!(offsets[16], 128 * 1024);
    }

    #[test]
    fn test_seq_nr_issues_followers_after_random_jump() {
        let gen = OffsetGen::new(AccessMode::Random).seq_stride(4, 0);
        let mut cur = Cursor::default();
        let mut r = rng();

        let bs = 4096u64;
        let size = 1u64 << 24;
        let first = gen.next(&mut cur, None, &mut r, Ddir::Read, bs, size).unwrap();
        // Three sequential followers
        for i in 1..4 {
            let off = gen.next(&mut cur, None, &mut r, Ddir::Read, bs, size).unwrap();
            assert_eq!(off, first + i * bs);
        }
    }
}
