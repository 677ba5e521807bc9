//! File service selection
//!
//! Picks which file of a multi-file job the next I/O goes to. Round-robin
//! rotates after `file_service_nr` issues, random draws from the dedicated
//! stream at the same cadence, and sequential sticks with one file until the
//! worker explicitly finishes it.

use crate::rng::RandSource;
use serde::{Deserialize, Serialize};

/// Selection policy, from the `file_service_type` option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FileService {
    #[default]
    RoundRobin,
    Random,
    Sequential,
}

/// Per-worker selection state
#[derive(Debug, Clone)]
pub struct FileSelector {
    kind: FileService,
    /// Issues per file before switching
    nr: u32,
    left: u32,
    cur: usize,
}

impl FileSelector {
    pub fn new(kind: FileService, file_service_nr: u32) -> Self {
        Self {
            kind,
            nr: file_service_nr.max(1),
            left: 0,
            cur: 0,
        }
    }

    /// File index for the next I/O.
    pub fn next(&mut self, nr_files: usize, rng: &mut RandSource) -> usize {
        if nr_files <= 1 {
            return 0;
        }
        match self.kind {
            FileService::Sequential => self.cur,
            FileService::RoundRobin => {
                if self.left == 0 {
                    self.cur = (self.cur + 1) % nr_files;
                    self.left = self.nr;
                }
                self.left -= 1;
                self.cur
            }
            FileService::Random => {
                if self.left == 0 {
                    self.cur = rng.next_below(nr_files as u64) as usize;
                    self.left = self.nr;
                }
                self.left -= 1;
                self.cur
            }
        }
    }

    /// Move past a finished file (sequential service). Returns `false` when
    /// every file has been finished.
    pub fn advance(&mut self, nr_files: usize) -> bool {
        self.cur += 1;
        self.left = 0;
        self.cur < nr_files
    }

    pub fn current(&self) -> usize {
        self.cur
    }

    pub fn reset(&mut self) {
        self.cur = 0;
        self.left = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::{RandKind, RandSource};

    fn rng() -> RandSource {
        RandSource::new(RandKind::Fast, 21)
    }

    #[test]
    fn test_single_file_is_trivial() {
        let mut sel = FileSelector::new(FileService::Random, 1);
        let mut r = rng();
        for _ in 0..10 {
            assert_eq!(sel.next(1, &mut r), 0);
        }
    }

    #[test]
    fn test_round_robin_rotates_per_nr() {
        let mut sel = FileSelector::new(FileService::RoundRobin, 2);
        let mut r = rng();
        let picks: Vec<usize> = (0..8).map(|_| sel.next(3, &mut r)).collect();
        assert_eq!(picks, vec![1, 1, 2, 2, 0, 0, 1, 1]);
    }

    #[test]
    fn test_random_covers_files() {
        let mut sel = FileSelector::new(FileService::Random, 1);
        let mut r = rng();
        let mut seen = [false; 4];
        for _ in 0..200 {
            seen[sel.next(4, &mut r)] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_sequential_sticks_until_advanced() {
        let mut sel = FileSelector::new(FileService::Sequential, 1);
        let mut r = rng();
        for _ in 0..5 {
            assert_eq!(sel.next(3, &mut r), 0);
        }
        assert!(sel.advance(3));
        assert_eq!(sel.next(3, &mut r), 1);
        assert!(sel.advance(3));
        assert!(!sel.advance(3));
    }
}
