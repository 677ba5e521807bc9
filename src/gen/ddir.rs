//! Direction chooser
//!
//! Picks read/write/trim for the next I/O. Pure workloads short-circuit to
//! their fixed direction; mixed workloads draw against the configured read
//! percentage, re-evaluating every `rwmixcycle` issues. Trims interleave by
//! their own percentage, independent of the read/write split.

use crate::engine::Ddir;
use crate::rng::RandSource;

#[derive(Debug, Clone)]
pub struct DirChooser {
    /// Fixed direction for pure workloads; `None` means mixed read/write
    fixed: Option<Ddir>,
    /// Percentage of reads in a mixed workload
    rwmix_read: u32,
    /// Issues between mix re-evaluations
    rwmixcycle: u32,
    /// Percentage of I/Os replaced by trims
    trim_pct: u32,
    issues_left: u32,
    cached: Ddir,
}

impl DirChooser {
    pub fn new(fixed: Option<Ddir>, rwmix_read: u32, rwmixcycle: u32, trim_pct: u32) -> Self {
        Self {
            fixed,
            rwmix_read,
            rwmixcycle: rwmixcycle.max(1),
            trim_pct,
            issues_left: 0,
            cached: Ddir::Read,
        }
    }

    pub fn pure(ddir: Ddir) -> Self {
        Self::new(Some(ddir), 0, 1, 0)
    }

    /// Direction of the next I/O. `rwmix_rng` and `trim_rng` are the two
    /// dedicated streams, so trim interleave does not perturb the mix.
    pub fn next(&mut self, rwmix_rng: &mut RandSource, trim_rng: &mut RandSource) -> Ddir {
        if self.trim_pct > 0 && trim_rng.next_percent() < self.trim_pct {
            return Ddir::Trim;
        }

        if let Some(d) = self.fixed {
            return d;
        }

        if self.issues_left == 0 {
            self.cached = if rwmix_rng.next_percent() < self.rwmix_read {
                Ddir::Read
            } else {
                Ddir::Write
            };
            self.issues_left = self.rwmixcycle;
        }
        self.issues_left -= 1;
        self.cached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::{RandKind, RandSource};

    #[test]
    fn test_pure_workloads_are_fixed() {
        let mut rw = RandSource::new(RandKind::Fast, 1);
        let mut tr = RandSource::new(RandKind::Fast, 2);

        for fixed in [Ddir::Read, Ddir::Write, Ddir::Trim] {
            let mut chooser = DirChooser::pure(fixed);
            for _ in 0..100 {
                assert_eq!(chooser.next(&mut rw, &mut tr), fixed);
            }
        }
    }

    #[test]
    fn test_mix_fraction_converges() {
        // Matches the configured 70/30 split within two points over 10k draws.
        let mut rw = RandSource::new(RandKind::Fast, 42);
        let mut tr = RandSource::new(RandKind::Fast, 43);
        let mut chooser = DirChooser::new(None, 70, 1, 0);

        let n = 10_000;
        let mut reads = 0u32;
        for _ in 0..n {
            if chooser.next(&mut rw, &mut tr) == Ddir::Read {
                reads += 1;
            }
        }
        let frac = reads as f64 / n as f64;
        assert!(frac >= 0.68 && frac <= 0.72, "read fraction {}", frac);
    }

    #[test]
    fn test_rwmixcycle_batches_direction() {
        let mut rw = RandSource::new(RandKind::Fast, 5);
        let mut tr = RandSource::new(RandKind::Fast, 6);
        let mut chooser = DirChooser::new(None, 50, 8, 0);

        // Within each batch of 8 the direction never changes.
        for _ in 0..50 {
            let first = chooser.next(&mut rw, &mut tr);
            for _ in 1..8 {
                assert_eq!(chooser.next(&mut rw, &mut tr), first);
            }
        }
    }

    #[test]
    fn test_trim_interleave_independent_of_mix() {
        let mut rw = RandSource::new(RandKind::Fast, 9);
        let mut tr = RandSource::new(RandKind::Fast, 10);
        let mut chooser = DirChooser::new(Some(Ddir::Write), 0, 1, 25);

        let n = 10_000;
        let mut trims = 0u32;
        for _ in 0..n {
            if chooser.next(&mut rw, &mut tr) == Ddir::Trim {
                trims += 1;
            }
        }
        let frac = trims as f64 / n as f64;
        assert!(frac > 0.22 && frac < 0.28, "trim fraction {}", frac);
    }
}
