//! Write history for verification
//!
//! Every completed write leaves an entry describing what should later be
//! read back. Two stores behind one interface, chosen at construction:
//! an offset-sorted tree for overwriting workloads (a later write
//! supersedes earlier ones, but only for the overlapping extent) and a
//! plain insertion-ordered list for append-style workloads.

use std::collections::{BTreeMap, VecDeque};

/// One verifiable extent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Arena index of the file the write went to
    pub file: usize,
    /// Live extent start
    pub offset: u64,
    /// Live extent length
    pub len: u64,
    /// Start of the original write; payload regeneration anchors here
    pub block_offset: u64,
    /// Length of the original write
    pub block_len: u64,
    /// Block seed the payload was generated with
    pub seed: u64,
    /// Write sequence number
    pub seq: u64,
}

impl HistoryEntry {
    pub fn new(offset: u64, len: u64, seed: u64, seq: u64) -> Self {
        Self {
            file: 0,
            offset,
            len,
            block_offset: offset,
            block_len: len,
            seed,
            seq,
        }
    }

    pub fn for_file(mut self, file: usize) -> Self {
        self.file = file;
        self
    }

    fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// History store selected by the `verify_sort`/`overwrite` combination
#[derive(Debug)]
pub enum WriteHistory {
    /// Ordered by offset; overlapping records supersede by extent
    Sorted(BTreeMap<u64, HistoryEntry>),
    /// Insertion order; verification replays writes as they happened
    Ordered(VecDeque<HistoryEntry>),
}

impl WriteHistory {
    pub fn sorted() -> Self {
        WriteHistory::Sorted(BTreeMap::new())
    }

    pub fn ordered() -> Self {
        WriteHistory::Ordered(VecDeque::new())
    }

    pub fn len(&self) -> usize {
        match self {
            WriteHistory::Sorted(tree) => tree.len(),
            WriteHistory::Ordered(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        match self {
            WriteHistory::Sorted(tree) => tree.clear(),
            WriteHistory::Ordered(list) => list.clear(),
        }
    }

    /// Record a completed write.
    ///
    /// In sorted mode the new extent supersedes whatever it overlaps:
    /// covered entries are dropped, a preceding overlapper is truncated,
    /// and a trailing remainder is re-keyed past the new extent while
    /// keeping its original anchor so its payload can still be regenerated.
    pub fn record(&mut self, entry: HistoryEntry) {
        match self {
            WriteHistory::Ordered(list) => list.push_back(entry),
            WriteHistory::Sorted(tree) => {
                let start = entry.offset;
                let end = entry.end();

                // A predecessor that overlaps from the left.
                if let Some((&pkey, prev)) = tree.range(..start).next_back() {
                    if prev.end() > start {
                        let mut head = prev.clone();
                        let tail_end = prev.end();
                        head.len = start - head.offset;
                        let tail = if tail_end > end {
                            let mut t = prev.clone();
                            t.len = tail_end - end;
                            t.offset = end;
                            Some(t)
                        } else {
                            None
                        };
                        if head.len > 0 {
                            tree.insert(pkey, head);
                        } else {
                            tree.remove(&pkey);
                        }
                        if let Some(t) = tail {
                            tree.insert(t.offset, t);
                        }
                    }
                }

                // Entries starting inside the new extent.
                let inside: Vec<u64> = tree.range(start..end).map(|(&k, _)| k).collect();
                for key in inside {
                    let old = tree.remove(&key).unwrap();
                    if old.end() > end {
                        // Keep the part past the new extent, anchor intact.
                        let mut tail = old.clone();
                        tail.len = old.end() - end;
                        tail.offset = end;
                        tree.insert(tail.offset, tail);
                    }
                }

                tree.insert(start, entry);
            }
        }
    }

    /// Take the next entry to verify: lowest offset in sorted mode, oldest
    /// write in ordered mode.
    pub fn pop(&mut self) -> Option<HistoryEntry> {
        match self {
            WriteHistory::Sorted(tree) => tree.pop_first().map(|(_, e)| e),
            WriteHistory::Ordered(list) => list.pop_front(),
        }
    }

    /// Most recently recorded entry covering `offset` (sorted mode).
    pub fn lookup(&self, offset: u64) -> Option<&HistoryEntry> {
        match self {
            WriteHistory::Sorted(tree) => tree
                .range(..=offset)
                .next_back()
                .map(|(_, e)| e)
                .filter(|e| e.end() > offset),
            WriteHistory::Ordered(list) => list
                .iter()
                .rev()
                .find(|e| e.offset <= offset && e.end() > offset),
        }
    }
}
