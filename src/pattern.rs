//! Level-aware merging set of column indices
//!
//! [`RowPattern`] accumulates the union of index lists across repeated
//! merges and remembers which indices arrived since the last time the
//! *frontier* was taken. One expansion level consists of several merge calls
//! (one per received reply, or one per frontier index), so the frontier is
//! the union of those deltas, consumed by the next level's fetch.
//!
//! Membership is an open-address table of fixed capacity; the capacity is
//! chosen by the caller so overflow indicates a misconfigured build, which
//! is fatal. Insertion order is preserved in a side list, and resetting
//! replays only the touched slots so per-row reuse costs O(row), not
//! O(capacity).

use std::ops::Range;

/// Default membership capacity, a prime comfortably above the pattern sizes
/// the supported problem classes produce.
pub const ROW_PATTERN_CAPACITY: usize = 50_021;

const EMPTY: usize = usize::MAX;

/// Overflow of a fixed-capacity pattern. Treated as a programming defect by
/// callers: capacities are sized so this cannot occur for supported inputs.
#[derive(Debug, thiserror::Error)]
#[error("row pattern exceeded its capacity of {capacity} indices")]
pub struct PatternError {
    /// The configured capacity that was exhausted.
    pub capacity: usize,
}

/// Merging set of global column indices with a consumable frontier.
pub struct RowPattern {
    table: Vec<usize>,
    entries: Vec<usize>,
    slots: Vec<usize>,
    consumed: usize,
}

impl RowPattern {
    /// A pattern with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(ROW_PATTERN_CAPACITY)
    }

    /// A pattern holding at most `capacity` distinct indices.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            table: vec![EMPTY; capacity],
            entries: Vec::new(),
            slots: Vec::new(),
            consumed: 0,
        }
    }

    fn insert(&mut self, key: usize) -> Result<(), PatternError> {
        debug_assert_ne!(key, EMPTY);
        let cap = self.table.len();
        let mut at = key % cap;
        for _ in 0..cap {
            let cur = self.table[at];
            if cur == key {
                return Ok(());
            }
            if cur == EMPTY {
                self.table[at] = key;
                self.entries.push(key);
                self.slots.push(at);
                return Ok(());
            }
            at += 1;
            if at == cap {
                at = 0;
            }
        }
        Err(PatternError { capacity: cap })
    }

    /// Merge an index list; indices already present are silent no-ops.
    pub fn merge(&mut self, ind: &[usize]) -> Result<(), PatternError> {
        for &j in ind {
            self.insert(j)?;
        }
        Ok(())
    }

    /// Merge only the indices falling outside `local`.
    pub fn merge_external(&mut self, ind: &[usize], local: &Range<usize>) -> Result<(), PatternError> {
        for &j in ind {
            if !local.contains(&j) {
                self.insert(j)?;
            }
        }
        Ok(())
    }

    /// The indices added since the previous `frontier` call, consuming them:
    /// the next call reports only what arrives after this one.
    pub fn frontier(&mut self) -> &[usize] {
        let from = self.consumed;
        self.consumed = self.entries.len();
        &self.entries[from..]
    }

    /// Every index currently in the set, in insertion order.
    pub fn all(&self) -> &[usize] {
        &self.entries
    }

    /// Number of distinct indices held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empty the set and frontier. Costs O(indices held), not O(capacity).
    pub fn reset(&mut self) {
        for &slot in &self.slots {
            self.table[slot] = EMPTY;
        }
        self.slots.clear();
        self.entries.clear();
        self.consumed = 0;
    }
}

impl Default for RowPattern {
    fn default() -> Self {
        Self::new()
    }
}
