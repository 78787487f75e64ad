//! Open-address hash from global indices to dense slots
//!
//! The per-row solve needs to answer "is this global column in the current
//! row's pattern, and at which position" many times per assembled entry.
//! [`IndexHash`] is a linear-probing table sized per solve at
//! `4·max_row_len + 1`, keeping the load factor at or below one quarter.
//! Clearing between rows replays the recorded slot list instead of scanning
//! the table, so reset cost is proportional to the row.

const EMPTY: usize = usize::MAX;

/// Fixed-capacity open-address table mapping a global index to its slot.
pub struct IndexHash {
    table: Vec<usize>,
}

impl IndexHash {
    /// A table with room for `capacity` slots. Callers size this at four
    /// times the largest key count they will insert between resets.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            table: vec![EMPTY; capacity],
        }
    }

    /// Insert `key`, returning its slot and whether it was newly inserted.
    ///
    /// Panics if the table is full, which the sizing contract rules out; a
    /// full table is a programming defect, not a recoverable condition.
    pub fn insert(&mut self, key: usize) -> (usize, bool) {
        debug_assert_ne!(key, EMPTY);
        let cap = self.table.len();
        let mut at = key % cap;
        for _ in 0..cap {
            let cur = self.table[at];
            if cur == key {
                return (at, false);
            }
            if cur == EMPTY {
                self.table[at] = key;
                return (at, true);
            }
            at += 1;
            if at == cap {
                at = 0;
            }
        }
        panic!("index hash of capacity {cap} is full");
    }

    /// The slot of `key`, if present.
    pub fn lookup(&self, key: usize) -> Option<usize> {
        let cap = self.table.len();
        let mut at = key % cap;
        for _ in 0..cap {
            let cur = self.table[at];
            if cur == key {
                return Some(at);
            }
            if cur == EMPTY {
                return None;
            }
            at += 1;
            if at == cap {
                at = 0;
            }
        }
        None
    }

    /// Clear exactly the listed slots.
    pub fn reset(&mut self, slots: &[usize]) {
        for &slot in slots {
            self.table[slot] = EMPTY;
        }
    }
}
