//! Randomized order statistics
//!
//! Threshold selection needs the k-th smallest of each row's scaled
//! magnitudes. [`randomized_select`] finds it in expected linear time with
//! Lomuto partitioning around a uniformly random pivot, reordering the
//! buffer in place.

use rand::Rng;

/// The `k`-th smallest element of `vals` (1-based, `1 <= k <= vals.len()`),
/// partially reordering `vals` in the process.
pub fn randomized_select<R: Rng>(vals: &mut [f64], k: usize, rng: &mut R) -> f64 {
    debug_assert!(!vals.is_empty());
    debug_assert!(1 <= k && k <= vals.len());

    let mut lo = 0;
    let mut hi = vals.len() - 1;
    let mut want = k;
    loop {
        if lo == hi {
            return vals[lo];
        }
        // Lomuto partition around a random pivot.
        let pivot_at = rng.gen_range(lo..=hi);
        vals.swap(pivot_at, hi);
        let pivot = vals[hi];
        let mut store = lo;
        for i in lo..hi {
            if vals[i] <= pivot {
                vals.swap(i, store);
                store += 1;
            }
        }
        vals.swap(store, hi);

        let rank = store - lo + 1;
        if want == rank {
            return vals[store];
        }
        if want < rank {
            hi = store - 1;
        } else {
            lo = store + 1;
            want -= rank;
        }
    }
}
