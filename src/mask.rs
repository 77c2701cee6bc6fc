//! Causal and sliding-window mask policy.
//!
//! Attendability follows the tril-diagonal convention: query `qi` of a
//! sequence with `len_q` queries and `len_k` keys is aligned with key
//! position `qi + (len_k - len_q)`. Causal masking allows keys at or before
//! the aligned position; a sliding window further bounds the distance to it
//! on either side. Both constraints intersect when both are active.
//!
//! The policy is evaluated at two granularities:
//! - per (query-tile, key-tile) pair, classifying the tile as [`Skip`],
//!   [`Full`], or [`Partial`] so the engines touch no skipped tile at all
//!   and pay per-element masking only on partial tiles;
//! - per (qi, ki) pair inside partial tiles.
//!
//! All decisions use exact integer arithmetic; no floating-point comparison
//! is involved.
//!
//! [`Skip`]: TileCoverage::Skip
//! [`Full`]: TileCoverage::Full
//! [`Partial`]: TileCoverage::Partial

use serde::{Deserialize, Serialize};

/// Mask configuration for one attention call.
///
/// `window_left` / `window_right` bound how far before / after its aligned
/// key position a query may look; a negative value leaves that side
/// unbounded. A Mistral-style causal sliding window of `w` keys (self
/// included) is `causal = true, window_left = w - 1, window_right = 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskSpec {
    /// Restrict each query to keys at or before its aligned position.
    pub causal: bool,
    /// Max lookback distance from the aligned position; negative = unbounded.
    #[serde(default = "unbounded")]
    pub window_left: i32,
    /// Max lookahead distance from the aligned position; negative = unbounded.
    #[serde(default = "unbounded")]
    pub window_right: i32,
}

fn unbounded() -> i32 {
    -1
}

impl Default for MaskSpec {
    fn default() -> Self {
        Self {
            causal: false,
            window_left: -1,
            window_right: -1,
        }
    }
}

/// Classification of one (query-tile, key-tile) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileCoverage {
    /// No pair in the tile is attendable; the engine must not touch it.
    Skip,
    /// Every pair is attendable; no per-element masking needed.
    Full,
    /// Mixed; apply the per-element predicate inside the tile.
    Partial,
}

impl MaskSpec {
    /// Fully bidirectional attention (no mask).
    pub fn none() -> Self {
        Self::default()
    }

    /// Plain causal attention without a window.
    pub fn causal() -> Self {
        Self {
            causal: true,
            ..Self::default()
        }
    }

    /// Inclusive `[lo, hi]` key-index bounds attendable by query `qi`,
    /// unclamped to the valid key range. `hi < lo` never occurs for
    /// non-negative window values; rows with zero attendable keys arise
    /// from the bounds falling entirely outside `0..len_k`.
    #[inline]
    fn key_bounds(&self, qi: usize, len_q: usize, len_k: usize) -> (i64, i64) {
        let aligned = qi as i64 + len_k as i64 - len_q as i64;
        let lo = if self.window_left >= 0 {
            aligned - self.window_left as i64
        } else {
            i64::MIN
        };
        let mut hi = if self.window_right >= 0 {
            aligned + self.window_right as i64
        } else {
            i64::MAX
        };
        if self.causal {
            hi = hi.min(aligned);
        }
        (lo, hi)
    }

    /// Element-wise attendability predicate.
    #[inline]
    pub fn is_attendable(&self, qi: usize, ki: usize, len_q: usize, len_k: usize) -> bool {
        let (lo, hi) = self.key_bounds(qi, len_q, len_k);
        let ki = ki as i64;
        ki >= lo && ki <= hi
    }

    /// Classify the tile spanning local queries `q_start..q_end` against
    /// local keys `k_start..k_end` (both half-open, non-empty).
    ///
    /// The per-row key bounds shift monotonically with `qi`, so the whole
    /// tile is decided from the first and last query rows alone.
    pub fn coverage(
        &self,
        q_start: usize,
        q_end: usize,
        k_start: usize,
        k_end: usize,
        len_q: usize,
        len_k: usize,
    ) -> TileCoverage {
        debug_assert!(q_start < q_end && k_start < k_end);
        let (lo_first, hi_first) = self.key_bounds(q_start, len_q, len_k);
        let (lo_last, hi_last) = self.key_bounds(q_end - 1, len_q, len_k);
        let k_lo = k_start as i64;
        let k_hi = k_end as i64 - 1;

        if hi_last < k_lo || lo_first > k_hi {
            TileCoverage::Skip
        } else if lo_last <= k_lo && hi_first >= k_hi {
            TileCoverage::Full
        } else {
            TileCoverage::Partial
        }
    }

    /// Exact number of attendable (qi, ki) pairs for one sequence.
    ///
    /// This is the FLOP-accounting quantity benchmark harnesses divide by;
    /// under causal or windowed masks it is what makes the practical cost
    /// sub-quadratic.
    pub fn visible_pair_count(&self, len_q: usize, len_k: usize) -> u64 {
        let mut count = 0u64;
        for qi in 0..len_q {
            let (lo, hi) = self.key_bounds(qi, len_q, len_k);
            let lo = lo.max(0);
            let hi = hi.min(len_k as i64 - 1);
            if hi >= lo {
                count += (hi - lo + 1) as u64;
            }
        }
        count
    }
}
