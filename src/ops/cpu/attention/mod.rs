//! CPU attention kernels.
//!
//! `flash` holds the tiled forward engine, `backward` the recompute-based
//! gradient engine. Both consume the resolved [`VarlenLayout`] span table
//! and the [`MaskSpec`] tile decisions; neither ever materializes a full
//! score matrix.
//!
//! [`VarlenLayout`]: crate::layout::VarlenLayout
//! [`MaskSpec`]: crate::mask::MaskSpec

pub mod backward;
pub mod flash;

use crate::element::Element;
use crate::layout::VarlenLayout;

/// Query/key tile extents shared by the forward and backward engines.
/// Sized so one tile of scores plus the per-row running state stays within
/// L1/L2 for common head dims.
pub(crate) const TILE_Q: usize = 64;
pub(crate) const TILE_K: usize = 64;

/// One (sequence, query head, query tile) unit of work. Used by the
/// forward engine and the backward dQ pass; the owning item is the only
/// writer of its query rows.
#[derive(Clone, Copy)]
pub(crate) struct QTile {
    pub seq: usize,
    pub head: usize,
    /// Local query range within the sequence.
    pub q_start: usize,
    pub q_end: usize,
}

/// Build the flat query-tile work list in a fixed order.
pub(crate) fn q_tile_items(layout: &VarlenLayout, num_heads: usize) -> Vec<QTile> {
    let mut items = Vec::new();
    for (seq, span) in layout.spans().iter().enumerate() {
        for head in 0..num_heads {
            for q_start in (0..span.len_q()).step_by(TILE_Q) {
                items.push(QTile {
                    seq,
                    head,
                    q_start,
                    q_end: (q_start + TILE_Q).min(span.len_q()),
                });
            }
        }
    }
    items
}

/// Offset of `(row, head)` in a packed `[rows, heads, dim]` array.
#[inline(always)]
pub(crate) fn row_off(row: usize, num_heads: usize, head: usize, dim: usize) -> usize {
    (row * num_heads + head) * dim
}

/// Widening f32 dot product of two element rows.
#[inline]
pub(crate) fn dot<E: Element>(a: &[E], b: &[E]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        sum += x.to_f32() * y.to_f32();
    }
    sum
}
