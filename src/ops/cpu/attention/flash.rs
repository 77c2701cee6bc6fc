//! Tiled forward engine with online softmax.
//!
//! One work item per (sequence, query head, query tile). Each item walks
//! the key tiles the mask policy admits and maintains, per query row:
//!
//!   1. Tile scores: `s[j] = dot(q, k[j]) * scale` (`-inf` where masked)
//!   2. Online rescale: `m_new = max(m, max(s))`; previous sum and output
//!      accumulator are multiplied by `exp(m - m_new)`
//!   3. Accumulate: `l += Σ exp(s[j] - m_new)`,
//!      `acc += exp(s[j] - m_new) * v[j]`
//!
//! After the last tile, `out = acc / l` and `lse = m + ln(l)`. This is
//! mathematically the two-pass max-then-normalize softmax in a single pass
//! over K/V, holding only O(tile) state. A row whose mask admits no key
//! keeps `m = -inf` and produces output `0`, logsumexp `-inf`.
//!
//! Every output row and logsumexp entry is written by exactly one work
//! item, and the key-tile loop order is fixed, so repeated calls are
//! bit-identical regardless of worker scheduling.

use rayon::prelude::*;

use super::{dot, q_tile_items, row_off, TILE_K};
use crate::element::Element;
use crate::heads::resolve_kv_head;
use crate::layout::VarlenLayout;
use crate::mask::{MaskSpec, TileCoverage};

/// Tiled varlen attention forward. Inputs are validated by the backend;
/// `scale` is already resolved.
#[allow(clippy::too_many_arguments)]
pub fn flash_varlen_fwd<E: Element>(
    q: &[E],
    k: &[E],
    v: &[E],
    out: &mut [E],
    lse: &mut [f32],
    layout: &VarlenLayout,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    head_dim_v: usize,
    scale: f32,
    mask: MaskSpec,
) {
    let total_q = layout.total_q();
    let group_size = num_heads / num_kv_heads;
    let items = q_tile_items(layout, num_heads);

    let out_addr = out.as_mut_ptr() as usize;
    let lse_addr = lse.as_mut_ptr() as usize;

    items.par_iter().for_each(|item| {
        let span = layout.spans()[item.seq];
        let len_q = span.len_q();
        let len_k = span.len_k();
        let kv_head = resolve_kv_head(item.head, group_size);
        let tile_rows = item.q_end - item.q_start;

        // Running softmax state per query row of this tile.
        let mut row_max = vec![f32::NEG_INFINITY; tile_rows];
        let mut row_sum = vec![0.0f32; tile_rows];
        let mut acc = vec![0.0f32; tile_rows * head_dim_v];
        let mut scores = [0.0f32; TILE_K];

        for k_start in (0..len_k).step_by(TILE_K) {
            let k_end = (k_start + TILE_K).min(len_k);
            let coverage = mask.coverage(item.q_start, item.q_end, k_start, k_end, len_q, len_k);
            if coverage == TileCoverage::Skip {
                continue;
            }
            let elementwise = coverage == TileCoverage::Partial;

            for r in 0..tile_rows {
                let qi = item.q_start + r;
                let q_base = row_off(span.q_start + qi, num_heads, item.head, head_dim);
                let q_row = &q[q_base..q_base + head_dim];

                // Phase 1: scores for this row against the key tile.
                let mut tile_max = f32::NEG_INFINITY;
                for (j, ki) in (k_start..k_end).enumerate() {
                    if elementwise && !mask.is_attendable(qi, ki, len_q, len_k) {
                        scores[j] = f32::NEG_INFINITY;
                        continue;
                    }
                    let k_base = row_off(span.k_start + ki, num_kv_heads, kv_head, head_dim);
                    let s = dot(q_row, &k[k_base..k_base + head_dim]) * scale;
                    scores[j] = s;
                    if s > tile_max {
                        tile_max = s;
                    }
                }

                // Phase 2: rescale previous accumulator to the new max.
                let new_max = row_max[r].max(tile_max);
                if new_max == f32::NEG_INFINITY {
                    // Nothing attendable so far for this row.
                    continue;
                }
                let alpha = (row_max[r] - new_max).exp();
                row_sum[r] *= alpha;
                let acc_row = &mut acc[r * head_dim_v..(r + 1) * head_dim_v];
                for a in acc_row.iter_mut() {
                    *a *= alpha;
                }

                // Phase 3: fold in this tile's probabilities and values.
                let mut tile_sum = 0.0f32;
                for (j, ki) in (k_start..k_end).enumerate() {
                    let s = scores[j];
                    if s == f32::NEG_INFINITY {
                        continue;
                    }
                    let p = (s - new_max).exp();
                    tile_sum += p;
                    let v_base = row_off(span.k_start + ki, num_kv_heads, kv_head, head_dim_v);
                    let v_row = &v[v_base..v_base + head_dim_v];
                    for (a, vv) in acc_row.iter_mut().zip(v_row.iter()) {
                        *a += p * vv.to_f32();
                    }
                }

                row_max[r] = new_max;
                row_sum[r] += tile_sum;
            }
        }

        // Finalize: out = acc / l, lse = m + ln(l). Rows that attended
        // nothing get zeros and -inf instead of a division by zero.
        //
        // SAFETY: this work item exclusively owns the output rows of its
        // (sequence, head, query tile) triple and the matching logsumexp
        // entries; no other item writes them.
        let out_ptr = out_addr as *mut E;
        let lse_ptr = lse_addr as *mut f32;
        for r in 0..tile_rows {
            let global_q = span.q_start + item.q_start + r;
            let out_base = row_off(global_q, num_heads, item.head, head_dim_v);
            unsafe {
                if row_max[r] == f32::NEG_INFINITY {
                    for d in 0..head_dim_v {
                        *out_ptr.add(out_base + d) = E::from_f32(0.0);
                    }
                    *lse_ptr.add(item.head * total_q + global_q) = f32::NEG_INFINITY;
                } else {
                    let inv_sum = row_sum[r].recip();
                    for d in 0..head_dim_v {
                        *out_ptr.add(out_base + d) = E::from_f32(acc[r * head_dim_v + d] * inv_sum);
                    }
                    *lse_ptr.add(item.head * total_q + global_q) =
                        row_max[r] + row_sum[r].ln();
                }
            }
        }
    });
}
