//! Recompute-based backward engine.
//!
//! Probabilities are re-derived tile-by-tile from the saved logsumexp —
//! `p = exp(scale * q·k - lse)` — instead of storing the forward
//! probability matrix. Gradients follow the softmax Jacobian-vector
//! product: with `D = rowsum(dOut ⊙ Out)` per query row,
//!
//!   dS = P ⊙ (dP - D)          where dP = dOut · V^T
//!   dQ += scale * dS · K
//!   dK += scale * dS^T · Q
//!   dV += P^T · dOut
//!
//! Three fixed-order passes keep every gradient location owned by exactly
//! one worker, so repeated calls are bit-identical — including dQ:
//!
//!   1. delta: `D` per (query row, head), parallel over query rows
//!   2. dQ: parallel over (sequence, query head, query tile); key tiles
//!      ascending inside the owner
//!   3. dK/dV: parallel over (sequence, kv head, key tile); the group's
//!      query heads and the query tiles ascending inside the owner, which
//!      is where GQA gradients from all query heads of a group fold into
//!      the shared kv head
//!
//! Rows with logsumexp `-inf` attended nothing in the forward pass; they
//! are skipped and contribute exactly zero, never a NaN.

use rayon::prelude::*;

use super::{dot, q_tile_items, row_off, TILE_K, TILE_Q};
use crate::element::Element;
use crate::heads::resolve_kv_head;
use crate::layout::VarlenLayout;
use crate::mask::{MaskSpec, TileCoverage};

/// One (sequence, kv head, key tile) unit of dK/dV work.
#[derive(Clone, Copy)]
struct KTile {
    seq: usize,
    kv_head: usize,
    /// Local key range within the sequence.
    k_start: usize,
    k_end: usize,
}

fn k_tile_items(layout: &VarlenLayout, num_kv_heads: usize) -> Vec<KTile> {
    let mut items = Vec::new();
    for (seq, span) in layout.spans().iter().enumerate() {
        for kv_head in 0..num_kv_heads {
            for k_start in (0..span.len_k()).step_by(TILE_K) {
                items.push(KTile {
                    seq,
                    kv_head,
                    k_start,
                    k_end: (k_start + TILE_K).min(span.len_k()),
                });
            }
        }
    }
    items
}

/// Tiled varlen attention backward. Inputs are validated by the backend;
/// `scale` is already resolved and must match the forward call.
#[allow(clippy::too_many_arguments)]
pub fn flash_varlen_bwd<E: Element>(
    dout: &[E],
    q: &[E],
    k: &[E],
    v: &[E],
    out: &[E],
    lse: &[f32],
    dq: &mut [E],
    dk: &mut [E],
    dv: &mut [E],
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

    // Pass 1: D = rowsum(dOut ⊙ Out) per (query row, head).
    let mut delta = vec![0.0f32; total_q * num_heads];
    delta
        .par_chunks_mut(num_heads.max(1))
        .enumerate()
        .for_each(|(g, delta_row)| {
            for (h, slot) in delta_row.iter_mut().enumerate() {
                let base = row_off(g, num_heads, h, head_dim_v);
                let mut acc = 0.0f32;
                for d in 0..head_dim_v {
                    acc += dout[base + d].to_f32() * out[base + d].to_f32();
                }
                *slot = acc;
            }
        });

    // Pass 2: dQ, one owner per (sequence, query head, query tile).
    let dq_addr = dq.as_mut_ptr() as usize;
    q_tile_items(layout, num_heads).par_iter().for_each(|item| {
        let span = layout.spans()[item.seq];
        let len_q = span.len_q();
        let len_k = span.len_k();
        let kv_head = resolve_kv_head(item.head, group_size);
        let tile_rows = item.q_end - item.q_start;
        let mut dq_acc = vec![0.0f32; tile_rows * head_dim];

        for k_start in (0..len_k).step_by(TILE_K) {
            let k_end = (k_start + TILE_K).min(len_k);
            let coverage = mask.coverage(item.q_start, item.q_end, k_start, k_end, len_q, len_k);
            if coverage == TileCoverage::Skip {
                continue;
            }
            let elementwise = coverage == TileCoverage::Partial;

            for r in 0..tile_rows {
                let qi = item.q_start + r;
                let global_q = span.q_start + qi;
                let row_lse = lse[item.head * total_q + global_q];
                if row_lse == f32::NEG_INFINITY {
                    continue;
                }
                let row_delta = delta[global_q * num_heads + item.head];
                let q_base = row_off(global_q, num_heads, item.head, head_dim);
                let q_row = &q[q_base..q_base + head_dim];
                let do_base = row_off(global_q, num_heads, item.head, head_dim_v);
                let do_row = &dout[do_base..do_base + head_dim_v];
                let dq_row = &mut dq_acc[r * head_dim..(r + 1) * head_dim];

                for ki in k_start..k_end {
                    if elementwise && !mask.is_attendable(qi, ki, len_q, len_k) {
                        continue;
                    }
                    let k_base = row_off(span.k_start + ki, num_kv_heads, kv_head, head_dim);
                    let k_row = &k[k_base..k_base + head_dim];
                    let v_base = row_off(span.k_start + ki, num_kv_heads, kv_head, head_dim_v);
                    let v_row = &v[v_base..v_base + head_dim_v];

                    let p = (dot(q_row, k_row) * scale - row_lse).exp();
                    let dp = dot(do_row, v_row);
                    let coeff = scale * p * (dp - row_delta);
                    for (g_acc, kk) in dq_row.iter_mut().zip(k_row.iter()) {
                        *g_acc += coeff * kk.to_f32();
                    }
                }
            }
        }

        // SAFETY: this work item exclusively owns the dq rows of its
        // (sequence, head, query tile) triple.
        let dq_ptr = dq_addr as *mut E;
        for r in 0..tile_rows {
            let global_q = span.q_start + item.q_start + r;
            let dq_base = row_off(global_q, num_heads, item.head, head_dim);
            for d in 0..head_dim {
                unsafe {
                    *dq_ptr.add(dq_base + d) = E::from_f32(dq_acc[r * head_dim + d]);
                }
            }
        }
    });

    // Pass 3: dK/dV, one owner per (sequence, kv head, key tile). The
    // reduction over query tiles — and over the query heads of the group —
    // runs serially inside the owner in ascending order.
    let dk_addr = dk.as_mut_ptr() as usize;
    let dv_addr = dv.as_mut_ptr() as usize;
    k_tile_items(layout, num_kv_heads)
        .par_iter()
        .for_each(|item| {
            let span = layout.spans()[item.seq];
            let len_q = span.len_q();
            let len_k = span.len_k();
            let tile_cols = item.k_end - item.k_start;
            let mut dk_acc = vec![0.0f32; tile_cols * head_dim];
            let mut dv_acc = vec![0.0f32; tile_cols * head_dim_v];

            for head in item.kv_head * group_size..(item.kv_head + 1) * group_size {
                for q_start in (0..len_q).step_by(TILE_Q) {
                    let q_end = (q_start + TILE_Q).min(len_q);
                    let coverage =
                        mask.coverage(q_start, q_end, item.k_start, item.k_end, len_q, len_k);
                    if coverage == TileCoverage::Skip {
                        continue;
                    }
                    let elementwise = coverage == TileCoverage::Partial;

                    for qi in q_start..q_end {
                        let global_q = span.q_start + qi;
                        let row_lse = lse[head * total_q + global_q];
                        if row_lse == f32::NEG_INFINITY {
                            continue;
                        }
                        let row_delta = delta[global_q * num_heads + head];
                        let q_base = row_off(global_q, num_heads, head, head_dim);
                        let q_row = &q[q_base..q_base + head_dim];
                        let do_base = row_off(global_q, num_heads, head, head_dim_v);
                        let do_row = &dout[do_base..do_base + head_dim_v];

                        for (j, ki) in (item.k_start..item.k_end).enumerate() {
                            if elementwise && !mask.is_attendable(qi, ki, len_q, len_k) {
                                continue;
                            }
                            let k_base =
                                row_off(span.k_start + ki, num_kv_heads, item.kv_head, head_dim);
                            let k_row = &k[k_base..k_base + head_dim];
                            let v_base =
                                row_off(span.k_start + ki, num_kv_heads, item.kv_head, head_dim_v);
                            let v_row = &v[v_base..v_base + head_dim_v];

                            let p = (dot(q_row, k_row) * scale - row_lse).exp();
                            let dp = dot(do_row, v_row);
                            let coeff = scale * p * (dp - row_delta);

                            let dk_row = &mut dk_acc[j * head_dim..(j + 1) * head_dim];
                            for (g_acc, qq) in dk_row.iter_mut().zip(q_row.iter()) {
                                *g_acc += coeff * qq.to_f32();
                            }
                            let dv_row = &mut dv_acc[j * head_dim_v..(j + 1) * head_dim_v];
                            for (g_acc, dd) in dv_row.iter_mut().zip(do_row.iter()) {
                                *g_acc += p * dd.to_f32();
                            }
                        }
                    }
                }
            }

            // SAFETY: this work item exclusively owns the dk/dv rows of its
            // (sequence, kv head, key tile) triple.
            let dk_ptr = dk_addr as *mut E;
            let dv_ptr = dv_addr as *mut E;
            for j in 0..tile_cols {
                let global_k = span.k_start + item.k_start + j;
                let dk_base = row_off(global_k, num_kv_heads, item.kv_head, head_dim);
                for d in 0..head_dim {
                    unsafe {
                        *dk_ptr.add(dk_base + d) = E::from_f32(dk_acc[j * head_dim + d]);
                    }
                }
                let dv_base = row_off(global_k, num_kv_heads, item.kv_head, head_dim_v);
                for d in 0..head_dim_v {
                    unsafe {
                        *dv_ptr.add(dv_base + d) = E::from_f32(dv_acc[j * head_dim_v + d]);
                    }
                }
            }
        });
}
