//! Attention operation traits

use crate::element::Element;
use crate::error::Result;
use crate::mask::MaskSpec;

/// Tiled flash attention over packed variable-length batches.
///
/// This is a PRIMITIVE op (the fused kernel IS the algorithm): the full
/// `(len_q, len_k)` score matrix is never materialized. Each backend
/// provides its own implementation behind this seam.
///
/// # Layout contract
///
/// - `q`: `[total_q, num_heads, head_dim]` — packed queries (row-major)
/// - `k`: `[total_k, num_kv_heads, head_dim]` — packed keys
/// - `v`: `[total_k, num_kv_heads, head_dim_v]` — packed values
/// - `out`: `[total_q, num_heads, head_dim_v]`
/// - `lse`: `[num_heads, total_q]` — natural-log softmax normalizer, always
///   `f32`, required by the backward pass
/// - `cu_seqlens_q` / `cu_seqlens_k`: `[batch_size + 1]` cumulative offsets
///   (I32); `cu_seqlens[0] = 0`, sequence `i` spans
///   `[cu_seqlens[i], cu_seqlens[i + 1])`, and the final entry is the total
///   packed length of that axis
///
/// `total_q` and `total_k` are taken from the offset tables; every slice
/// length is validated against them before any tile work starts.
///
/// # GQA support
///
/// When `num_kv_heads < num_heads`, each block of
/// `num_heads / num_kv_heads` consecutive query heads reads one KV head.
/// `num_heads` must be divisible by `num_kv_heads`; the kernels resolve the
/// mapping per query head without physically duplicating K/V, and backward
/// folds every query head's contribution into its shared KV head gradient.
///
/// # Masking
///
/// [`MaskSpec`] carries the causal flag and sliding-window bounds. Key
/// tiles with nothing attendable are skipped entirely; fully attendable
/// tiles run unmasked; only boundary tiles pay the per-element predicate.
///
/// # Zero-attendable rows
///
/// A query row whose mask admits no key (degenerate windows, or an empty
/// key sequence) produces output `0` and logsumexp `-inf`, and contributes
/// zero gradient. This is a defined result, not an error, and never a NaN.
///
/// # Determinism
///
/// For fixed inputs, repeated calls are bit-identical: tiling and
/// accumulation orders are fixed and data-independent, and every output
/// location is written by exactly one worker. This holds for `dq`, `dk`,
/// and `dv` as well as the forward outputs.
#[allow(clippy::too_many_arguments)]
pub trait FlashAttentionOps {
    /// Forward pass: `out = softmax(scale * Q K^T + mask) V` per sequence,
    /// plus the logsumexp of the masked, scaled scores.
    ///
    /// `softmax_scale` defaults to `1 / sqrt(head_dim)` when `None`.
    /// `is_varlen = false` asserts the batch is uniform (every sequence one
    /// length); results are bit-identical to the packed equivalent.
    fn flash_attention_varlen_fwd<E: Element>(
        &self,
        q: &[E],
        k: &[E],
        v: &[E],
        out: &mut [E],
        lse: &mut [f32],
        cu_seqlens_q: &[i32],
        cu_seqlens_k: &[i32],
        max_seqlen_q: usize,
        max_seqlen_k: usize,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        head_dim_v: usize,
        softmax_scale: Option<f32>,
        mask: MaskSpec,
        is_varlen: bool,
    ) -> Result<()>;

    /// Backward pass: given the forward inputs, `out`, `lse`, and the
    /// incoming output gradient `dout`, recompute attention probabilities
    /// tile-by-tile and accumulate `dq`, `dk`, `dv`.
    ///
    /// Gradient arrays are fully overwritten; they need no zeroing by the
    /// caller. `softmax_scale` and `mask` must match the forward call.
    fn flash_attention_varlen_bwd<E: Element>(
        &self,
        dout: &[E],
        q: &[E],
        k: &[E],
        v: &[E],
        out: &[E],
        lse: &[f32],
        dq: &mut [E],
        dk: &mut [E],
        dv: &mut [E],
        cu_seqlens_q: &[i32],
        cu_seqlens_k: &[i32],
        max_seqlen_q: usize,
        max_seqlen_k: usize,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        head_dim_v: usize,
        softmax_scale: Option<f32>,
        mask: MaskSpec,
    ) -> Result<()>;
}
