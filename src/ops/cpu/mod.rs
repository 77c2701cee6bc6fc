//! CPU backend for the flash attention ops.
//!
//! `CpuBackend` validates the layout, head configuration, and every slice
//! length up front (fail fast, no partial writes), resolves the softmax
//! scale default, then hands off to the tiled kernels in [`attention`].
//! Parallelism inside the kernels is rayon work-stealing over fixed work
//! lists; see the kernel modules for the determinism argument.

pub mod attention;

use crate::element::Element;
use crate::error::{Error, Result};
use crate::heads;
use crate::layout::VarlenLayout;
use crate::mask::MaskSpec;
use crate::ops::traits::FlashAttentionOps;

/// CPU implementation of [`FlashAttentionOps`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

fn check_len(array: &'static str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(Error::ShapeMismatch {
            array,
            expected,
            got,
        });
    }
    Ok(())
}

impl FlashAttentionOps for CpuBackend {
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
    ) -> Result<()> {
        let layout = VarlenLayout::new(
            cu_seqlens_q,
            cu_seqlens_k,
            max_seqlen_q,
            max_seqlen_k,
            is_varlen,
        )?;
        heads::kv_group_size(num_heads, num_kv_heads)?;
        let total_q = layout.total_q();
        let total_k = layout.total_k();
        check_len("q", q.len(), total_q * num_heads * head_dim)?;
        check_len("k", k.len(), total_k * num_kv_heads * head_dim)?;
        check_len("v", v.len(), total_k * num_kv_heads * head_dim_v)?;
        check_len("out", out.len(), total_q * num_heads * head_dim_v)?;
        check_len("lse", lse.len(), num_heads * total_q)?;

        let scale = softmax_scale.unwrap_or_else(|| (head_dim as f32).sqrt().recip());
        tracing::debug!(
            batch = layout.batch_size(),
            total_q,
            total_k,
            num_heads,
            num_kv_heads,
            head_dim,
            head_dim_v,
            causal = mask.causal,
            "dispatching varlen flash attention forward"
        );

        attention::flash::flash_varlen_fwd(
            q,
            k,
            v,
            out,
            lse,
            &layout,
            num_heads,
            num_kv_heads,
            head_dim,
            head_dim_v,
            scale,
            mask,
        );
        Ok(())
    }

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
    ) -> Result<()> {
        let layout = VarlenLayout::new(
            cu_seqlens_q,
            cu_seqlens_k,
            max_seqlen_q,
            max_seqlen_k,
            true,
        )?;
        heads::kv_group_size(num_heads, num_kv_heads)?;
        let total_q = layout.total_q();
        let total_k = layout.total_k();
        check_len("q", q.len(), total_q * num_heads * head_dim)?;
        check_len("k", k.len(), total_k * num_kv_heads * head_dim)?;
        check_len("v", v.len(), total_k * num_kv_heads * head_dim_v)?;
        check_len("out", out.len(), total_q * num_heads * head_dim_v)?;
        check_len("dout", dout.len(), total_q * num_heads * head_dim_v)?;
        check_len("lse", lse.len(), num_heads * total_q)?;
        check_len("dq", dq.len(), total_q * num_heads * head_dim)?;
        check_len("dk", dk.len(), total_k * num_kv_heads * head_dim)?;
        check_len("dv", dv.len(), total_k * num_kv_heads * head_dim_v)?;

        let scale = softmax_scale.unwrap_or_else(|| (head_dim as f32).sqrt().recip());
        tracing::debug!(
            batch = layout.batch_size(),
            total_q,
            total_k,
            num_heads,
            num_kv_heads,
            causal = mask.causal,
            "dispatching varlen flash attention backward"
        );

        attention::backward::flash_varlen_bwd(
            dout,
            q,
            k,
            v,
            out,
            lse,
            dq,
            dk,
            dv,
            &layout,
            num_heads,
            num_kv_heads,
            head_dim,
            head_dim_v,
            scale,
            mask,
        );
        Ok(())
    }
}
