//! Grouped-query head broadcasting.
//!
//! With GQA, `num_kv_heads` key/value heads serve `num_heads` query heads;
//! each block of `num_heads / num_kv_heads` consecutive query heads reads
//! the same KV head. The mapping is a stateless integer division used
//! identically by the forward and backward engines — no dispatch table, no
//! physical duplication of K/V.

use crate::error::{Error, Result};

/// Number of query heads sharing one KV head.
///
/// Fails with [`Error::InvalidHeadConfig`] when `num_kv_heads` is zero or
/// does not evenly divide `num_heads`.
pub fn kv_group_size(num_heads: usize, num_kv_heads: usize) -> Result<usize> {
    if num_heads == 0 || num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
        return Err(Error::InvalidHeadConfig {
            num_heads,
            num_kv_heads,
        });
    }
    Ok(num_heads / num_kv_heads)
}

/// KV head owning query head `q_head`, given a validated group size.
#[inline(always)]
pub fn resolve_kv_head(q_head: usize, group_size: usize) -> usize {
    q_head / group_size
}
