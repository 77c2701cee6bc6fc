//! Packed variable-length batch layout.
//!
//! A batch of B sequences is packed along one axis; sequence `i` occupies
//! the half-open token range `[cu_seqlens[i], cu_seqlens[i + 1])`. The
//! resolver validates the two offset tables once, up front, and produces a
//! flat span table (one `[SeqSpan]` arena indexed by batch position) that
//! both engines use to translate local `(qi, ki)` coordinates into the
//! packed arrays.
//!
//! Uniform batching — every sequence sharing one length — is the
//! degenerate case of the same layout: the kernels only ever see resolved
//! spans, so a uniform batch is bit-identical to packing it explicitly.

use crate::error::{Error, Result};

/// Packed-array coordinates of one sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqSpan {
    /// First query row of this sequence in the packed query/output arrays.
    pub q_start: usize,
    /// One past the last query row.
    pub q_end: usize,
    /// First key/value row in the packed key/value arrays.
    pub k_start: usize,
    /// One past the last key/value row.
    pub k_end: usize,
}

impl SeqSpan {
    /// Number of query rows.
    #[inline]
    pub fn len_q(&self) -> usize {
        self.q_end - self.q_start
    }

    /// Number of key/value rows.
    #[inline]
    pub fn len_k(&self) -> usize {
        self.k_end - self.k_start
    }
}

/// Validated span table for one packed batch.
#[derive(Debug, Clone)]
pub struct VarlenLayout {
    spans: Vec<SeqSpan>,
    total_q: usize,
    total_k: usize,
    max_seqlen_q: usize,
    max_seqlen_k: usize,
}

impl VarlenLayout {
    /// Resolve and validate cumulative offset tables.
    ///
    /// Both tables must have the same length B+1, start at 0, and be
    /// non-decreasing; `max_seqlen_q` / `max_seqlen_k` must equal the true
    /// per-sequence maxima. With `is_varlen = false` every sequence must
    /// additionally share one query length and one key length.
    pub fn new(
        cu_seqlens_q: &[i32],
        cu_seqlens_k: &[i32],
        max_seqlen_q: usize,
        max_seqlen_k: usize,
        is_varlen: bool,
    ) -> Result<Self> {
        if cu_seqlens_q.is_empty() || cu_seqlens_k.is_empty() {
            return Err(invalid("cu_seqlens tables must have length B + 1 >= 1"));
        }
        if cu_seqlens_q.len() != cu_seqlens_k.len() {
            return Err(invalid(format!(
                "cu_seqlens_q has {} entries but cu_seqlens_k has {}",
                cu_seqlens_q.len(),
                cu_seqlens_k.len()
            )));
        }
        if cu_seqlens_q[0] != 0 || cu_seqlens_k[0] != 0 {
            return Err(invalid("cu_seqlens[0] must be 0"));
        }

        let batch = cu_seqlens_q.len() - 1;
        let mut spans = Vec::with_capacity(batch);
        let mut true_max_q = 0usize;
        let mut true_max_k = 0usize;

        for i in 0..batch {
            let (q0, q1) = (cu_seqlens_q[i], cu_seqlens_q[i + 1]);
            let (k0, k1) = (cu_seqlens_k[i], cu_seqlens_k[i + 1]);
            if q1 < q0 || k1 < k0 {
                return Err(invalid(format!(
                    "cu_seqlens must be non-decreasing (sequence {i})"
                )));
            }
            let span = SeqSpan {
                q_start: q0 as usize,
                q_end: q1 as usize,
                k_start: k0 as usize,
                k_end: k1 as usize,
            };
            true_max_q = true_max_q.max(span.len_q());
            true_max_k = true_max_k.max(span.len_k());
            spans.push(span);
        }

        if true_max_q != max_seqlen_q {
            return Err(invalid(format!(
                "declared max_seqlen_q = {max_seqlen_q} but true maximum is {true_max_q}"
            )));
        }
        if true_max_k != max_seqlen_k {
            return Err(invalid(format!(
                "declared max_seqlen_k = {max_seqlen_k} but true maximum is {true_max_k}"
            )));
        }

        if !is_varlen {
            let uniform = spans
                .iter()
                .all(|s| s.len_q() == max_seqlen_q && s.len_k() == max_seqlen_k);
            if !uniform {
                return Err(invalid(
                    "is_varlen = false requires every sequence to share one length",
                ));
            }
        }

        Ok(Self {
            spans,
            total_q: cu_seqlens_q[batch] as usize,
            total_k: cu_seqlens_k[batch] as usize,
            max_seqlen_q,
            max_seqlen_k,
        })
    }

    /// Number of sequences in the batch.
    #[inline]
    pub fn batch_size(&self) -> usize {
        self.spans.len()
    }

    /// Per-sequence spans, indexed by batch position.
    #[inline]
    pub fn spans(&self) -> &[SeqSpan] {
        &self.spans
    }

    /// Total packed query rows (`cu_seqlens_q[B]`).
    #[inline]
    pub fn total_q(&self) -> usize {
        self.total_q
    }

    /// Total packed key/value rows (`cu_seqlens_k[B]`).
    #[inline]
    pub fn total_k(&self) -> usize {
        self.total_k
    }

    /// Longest query sequence.
    #[inline]
    pub fn max_seqlen_q(&self) -> usize {
        self.max_seqlen_q
    }

    /// Longest key sequence.
    #[inline]
    pub fn max_seqlen_k(&self) -> usize {
        self.max_seqlen_k
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidLayout {
        reason: reason.into(),
    }
}
