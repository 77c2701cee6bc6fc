//! Shared helpers for the attnr integration tests: a dense brute-force
//! reference (explicit score matrix, two-pass softmax, analytic
//! gradients), deterministic and seeded-random data generation, and the
//! comparison metrics the kernels are held to.
#![allow(dead_code)]

use attnr::MaskSpec;
use rand::rngs::StdRng;
use rand::Rng;

/// Deterministic pseudo-random data using a sin-based pattern.
pub fn det_data(n: usize, phase: f32) -> Vec<f32> {
    (0..n).map(|i| (i as f32 * phase).sin() * 0.5).collect()
}

/// Seeded uniform data in [-1, 1).
pub fn rand_data(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

/// Random per-sequence lengths with `len_k >= len_q`, plus their
/// cumulative offset tables and true maxima.
pub struct RandomBatch {
    pub cu_seqlens_q: Vec<i32>,
    pub cu_seqlens_k: Vec<i32>,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
    pub total_q: usize,
    pub total_k: usize,
}

pub fn random_batch(rng: &mut StdRng, batch: usize, max_len: usize) -> RandomBatch {
    let mut cu_q = vec![0i32];
    let mut cu_k = vec![0i32];
    let (mut max_q, mut max_k) = (0usize, 0usize);
    for _ in 0..batch {
        let len_q = rng.gen_range(1..=max_len);
        let len_k = rng.gen_range(len_q..=max_len);
        max_q = max_q.max(len_q);
        max_k = max_k.max(len_k);
        cu_q.push(cu_q.last().unwrap() + len_q as i32);
        cu_k.push(cu_k.last().unwrap() + len_k as i32);
    }
    RandomBatch {
        total_q: *cu_q.last().unwrap() as usize,
        total_k: *cu_k.last().unwrap() as usize,
        cu_seqlens_q: cu_q,
        cu_seqlens_k: cu_k,
        max_seqlen_q: max_q,
        max_seqlen_k: max_k,
    }
}

/// Independent attendability oracle, written from the tril-diagonal
/// formula rather than shared with the crate's mask policy.
fn allowed(qi: usize, ki: usize, len_q: usize, len_k: usize, mask: MaskSpec) -> bool {
    let aligned = qi as i64 + len_k as i64 - len_q as i64;
    let ki = ki as i64;
    if mask.causal && ki > aligned {
        return false;
    }
    if mask.window_left >= 0 && ki < aligned - mask.window_left as i64 {
        return false;
    }
    if mask.window_right >= 0 && ki > aligned + mask.window_right as i64 {
        return false;
    }
    true
}

/// Dense reference forward over a packed batch.
///
/// Returns `(out, lse)` with the kernel's layouts:
/// out `[total_q, num_heads, head_dim_v]`, lse `[num_heads, total_q]`.
#[allow(clippy::too_many_arguments)]
pub fn reference_fwd(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    cu_seqlens_q: &[i32],
    cu_seqlens_k: &[i32],
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    head_dim_v: usize,
    scale: f32,
    mask: MaskSpec,
) -> (Vec<f32>, Vec<f32>) {
    let total_q = *cu_seqlens_q.last().unwrap() as usize;
    let group = num_heads / num_kv_heads;
    let mut out = vec![0.0f32; total_q * num_heads * head_dim_v];
    let mut lse = vec![f32::NEG_INFINITY; num_heads * total_q];

    for b in 0..cu_seqlens_q.len() - 1 {
        let q0 = cu_seqlens_q[b] as usize;
        let q1 = cu_seqlens_q[b + 1] as usize;
        let k0 = cu_seqlens_k[b] as usize;
        let k1 = cu_seqlens_k[b + 1] as usize;
        let (len_q, len_k) = (q1 - q0, k1 - k0);

        for h in 0..num_heads {
            let kv_h = h / group;
            for qi in 0..len_q {
                let q_base = ((q0 + qi) * num_heads + h) * head_dim;
                // Two-pass softmax over the full masked score row.
                let mut scores = vec![f32::NEG_INFINITY; len_k];
                let mut row_max = f32::NEG_INFINITY;
                for ki in 0..len_k {
                    if !allowed(qi, ki, len_q, len_k, mask) {
                        continue;
                    }
                    let k_base = ((k0 + ki) * num_kv_heads + kv_h) * head_dim;
                    let mut dot = 0.0f32;
                    for d in 0..head_dim {
                        dot += q[q_base + d] * k[k_base + d];
                    }
                    scores[ki] = dot * scale;
                    row_max = row_max.max(scores[ki]);
                }
                if row_max == f32::NEG_INFINITY {
                    continue; // zero attendable keys: out stays 0, lse -inf
                }
                let mut denom = 0.0f32;
                for s in &scores {
                    if *s != f32::NEG_INFINITY {
                        denom += (s - row_max).exp();
                    }
                }
                let out_base = ((q0 + qi) * num_heads + h) * head_dim_v;
                for ki in 0..len_k {
                    if scores[ki] == f32::NEG_INFINITY {
                        continue;
                    }
                    let w = (scores[ki] - row_max).exp() / denom;
                    let v_base = ((k0 + ki) * num_kv_heads + kv_h) * head_dim_v;
                    for d in 0..head_dim_v {
                        out[out_base + d] += w * v[v_base + d];
                    }
                }
                lse[h * total_q + q0 + qi] = row_max + denom.ln();
            }
        }
    }
    (out, lse)
}

/// Dense reference backward: explicit probability matrix and the softmax
/// Jacobian-vector product, GQA gradients summed into shared kv heads.
#[allow(clippy::too_many_arguments)]
pub fn reference_bwd(
    dout: &[f32],
    q: &[f32],
    k: &[f32],
    v: &[f32],
    cu_seqlens_q: &[i32],
    cu_seqlens_k: &[i32],
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    head_dim_v: usize,
    scale: f32,
    mask: MaskSpec,
) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let total_q = *cu_seqlens_q.last().unwrap() as usize;
    let total_k = *cu_seqlens_k.last().unwrap() as usize;
    let group = num_heads / num_kv_heads;
    let mut dq = vec![0.0f32; total_q * num_heads * head_dim];
    let mut dk = vec![0.0f32; total_k * num_kv_heads * head_dim];
    let mut dv = vec![0.0f32; total_k * num_kv_heads * head_dim_v];

    for b in 0..cu_seqlens_q.len() - 1 {
        let q0 = cu_seqlens_q[b] as usize;
        let q1 = cu_seqlens_q[b + 1] as usize;
        let k0 = cu_seqlens_k[b] as usize;
        let k1 = cu_seqlens_k[b + 1] as usize;
        let (len_q, len_k) = (q1 - q0, k1 - k0);

        for h in 0..num_heads {
            let kv_h = h / group;
            for qi in 0..len_q {
                let q_base = ((q0 + qi) * num_heads + h) * head_dim;
                let do_base = ((q0 + qi) * num_heads + h) * head_dim_v;

                // Probability row via two-pass softmax.
                let mut probs = vec![0.0f32; len_k];
                let mut row_max = f32::NEG_INFINITY;
                let mut scores = vec![f32::NEG_INFINITY; len_k];
                for ki in 0..len_k {
                    if !allowed(qi, ki, len_q, len_k, mask) {
                        continue;
                    }
                    let k_base = ((k0 + ki) * num_kv_heads + kv_h) * head_dim;
                    let mut dot = 0.0f32;
                    for d in 0..head_dim {
                        dot += q[q_base + d] * k[k_base + d];
                    }
                    scores[ki] = dot * scale;
                    row_max = row_max.max(scores[ki]);
                }
                if row_max == f32::NEG_INFINITY {
                    continue;
                }
                let mut denom = 0.0f32;
                for ki in 0..len_k {
                    if scores[ki] != f32::NEG_INFINITY {
                        probs[ki] = (scores[ki] - row_max).exp();
                        denom += probs[ki];
                    }
                }
                for p in probs.iter_mut() {
                    *p /= denom;
                }

                // dP and the row term D = Σ_j P_j dP_j.
                let mut dp = vec![0.0f32; len_k];
                let mut row_d = 0.0f32;
                for ki in 0..len_k {
                    if probs[ki] == 0.0 {
                        continue;
                    }
                    let v_base = ((k0 + ki) * num_kv_heads + kv_h) * head_dim_v;
                    for d in 0..head_dim_v {
                        dp[ki] += dout[do_base + d] * v[v_base + d];
                    }
                    row_d += probs[ki] * dp[ki];
                }

                for ki in 0..len_k {
                    if probs[ki] == 0.0 {
                        continue;
                    }
                    let ds = probs[ki] * (dp[ki] - row_d) * scale;
                    let k_base = ((k0 + ki) * num_kv_heads + kv_h) * head_dim;
                    let v_base = ((k0 + ki) * num_kv_heads + kv_h) * head_dim_v;
                    for d in 0..head_dim {
                        dq[q_base + d] += ds * k[k_base + d];
                        dk[k_base + d] += ds * q[q_base + d];
                    }
                    for d in 0..head_dim_v {
                        dv[v_base + d] += probs[ki] * dout[do_base + d];
                    }
                }
            }
        }
    }
    (dq, dk, dv)
}

/// Cosine-distance + RMSE comparison in f64, mirroring the reference
/// harness thresholds: cosine distance must stay below 1e-5.
pub fn assert_close(x: &[f32], y: &[f32], name: &str) {
    assert_eq!(x.len(), y.len(), "{name}: length mismatch");
    let mut dot = 0.0f64;
    let mut norm = 0.0f64;
    let mut sq_err = 0.0f64;
    for (&a, &b) in x.iter().zip(y.iter()) {
        // -inf logsumexp entries must match exactly and would poison the
        // accumulators.
        if a == f32::NEG_INFINITY || b == f32::NEG_INFINITY {
            assert_eq!(a, b, "{name}: -inf mismatch");
            continue;
        }
        let (a, b) = (a as f64, b as f64);
        dot += a * b;
        norm += a * a + b * b;
        sq_err += (a - b) * (a - b);
    }
    // When both vectors are (near-)zero the cosine distance is undefined
    // (dot == norm == 0 would yield a spurious 1.0); such inputs are equal
    // iff their RMSE is ~0, which the assertion below still witnesses.
    let cos_diff = if norm <= 1e-12 {
        0.0
    } else {
        1.0 - 2.0 * dot / norm
    };
    let rmse = (sq_err / x.len() as f64).sqrt();
    assert!(
        cos_diff < 1e-5,
        "{name}: cos_diff={cos_diff:.3e}, rmse={rmse:.3e}"
    );
}

/// Element-wise rtol/atol comparison.
pub fn assert_allclose(a: &[f32], b: &[f32], rtol: f32, atol: f32, name: &str) {
    assert_eq!(a.len(), b.len(), "{name}: length mismatch");
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        if *x == f32::NEG_INFINITY && *y == f32::NEG_INFINITY {
            continue;
        }
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        assert!(
            diff <= tol,
            "{name} at index {i}: {x} vs {y} (diff={diff}, tol={tol})"
        );
    }
}

/// Bit-exact comparison for the determinism contract.
pub fn assert_bits_eq(a: &[f32], b: &[f32], name: &str) {
    assert_eq!(a.len(), b.len(), "{name}: length mismatch");
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert_eq!(
            x.to_bits(),
            y.to_bits(),
            "{name} at index {i}: {x} vs {y}"
        );
    }
}
