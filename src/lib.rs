//! # attnr
//!
//! **Tiled variable-length flash attention — forward, logsumexp, and a
//! deterministic recompute backward over packed batches.**
//!
//! attnr computes `softmax(scale * Q K^T + mask) V` and its gradient for
//! batches of variable-length sequences packed along one axis, without ever
//! materializing a full score matrix. All arrays are caller-allocated dense
//! slices; the crate holds no state between calls.
//!
//! ## Design
//!
//! - **Online softmax**: running max/sum/accumulator per query row, updated
//!   per key tile — peak memory is O(tile), not O(seq²)
//! - **Packed varlen layout**: sequences addressed through cumulative
//!   offset tables (`cu_seqlens`), validated once into a flat span arena
//! - **Tile-level masking**: causal/sliding-window decisions made per
//!   (query-tile, key-tile) pair in exact integer arithmetic; skipped tiles
//!   are never touched, which is what makes masked cost sub-quadratic
//! - **GQA broadcasting**: a stateless integer mapping from query heads to
//!   shared KV heads, used identically by forward and backward
//! - **Recompute backward**: probabilities re-derived from the saved
//!   logsumexp; gradients accumulated in fixed order by exclusive owners,
//!   so repeated calls are bit-identical (dQ included)
//! - **Extension trait seam**: [`FlashAttentionOps`] is the backend
//!   boundary; [`CpuBackend`] is the rayon-parallel implementation
//!
//! Storage elements may be `f32`, `f16`, or `bf16` ([`Element`]); every
//! reduction runs in `f32` and the logsumexp is always `f32`.

pub mod element;
pub mod error;
pub mod heads;
pub mod layout;
pub mod mask;
pub mod ops;

pub use element::Element;
pub use error::{Error, Result};
pub use layout::{SeqSpan, VarlenLayout};
pub use mask::{MaskSpec, TileCoverage};
pub use ops::{CpuBackend, FlashAttentionOps};
