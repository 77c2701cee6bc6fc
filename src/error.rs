//! attnr error types

/// attnr result type
pub type Result<T> = std::result::Result<T, Error>;

/// attnr errors
///
/// Every variant is detected synchronously before any tile computation
/// begins — a failed call performs no partial writes. Numerical edge cases
/// (a query row with zero attendable keys) are not errors; they produce the
/// documented zero-output / `-inf`-logsumexp result instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed cumulative offsets or declared maxima that do not match
    /// the true per-sequence maxima
    #[error("invalid layout: {reason}")]
    InvalidLayout {
        /// Description of what went wrong
        reason: String,
    },

    /// KV head count does not evenly divide the query head count
    #[error("invalid head config: num_heads={num_heads} not divisible by num_kv_heads={num_kv_heads}")]
    InvalidHeadConfig {
        /// Number of query heads
        num_heads: usize,
        /// Number of key/value heads
        num_kv_heads: usize,
    },

    /// Array length inconsistent with the declared totals, head counts,
    /// or head dims
    #[error("shape mismatch for `{array}`: expected {expected} elements, got {got}")]
    ShapeMismatch {
        /// Name of the offending array argument
        array: &'static str,
        /// Element count implied by the declared dimensions
        expected: usize,
        /// Actual element count
        got: usize,
    },
}
