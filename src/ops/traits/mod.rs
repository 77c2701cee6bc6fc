pub mod attention;

pub use attention::FlashAttentionOps;
