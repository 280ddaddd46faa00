//! Embedding contract for the memory engine
//!
//! The engine consumes an embedding function as a pluggable service; it
//! does not load a model itself. `HashEmbedder` provides a deterministic
//! default so the engine and its tests run without any ML runtime.

use crate::error::Result;

/// Dimension produced by the default hash embedder.
pub const HASH_EMBEDDING_DIM: usize = 384;

/// Pluggable embedding function.
pub trait Embedder: Send + Sync {
    /// Embed a piece of text into a fixed-dimension vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Dimension of vectors produced by this embedder.
    fn dimension(&self) -> usize;
}

/// Deterministic embedding from text hashing.
///
/// Produces pseudo-random but stable vectors in [-1, 1]. Identical texts
/// always embed identically, which is all the engine's own correctness
/// properties require of an embedder.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashEmbedder;

impl HashEmbedder {
    pub fn new() -> Self {
        Self
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let seed = hasher.finish();

        Ok((0..HASH_EMBEDDING_DIM)
            .map(|i| {
                let x = seed
                    .wrapping_mul(i as u64 + 1)
                    .wrapping_add(0x9e3779b97f4a7c15);
                let normalized = (x as f32) / (u64::MAX as f32);
                (normalized * 2.0) - 1.0
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        HASH_EMBEDDING_DIM
    }
}

/// Cosine similarity between two vectors, clamped to [-1, 1].
/// Mismatched or empty vectors score 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}
