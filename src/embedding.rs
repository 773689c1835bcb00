use std::hash::{DefaultHasher, Hash, Hasher};

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use crate::error::{MemoryError, Result, model_corrupted_error, model_oom_error};

/// Maps text to a fixed-length unit-norm vector. The model is loaded once
/// per process and shared read-only.
pub trait Embedder {
    fn dimension(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Text embedded for a memory: the summary and body together, so hits on
/// either surface in similarity search.
pub fn embedding_text(summary: &str, content: &str) -> String {
    if content.is_empty() {
        summary.to_string()
    } else {
        format!("{summary}\n{content}")
    }
}

/// Production embedder backed by a local BGE-small model (384 dimensions).
pub struct FastEmbedder {
    model: TextEmbedding,
    dimension: usize,
}

impl FastEmbedder {
    pub fn new() -> Result<Self> {
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::BGESmallENV15).with_show_download_progress(true),
        )
        .map_err(|e| {
            let msg = e.to_string();
            if msg.to_lowercase().contains("memory") || msg.to_lowercase().contains("alloc") {
                model_oom_error(&msg)
            } else {
                model_corrupted_error(&msg)
            }
        })?;
        Ok(Self {
            model,
            dimension: 384,
        })
    }
}

impl Embedder for FastEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self
            .model
            .embed(vec![text], None)
            .map_err(|e| MemoryError::embedding(e.to_string()))?;
        vectors
            .pop()
            .ok_or_else(|| MemoryError::embedding("model returned no vector"))
    }
}

/// Deterministic embedder that buckets token hashes into the vector and
/// normalizes. No model download, no I/O; texts sharing tokens get
/// overlapping components. Used by tests and available for offline runs.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let bucket = (hasher.finish() as usize) % self.dimension;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::new(16);
        let a = embedder.embed("use postgresql for the database").unwrap();
        let b = embedder.embed("use postgresql for the database").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_hashing_embedder_unit_norm() {
        let embedder = HashingEmbedder::new(16);
        let v = embedder.embed("some text to embed").unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_tokens_overlap() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed("database migration plan").unwrap();
        let b = embedder.embed("database rollout").unwrap();
        let c = embedder.embed("completely unrelated words").unwrap();
        let dot = |x: &[f32], y: &[f32]| -> f32 { x.iter().zip(y).map(|(p, q)| p * q).sum() };
        assert!(dot(&a, &b) > dot(&a, &c));
    }

    #[test]
    fn test_empty_text_embeds_to_zero_vector() {
        let embedder = HashingEmbedder::new(8);
        let v = embedder.embed("").unwrap();
        assert!(v.iter().all(|&x| x == 0.0));
    }
}
