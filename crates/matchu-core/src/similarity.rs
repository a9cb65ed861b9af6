//! Bounded cosine similarity between embedding vectors.

use thiserror::Error;

/// Norm products at or below this are treated as zero magnitude.
const MIN_NORM_PRODUCT: f64 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimilarityError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Compute cosine similarity between two flat vectors.
///
/// Returns a value clamped to [-1, 1]. A zero-magnitude vector yields exactly
/// 0.0. Empty inputs and length mismatches are rejected.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
    if a.is_empty() || b.is_empty() {
        return Err(SimilarityError::InvalidInput(
            "embedding vectors must not be empty".into(),
        ));
    }
    if a.len() != b.len() {
        return Err(SimilarityError::InvalidInput(format!(
            "embedding vectors must have the same shape ({} vs {})",
            a.len(),
            b.len()
        )));
    }

    // f64 accumulation keeps identical vectors at 1.0.
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= MIN_NORM_PRODUCT {
        return Ok(0.0);
    }

    Ok((dot / denom).clamp(-1.0, 1.0) as f32)
}
