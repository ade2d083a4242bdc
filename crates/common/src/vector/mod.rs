//! Embedding validation and scoring
//!
//! Cosine similarity (higher is better) and cosine distance (lower is
//! better) are both exposed; callers pick one per retrieval mode and never
//! compare the two.

use crate::errors::{AppError, Result};
use serde_json::Value;

/// Parse a stored embedding.
///
/// Only a non-empty array made entirely of finite numbers counts as an
/// embedding; anything else (null, empty array, mixed types) is `None` so
/// the row is excluded from retrieval instead of scoring as zero.
pub fn normalize_embedding(value: &Value) -> Option<Vec<f32>> {
    let items = value.as_array()?;
    if items.is_empty() {
        return None;
    }

    let mut embedding = Vec::with_capacity(items.len());
    for item in items {
        let v = item.as_f64()? as f32;
        if !v.is_finite() {
            return None;
        }
        embedding.push(v);
    }
    Some(embedding)
}

/// Non-empty and free of NaN/inf
pub fn validate_embedding(embedding: &[f32]) -> bool {
    !embedding.is_empty() && embedding.iter().all(|v| v.is_finite())
}

/// Cosine similarity in [-1, 1]. Zero-norm vectors score 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(AppError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    Ok((dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0) as f32)
}

/// Cosine distance as computed by pgvector's `<=>` operator
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f32> {
    Ok(1.0 - cosine_similarity(a, b)?)
}

/// pgvector literal, e.g. `[0.1,0.2,0.3]`
pub fn to_pgvector_literal(embedding: &[f32]) -> String {
    format!(
        "[{}]",
        embedding
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}
