//! Blended embedding similarity.
//!
//! Three metrics are combined: cosine similarity (primary), a
//! Euclidean-distance similarity `1 / (1 + d)` and the absolute Pearson
//! correlation. Pairs whose pose-sensitive leading slice varies too much
//! are down-weighted instead of rejected outright.

use crate::config::SimilarityConfig;
use crate::types::Embedding;
use serde::Serialize;

/// Per-metric view of one comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimilarityBreakdown {
    pub cosine: f32,
    pub euclidean: f32,
    pub pearson: f32,
    pub pose_consistent: bool,
    /// Final blended score in [0, 1].
    pub score: f32,
}

impl SimilarityBreakdown {
    fn incomparable() -> Self {
        Self {
            cosine: 0.0,
            euclidean: 0.0,
            pearson: 0.0,
            pose_consistent: false,
            score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimilarityEngine {
    config: SimilarityConfig,
}

impl SimilarityEngine {
    pub fn new(config: SimilarityConfig) -> Self {
        Self { config }
    }

    /// Blended similarity in [0, 1]; 0 for incomparable embeddings.
    pub fn similarity(&self, a: &Embedding, b: &Embedding) -> f32 {
        self.compare(a, b).score
    }

    pub fn compare(&self, a: &Embedding, b: &Embedding) -> SimilarityBreakdown {
        if !a.is_comparable_with(b) {
            return SimilarityBreakdown::incomparable();
        }
        let (x, y) = (a.values.as_slice(), b.values.as_slice());
        let c = &self.config;

        let cosine = cosine(x, y);
        let euclidean = 1.0 / (1.0 + euclidean_distance(x, y));
        let pearson = pearson(x, y).abs();

        let weight_sum = c.cosine_weight + c.euclidean_weight + c.pearson_weight;
        let blended = (c.cosine_weight * cosine + c.euclidean_weight * euclidean + c.pearson_weight * pearson)
            / weight_sum;

        let pose_consistent = self.pose_consistent(x, y);
        let score = if pose_consistent {
            blended
        } else {
            blended * c.pose_penalty
        };

        SimilarityBreakdown {
            cosine,
            euclidean,
            pearson,
            pose_consistent,
            score: score.clamp(0.0, 1.0),
        }
    }

    /// Whether the pose-sensitive leading slices of `x` and `y` agree.
    ///
    /// Variation is the RMS difference over the slice relative to the mean
    /// RMS magnitude of the two whole embeddings. Keypoint slices sit near
    /// zero for faces close to the reference layout.
    fn pose_consistent(&self, x: &[f32], y: &[f32]) -> bool {
        let len = self.config.pose_slice_len.min(x.len());
        if len == 0 {
            return true;
        }
        let rms = |v: &[f32]| (v.iter().map(|a| a * a).sum::<f32>() / v.len() as f32).sqrt();
        let diff = (x[..len].iter().zip(&y[..len]).map(|(a, b)| (a - b).powi(2)).sum::<f32>() / len as f32).sqrt();
        let scale = (rms(x) + rms(y)) / 2.0;
        if scale <= 0.0 {
            return diff <= 0.0;
        }
        diff / scale <= self.config.pose_variation_limit
    }
}

/// Cosine similarity in [-1, 1]; 0 when either vector has zero norm.
pub fn cosine(x: &[f32], y: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (a, b) in x.iter().zip(y) {
        dot += a * b;
        norm_a += a * a;
        norm_b += b * b;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        (dot / denom).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

pub fn euclidean_distance(x: &[f32], y: &[f32]) -> f32 {
    x.iter()
        .zip(y)
        .map(|(a, b)| (a - b).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Pearson correlation in [-1, 1]; 0 when either vector is constant.
pub fn pearson(x: &[f32], y: &[f32]) -> f32 {
    let n = x.len().min(y.len());
    if n == 0 {
        return 0.0;
    }
    let mean_x = x[..n].iter().sum::<f32>() / n as f32;
    let mean_y = y[..n].iter().sum::<f32>() / n as f32;

    let (mut cov, mut var_x, mut var_y) = (0.0f32, 0.0f32, 0.0f32);
    for (a, b) in x[..n].iter().zip(&y[..n]) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    let denom = (var_x * var_y).sqrt();
    if denom > 0.0 {
        (cov / denom).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}
