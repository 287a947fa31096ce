//! Per-detection quality scoring.
//!
//! Five independent sub-scores in [0, 1] are combined with configurable
//! weights. Any zero sub-score forces the overall score to zero; a frame
//! with every sub-score at 1.0 scores exactly 1.0 ("perfect").

use crate::config::QualityConfig;
use crate::types::DetectedFace;
use serde::Serialize;

/// Individual quality factors, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityBreakdown {
    pub size: f32,
    pub position: f32,
    pub keypoints: f32,
    pub edge: f32,
    pub aspect: f32,
}

impl QualityBreakdown {
    fn factors(&self) -> [(&'static str, f32); 5] {
        [
            ("size", self.size),
            ("position", self.position),
            ("keypoints", self.keypoints),
            ("edge", self.edge),
            ("aspect", self.aspect),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityAssessment {
    pub is_valid: bool,
    pub score: f32,
    pub reason: String,
    pub breakdown: QualityBreakdown,
}

impl QualityAssessment {
    /// Zero-score assessment for a detection that was never scored.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            score: 0.0,
            reason: reason.into(),
            breakdown: QualityBreakdown {
                size: 0.0,
                position: 0.0,
                keypoints: 0.0,
                edge: 0.0,
                aspect: 0.0,
            },
        }
    }

    /// All factors at their maximum.
    pub fn is_perfect(&self) -> bool {
        self.score >= 1.0
    }

    pub fn is_high_quality(&self, threshold: f32) -> bool {
        self.is_valid && self.score >= threshold
    }
}

#[derive(Debug, Clone, Default)]
pub struct QualityScorer {
    config: QualityConfig,
}

impl QualityScorer {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Whether `assessment` clears the configured high-quality threshold.
    pub fn is_high_quality(&self, assessment: &QualityAssessment) -> bool {
        assessment.is_high_quality(self.config.high_quality_threshold)
    }

    pub fn score(&self, face: &DetectedFace, frame_width: u32, frame_height: u32) -> QualityAssessment {
        let c = &self.config;
        let (fw, fh) = (frame_width as f32, frame_height as f32);
        let b = face.face_box;

        let frame_area = fw * fh;
        let area_ratio = if frame_area > 0.0 { b.area() / frame_area } else { 0.0 };
        let size = band_score(
            area_ratio,
            c.min_area_ratio,
            c.ideal_area_min,
            c.ideal_area_max,
            c.max_area_ratio,
        );

        let (bx, by) = b.center();
        let half_diagonal = (fw * fw + fh * fh).sqrt() / 2.0;
        let offset = if half_diagonal > 0.0 {
            ((bx - fw / 2.0).powi(2) + (by - fh / 2.0).powi(2)).sqrt() / half_diagonal
        } else {
            1.0
        };
        let position = if offset <= c.centered_offset {
            1.0
        } else if offset >= c.max_center_offset {
            0.0
        } else {
            1.0 - (offset - c.centered_offset) / (c.max_center_offset - c.centered_offset)
        };

        let keypoints = (face.keypoints.len() as f32 / c.good_keypoints as f32).min(1.0);

        let m = c.edge_margin;
        let clipped = b.x < m || b.y < m || b.right() > fw - m || b.bottom() > fh - m;
        let edge = if clipped { 0.0 } else { 1.0 };

        let aspect = band_score(
            b.aspect_ratio(),
            c.aspect_min,
            c.ideal_aspect_min,
            c.ideal_aspect_max,
            c.aspect_max,
        );

        let breakdown = QualityBreakdown {
            size,
            position,
            keypoints,
            edge,
            aspect,
        };
        self.combine(breakdown)
    }

    fn combine(&self, breakdown: QualityBreakdown) -> QualityAssessment {
        let factors = breakdown.factors();

        if let Some((name, _)) = factors.iter().find(|(_, v)| *v <= 0.0) {
            return QualityAssessment {
                is_valid: false,
                score: 0.0,
                reason: format!("{name} out of range"),
                breakdown,
            };
        }

        if factors.iter().all(|(_, v)| *v >= 1.0) {
            return QualityAssessment {
                is_valid: true,
                score: 1.0,
                reason: "perfect".to_string(),
                breakdown,
            };
        }

        let w = &self.config.weights;
        let weighted = w.size * breakdown.size
            + w.position * breakdown.position
            + w.keypoints * breakdown.keypoints
            + w.edge * breakdown.edge
            + w.aspect * breakdown.aspect;
        // Strictly below 1.0: some factor is partial.
        let score = (weighted / w.sum()).clamp(0.0, 1.0).min(1.0 - f32::EPSILON);

        let weakest = factors
            .iter()
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(name, _)| *name)
            .unwrap_or("none");

        QualityAssessment {
            is_valid: true,
            score,
            reason: format!("weakest factor: {weakest}"),
            breakdown,
        }
    }
}

/// 0 outside [lo, hi], 1 inside [ideal_lo, ideal_hi], linear in between.
fn band_score(value: f32, lo: f32, ideal_lo: f32, ideal_hi: f32, hi: f32) -> f32 {
    if value < lo || value > hi {
        0.0
    } else if value < ideal_lo {
        if ideal_lo > lo {
            (value - lo) / (ideal_lo - lo)
        } else {
            1.0
        }
    } else if value > ideal_hi {
        if hi > ideal_hi {
            (hi - value) / (hi - ideal_hi)
        } else {
            1.0
        }
    } else {
        1.0
    }
}
