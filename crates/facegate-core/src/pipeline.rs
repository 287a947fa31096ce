//! Per-frame analysis: validate, score and embed one detection.
//!
//! [`FaceEngine`] bundles the stateless components built from one
//! [`EngineConfig`]. It is cheap to clone and safe to share between
//! sessions; the only mutable per-session state lives in the
//! [`CaptureStateMachine`] it hands out.

use crate::capture::{CaptureStateMachine, FrameInput};
use crate::config::EngineConfig;
use crate::embedding::EmbeddingGenerator;
use crate::matcher::{Decision, MatchDecider};
use crate::quality::{QualityAssessment, QualityScorer};
use crate::similarity::SimilarityEngine;
use crate::types::{DetectedFace, Embedding, GalleryEntry};
use crate::validator::{FaceValidator, Strictness, Verdict};

/// Result of analysing one detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub verdict: Verdict,
    pub quality: QualityAssessment,
    /// Present only for valid, high-quality detections that produced a
    /// non-empty embedding.
    pub probe: Option<Embedding>,
}

impl Analysis {
    pub fn into_input(self) -> FrameInput {
        FrameInput::Face {
            quality: self.quality,
            probe: self.probe,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FaceEngine {
    config: EngineConfig,
    validator: FaceValidator,
    scorer: QualityScorer,
    generator: EmbeddingGenerator,
    similarity: SimilarityEngine,
    decider: MatchDecider,
}

impl FaceEngine {
    pub fn new(config: EngineConfig) -> Self {
        let similarity = SimilarityEngine::new(config.similarity.clone());
        Self {
            validator: FaceValidator::new(config.validator.clone()),
            scorer: QualityScorer::new(config.quality.clone()),
            generator: EmbeddingGenerator::new(config.embedding.clone()),
            decider: MatchDecider::new(similarity.clone(), config.matching.clone()),
            similarity,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn validator(&self) -> &FaceValidator {
        &self.validator
    }

    pub fn scorer(&self) -> &QualityScorer {
        &self.scorer
    }

    pub fn generator(&self) -> &EmbeddingGenerator {
        &self.generator
    }

    pub fn similarity(&self) -> &SimilarityEngine {
        &self.similarity
    }

    pub fn decider(&self) -> &MatchDecider {
        &self.decider
    }

    /// Validate with the given strictness, score, and embed when the
    /// detection is good enough to count toward a capture.
    pub fn analyze(&self, face: &DetectedFace, frame_width: u32, frame_height: u32, strictness: Strictness) -> Analysis {
        let verdict = self.validator.validate(face, frame_width, frame_height, strictness);
        if !verdict.is_valid() {
            let quality = QualityAssessment::rejected(verdict.reason());
            return Analysis {
                verdict,
                quality,
                probe: None,
            };
        }

        let quality = self.scorer.score(face, frame_width, frame_height);
        let probe = if self.scorer.is_high_quality(&quality) {
            Some(self.generator.generate(face)).filter(|e| !e.is_empty())
        } else {
            None
        };
        Analysis {
            verdict,
            quality,
            probe,
        }
    }

    /// Embedding for enrollment: strict validation, no quality gate.
    pub fn enroll_embedding(
        &self,
        face: &DetectedFace,
        frame_width: u32,
        frame_height: u32,
    ) -> Result<Embedding, Verdict> {
        let verdict = self.validator.validate(face, frame_width, frame_height, Strictness::Strict);
        if !verdict.is_valid() {
            return Err(verdict);
        }
        let embedding = self.generator.generate(face);
        if embedding.is_empty() {
            return Err(verdict);
        }
        Ok(embedding)
    }

    /// Fresh capture state for one session.
    pub fn capture_machine(&self) -> CaptureStateMachine {
        CaptureStateMachine::new(
            self.config.capture.clone(),
            self.config.quality.high_quality_threshold,
            self.similarity.clone(),
        )
    }

    pub fn decide(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> Decision {
        self.decider.decide_default(probe, gallery)
    }
}

impl Default for FaceEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
