//! 1:N matching with an absolute threshold and a confidence-gap gate.
//!
//! A best candidate is accepted only if it clears the threshold *and*
//! leads the best candidate of any other member by at least the minimum
//! gap. Look-alikes that both clear the bar are rejected as ambiguous.

use crate::config::MatchConfig;
use crate::similarity::SimilarityEngine;
use crate::types::{Embedding, GalleryEntry, MatchResult};

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    EmptyGallery,
    BelowThreshold,
    /// Best cleared the threshold but did not dominate the runner-up.
    Ambiguous,
}

/// Full record of one match decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub result: MatchResult,
    pub outcome: Outcome,
    /// Index into the gallery of the best-scoring entry.
    pub best_index: Option<usize>,
    pub best_score: f32,
    /// Best score among entries of a different member; 0.0 if there is none.
    pub runner_up_score: f32,
    pub gap: f32,
    /// Threshold after adaptive relaxation.
    pub effective_threshold: f32,
}

#[derive(Debug, Clone, Default)]
pub struct MatchDecider {
    similarity: SimilarityEngine,
    config: MatchConfig,
}

impl MatchDecider {
    pub fn new(similarity: SimilarityEngine, config: MatchConfig) -> Self {
        Self { similarity, config }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Decide using the configured threshold.
    pub fn decide_default(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> Decision {
        self.decide(probe, gallery, self.config.threshold)
    }

    pub fn decide(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> Decision {
        if gallery.is_empty() {
            return Decision {
                result: MatchResult::no_match(0.0),
                outcome: Outcome::EmptyGallery,
                best_index: None,
                best_score: 0.0,
                runner_up_score: 0.0,
                gap: 0.0,
                effective_threshold: threshold,
            };
        }

        // Every entry is scored; no early exit.
        let scores: Vec<f32> = gallery
            .iter()
            .map(|entry| self.similarity.similarity(probe, &entry.embedding))
            .collect();

        let mut best_idx = 0;
        for (i, &s) in scores.iter().enumerate() {
            if s > scores[best_idx] {
                best_idx = i;
            }
        }
        let best_score = scores[best_idx];
        let best_member = &gallery[best_idx].member_id;

        let rivals = gallery
            .iter()
            .zip(&scores)
            .filter(|(entry, _)| &entry.member_id != best_member);
        let (has_rival, runner_up_score) =
            rivals.fold((false, 0.0f32), |(_, acc), (_, &s)| (true, acc.max(s)));

        let gap = best_score - runner_up_score;
        let effective_threshold = self.effective_threshold(threshold, best_score, gap);

        let decision = |result, outcome| Decision {
            result,
            outcome,
            best_index: Some(best_idx),
            best_score,
            runner_up_score,
            gap,
            effective_threshold,
        };

        if best_score < effective_threshold {
            return decision(MatchResult::no_match(best_score), Outcome::BelowThreshold);
        }

        if has_rival && gap < self.config.min_confidence_gap {
            tracing::info!(
                best_member = %best_member,
                best_score,
                runner_up_score,
                gap,
                min_gap = self.config.min_confidence_gap,
                "ambiguous match rejected"
            );
            return decision(MatchResult::no_match(best_score), Outcome::Ambiguous);
        }

        decision(
            MatchResult::accepted(&gallery[best_idx], best_score),
            Outcome::Accepted,
        )
    }

    /// Lower the threshold slightly for confident, well-separated matches.
    fn effective_threshold(&self, threshold: f32, best: f32, gap: f32) -> f32 {
        let c = &self.config;
        if best > c.relax_min_best && gap > c.relax_min_gap {
            (threshold - c.relax_amount).max(c.relax_floor).min(threshold)
        } else {
            threshold
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemberStatus;

    fn entry(id: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            member_id: id.into(),
            name: format!("member {id}"),
            status: MemberStatus::Allowed,
            embedding: Embedding::new(values, "test"),
        }
    }

    fn probe(values: Vec<f32>) -> Embedding {
        Embedding::new(values, "test")
    }

    #[test]
    fn test_scans_whole_gallery() {
        // Best match is the last entry.
        let gallery = vec![
            entry("1", vec![0.0, 1.0, 0.0]),
            entry("2", vec![0.0, 0.0, 1.0]),
            entry("3", vec![1.0, 0.0, 0.0]),
        ];
        let decider = MatchDecider::default();
        let d = decider.decide(&probe(vec![1.0, 0.0, 0.0]), &gallery, 0.8);
        assert_eq!(d.outcome, Outcome::Accepted);
        assert_eq!(d.best_index, Some(2));
        assert_eq!(d.result.member_id.as_deref(), Some("3"));
        assert_eq!(d.result.name.as_deref(), Some("member 3"));
        assert_eq!(d.result.status, Some(MemberStatus::Allowed));
        assert!((d.result.confidence - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_empty_gallery() {
        let d = MatchDecider::default().decide(&probe(vec![1.0, 0.0]), &[], 0.5);
        assert_eq!(d.outcome, Outcome::EmptyGallery);
        assert!(!d.result.matched);
        assert_eq!(d.result.confidence, 0.0);
    }

    #[test]
    fn test_below_threshold() {
        let gallery = vec![entry("1", vec![0.0, 1.0, 0.0])];
        let d = MatchDecider::default().decide(&probe(vec![1.0, 0.0, 0.0]), &gallery, 0.8);
        assert_eq!(d.outcome, Outcome::BelowThreshold);
        assert!(!d.result.matched);
        assert!(d.result.member_id.is_none());
    }

    #[test]
    fn test_ambiguous_look_alikes_rejected() {
        let gallery = vec![
            entry("a", vec![1.0, 0.0, 0.0, 0.5]),
            entry("b", vec![1.0, 0.01, 0.0, 0.5]),
        ];
        let d = MatchDecider::default().decide(&probe(vec![1.0, 0.0, 0.0, 0.5]), &gallery, 0.8);
        assert!(d.best_score >= 0.8 && d.runner_up_score >= 0.8);
        assert_eq!(d.outcome, Outcome::Ambiguous);
        assert!(!d.result.matched);
    }

    #[test]
    fn test_same_member_is_not_a_rival() {
        // Two enrollments of the same member are near-identical; no other member.
        let gallery = vec![
            entry("a", vec![1.0, 0.0, 0.0, 0.5]),
            entry("a", vec![1.0, 0.01, 0.0, 0.5]),
            entry("b", vec![0.0, 1.0, 0.0, 0.0]),
        ];
        let d = MatchDecider::default().decide(&probe(vec![1.0, 0.0, 0.0, 0.5]), &gallery, 0.8);
        assert_eq!(d.outcome, Outcome::Accepted);
        assert_eq!(d.result.member_id.as_deref(), Some("a"));
        assert!(d.runner_up_score < 0.8);
    }

    #[test]
    fn test_single_candidate_needs_no_gap() {
        let decider = MatchDecider::new(
            SimilarityEngine::default(),
            MatchConfig {
                min_confidence_gap: 0.99,
                ..MatchConfig::default()
            },
        );
        let gallery = vec![entry("only", vec![0.2, 0.4, 0.6])];
        let d = decider.decide(&probe(vec![0.2, 0.4, 0.6]), &gallery, 0.8);
        assert_eq!(d.outcome, Outcome::Accepted);
    }

    #[test]
    fn test_relaxation_lowers_threshold_for_dominant_match() {
        let decider = MatchDecider::default();
        // best 0.88, gap 0.3: relaxed from 0.9 to 0.85.
        assert!((decider.effective_threshold(0.9, 0.88, 0.3) - 0.85).abs() < 1e-6);
        // Small gap: no relaxation.
        assert_eq!(decider.effective_threshold(0.9, 0.88, 0.05), 0.9);
        // Never below the floor.
        assert!((decider.effective_threshold(0.72, 0.95, 0.3) - 0.70).abs() < 1e-6);
        // Never above the requested threshold.
        assert_eq!(decider.effective_threshold(0.5, 0.95, 0.3), 0.5);
    }
}
