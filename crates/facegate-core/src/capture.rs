//! Per-session capture state machine.
//!
//! ```text
//! Idle ──face──▶ Tracking ──high quality──▶ Stabilizing ──N frames / perfect──▶ Captured
//!   ▲               ▲  ◀──low quality──────────┘                                   │
//!   └──no face──────┴──────────────── low quality / no face ◀──────────────────────┘
//! ```
//!
//! One [`CaptureStateMachine::observe`] call per processed frame decides
//! everything: stability counting, the perfect-quality shortcut, the
//! different-person reset and its dwell time. Time is passed in, so the
//! machine itself never reads a clock.

use crate::config::CaptureConfig;
use crate::quality::QualityAssessment;
use crate::similarity::SimilarityEngine;
use crate::types::{Embedding, MatchResult};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Tracking,
    Stabilizing,
    Captured,
}

/// What the session loop saw this frame.
#[derive(Debug, Clone)]
pub enum FrameInput {
    NoFace,
    /// A validated detection; `probe` is present for high-quality frames.
    Face {
        quality: QualityAssessment,
        probe: Option<Embedding>,
    },
}

/// What the session loop should do with this frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// No face: all state cleared.
    Idle,
    /// Below the high-quality threshold: stability counter reset.
    Tracking { quality: f32 },
    /// Counting stable frames toward a capture.
    Stabilizing { stable_frames: u32, quality: f32 },
    /// Match `probe` now.
    Capture {
        probe: Embedding,
        quality: f32,
        stable_frames: u32,
        /// Triggered by a perfect-quality frame rather than the counter.
        instant: bool,
    },
    /// Same subject already captured recently.
    Holding { quality: f32 },
    /// A different person replaced the previous subject; all state was reset.
    SubjectChanged,
    /// A different-person detection arrived within the dwell time and was ignored.
    Settling { quality: f32 },
}

/// Mutable per-session state. Owned by exactly one session loop.
#[derive(Debug, Clone, Default)]
pub struct CaptureState {
    pub phase: Phase,
    pub stable_frames: u32,
    pub last_quality_at: Option<Instant>,
    pub best_quality: f32,
    pub best_quality_embedding: Option<Embedding>,
    pub last_probe: Option<Embedding>,
    pub last_detection_at: Option<Instant>,
    pub captured_at: Option<Instant>,
    pub last_match: Option<MatchResult>,
    /// Members already recorded during this subject's turn.
    pub recent_matches: Vec<(String, Instant)>,
    pub last_subject_change: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct CaptureStateMachine {
    config: CaptureConfig,
    high_quality_threshold: f32,
    similarity: SimilarityEngine,
    state: CaptureState,
}

impl CaptureStateMachine {
    pub fn new(config: CaptureConfig, high_quality_threshold: f32, similarity: SimilarityEngine) -> Self {
        Self {
            config,
            high_quality_threshold,
            similarity,
            state: CaptureState::default(),
        }
    }

    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    /// Drop all state, as when the session restarts.
    pub fn reset(&mut self) {
        self.state = CaptureState::default();
    }

    pub fn observe(&mut self, now: Instant, input: FrameInput) -> Transition {
        let (quality, probe) = match input {
            FrameInput::NoFace => {
                if self.state.phase != Phase::Idle {
                    tracing::debug!("face lost; capture state cleared");
                }
                self.reset();
                return Transition::Idle;
            }
            FrameInput::Face { quality, probe } => (quality, probe),
        };
        self.state.last_detection_at = Some(now);

        let probe = match probe {
            Some(p) if !p.is_empty() && quality.is_high_quality(self.high_quality_threshold) => p,
            _ => return self.drop_to_tracking(quality.score),
        };

        if let Some(last) = &self.state.last_probe {
            let same = self.similarity.similarity(last, &probe);
            if same < self.config.same_person_threshold {
                return self.subject_change(now, probe, quality.score, same);
            }
        }
        self.state.last_probe = Some(probe.clone());

        let within_window = self
            .state
            .last_quality_at
            .is_some_and(|t| now.saturating_duration_since(t) <= self.config.stability_window());
        self.state.stable_frames = if self.state.stable_frames > 0 && within_window {
            self.state.stable_frames + 1
        } else {
            1
        };
        self.state.last_quality_at = Some(now);

        if self.state.best_quality_embedding.is_none() || quality.score > self.state.best_quality {
            self.state.best_quality = quality.score;
            self.state.best_quality_embedding = Some(probe.clone());
        }

        if self.state.phase == Phase::Captured {
            let held_for = self
                .state
                .captured_at
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or(Duration::MAX);
            if held_for < self.config.recapture_interval() {
                return Transition::Holding { quality: quality.score };
            }
        }

        let instant = quality.is_perfect();
        if instant || self.state.stable_frames >= self.config.required_stable_frames {
            return self.capture(now, probe, instant);
        }

        self.state.phase = Phase::Stabilizing;
        Transition::Stabilizing {
            stable_frames: self.state.stable_frames,
            quality: quality.score,
        }
    }

    /// Record the match produced for the last capture.
    ///
    /// Returns `true` when attendance should be recorded for the member,
    /// i.e. it was not already recorded within the match cooldown during
    /// this subject's turn.
    pub fn remember_match(&mut self, result: &MatchResult, now: Instant) -> bool {
        self.state.last_match = Some(result.clone());
        let Some(member_id) = result.member_id.as_deref().filter(|_| result.matched) else {
            return false;
        };

        let cooldown = self.config.match_cooldown();
        self.state
            .recent_matches
            .retain(|(_, at)| now.saturating_duration_since(*at) < cooldown);
        if self.state.recent_matches.iter().any(|(id, _)| id == member_id) {
            return false;
        }
        self.state.recent_matches.push((member_id.to_string(), now));
        true
    }

    fn drop_to_tracking(&mut self, quality: f32) -> Transition {
        self.state.stable_frames = 0;
        self.state.last_quality_at = None;
        self.state.best_quality = 0.0;
        self.state.best_quality_embedding = None;
        self.state.phase = Phase::Tracking;
        Transition::Tracking { quality }
    }

    fn subject_change(&mut self, now: Instant, probe: Embedding, quality: f32, similarity: f32) -> Transition {
        let dwell = self.config.subject_change_dwell();
        if let Some(prev) = self.state.last_subject_change {
            if now.saturating_duration_since(prev) < dwell {
                tracing::debug!(similarity, "different person within dwell time; frame ignored");
                return Transition::Settling { quality };
            }
        }

        tracing::info!(similarity, "different person detected; capture state reset");
        self.state = CaptureState {
            phase: Phase::Tracking,
            last_probe: Some(probe),
            last_detection_at: Some(now),
            last_subject_change: Some(now),
            ..CaptureState::default()
        };
        Transition::SubjectChanged
    }

    fn capture(&mut self, now: Instant, current: Embedding, instant: bool) -> Transition {
        let (probe, quality) = match self.state.best_quality_embedding.take() {
            Some(best) => (best, self.state.best_quality),
            None => (current, self.state.best_quality),
        };
        self.state.best_quality = 0.0;
        self.state.phase = Phase::Captured;
        self.state.captured_at = Some(now);

        tracing::debug!(
            stable_frames = self.state.stable_frames,
            quality,
            instant,
            "capture triggered"
        );
        Transition::Capture {
            probe,
            quality,
            stable_frames: self.state.stable_frames,
            instant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::QualityBreakdown;
    use crate::types::MemberStatus;

    fn assessment(score: f32) -> QualityAssessment {
        let b = if score >= 1.0 { 1.0 } else { score };
        QualityAssessment {
            is_valid: score > 0.0,
            score,
            reason: String::new(),
            breakdown: QualityBreakdown {
                size: b,
                position: b,
                keypoints: b,
                edge: 1.0,
                aspect: 1.0,
            },
        }
    }

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec(), "test")
    }

    fn person_a() -> Embedding {
        emb(&[0.9, 0.1, 0.3, 0.2, 0.1, 0.05])
    }

    fn person_b() -> Embedding {
        emb(&[-0.2, 0.8, -0.4, 0.1, 0.6, -0.3])
    }

    fn face(score: f32, probe: Embedding) -> FrameInput {
        FrameInput::Face {
            quality: assessment(score),
            probe: Some(probe),
        }
    }

    fn low(score: f32) -> FrameInput {
        FrameInput::Face {
            quality: assessment(score),
            probe: None,
        }
    }

    fn machine(required: u32) -> CaptureStateMachine {
        let config = CaptureConfig {
            required_stable_frames: required,
            recapture_interval_ms: 500,
            ..CaptureConfig::default()
        };
        CaptureStateMachine::new(config, 0.9, SimilarityEngine::default())
    }

    fn ms(base: Instant, millis: u64) -> Instant {
        base + Duration::from_millis(millis)
    }

    #[test]
    fn test_counts_stable_frames_then_captures() {
        let mut m = machine(3);
        let t = Instant::now();
        assert_eq!(
            m.observe(t, face(0.95, person_a())),
            Transition::Stabilizing { stable_frames: 1, quality: 0.95 }
        );
        assert_eq!(
            m.observe(ms(t, 100), face(0.93, person_a())),
            Transition::Stabilizing { stable_frames: 2, quality: 0.93 }
        );
        match m.observe(ms(t, 200), face(0.92, person_a())) {
            Transition::Capture { stable_frames, instant, quality, .. } => {
                assert_eq!(stable_frames, 3);
                assert!(!instant);
                // Best frame of the run, not the last one.
                assert!((quality - 0.95).abs() < 1e-6);
            }
            other => panic!("expected capture, got {other:?}"),
        }
        assert_eq!(m.phase(), Phase::Captured);
    }

    #[test]
    fn test_capture_prefers_best_quality_embedding() {
        let mut m = machine(2);
        let t = Instant::now();
        let best = emb(&[0.9, 0.1, 0.3, 0.2, 0.1, 0.06]);
        m.observe(t, face(0.97, best.clone()));
        match m.observe(ms(t, 100), face(0.91, person_a())) {
            Transition::Capture { probe, .. } => assert_eq!(probe, best),
            other => panic!("expected capture, got {other:?}"),
        }
    }

    #[test]
    fn test_low_quality_frame_resets_counter() {
        let mut m = machine(4);
        let t = Instant::now();
        for i in 0..3 {
            m.observe(ms(t, i * 100), face(0.95, person_a()));
        }
        assert_eq!(m.state().stable_frames, 3);
        assert_eq!(m.observe(ms(t, 300), low(0.5)), Transition::Tracking { quality: 0.5 });
        assert_eq!(m.state().stable_frames, 0);
        assert_eq!(m.phase(), Phase::Tracking);
        assert!(m.state().best_quality_embedding.is_none());
    }

    #[test]
    fn test_high_score_without_probe_counts_as_low() {
        let mut m = machine(2);
        let t = Instant::now();
        m.observe(t, face(0.95, person_a()));
        let empty = FrameInput::Face {
            quality: assessment(0.95),
            probe: Some(Embedding::empty()),
        };
        assert!(matches!(m.observe(ms(t, 50), empty), Transition::Tracking { .. }));
        assert_eq!(m.state().stable_frames, 0);
    }

    #[test]
    fn test_gap_outside_window_restarts_count() {
        let mut m = machine(3);
        let t = Instant::now();
        m.observe(t, face(0.95, person_a()));
        m.observe(ms(t, 100), face(0.95, person_a()));
        assert_eq!(
            m.observe(ms(t, 2000), face(0.95, person_a())),
            Transition::Stabilizing { stable_frames: 1, quality: 0.95 }
        );
    }

    #[test]
    fn test_perfect_frame_captures_instantly() {
        let mut m = machine(3);
        let t = Instant::now();
        match m.observe(t, face(1.0, person_a())) {
            Transition::Capture { instant, stable_frames, .. } => {
                assert!(instant);
                assert_eq!(stable_frames, 1);
            }
            other => panic!("expected instant capture, got {other:?}"),
        }
    }

    #[test]
    fn test_holds_after_capture_then_recaptures() {
        let mut m = machine(1);
        let t = Instant::now();
        assert!(matches!(m.observe(t, face(0.95, person_a())), Transition::Capture { .. }));
        assert!(matches!(m.observe(ms(t, 100), face(0.95, person_a())), Transition::Holding { .. }));
        assert!(matches!(m.observe(ms(t, 200), face(1.0, person_a())), Transition::Holding { .. }));
        assert!(matches!(m.observe(ms(t, 600), face(0.95, person_a())), Transition::Capture { .. }));
    }

    #[test]
    fn test_no_face_clears_everything() {
        let mut m = machine(3);
        let t = Instant::now();
        m.observe(t, face(0.95, person_a()));
        assert_eq!(m.observe(ms(t, 100), FrameInput::NoFace), Transition::Idle);
        assert_eq!(m.phase(), Phase::Idle);
        assert!(m.state().last_probe.is_none());
        assert_eq!(m.state().stable_frames, 0);
    }

    #[test]
    fn test_different_person_hard_reset() {
        let mut m = machine(5);
        let t = Instant::now();
        for i in 0..3 {
            m.observe(ms(t, i * 100), face(0.95, person_a()));
        }
        let matched = MatchResult {
            matched: true,
            member_id: Some("alice".into()),
            name: Some("Alice".into()),
            status: Some(MemberStatus::Allowed),
            confidence: 0.97,
        };
        assert!(m.remember_match(&matched, ms(t, 250)));
        assert!(m.state().best_quality_embedding.is_some());
        assert_eq!(m.state().stable_frames, 3);

        let sim = SimilarityEngine::default().similarity(&person_a(), &person_b());
        assert!(sim < 0.80, "fixture similarity {sim}");

        assert_eq!(m.observe(ms(t, 300), face(0.95, person_b())), Transition::SubjectChanged);
        let s = m.state();
        assert_eq!(s.stable_frames, 0);
        assert!(s.best_quality_embedding.is_none());
        assert!(s.last_match.is_none());
        assert!(s.recent_matches.is_empty());
        assert_eq!(s.last_probe.as_ref(), Some(&person_b()));

        // The new subject then stabilizes normally.
        assert_eq!(
            m.observe(ms(t, 400), face(0.95, person_b())),
            Transition::Stabilizing { stable_frames: 1, quality: 0.95 }
        );
    }

    #[test]
    fn test_subject_change_dwell() {
        let mut m = machine(5);
        let t = Instant::now();
        m.observe(t, face(0.95, person_a()));
        assert_eq!(m.observe(ms(t, 100), face(0.95, person_b())), Transition::SubjectChanged);
        // Flip back to A within 1.5s: ignored, state untouched.
        assert_eq!(
            m.observe(ms(t, 600), face(0.95, person_a())),
            Transition::Settling { quality: 0.95 }
        );
        assert_eq!(m.state().last_probe.as_ref(), Some(&person_b()));
        // After the dwell the change is processed.
        assert_eq!(m.observe(ms(t, 1700), face(0.95, person_a())), Transition::SubjectChanged);
    }

    #[test]
    fn test_remember_match_cooldown() {
        let mut m = machine(1);
        let t = Instant::now();
        let result = MatchResult {
            matched: true,
            member_id: Some("m1".into()),
            name: Some("M".into()),
            status: Some(MemberStatus::Vip),
            confidence: 0.9,
        };
        assert!(m.remember_match(&result, t));
        assert!(!m.remember_match(&result, ms(t, 5_000)));
        assert!(m.remember_match(&result, ms(t, 10_001)));
        assert!(!m.remember_match(&MatchResult::no_match(0.4), ms(t, 10_002)));
        assert_eq!(m.state().last_match.as_ref().map(|r| r.matched), Some(false));
    }
}
