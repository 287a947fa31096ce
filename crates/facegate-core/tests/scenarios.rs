//! End-to-end properties of the recognition core.

use facegate_core::capture::{FrameInput, Transition};
use facegate_core::config::{CaptureConfig, MatchConfig};
use facegate_core::embedding::KEYPOINT_MODEL_VERSION;
use facegate_core::quality::QualityAssessment;
use facegate_core::{
    DetectedFace, Embedding, FaceBox, FaceEngine, FaceValidator, GalleryEntry, Keypoint, MatchDecider, MemberStatus,
    Outcome, SimilarityEngine, Strictness, Verdict,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

fn frontal_face() -> DetectedFace {
    DetectedFace {
        face_box: FaceBox::new(220.0, 140.0, 200.0, 200.0),
        keypoints: vec![
            Keypoint::named(280.0, 210.0, "right_eye"),
            Keypoint::named(360.0, 210.0, "left_eye"),
            Keypoint::named(320.0, 250.0, "nose_tip"),
            Keypoint::named(320.0, 295.0, "mouth_center"),
            Keypoint::named(235.0, 230.0, "right_ear"),
            Keypoint::named(405.0, 230.0, "left_ear"),
        ],
        confidence: 0.95,
    }
}

fn entry(id: &str, embedding: Embedding) -> GalleryEntry {
    GalleryEntry {
        member_id: id.into(),
        name: format!("Member {id}"),
        status: MemberStatus::Allowed,
        embedding,
    }
}

fn random_values(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn unit(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter_mut().for_each(|x| *x /= norm);
    v
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Unit vector at exactly `cos` cosine similarity to unit vector `a`.
fn rotate_towards(a: &[f32], other: &[f32], cos: f32) -> Vec<f32> {
    let along = dot(a, other);
    let perp = unit(a.iter().zip(other).map(|(x, y)| y - along * x).collect());
    let sin = (1.0 - cos * cos).sqrt();
    a.iter().zip(&perp).map(|(x, p)| cos * x + sin * p).collect()
}

fn high_quality(score: f32) -> QualityAssessment {
    let mut q = QualityAssessment::rejected("");
    q.is_valid = true;
    q.score = score;
    q
}

#[test]
fn embedding_is_deterministic() {
    let engine = FaceEngine::default();
    let face = frontal_face();
    let first = engine.generator().generate(&face);
    for _ in 0..10 {
        assert_eq!(engine.generator().generate(&face).values, first.values);
    }
}

#[test]
fn similarity_is_symmetric_and_reflexive() {
    let engine = SimilarityEngine::default();
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..50 {
        let a = Embedding::new(random_values(&mut rng, 48), "test");
        let b = Embedding::new(random_values(&mut rng, 48), "test");
        assert_eq!(engine.similarity(&a, &b), engine.similarity(&b, &a));
        assert!((engine.similarity(&a, &a) - 1.0).abs() < 1e-5);
    }
}

#[test]
fn similarity_of_mismatched_lengths_is_zero() {
    let engine = SimilarityEngine::default();
    let a = Embedding::new(vec![0.1, 0.2, 0.3], "test");
    let b = Embedding::new(vec![0.1, 0.2, 0.3, 0.4], "test");
    assert_eq!(engine.similarity(&a, &b), 0.0);
    assert_eq!(engine.similarity(&b, &a), 0.0);
}

#[test]
fn threshold_is_monotonic() {
    let mut rng = StdRng::seed_from_u64(11);
    let base = unit(random_values(&mut rng, 64));
    let gallery: Vec<GalleryEntry> = (0..5)
        .map(|i| {
            let noise = random_values(&mut rng, 64);
            let cos = 0.80 + 0.04 * i as f32;
            entry(&format!("m{i}"), Embedding::new(rotate_towards(&base, &noise, cos), "test"))
        })
        .collect();
    let decider = MatchDecider::default();

    for _ in 0..20 {
        let noise = random_values(&mut rng, 64);
        let probe = Embedding::new(rotate_towards(&base, &noise, 0.9), "test");
        let outcomes: Vec<bool> = (0..=20)
            .map(|step| decider.decide(&probe, &gallery, step as f32 * 0.05).result.matched)
            .collect();
        // Once rejected at some threshold, every higher threshold rejects too.
        if let Some(first_reject) = outcomes.iter().position(|m| !m) {
            assert!(outcomes[first_reject..].iter().all(|m| !m), "{outcomes:?}");
        }
    }
}

#[test]
fn near_identical_look_alikes_are_rejected() {
    let a = Embedding::new(vec![0.5, 0.3, -0.2, 0.8, 0.1, -0.4], "test");
    let b = Embedding::new(vec![0.5, 0.3, -0.2, 0.8, 0.1, -0.39], "test");
    let gallery = vec![entry("a", a.clone()), entry("b", b)];
    let d = MatchDecider::default().decide(&a, &gallery, 0.8);
    assert!(d.best_score >= 0.8 && d.runner_up_score >= 0.8);
    assert!(!d.result.matched);
    assert_eq!(d.outcome, Outcome::Ambiguous);
}

#[test]
fn collinear_hand_is_not_a_face() {
    let hand = DetectedFace {
        face_box: FaceBox::new(150.0, 100.0, 280.0, 280.0),
        keypoints: (0..8)
            .map(|i| {
                let t = i as f32 / 7.0;
                Keypoint::new(150.0 + 280.0 * t, 100.0 + 280.0 * t)
            })
            .collect(),
        confidence: 0.9,
    };
    let validator = FaceValidator::default();
    for strictness in [Strictness::Relaxed, Strictness::Strict] {
        assert!(matches!(validator.validate(&hand, 640, 480, strictness), Verdict::Rejected(_)));
    }
}

#[test]
fn low_quality_frame_resets_stability() {
    let required = 4;
    let engine = FaceEngine::new(facegate_core::EngineConfig {
        capture: CaptureConfig {
            required_stable_frames: required,
            ..CaptureConfig::default()
        },
        ..Default::default()
    });
    let mut machine = engine.capture_machine();
    let probe = Embedding::new(vec![0.4, 0.2, 0.7, 0.1], "test");
    let t = Instant::now();

    for i in 0..(required - 1) {
        let input = FrameInput::Face {
            quality: high_quality(0.95),
            probe: Some(probe.clone()),
        };
        let tr = machine.observe(t + Duration::from_millis(100 * i as u64), input);
        assert!(matches!(tr, Transition::Stabilizing { .. }), "{tr:?}");
    }
    assert_eq!(machine.state().stable_frames, required - 1);

    let low = FrameInput::Face {
        quality: high_quality(0.4),
        probe: None,
    };
    machine.observe(t + Duration::from_millis(500), low);
    assert_eq!(machine.state().stable_frames, 0);
}

#[test]
fn different_person_resets_capture_state() {
    let engine = FaceEngine::new(facegate_core::EngineConfig {
        capture: CaptureConfig {
            required_stable_frames: 5,
            ..CaptureConfig::default()
        },
        ..Default::default()
    });
    let a = Embedding::new(vec![0.9, 0.1, 0.3, 0.2, 0.1, 0.05], "test");
    let b = Embedding::new(vec![-0.2, 0.8, -0.4, 0.1, 0.6, -0.3], "test");
    assert!(engine.similarity().similarity(&a, &b) < 0.80);

    let mut machine = engine.capture_machine();
    let t = Instant::now();
    for i in 0..3 {
        let input = FrameInput::Face {
            quality: high_quality(0.95),
            probe: Some(a.clone()),
        };
        machine.observe(t + Duration::from_millis(100 * i), input);
    }
    let alice = facegate_core::MatchResult::accepted(&entry("alice", a.clone()), 0.97);
    machine.remember_match(&alice, t + Duration::from_millis(250));
    assert!(machine.state().best_quality_embedding.is_some());
    assert!(machine.state().last_match.is_some());

    let input = FrameInput::Face {
        quality: high_quality(0.95),
        probe: Some(b),
    };
    assert_eq!(machine.observe(t + Duration::from_millis(300), input), Transition::SubjectChanged);
    let state = machine.state();
    assert!(state.best_quality_embedding.is_none());
    assert!(state.last_match.is_none());
    assert_eq!(state.stable_frames, 0);
}

/// The frontal face with per-keypoint pixel offsets, in keypoint order.
fn reshaped(offsets: [(f32, f32); 6]) -> DetectedFace {
    let mut face = frontal_face();
    for (kp, (dx, dy)) in face.keypoints.iter_mut().zip(offsets) {
        kp.x += dx;
        kp.y += dy;
    }
    face
}

/// Distinct people as keypoint offsets: eyes, nose, mouth, ears.
fn other_people() -> Vec<(&'static str, DetectedFace)> {
    vec![
        (
            "wider eyes",
            reshaped([(-10.0, 0.0), (10.0, 0.0), (0.0, 0.0), (0.0, 0.0), (0.0, 0.0), (0.0, 0.0)]),
        ),
        (
            "wide eyes, low mouth",
            reshaped([(-20.0, 0.0), (20.0, 0.0), (0.0, 0.0), (0.0, 20.0), (0.0, 0.0), (0.0, 0.0)]),
        ),
        (
            "narrow, long face",
            reshaped([(15.0, 0.0), (-15.0, 0.0), (0.0, 20.0), (0.0, 25.0), (10.0, 0.0), (-10.0, 0.0)]),
        ),
    ]
}

#[test]
fn different_generated_faces_stay_below_same_person_threshold() {
    let engine = FaceEngine::default();
    let same_person = CaptureConfig::default().same_person_threshold;
    let enrolled = engine.generator().generate(&frontal_face());
    let gallery = vec![entry("m1", enrolled.clone())];

    for (label, face) in other_people() {
        let probe = engine.generator().generate(&face);
        let score = engine.similarity().similarity(&enrolled, &probe);
        assert!(score < same_person, "{label}: similarity {score}");

        let d = engine.decide(&probe, &gallery);
        assert!(!d.result.matched, "{label}: {d:?}");
        assert_eq!(d.outcome, Outcome::BelowThreshold, "{label}");
    }
}

#[test]
fn pixel_jitter_keeps_the_same_person() {
    let engine = FaceEngine::default();
    let enrolled = engine.generator().generate(&frontal_face());
    let gallery = vec![entry("m1", enrolled.clone())];
    let jittered = engine
        .generator()
        .generate(&reshaped([(1.0, -1.0), (-1.0, 0.0), (1.0, 1.0), (0.0, -1.0), (-1.0, 1.0), (1.0, 0.0)]));

    let score = engine.similarity().similarity(&enrolled, &jittered);
    assert!(score > CaptureConfig::default().same_person_threshold, "similarity {score}");
    let d = engine.decide(&jittered, &gallery);
    assert!(d.result.matched, "{d:?}");
    assert_eq!(d.result.member_id.as_deref(), Some("m1"));
}

#[test]
fn generated_different_face_resets_capture_state() {
    let engine = FaceEngine::default();
    let alice = engine.generator().generate(&frontal_face());
    let (_, bob_face) = other_people().remove(0);
    let bob = engine.generator().generate(&bob_face);

    let mut machine = engine.capture_machine();
    let t = Instant::now();
    let frame = |probe: &Embedding| FrameInput::Face {
        quality: high_quality(0.95),
        probe: Some(probe.clone()),
    };
    machine.observe(t, frame(&alice));
    assert!(matches!(
        machine.observe(t + Duration::from_millis(100), frame(&alice)),
        Transition::Capture { .. }
    ));
    let matched = facegate_core::MatchResult::accepted(&entry("alice", alice.clone()), 1.0);
    machine.remember_match(&matched, t + Duration::from_millis(150));

    assert_eq!(
        machine.observe(t + Duration::from_millis(300), frame(&bob)),
        Transition::SubjectChanged
    );
    let state = machine.state();
    assert!(state.last_match.is_none());
    assert!(state.best_quality_embedding.is_none());
    assert_eq!(state.last_probe.as_ref(), Some(&bob));
}

#[test]
fn identical_probe_matches_enrolled_member() {
    let engine = FaceEngine::default();
    let e1 = engine.generator().generate(&frontal_face());
    assert!(!e1.is_empty());
    let gallery = vec![entry("m1", e1.clone())];

    let d = engine.decide(&e1, &gallery);
    assert!(d.result.matched);
    assert_eq!(d.result.member_id.as_deref(), Some("m1"));
    assert_eq!(d.result.status, Some(MemberStatus::Allowed));
    assert!((d.result.confidence - 1.0).abs() < 1e-4);
}

#[test]
fn unrelated_probe_does_not_match() {
    let engine = FaceEngine::default();
    let e1 = engine.generator().generate(&frontal_face());
    let gallery = vec![entry("m1", e1.clone())];

    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..20 {
        let probe = Embedding::new(random_values(&mut rng, e1.len()), KEYPOINT_MODEL_VERSION);
        let d = engine.decide(&probe, &gallery);
        assert!(!d.result.matched, "confidence {}", d.result.confidence);
    }
}

#[test]
fn look_alike_gallery_trades_true_positive_for_safety() {
    let mut rng = StdRng::seed_from_u64(3);
    let e1 = unit(random_values(&mut rng, 64));
    let other = random_values(&mut rng, 64);
    let e2 = rotate_towards(&e1, &other, 0.97);
    assert!((dot(&e1, &e2) - 0.97).abs() < 1e-3);

    let gallery = vec![
        entry("m1", Embedding::new(e1.clone(), "test")),
        entry("m2", Embedding::new(e2, "test")),
    ];
    let probe = Embedding::new(e1, "test");

    let similarity = SimilarityEngine::default();
    let lenient = MatchDecider::new(similarity.clone(), MatchConfig::default());
    let d = lenient.decide_default(&probe, &gallery);
    let gap = d.gap;
    assert!(d.best_score > 0.99 && d.runner_up_score >= 0.8, "{d:?}");

    // A minimum gap just above the observed gap rejects the true match.
    let strict = MatchDecider::new(
        similarity.clone(),
        MatchConfig {
            min_confidence_gap: gap + 0.01,
            ..MatchConfig::default()
        },
    );
    let d = strict.decide_default(&probe, &gallery);
    assert!(!d.result.matched);
    assert_eq!(d.outcome, Outcome::Ambiguous);

    // Just below it, the same probe is accepted as m1.
    let loose = MatchDecider::new(
        similarity,
        MatchConfig {
            min_confidence_gap: (gap - 0.01).max(0.0),
            ..MatchConfig::default()
        },
    );
    let d = loose.decide_default(&probe, &gallery);
    assert!(d.result.matched);
    assert_eq!(d.result.member_id.as_deref(), Some("m1"));
}

#[test]
fn frontal_face_walkthrough_to_match() {
    let engine = FaceEngine::default();
    let face = frontal_face();
    let enrolled = engine.enroll_embedding(&face, 640, 480).expect("enrollable");
    let gallery = vec![entry("m1", enrolled)];

    let mut machine = engine.capture_machine();
    let analysis = engine.analyze(&face, 640, 480, Strictness::Relaxed);
    let probe = match machine.observe(Instant::now(), analysis.into_input()) {
        Transition::Capture { probe, .. } => probe,
        other => panic!("expected capture, got {other:?}"),
    };
    let decision = engine.decide(&probe, &gallery);
    assert!(decision.result.matched);
    assert_eq!(decision.result.member_id.as_deref(), Some("m1"));
}
