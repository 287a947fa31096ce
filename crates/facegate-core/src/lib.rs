//! facegate-core: Keypoint-based face validation, embedding and matching.
//!
//! Everything here is synchronous and deterministic: given the same
//! detections and configuration, the same decisions come out. Camera
//! access, detector inference and persistence live in `facegated`.

pub mod adapter;
pub mod capture;
pub mod config;
pub mod embedding;
pub mod geometry;
pub mod matcher;
pub mod mesh;
pub mod pipeline;
pub mod quality;
pub mod similarity;
pub mod types;
pub mod validator;

pub use adapter::{primary_face, FivePointDetection, MeshDetection, NormalizedDetection};
pub use capture::{CaptureState, CaptureStateMachine, FrameInput, Phase, Transition};
pub use config::{ConfigError, EngineConfig, LightingMode};
pub use embedding::EmbeddingGenerator;
pub use matcher::{Decision, MatchDecider, Outcome};
pub use pipeline::{Analysis, FaceEngine};
pub use quality::{QualityAssessment, QualityScorer};
pub use similarity::SimilarityEngine;
pub use types::{DetectedFace, Embedding, FaceBox, GalleryEntry, Keypoint, MatchResult, MemberStatus};
pub use validator::{FaceValidator, Rejection, Strictness, Verdict};
