//! Face-shape validation of raw detector output.
//!
//! Keypoint detectors happily report hands, shoulders and partial faces as
//! faces. The validator rejects detections whose keypoint layout or box
//! geometry cannot belong to a frontal face. A rejection is a normal
//! per-frame outcome, not an error.

use crate::config::{StrictnessProfile, ValidatorConfig};
use crate::geometry::{KeypointStats, PrincipalAxis};
use crate::types::DetectedFace;
use std::fmt;

/// Which box-level limits to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// Per-frame tracking.
    Relaxed,
    /// Final check before a capture is matched.
    Strict,
}

/// Why a detection was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    TooFewKeypoints { found: usize, required: usize },
    ClusteredKeypoints { coverage_x: f32, coverage_y: f32 },
    OneSided,
    VerticallyFlat { thirds: usize },
    AspectRatio { ratio: f32 },
    EdgeClipped,
    OffCenter { offset_x: f32, offset_y: f32 },
    LinearPattern { ratio: f32 },
    DegenerateBox,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooFewKeypoints { found, required } => {
                write!(f, "too few keypoints: {found} < {required}")
            }
            Self::ClusteredKeypoints {
                coverage_x,
                coverage_y,
            } => write!(
                f,
                "keypoints clustered: cover {:.0}% x {:.0}% of the box",
                coverage_x * 100.0,
                coverage_y * 100.0
            ),
            Self::OneSided => f.write_str("keypoints only on one side of the face centre"),
            Self::VerticallyFlat { thirds } => {
                write!(f, "keypoints span only {thirds} vertical third(s) of the box")
            }
            Self::AspectRatio { ratio } => write!(f, "face box aspect ratio {ratio:.2} out of range"),
            Self::EdgeClipped => f.write_str("face box touches the frame edge"),
            Self::OffCenter { offset_x, offset_y } => write!(
                f,
                "face off-centre by {:.0}% / {:.0}% of the frame",
                offset_x * 100.0,
                offset_y * 100.0
            ),
            Self::LinearPattern { ratio } => write!(
                f,
                "{:.0}% of keypoints lie on one line (hand-like pattern)",
                ratio * 100.0
            ),
            Self::DegenerateBox => f.write_str("face box has no area"),
        }
    }
}

/// Validation outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted,
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// Human-readable reason.
    pub fn reason(&self) -> String {
        match self {
            Self::Accepted => "ok".to_string(),
            Self::Rejected(r) => r.to_string(),
        }
    }
}

/// Rejects detector outputs that are not face-shaped.
#[derive(Debug, Clone, Default)]
pub struct FaceValidator {
    config: ValidatorConfig,
}

impl FaceValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Run every rule against `face`. The first failing rule wins.
    pub fn validate(
        &self,
        face: &DetectedFace,
        frame_width: u32,
        frame_height: u32,
        strictness: Strictness,
    ) -> Verdict {
        match self.check(face, frame_width as f32, frame_height as f32, strictness) {
            Ok(()) => Verdict::Accepted,
            Err(rejection) => {
                tracing::debug!(%rejection, ?strictness, "detection rejected");
                Verdict::Rejected(rejection)
            }
        }
    }

    fn check(
        &self,
        face: &DetectedFace,
        frame_w: f32,
        frame_h: f32,
        strictness: Strictness,
    ) -> Result<(), Rejection> {
        let profile = match strictness {
            Strictness::Relaxed => &self.config.relaxed,
            Strictness::Strict => &self.config.strict,
        };
        let b = face.face_box;
        if !(b.width > 0.0 && b.height > 0.0) {
            return Err(Rejection::DegenerateBox);
        }

        let required = self.config.required_keypoints();
        let found = face.keypoints.len();
        if found < required || found == 0 {
            return Err(Rejection::TooFewKeypoints { found, required });
        }

        // Non-empty, checked above.
        let Some(stats) = KeypointStats::compute(&face.keypoints) else {
            return Err(Rejection::TooFewKeypoints { found, required });
        };

        let coverage_x = stats.extent.width() / b.width;
        let coverage_y = stats.extent.height() / b.height;
        if coverage_x < self.config.min_keypoint_spread || coverage_y < self.config.min_keypoint_spread {
            return Err(Rejection::ClusteredKeypoints {
                coverage_x,
                coverage_y,
            });
        }

        let (cx, _) = b.center();
        let left = face.keypoints.iter().any(|kp| kp.x < cx);
        let right = face.keypoints.iter().any(|kp| kp.x > cx);
        if !(left && right) {
            return Err(Rejection::OneSided);
        }

        let thirds = occupied_thirds(face);
        if thirds < 2 {
            return Err(Rejection::VerticallyFlat { thirds });
        }

        let ratio = b.aspect_ratio();
        if ratio < profile.aspect_min || ratio > profile.aspect_max {
            return Err(Rejection::AspectRatio { ratio });
        }

        if touches_edge(face, frame_w, frame_h, profile) {
            return Err(Rejection::EdgeClipped);
        }

        if let Some(max_offset) = profile.max_center_offset {
            let (bx, by) = b.center();
            let offset_x = (bx - frame_w / 2.0).abs() / frame_w;
            let offset_y = (by - frame_h / 2.0).abs() / frame_h;
            if offset_x > max_offset || offset_y > max_offset {
                return Err(Rejection::OffCenter { offset_x, offset_y });
            }
        }

        let linear = self.linear_ratio(face);
        if linear > self.config.max_linear_ratio {
            return Err(Rejection::LinearPattern { ratio: linear });
        }

        Ok(())
    }

    /// Fraction of keypoints lying on the best-fit line through all of them.
    fn linear_ratio(&self, face: &DetectedFace) -> f32 {
        let Some(axis) = PrincipalAxis::fit(&face.keypoints) else {
            return 0.0;
        };
        if axis.length <= 0.0 {
            return 1.0;
        }
        let tolerance = axis.length * self.config.line_tolerance;
        let on_line = face
            .keypoints
            .iter()
            .filter(|kp| axis.distance_to((kp.x, kp.y)) <= tolerance)
            .count();
        on_line as f32 / face.keypoints.len() as f32
    }
}

/// Number of {upper, middle, lower} thirds of the box holding a keypoint.
fn occupied_thirds(face: &DetectedFace) -> usize {
    let b = face.face_box;
    let mut occupied = [false; 3];
    for kp in &face.keypoints {
        let rel = (kp.y - b.y) / b.height;
        if !(0.0..=1.0).contains(&rel) {
            continue;
        }
        let third = ((rel * 3.0) as usize).min(2);
        occupied[third] = true;
    }
    occupied.iter().filter(|o| **o).count()
}

fn touches_edge(face: &DetectedFace, frame_w: f32, frame_h: f32, profile: &StrictnessProfile) -> bool {
    let b = face.face_box;
    let m = profile.edge_margin;
    b.x < m || b.y < m || b.right() > frame_w - m || b.bottom() > frame_h - m
}
