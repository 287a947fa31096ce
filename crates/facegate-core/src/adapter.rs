//! Detector-shape adapters.
//!
//! Each detector family reports faces in its own shape. These types convert
//! them into the single [`DetectedFace`] the rest of the engine works with.

use crate::types::{DetectedFace, FaceBox, Keypoint};
use serde::{Deserialize, Serialize};

/// Landmark names for five-point output, image-left point of each pair first.
pub const FIVE_POINT_NAMES: [&str; 5] = ["right_eye", "left_eye", "nose_tip", "mouth_right", "mouth_left"];

/// SCRFD-style detection: pixel box plus optional five landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FivePointDetection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    #[serde(default)]
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl From<FivePointDetection> for DetectedFace {
    fn from(d: FivePointDetection) -> Self {
        let keypoints = d
            .landmarks
            .map(|lms| {
                lms.iter()
                    .zip(FIVE_POINT_NAMES)
                    .map(|(&(x, y), name)| Keypoint::named(x, y, name))
                    .collect()
            })
            .unwrap_or_default();
        DetectedFace {
            face_box: FaceBox::new(d.x, d.y, d.width, d.height),
            keypoints,
            confidence: d.confidence,
        }
    }
}

/// Dense mesh detection: pixel box plus mesh points in pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshDetection {
    pub face_box: FaceBox,
    pub mesh: Vec<(f32, f32)>,
    #[serde(default = "one")]
    pub confidence: f32,
}

impl From<MeshDetection> for DetectedFace {
    fn from(d: MeshDetection) -> Self {
        DetectedFace {
            face_box: d.face_box,
            keypoints: d.mesh.into_iter().map(|(x, y)| Keypoint::new(x, y)).collect(),
            confidence: d.confidence,
        }
    }
}

/// A named point in normalized [0, 1] frame coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPoint {
    pub x: f32,
    pub y: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Detection with box and keypoints relative to the frame size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedDetection {
    pub x_min: f32,
    pub y_min: f32,
    pub width: f32,
    pub height: f32,
    pub keypoints: Vec<NormalizedPoint>,
    #[serde(default = "one")]
    pub score: f32,
}

impl NormalizedDetection {
    /// Scale into pixel coordinates for a frame of the given size.
    pub fn into_face(self, frame_width: u32, frame_height: u32) -> DetectedFace {
        let (w, h) = (frame_width as f32, frame_height as f32);
        DetectedFace {
            face_box: FaceBox::new(self.x_min * w, self.y_min * h, self.width * w, self.height * h),
            keypoints: self
                .keypoints
                .into_iter()
                .map(|p| Keypoint {
                    x: p.x * w,
                    y: p.y * h,
                    name: p.name,
                })
                .collect(),
            confidence: self.score,
        }
    }
}

/// The face a single-subject session should act on: the largest box, the
/// earliest one on ties.
pub fn primary_face(faces: &[DetectedFace]) -> Option<&DetectedFace> {
    faces.iter().reduce(|best, f| {
        if f.face_box.area() > best.face_box.area() {
            f
        } else {
            best
        }
    })
}

fn one() -> f32 {
    1.0
}
