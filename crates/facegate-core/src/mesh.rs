//! Embedding path for dense 468-point face meshes.
//!
//! Only landmarks that stay put across expressions are read: eye corners,
//! the nose bridge/tip/base, mouth corners, chin, forehead, cheek contour
//! and jaw. Inner-lip and eyelid points move with expression and would
//! make a registration-time embedding drift from a recognition-time one,
//! so they are never used.

use crate::embedding::l2_normalize;
use crate::geometry::{angle_at, distance};
use crate::types::{Embedding, Keypoint};

/// Minimum number of mesh points for this path.
pub const MESH_POINTS: usize = 468;

pub const MESH_MODEL_VERSION: &str = "mesh468-geom-v1";

const RIGHT_EYE_OUTER: usize = 33;
const RIGHT_EYE_INNER: usize = 133;
const LEFT_EYE_OUTER: usize = 263;
const LEFT_EYE_INNER: usize = 362;
const NOSE_BRIDGE: usize = 168;
const NOSE_TIP: usize = 1;
const NOSE_BASE: usize = 2;
const MOUTH_RIGHT: usize = 61;
const MOUTH_LEFT: usize = 291;
const CHIN: usize = 152;
const FOREHEAD: usize = 10;
const CHEEK_RIGHT: usize = 234;
const CHEEK_LEFT: usize = 454;
const JAW_RIGHT: usize = 172;
const JAW_LEFT: usize = 397;

/// Stable landmarks, in embedding order.
pub const STABLE_LANDMARKS: [usize; 15] = [
    RIGHT_EYE_OUTER,
    RIGHT_EYE_INNER,
    LEFT_EYE_OUTER,
    LEFT_EYE_INNER,
    NOSE_BRIDGE,
    NOSE_TIP,
    NOSE_BASE,
    MOUTH_RIGHT,
    MOUTH_LEFT,
    CHIN,
    FOREHEAD,
    CHEEK_RIGHT,
    CHEEK_LEFT,
    JAW_RIGHT,
    JAW_LEFT,
];

/// Expression-sensitive landmarks (inner lips, upper/lower eyelids).
pub const EXPRESSION_LANDMARKS: [usize; 6] = [13, 14, 159, 145, 386, 374];

const N: usize = STABLE_LANDMARKS.len();
const RATIO_DIMS: usize = 8;

/// Length of a mesh-path embedding.
pub const MESH_EMBEDDING_DIM: usize = N * 2 + N * (N - 1) / 2 + RATIO_DIMS;

/// Generate a mesh-path embedding; empty when the mesh is incomplete or degenerate.
pub fn generate(mesh: &[Keypoint]) -> Embedding {
    if mesh.len() < MESH_POINTS {
        return Embedding::empty();
    }
    let p = |i: usize| (mesh[i].x, mesh[i].y);
    let points: Vec<(f32, f32)> = STABLE_LANDMARKS.iter().map(|&i| p(i)).collect();

    let face_w = distance(p(CHEEK_RIGHT), p(CHEEK_LEFT));
    let face_h = distance(p(FOREHEAD), p(CHIN));
    let right_eye = midpoint(p(RIGHT_EYE_OUTER), p(RIGHT_EYE_INNER));
    let left_eye = midpoint(p(LEFT_EYE_OUTER), p(LEFT_EYE_INNER));
    let eye_distance = distance(right_eye, left_eye);
    if face_w <= 0.0 || face_h <= 0.0 || eye_distance <= 0.0 {
        return Embedding::empty();
    }

    let n = N as f32;
    let cx = points.iter().map(|q| q.0).sum::<f32>() / n;
    let cy = points.iter().map(|q| q.1).sum::<f32>() / n;

    let mut out = Vec::with_capacity(MESH_EMBEDDING_DIM);

    for &(x, y) in &points {
        out.push((x - cx) / face_w);
        out.push((y - cy) / face_h);
    }

    for i in 0..N {
        for j in (i + 1)..N {
            out.push(distance(points[i], points[j]) / face_w);
        }
    }

    let eye_mid = midpoint(right_eye, left_eye);
    // Unit vector of the vertical face axis (forehead to chin).
    let axis = {
        let (dx, dy) = (p(CHIN).0 - p(FOREHEAD).0, p(CHIN).1 - p(FOREHEAD).1);
        (dx / face_h, dy / face_h)
    };
    let nose = p(NOSE_TIP);
    let (nx, ny) = (nose.0 - eye_mid.0, nose.1 - eye_mid.1);
    let nose_along = nx * axis.0 + ny * axis.1;
    let nose_across = nx * axis.1 - ny * axis.0;

    let eye_width = (distance(p(RIGHT_EYE_OUTER), p(RIGHT_EYE_INNER))
        + distance(p(LEFT_EYE_OUTER), p(LEFT_EYE_INNER)))
        / 2.0;
    // Angle between the eye line and the face axis; independent of head roll.
    let eye_axis_angle = angle_at(
        (0.0, 0.0),
        (left_eye.0 - right_eye.0, left_eye.1 - right_eye.1),
        axis,
    ) / std::f32::consts::PI;

    out.extend([
        eye_distance / face_w,
        nose_along / face_h,
        nose_across / face_w,
        distance(p(MOUTH_RIGHT), p(MOUTH_LEFT)) / eye_distance,
        face_h / face_w,
        distance(p(JAW_RIGHT), p(JAW_LEFT)) / face_w,
        eye_width / eye_distance,
        eye_axis_angle,
    ]);

    debug_assert_eq!(out.len(), MESH_EMBEDDING_DIM);
    l2_normalize(&mut out);
    Embedding::new(out, MESH_MODEL_VERSION)
}

fn midpoint(a: (f32, f32), b: (f32, f32)) -> (f32, f32) {
    ((a.0 + b.0) / 2.0, (a.1 + b.1) / 2.0)
}
