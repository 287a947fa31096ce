//! Geometric face embeddings from detector keypoints.
//!
//! The keypoint path places each keypoint into one of eight anatomical
//! slots and emits, in this fixed order:
//!
//! | block | dims | weight | content |
//! |-------|------|--------|---------|
//! | positions | 8 × 4 | 4.2 | offset from centroid normalized by extent, plus signed-square amplification |
//! | aspect | 2 | 1.7 | extent width/height and its logarithm |
//! | distances | 28 × 3 | 6.25 | every slot pair, normalized by face width; linear, quadratic, log1p |
//! | angles | 56 × 3 | 1.6 | angle at the middle slot of every slot triple (optional) |
//! | symmetry | 3 | 0.3 | left/right half centroid differences and count imbalance |
//! | quadrants | 4 | 0.3 | quadrant occupancy |
//! | spread | 3 | 33 | normalized (co)variance |
//! | presence | 8 | 1.0 | one per filled slot |
//!
//! Every block except presence is emitted as its deviation from the same
//! block computed on [`REFERENCE_LAYOUT`] restricted to the filled slots,
//! times the block weight. The weights are roughly the inverse of each
//! block's spread across different faces, and the presence block anchors
//! the scale: a face that matches the reference exactly embeds to presence
//! alone.
//!
//! Absent slots contribute zeros, so the length depends only on whether
//! angles are enabled. The result is L2-normalized. Gallery and probe
//! embeddings must come from the same configuration; the procedure is
//! recorded in [`Embedding::model_version`].

use crate::config::{EmbeddingConfig, EmbeddingMode};
use crate::geometry::{angle_at, distance};
use crate::mesh::{self, MESH_POINTS};
use crate::types::{DetectedFace, Embedding, Keypoint};

/// Anatomical slots of the keypoint path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Slot {
    RightEye = 0,
    LeftEye = 1,
    NoseTip = 2,
    MouthCenter = 3,
    MouthRight = 4,
    MouthLeft = 5,
    RightEar = 6,
    LeftEar = 7,
}

impl Slot {
    pub const COUNT: usize = 8;

    /// Map a detector keypoint name onto a slot.
    pub fn from_name(name: &str) -> Option<Self> {
        let key: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match key.as_str() {
            "righteye" | "righteyecenter" | "reye" => Some(Self::RightEye),
            "lefteye" | "lefteyecenter" | "leye" => Some(Self::LeftEye),
            "nose" | "nosetip" => Some(Self::NoseTip),
            "mouth" | "mouthcenter" => Some(Self::MouthCenter),
            "mouthright" | "rightmouth" | "rightmouthcorner" => Some(Self::MouthRight),
            "mouthleft" | "leftmouth" | "leftmouthcorner" => Some(Self::MouthLeft),
            "rightear" | "righteartragion" => Some(Self::RightEar),
            "leftear" | "lefteartragion" => Some(Self::LeftEar),
            _ => None,
        }
    }
}

/// Slot order for unnamed six-point output (BlazeFace convention).
const SIX_POINT_LAYOUT: [Slot; 6] = [
    Slot::RightEye,
    Slot::LeftEye,
    Slot::NoseTip,
    Slot::MouthCenter,
    Slot::RightEar,
    Slot::LeftEar,
];

/// Slot order for unnamed five-point output (SCRFD convention, image-left
/// point of each pair first, i.e. the subject's right side).
const FIVE_POINT_LAYOUT: [Slot; 5] = [
    Slot::RightEye,
    Slot::LeftEye,
    Slot::NoseTip,
    Slot::MouthRight,
    Slot::MouthLeft,
];

const SEQUENTIAL_LAYOUT: [Slot; Slot::COUNT] = [
    Slot::RightEye,
    Slot::LeftEye,
    Slot::NoseTip,
    Slot::MouthCenter,
    Slot::MouthRight,
    Slot::MouthLeft,
    Slot::RightEar,
    Slot::LeftEar,
];

const PAIRS: usize = Slot::COUNT * (Slot::COUNT - 1) / 2;
const TRIPLES: usize = Slot::COUNT * (Slot::COUNT - 1) * (Slot::COUNT - 2) / 6;
const TRANSFORMS: usize = 3;

/// Signed-square gain applied to relative positions.
const SIGNED_SQUARE_GAIN: f32 = 4.0;

const POSITION_DIMS: usize = Slot::COUNT * 4;
const ASPECT_DIMS: usize = 2;
const DISTANCE_DIMS: usize = PAIRS * TRANSFORMS;
const ANGLE_DIMS: usize = TRIPLES * TRANSFORMS;
const SYMMETRY_DIMS: usize = 3;
const QUADRANT_DIMS: usize = 4;
const SPREAD_DIMS: usize = 3;
const PRESENCE_DIMS: usize = Slot::COUNT;

const POSITION_WEIGHT: f32 = 4.2;
const ASPECT_WEIGHT: f32 = 1.7;
const DISTANCE_WEIGHT: f32 = 6.25;
const ANGLE_WEIGHT: f32 = 1.6;
const SYMMETRY_WEIGHT: f32 = 0.3;
const QUADRANT_WEIGHT: f32 = 0.3;
const SPREAD_WEIGHT: f32 = 33.0;
const PRESENCE_WEIGHT: f32 = 1.0;

/// Canonical frontal layout on a 100-unit face box, indexed by [`Slot`].
/// Integer coordinates keep midline points exactly on the centroid.
pub const REFERENCE_LAYOUT: [(f32, f32); Slot::COUNT] = [
    (30.0, 35.0),
    (70.0, 35.0),
    (50.0, 55.0),
    (50.0, 77.0),
    (36.0, 76.0),
    (64.0, 76.0),
    (7.0, 45.0),
    (93.0, 45.0),
];

/// Length of a keypoint-path embedding with angle features.
pub const KEYPOINT_EMBEDDING_DIM: usize = POSITION_DIMS
    + ASPECT_DIMS
    + DISTANCE_DIMS
    + ANGLE_DIMS
    + SYMMETRY_DIMS
    + QUADRANT_DIMS
    + SPREAD_DIMS
    + PRESENCE_DIMS;

/// Length of a keypoint-path embedding without angle features.
pub const KEYPOINT_EMBEDDING_DIM_NO_ANGLES: usize = KEYPOINT_EMBEDDING_DIM - ANGLE_DIMS;

pub const KEYPOINT_MODEL_VERSION: &str = "kp8-geom-v2";
pub const KEYPOINT_MODEL_VERSION_NO_ANGLES: &str = "kp8-geom-noangle-v2";

type Slots = [Option<(f32, f32)>; Slot::COUNT];

/// Converts validated detections into comparison-ready embeddings.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingGenerator {
    config: EmbeddingConfig,
}

impl EmbeddingGenerator {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self { config }
    }

    /// Generate an embedding for `face`.
    ///
    /// Returns an empty embedding when the keypoints cannot support one
    /// (fewer than two filled slots, or all collapsed onto a line or point).
    pub fn generate(&self, face: &DetectedFace) -> Embedding {
        let use_mesh = match self.config.mode {
            EmbeddingMode::Auto => face.keypoints.len() >= MESH_POINTS,
            EmbeddingMode::Keypoints => false,
            EmbeddingMode::Mesh => true,
        };
        if use_mesh {
            mesh::generate(&face.keypoints)
        } else {
            self.generate_from_keypoints(&face.keypoints)
        }
    }

    /// Keypoint path; see the module documentation for the layout.
    pub fn generate_from_keypoints(&self, keypoints: &[Keypoint]) -> Embedding {
        let slots = assign_slots(keypoints);
        let reference: Slots = std::array::from_fn(|i| slots[i].map(|_| REFERENCE_LAYOUT[i]));
        let angles = self.config.include_angles;

        // A reference pinned by two axis-aligned slots has no extent either.
        let (Some(face), Some(reference)) = (Features::extract(&slots, angles), Features::extract(&reference, angles))
        else {
            return Embedding::empty();
        };

        let dim = if angles {
            KEYPOINT_EMBEDDING_DIM
        } else {
            KEYPOINT_EMBEDDING_DIM_NO_ANGLES
        };
        let mut out = Vec::with_capacity(dim);
        push_deviation(&mut out, &face.positions, &reference.positions, POSITION_WEIGHT);
        push_deviation(&mut out, &face.aspect, &reference.aspect, ASPECT_WEIGHT);
        push_deviation(&mut out, &face.distances, &reference.distances, DISTANCE_WEIGHT);
        push_deviation(&mut out, &face.angles, &reference.angles, ANGLE_WEIGHT);
        push_deviation(&mut out, &face.symmetry, &reference.symmetry, SYMMETRY_WEIGHT);
        push_deviation(&mut out, &face.quadrants, &reference.quadrants, QUADRANT_WEIGHT);
        push_deviation(&mut out, &face.spread, &reference.spread, SPREAD_WEIGHT);
        out.extend(slots.iter().map(|s| if s.is_some() { PRESENCE_WEIGHT } else { 0.0 }));

        debug_assert_eq!(out.len(), dim);
        l2_normalize(&mut out);

        let version = if angles {
            KEYPOINT_MODEL_VERSION
        } else {
            KEYPOINT_MODEL_VERSION_NO_ANGLES
        };
        Embedding::new(out, version)
    }
}

/// Raw geometric blocks of one slot assignment, before centring.
struct Features {
    positions: [f32; POSITION_DIMS],
    aspect: [f32; ASPECT_DIMS],
    distances: [f32; DISTANCE_DIMS],
    /// Empty when angles are disabled.
    angles: Vec<f32>,
    symmetry: [f32; SYMMETRY_DIMS],
    quadrants: [f32; QUADRANT_DIMS],
    spread: [f32; SPREAD_DIMS],
}

impl Features {
    /// `None` when fewer than two slots are filled or their extent is flat.
    fn extract(slots: &Slots, include_angles: bool) -> Option<Self> {
        let present: Vec<(f32, f32)> = slots.iter().flatten().copied().collect();
        if present.len() < 2 {
            return None;
        }

        let n = present.len() as f32;
        let cx = present.iter().map(|p| p.0).sum::<f32>() / n;
        let cy = present.iter().map(|p| p.1).sum::<f32>() / n;
        let (min_x, max_x) = min_max(present.iter().map(|p| p.0));
        let (min_y, max_y) = min_max(present.iter().map(|p| p.1));
        let width = max_x - min_x;
        let height = max_y - min_y;
        if width <= 0.0 || height <= 0.0 {
            return None;
        }

        let mut positions = [0.0; POSITION_DIMS];
        for (chunk, slot) in positions.chunks_exact_mut(4).zip(slots) {
            if let Some((x, y)) = slot {
                let nx = (x - cx) / width;
                let ny = (y - cy) / height;
                chunk.copy_from_slice(&[
                    nx,
                    ny,
                    nx * nx.abs() * SIGNED_SQUARE_GAIN,
                    ny * ny.abs() * SIGNED_SQUARE_GAIN,
                ]);
            }
        }

        let aspect = width / height;

        let mut distances = [0.0; DISTANCE_DIMS];
        let pairs = (0..Slot::COUNT).flat_map(|i| ((i + 1)..Slot::COUNT).map(move |j| (i, j)));
        for (chunk, (i, j)) in distances.chunks_exact_mut(TRANSFORMS).zip(pairs) {
            if let (Some(a), Some(b)) = (slots[i], slots[j]) {
                chunk.copy_from_slice(&amplify(distance(a, b) / width));
            }
        }

        let mut angles = Vec::new();
        if include_angles {
            angles.reserve(ANGLE_DIMS);
            for i in 0..Slot::COUNT {
                for j in (i + 1)..Slot::COUNT {
                    for k in (j + 1)..Slot::COUNT {
                        match (slots[i], slots[j], slots[k]) {
                            (Some(a), Some(v), Some(b)) => {
                                angles.extend(amplify(angle_at(v, a, b) / std::f32::consts::PI))
                            }
                            _ => angles.extend([0.0; TRANSFORMS]),
                        }
                    }
                }
            }
        }

        let (quadrants, spread) = density(&present, cx, cy, width, height);
        Some(Self {
            positions,
            aspect: [aspect, aspect.ln()],
            distances,
            angles,
            symmetry: symmetry(&present, cx, cy, width, height),
            quadrants,
            spread,
        })
    }
}

fn push_deviation(out: &mut Vec<f32>, face: &[f32], reference: &[f32], weight: f32) {
    out.extend(face.iter().zip(reference).map(|(f, r)| (f - r) * weight));
}

/// Place keypoints into slots: by name when every keypoint carries a
/// recognized name, otherwise by the detector's positional layout.
fn assign_slots(keypoints: &[Keypoint]) -> Slots {
    let mut slots = [None; Slot::COUNT];

    let named: Option<Vec<Slot>> = keypoints
        .iter()
        .map(|kp| kp.name.as_deref().and_then(Slot::from_name))
        .collect();

    match named {
        Some(names) if !names.is_empty() => {
            for (kp, slot) in keypoints.iter().zip(names) {
                // First occurrence wins.
                slots[slot as usize].get_or_insert((kp.x, kp.y));
            }
        }
        _ => {
            let layout: &[Slot] = match keypoints.len() {
                5 => &FIVE_POINT_LAYOUT,
                6 => &SIX_POINT_LAYOUT,
                _ => &SEQUENTIAL_LAYOUT,
            };
            for (kp, slot) in keypoints.iter().zip(layout) {
                slots[*slot as usize] = Some((kp.x, kp.y));
            }
        }
    }

    slots
}

/// Linear, quadratic and logarithmic views of one value.
fn amplify(v: f32) -> [f32; TRANSFORMS] {
    [v, v * v, v.ln_1p()]
}

fn symmetry(points: &[(f32, f32)], cx: f32, cy: f32, width: f32, height: f32) -> [f32; SYMMETRY_DIMS] {
    let (mut lx, mut ly, mut ln) = (0.0f32, 0.0f32, 0usize);
    let (mut rx, mut ry, mut rn) = (0.0f32, 0.0f32, 0usize);
    for &(x, y) in points {
        let nx = (x - cx) / width;
        let ny = (y - cy) / height;
        if nx < 0.0 {
            lx += nx;
            ly += ny;
            ln += 1;
        } else if nx > 0.0 {
            rx += nx;
            ry += ny;
            rn += 1;
        }
    }
    let mean = |s: f32, n: usize| if n > 0 { s / n as f32 } else { 0.0 };
    let (lx, ly) = (mean(lx, ln), mean(ly, ln));
    let (rx, ry) = (mean(rx, rn), mean(ry, rn));
    [
        lx.abs() - rx.abs(),
        ly - ry,
        (ln as f32 - rn as f32) / points.len() as f32,
    ]
}

/// Quadrant occupancy and normalized (co)variance about the centroid.
fn density(
    points: &[(f32, f32)],
    cx: f32,
    cy: f32,
    width: f32,
    height: f32,
) -> ([f32; QUADRANT_DIMS], [f32; SPREAD_DIMS]) {
    let n = points.len() as f32;
    let mut quadrants = [0.0f32; QUADRANT_DIMS];
    let (mut vx, mut vy, mut cov) = (0.0f32, 0.0f32, 0.0f32);
    for &(x, y) in points {
        let nx = (x - cx) / width;
        let ny = (y - cy) / height;
        let q = match (nx < 0.0, ny < 0.0) {
            (true, true) => 0,
            (false, true) => 1,
            (true, false) => 2,
            (false, false) => 3,
        };
        quadrants[q] += 1.0;
        vx += nx * nx;
        vy += ny * ny;
        cov += nx * ny;
    }
    (quadrants.map(|q| q / n), [vx / n, vy / n, cov / n])
}

fn min_max(values: impl Iterator<Item = f32>) -> (f32, f32) {
    values.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)))
}

/// Scale `values` to unit L2 norm in place; zero vectors are left untouched.
pub fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::tests::frontal_face;

    fn generator() -> EmbeddingGenerator {
        EmbeddingGenerator::default()
    }

    #[test]
    fn test_dimensions() {
        assert_eq!(KEYPOINT_EMBEDDING_DIM, 304);
        assert_eq!(KEYPOINT_EMBEDDING_DIM_NO_ANGLES, 136);
        let e = generator().generate(&frontal_face());
        assert_eq!(e.len(), KEYPOINT_EMBEDDING_DIM);
        assert_eq!(e.model_version.as_deref(), Some(KEYPOINT_MODEL_VERSION));

        let no_angles = EmbeddingGenerator::new(EmbeddingConfig {
            include_angles: false,
            ..EmbeddingConfig::default()
        });
        let e = no_angles.generate(&frontal_face());
        assert_eq!(e.len(), KEYPOINT_EMBEDDING_DIM_NO_ANGLES);
        assert_eq!(e.model_version.as_deref(), Some(KEYPOINT_MODEL_VERSION_NO_ANGLES));
    }

    #[test]
    fn test_deterministic() {
        let face = frontal_face();
        let a = generator().generate(&face);
        let b = generator().generate(&face);
        assert_eq!(a.values, b.values);
    }

    #[test]
    fn test_unit_norm() {
        let e = generator().generate(&frontal_face());
        let norm: f32 = e.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(e.values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_empty_keypoints_give_empty_embedding() {
        let mut face = frontal_face();
        face.keypoints.clear();
        assert!(generator().generate(&face).is_empty());
    }

    #[test]
    fn test_collapsed_keypoints_give_empty_embedding() {
        let mut face = frontal_face();
        face.keypoints.iter_mut().for_each(|kp| kp.y = 200.0);
        assert!(generator().generate(&face).is_empty());
    }

    #[test]
    fn test_translation_and_scale_invariant() {
        let face = frontal_face();
        let mut moved = face.clone();
        for kp in moved.keypoints.iter_mut() {
            kp.x = kp.x * 1.5 + 40.0;
            kp.y = kp.y * 1.5 - 30.0;
        }
        let a = generator().generate(&face);
        let b = generator().generate(&moved);
        for (x, y) in a.values.iter().zip(&b.values) {
            assert!((x - y).abs() < 1e-4, "{x} vs {y}");
        }
    }

    #[test]
    fn test_names_and_layout_agree() {
        // The unnamed six-point layout is BlazeFace order, same as frontal_face().
        let named = frontal_face();
        let mut unnamed = named.clone();
        unnamed.keypoints.iter_mut().for_each(|kp| kp.name = None);
        assert_eq!(generator().generate(&named).values, generator().generate(&unnamed).values);
    }

    #[test]
    fn test_different_geometry_differs() {
        let face = frontal_face();
        let mut other = face.clone();
        // Wider-set eyes, lower mouth.
        other.keypoints[0].x -= 12.0;
        other.keypoints[1].x += 12.0;
        other.keypoints[3].y += 15.0;
        let a = generator().generate(&face);
        let b = generator().generate(&other);
        assert_ne!(a.values, b.values);
    }

    #[test]
    fn test_reference_layout_embeds_to_presence_only() {
        let slots = [
            (Slot::RightEye, "right_eye"),
            (Slot::LeftEye, "left_eye"),
            (Slot::NoseTip, "nose_tip"),
            (Slot::MouthCenter, "mouth_center"),
            (Slot::RightEar, "right_ear"),
            (Slot::LeftEar, "left_ear"),
        ];
        let keypoints: Vec<Keypoint> = slots
            .iter()
            .map(|(slot, name)| {
                let (x, y) = REFERENCE_LAYOUT[*slot as usize];
                Keypoint::named(100.0 + 2.0 * x, 50.0 + 2.0 * y, *name)
            })
            .collect();
        let e = generator().generate_from_keypoints(&keypoints);

        let presence = &e.values[e.len() - PRESENCE_DIMS..];
        let expected = 1.0 / (slots.len() as f32).sqrt();
        for (i, v) in presence.iter().enumerate() {
            let filled = slots.iter().any(|(s, _)| *s as usize == i);
            let want = if filled { expected } else { 0.0 };
            assert!((v - want).abs() < 1e-4, "presence[{i}] = {v}");
        }
        for v in &e.values[..e.len() - PRESENCE_DIMS] {
            assert!(v.abs() < 1e-3, "deviation {v}");
        }
    }

    #[test]
    fn test_axis_aligned_pair_is_empty() {
        // Two eyes fill slots whose reference positions share a row.
        let keypoints = vec![
            Keypoint::named(100.0, 100.0, "right_eye"),
            Keypoint::named(180.0, 104.0, "left_eye"),
        ];
        assert!(generator().generate_from_keypoints(&keypoints).is_empty());
    }

    #[test]
    fn test_slot_names() {
        assert_eq!(Slot::from_name("left_eye"), Some(Slot::LeftEye));
        assert_eq!(Slot::from_name("rightEarTragion"), Some(Slot::RightEar));
        assert_eq!(Slot::from_name("Mouth Left"), Some(Slot::MouthLeft));
        assert_eq!(Slot::from_name("eyebrow"), None);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        let mut v = vec![0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0]);
    }
}
