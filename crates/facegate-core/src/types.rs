use serde::{Deserialize, Serialize};

/// A single detector keypoint in source-frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Optional anatomical tag (e.g. "left_eye", "nose_tip").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Keypoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y, name: None }
    }

    pub fn named(x: f32, y: f32, name: impl Into<String>) -> Self {
        Self {
            x,
            y,
            name: Some(name.into()),
        }
    }
}

/// Axis-aligned face box in source-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FaceBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Width over height; 0.0 for a degenerate box.
    pub fn aspect_ratio(&self) -> f32 {
        if self.height > 0.0 {
            self.width / self.height
        } else {
            0.0
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }
}

/// One face returned by a detector, normalized at the adapter boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    #[serde(rename = "box")]
    pub face_box: FaceBox,
    pub keypoints: Vec<Keypoint>,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

fn default_confidence() -> f32 {
    1.0
}

/// Geometric face embedding.
///
/// Two embeddings are comparable only when they have the same length and
/// were produced by the same generation procedure (`model_version`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Generation procedure that produced this embedding (e.g. "kp6-geom-v1").
    #[serde(default)]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            values,
            model_version: Some(model_version.into()),
        }
    }

    /// Embedding with no values, meaning "no embedding available".
    pub fn empty() -> Self {
        Self {
            values: Vec::new(),
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether `other` can be scored against `self` at all.
    pub fn is_comparable_with(&self, other: &Embedding) -> bool {
        if self.is_empty() || self.values.len() != other.values.len() {
            return false;
        }
        match (&self.model_version, &other.model_version) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// Access status of an enrolled member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberStatus {
    Allowed,
    Banned,
    #[serde(rename = "VIP", alias = "Vip")]
    Vip,
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allowed => f.write_str("Allowed"),
            Self::Banned => f.write_str("Banned"),
            Self::Vip => f.write_str("VIP"),
        }
    }
}

impl std::str::FromStr for MemberStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allowed" => Ok(Self::Allowed),
            "banned" => Ok(Self::Banned),
            "vip" => Ok(Self::Vip),
            other => Err(format!("unknown member status: {other}")),
        }
    }
}

/// An enrolled member of an organization's gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub member_id: String,
    pub name: String,
    pub status: MemberStatus,
    pub embedding: Embedding,
}

/// Outcome of matching one probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    pub member_id: Option<String>,
    pub name: Option<String>,
    pub status: Option<MemberStatus>,
    /// Best similarity in [0, 1].
    pub confidence: f32,
}

impl MatchResult {
    pub fn no_match(confidence: f32) -> Self {
        Self {
            matched: false,
            member_id: None,
            name: None,
            status: None,
            confidence,
        }
    }

    pub fn accepted(entry: &GalleryEntry, confidence: f32) -> Self {
        Self {
            matched: true,
            member_id: Some(entry.member_id.clone()),
            name: Some(entry.name.clone()),
            status: Some(entry.status),
            confidence,
        }
    }
}
