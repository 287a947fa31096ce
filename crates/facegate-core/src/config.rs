//! Engine configuration.
//!
//! Every threshold the algorithms use lives here, grouped by component.
//! All sections deserialize from TOML with per-field defaults, so a config
//! file only needs to name the values it changes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub validator: ValidatorConfig,
    pub quality: QualityConfig,
    pub embedding: EmbeddingConfig,
    pub similarity: SimilarityConfig,
    pub matching: MatchConfig,
    pub capture: CaptureConfig,
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&src)?;
        tracing::debug!(path = %path.display(), "loaded engine config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validator.validate()?;
        self.quality.validate()?;
        self.similarity.validate()?;
        self.matching.validate()?;
        self.capture.validate()?;
        Ok(())
    }
}

/// Lighting condition the detector is running under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightingMode {
    #[default]
    Normal,
    LowLight,
}

/// Box-level limits for one validator strictness level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrictnessProfile {
    pub aspect_min: f32,
    pub aspect_max: f32,
    /// Minimum distance in pixels between the face box and every frame edge.
    pub edge_margin: f32,
    /// Maximum offset of the box centre from the frame centre, as a fraction
    /// of the frame dimension on each axis. `None` disables the check.
    pub max_center_offset: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub lighting: LightingMode,
    pub min_keypoints: usize,
    pub min_keypoints_low_light: usize,
    /// Keypoint extent must cover at least this fraction of the box on both axes.
    pub min_keypoint_spread: f32,
    /// Reject when more than this fraction of keypoints lie on one line.
    pub max_linear_ratio: f32,
    /// Distance from the fitted line, as a fraction of the line's extent,
    /// under which a keypoint counts as lying on it.
    pub line_tolerance: f32,
    pub relaxed: StrictnessProfile,
    pub strict: StrictnessProfile,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            lighting: LightingMode::Normal,
            min_keypoints: 5,
            min_keypoints_low_light: 4,
            min_keypoint_spread: 0.3,
            max_linear_ratio: 0.6,
            line_tolerance: 0.08,
            relaxed: StrictnessProfile {
                aspect_min: 0.6,
                aspect_max: 1.5,
                edge_margin: 5.0,
                max_center_offset: None,
            },
            strict: StrictnessProfile {
                aspect_min: 0.75,
                aspect_max: 1.3,
                edge_margin: 20.0,
                max_center_offset: Some(0.35),
            },
        }
    }
}

impl ValidatorConfig {
    /// Minimum keypoint count for the configured lighting mode.
    pub fn required_keypoints(&self) -> usize {
        match self.lighting {
            LightingMode::Normal => self.min_keypoints,
            LightingMode::LowLight => self.min_keypoints_low_light,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        unit_interval("validator.min_keypoint_spread", self.min_keypoint_spread)?;
        unit_interval("validator.max_linear_ratio", self.max_linear_ratio)?;
        if self.line_tolerance <= 0.0 {
            return Err(invalid("validator.line_tolerance must be positive"));
        }
        for (name, p) in [("relaxed", &self.relaxed), ("strict", &self.strict)] {
            if !(p.aspect_min > 0.0 && p.aspect_min < p.aspect_max) {
                return Err(invalid(format!(
                    "validator.{name}: aspect range [{}, {}] is not ordered",
                    p.aspect_min, p.aspect_max
                )));
            }
            if p.edge_margin < 0.0 {
                return Err(invalid(format!("validator.{name}.edge_margin is negative")));
            }
        }
        Ok(())
    }
}

/// Weights of the quality sub-scores. Normalized by their sum when scoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub size: f32,
    pub position: f32,
    pub keypoints: f32,
    pub edge: f32,
    pub aspect: f32,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            size: 0.25,
            position: 0.25,
            keypoints: 0.25,
            edge: 0.15,
            aspect: 0.10,
        }
    }
}

impl QualityWeights {
    pub fn sum(&self) -> f32 {
        self.size + self.position + self.keypoints + self.edge + self.aspect
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub weights: QualityWeights,
    /// Face-area / frame-area below this scores 0.
    pub min_area_ratio: f32,
    pub ideal_area_min: f32,
    pub ideal_area_max: f32,
    /// Face-area / frame-area above this scores 0.
    pub max_area_ratio: f32,
    /// Centre offsets (fraction of the half-diagonal) up to this score 1.0.
    pub centered_offset: f32,
    /// Centre offsets beyond this score 0.
    pub max_center_offset: f32,
    /// Keypoint count at which the keypoint sub-score saturates.
    pub good_keypoints: usize,
    pub edge_margin: f32,
    pub ideal_aspect_min: f32,
    pub ideal_aspect_max: f32,
    pub aspect_min: f32,
    pub aspect_max: f32,
    /// Score at or above which a frame counts as high quality.
    pub high_quality_threshold: f32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            weights: QualityWeights::default(),
            min_area_ratio: 0.02,
            ideal_area_min: 0.08,
            ideal_area_max: 0.35,
            max_area_ratio: 0.6,
            centered_offset: 0.1,
            max_center_offset: 0.3,
            good_keypoints: 6,
            edge_margin: 10.0,
            ideal_aspect_min: 0.8,
            ideal_aspect_max: 1.25,
            aspect_min: 0.6,
            aspect_max: 1.5,
            high_quality_threshold: 0.90,
        }
    }
}

impl QualityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.weights;
        if [w.size, w.position, w.keypoints, w.edge, w.aspect]
            .iter()
            .any(|v| *v < 0.0)
        {
            return Err(invalid("quality.weights must be non-negative"));
        }
        if w.sum() <= 0.0 {
            return Err(invalid("quality.weights must have a positive sum"));
        }
        ordered(
            "quality area band",
            &[
                self.min_area_ratio,
                self.ideal_area_min,
                self.ideal_area_max,
                self.max_area_ratio,
            ],
        )?;
        ordered(
            "quality aspect band",
            &[
                self.aspect_min,
                self.ideal_aspect_min,
                self.ideal_aspect_max,
                self.aspect_max,
            ],
        )?;
        if !(self.centered_offset >= 0.0 && self.centered_offset < self.max_center_offset) {
            return Err(invalid(
                "quality.centered_offset must be below quality.max_center_offset",
            ));
        }
        if self.good_keypoints == 0 {
            return Err(invalid("quality.good_keypoints must be at least 1"));
        }
        unit_interval("quality.high_quality_threshold", self.high_quality_threshold)
    }
}

/// Which embedding path to use for a detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingMode {
    /// Mesh path when a full mesh is present, keypoint path otherwise.
    #[default]
    Auto,
    Keypoints,
    Mesh,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub mode: EmbeddingMode,
    /// Include three-point angle features in the keypoint path.
    pub include_angles: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            mode: EmbeddingMode::Auto,
            include_angles: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    pub cosine_weight: f32,
    pub euclidean_weight: f32,
    pub pearson_weight: f32,
    /// Leading embedding dimensions inspected by the pose-consistency check.
    pub pose_slice_len: usize,
    /// RMS difference over the pose slice, relative to the RMS magnitude
    /// of the whole embeddings, above which two embeddings are flagged as
    /// pose-inconsistent.
    pub pose_variation_limit: f32,
    /// Multiplier applied to the blended score of pose-inconsistent pairs.
    pub pose_penalty: f32,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            cosine_weight: 0.55,
            euclidean_weight: 0.30,
            pearson_weight: 0.15,
            pose_slice_len: 32,
            pose_variation_limit: 2.0,
            pose_penalty: 0.5,
        }
    }
}

impl SimilarityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let weights = [self.cosine_weight, self.euclidean_weight, self.pearson_weight];
        if weights.iter().any(|w| *w < 0.0) || weights.iter().sum::<f32>() <= 0.0 {
            return Err(invalid(
                "similarity weights must be non-negative with a positive sum",
            ));
        }
        if self.pose_variation_limit <= 0.0 {
            return Err(invalid("similarity.pose_variation_limit must be positive"));
        }
        unit_interval("similarity.pose_penalty", self.pose_penalty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Absolute similarity a best match must reach.
    pub threshold: f32,
    /// Required lead of the best match over the best different member.
    pub min_confidence_gap: f32,
    /// Relaxation applies when the best score exceeds this...
    pub relax_min_best: f32,
    /// ...and the gap exceeds this.
    pub relax_min_gap: f32,
    pub relax_amount: f32,
    /// Relaxation never lowers the threshold below this.
    pub relax_floor: f32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            min_confidence_gap: 0.05,
            relax_min_best: 0.85,
            relax_min_gap: 0.10,
            relax_amount: 0.05,
            relax_floor: 0.70,
        }
    }
}

impl MatchConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        unit_interval("matching.threshold", self.threshold)?;
        unit_interval("matching.min_confidence_gap", self.min_confidence_gap)?;
        unit_interval("matching.relax_min_best", self.relax_min_best)?;
        unit_interval("matching.relax_min_gap", self.relax_min_gap)?;
        unit_interval("matching.relax_amount", self.relax_amount)?;
        unit_interval("matching.relax_floor", self.relax_floor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Consecutive high-quality frames required before capture.
    pub required_stable_frames: u32,
    /// Maximum gap between two qualifying frames for them to count as consecutive.
    pub stability_window_ms: u64,
    /// Probe-to-probe similarity below which the subject is considered new.
    pub same_person_threshold: f32,
    /// Minimum time between two subject changes.
    pub subject_change_dwell_ms: u64,
    /// Minimum time between two attendance records for the same member
    /// within one subject's turn.
    pub match_cooldown_ms: u64,
    /// How long a captured subject is held before being matched again.
    pub recapture_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            required_stable_frames: 2,
            stability_window_ms: 1500,
            same_person_threshold: 0.85,
            subject_change_dwell_ms: 1500,
            match_cooldown_ms: 10_000,
            recapture_interval_ms: 3_000,
        }
    }
}

impl CaptureConfig {
    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }

    pub fn subject_change_dwell(&self) -> Duration {
        Duration::from_millis(self.subject_change_dwell_ms)
    }

    pub fn match_cooldown(&self) -> Duration {
        Duration::from_millis(self.match_cooldown_ms)
    }

    pub fn recapture_interval(&self) -> Duration {
        Duration::from_millis(self.recapture_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.required_stable_frames == 0 {
            return Err(invalid("capture.required_stable_frames must be at least 1"));
        }
        unit_interval("capture.same_person_threshold", self.same_person_threshold)
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn unit_interval(name: &str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{name} = {value} is outside [0, 1]")))
    }
}

fn ordered(name: &str, values: &[f32]) -> Result<(), ConfigError> {
    if values.windows(2).all(|w| w[0] <= w[1]) {
        Ok(())
    } else {
        Err(invalid(format!("{name} {values:?} is not ordered")))
    }
}
