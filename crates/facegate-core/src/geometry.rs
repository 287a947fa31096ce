//! Keypoint geometry helpers shared by the validator, scorer and embedder.

use crate::types::Keypoint;

/// Axis-aligned extent of a keypoint set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl Extent {
    pub fn width(&self) -> f32 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f32 {
        self.max_y - self.min_y
    }

    /// Width over height; 0.0 when the extent has no height.
    pub fn aspect_ratio(&self) -> f32 {
        let h = self.height();
        if h > 0.0 {
            self.width() / h
        } else {
            0.0
        }
    }
}

/// Summary statistics of a keypoint set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeypointStats {
    /// Mean of keypoint coordinates.
    pub center: (f32, f32),
    pub extent: Extent,
    /// Population variance of x and y.
    pub variance: (f32, f32),
    /// Population covariance of x and y.
    pub covariance: f32,
}

impl KeypointStats {
    /// Compute statistics; `None` for an empty set.
    pub fn compute(keypoints: &[Keypoint]) -> Option<Self> {
        let center = centroid(keypoints)?;
        let extent = extent(keypoints)?;
        let n = keypoints.len() as f32;

        let (mut vx, mut vy, mut cov) = (0.0f32, 0.0f32, 0.0f32);
        for kp in keypoints {
            let dx = kp.x - center.0;
            let dy = kp.y - center.1;
            vx += dx * dx;
            vy += dy * dy;
            cov += dx * dy;
        }

        Some(Self {
            center,
            extent,
            variance: (vx / n, vy / n),
            covariance: cov / n,
        })
    }

    /// Standard deviation of x and y.
    pub fn spread(&self) -> (f32, f32) {
        (self.variance.0.sqrt(), self.variance.1.sqrt())
    }
}

pub fn centroid(keypoints: &[Keypoint]) -> Option<(f32, f32)> {
    if keypoints.is_empty() {
        return None;
    }
    let n = keypoints.len() as f32;
    let (sx, sy) = keypoints
        .iter()
        .fold((0.0f32, 0.0f32), |(sx, sy), kp| (sx + kp.x, sy + kp.y));
    Some((sx / n, sy / n))
}

pub fn extent(keypoints: &[Keypoint]) -> Option<Extent> {
    let first = keypoints.first()?;
    let init = Extent {
        min_x: first.x,
        min_y: first.y,
        max_x: first.x,
        max_y: first.y,
    };
    Some(keypoints.iter().fold(init, |e, kp| Extent {
        min_x: e.min_x.min(kp.x),
        min_y: e.min_y.min(kp.y),
        max_x: e.max_x.max(kp.x),
        max_y: e.max_y.max(kp.y),
    }))
}

pub fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Interior angle at `vertex` formed with `a` and `b`, in radians [0, π].
///
/// Returns 0.0 when either arm has zero length.
pub fn angle_at(vertex: (f32, f32), a: (f32, f32), b: (f32, f32)) -> f32 {
    let (ax, ay) = (a.0 - vertex.0, a.1 - vertex.1);
    let (bx, by) = (b.0 - vertex.0, b.1 - vertex.1);
    let na = (ax * ax + ay * ay).sqrt();
    let nb = (bx * bx + by * by).sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    ((ax * bx + ay * by) / (na * nb)).clamp(-1.0, 1.0).acos()
}

/// Best-fit line through a point set (total least squares).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrincipalAxis {
    pub center: (f32, f32),
    /// Unit direction of the major axis.
    pub direction: (f32, f32),
    /// Spread of the points along the major axis (max - min projection).
    pub length: f32,
}

impl PrincipalAxis {
    pub fn fit(keypoints: &[Keypoint]) -> Option<Self> {
        let stats = KeypointStats::compute(keypoints)?;
        let (vx, vy) = stats.variance;
        let cov = stats.covariance;

        // Major-axis orientation of the 2x2 covariance matrix.
        let theta = 0.5 * (2.0 * cov).atan2(vx - vy);
        let direction = (theta.cos(), theta.sin());

        let (mut lo, mut hi) = (f32::INFINITY, f32::NEG_INFINITY);
        for kp in keypoints {
            let t = (kp.x - stats.center.0) * direction.0 + (kp.y - stats.center.1) * direction.1;
            lo = lo.min(t);
            hi = hi.max(t);
        }

        Some(Self {
            center: stats.center,
            direction,
            length: hi - lo,
        })
    }

    /// Perpendicular distance from `p` to the axis.
    pub fn distance_to(&self, p: (f32, f32)) -> f32 {
        let dx = p.0 - self.center.0;
        let dy = p.1 - self.center.1;
        (dx * self.direction.1 - dy * self.direction.0).abs()
    }
}
