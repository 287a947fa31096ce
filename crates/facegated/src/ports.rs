//! Collaborator interfaces consumed and exposed by a session.
//!
//! Camera access, detector inference, gallery persistence and attendance
//! logging all live behind these traits so the session loop can be driven
//! by real hardware, recordings or in-memory fakes alike.

use facegate_core::{DetectedFace, Embedding, GalleryEntry, MatchResult};
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;

/// One camera frame. `data` may be empty for sources that carry
/// detections out of band (recordings).
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    pub timestamp: std::time::Instant,
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to open source {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed frame at line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("capture failed: {0}")]
    Capture(String),
}

#[derive(Error, Debug)]
pub enum DetectorError {
    /// The detector cannot run at all (model missing, backend down).
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    /// Detection failed for this frame only.
    #[error("detection failed: {0}")]
    Frame(String),
}

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("failed to access gallery {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt gallery {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid organization id: {0:?}")]
    InvalidOrganization(String),
    #[error("gallery store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum SinkError {
    /// The attendance store does not know this member (deleted or never
    /// enrolled). The gallery snapshot that produced the match is stale.
    #[error("unknown member: {0}")]
    UnknownMember(String),
    #[error("failed to write attendance log {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("attendance store rejected record: {0}")]
    Rejected(String),
}

/// Produces frames one at a time. `Ok(None)` ends the stream.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> impl Future<Output = Result<Option<Frame>, SourceError>> + Send;

    /// Release the underlying device. Called once when the session ends.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

pub trait Detector: Send + Sync {
    /// Check the detector can run before the first frame.
    fn ready(&self) -> impl Future<Output = Result<(), DetectorError>> + Send {
        async { Ok(()) }
    }

    fn detect(&self, frame: &Frame) -> impl Future<Output = Result<Vec<DetectedFace>, DetectorError>> + Send;
}

pub trait GalleryStore: Send + Sync {
    fn load_gallery(&self, organization: &str) -> impl Future<Output = Result<Vec<GalleryEntry>, GalleryError>> + Send;
}

/// Attendance log. Duplicate calls must be tolerated.
pub trait AttendanceSink: Send + Sync {
    fn record_match(&self, member_id: &str, confidence: f32) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Exactly one event per processed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    NoFace,
    LowQuality { score: f32, reason: String },
    Stabilizing { stable_frames: u32, quality: f32 },
    /// A different person replaced the previous subject.
    SubjectChanged,
    Matched(MatchResult),
    /// A well-captured face that is not in the gallery; the probe can be
    /// handed to a registration flow.
    Unmatched { probe: Embedding, quality: f32 },
}

pub trait MatchObserver: Send + Sync {
    fn on_event(&self, event: FrameEvent);
}

impl MatchObserver for mpsc::UnboundedSender<FrameEvent> {
    fn on_event(&self, event: FrameEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.send(event);
    }
}

/// Observer that only logs, for headless runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl MatchObserver for LoggingObserver {
    fn on_event(&self, event: FrameEvent) {
        match event {
            FrameEvent::Matched(result) => tracing::info!(
                member_id = result.member_id.as_deref().unwrap_or_default(),
                name = result.name.as_deref().unwrap_or_default(),
                status = ?result.status,
                confidence = result.confidence,
                "member recognized"
            ),
            FrameEvent::Unmatched { quality, .. } => {
                tracing::info!(quality, "face not recognized")
            }
            FrameEvent::SubjectChanged => tracing::info!("new subject"),
            other => tracing::trace!(event = ?other, "frame processed"),
        }
    }
}
