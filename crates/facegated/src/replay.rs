//! Recorded detection streams.
//!
//! A recording is JSONL, one frame per line:
//!
//! ```json
//! {"sequence": 0, "width": 640, "height": 480, "faces": [{"box": {...}, "keypoints": [...]}]}
//! ```
//!
//! [`open`] splits a recording into a [`ReplaySource`] that yields the
//! frames and a [`ReplayDetector`] that returns the faces recorded for
//! each frame, so a full session can run without a camera or a model.

use crate::ports::{Detector, DetectorError, Frame, FrameSource, SourceError};
use facegate_core::DetectedFace;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedFrame {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub faces: Vec<DetectedFace>,
}

type Pending = Arc<Mutex<HashMap<u64, Vec<DetectedFace>>>>;

pub struct ReplaySource {
    frames: VecDeque<RecordedFrame>,
    pending: Pending,
    closed: bool,
}

#[derive(Clone)]
pub struct ReplayDetector {
    pending: Pending,
}

/// Parse a JSONL recording.
pub fn parse(text: &str) -> Result<Vec<RecordedFrame>, SourceError> {
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| serde_json::from_str(l).map_err(|source| SourceError::Malformed { line: i + 1, source }))
        .collect()
}

/// Read a recording from disk.
pub async fn open(path: impl AsRef<Path>) -> Result<(ReplaySource, ReplayDetector), SourceError> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path).await.map_err(|source| SourceError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let frames = parse(&text)?;
    tracing::info!(path = %path.display(), frames = frames.len(), "recording loaded");
    Ok(from_frames(frames))
}

pub fn from_frames(frames: Vec<RecordedFrame>) -> (ReplaySource, ReplayDetector) {
    let pending = Pending::default();
    (
        ReplaySource {
            frames: frames.into(),
            pending: pending.clone(),
            closed: false,
        },
        ReplayDetector { pending },
    )
}

impl ReplaySource {
    pub fn remaining(&self) -> usize {
        self.frames.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl FrameSource for ReplaySource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.closed {
            return Ok(None);
        }
        let Some(recorded) = self.frames.pop_front() else {
            return Ok(None);
        };
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(recorded.sequence, recorded.faces);
        Ok(Some(Frame {
            data: Vec::new(),
            width: recorded.width,
            height: recorded.height,
            sequence: recorded.sequence,
            timestamp: Instant::now(),
        }))
    }

    async fn close(&mut self) {
        self.closed = true;
        self.frames.clear();
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Detector for ReplayDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<DetectedFace>, DetectorError> {
        let faces = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&frame.sequence);
        faces.ok_or_else(|| DetectorError::Frame(format!("no recorded detections for frame {}", frame.sequence)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORDING: &str = r#"
{"sequence": 0, "width": 640, "height": 480}
{"sequence": 1, "width": 640, "height": 480, "faces": [{"box": {"x": 220, "y": 140, "width": 200, "height": 200}, "keypoints": [{"x": 280, "y": 210, "name": "right_eye"}, {"x": 360, "y": 210}], "confidence": 0.9}]}
"#;

    #[test]
    fn test_parse_recording() {
        let frames = parse(RECORDING).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].faces.is_empty());
        let face = &frames[1].faces[0];
        assert_eq!(face.face_box.width, 200.0);
        assert_eq!(face.keypoints[0].name.as_deref(), Some("right_eye"));
        assert!(face.keypoints[1].name.is_none());
    }

    #[test]
    fn test_parse_reports_line() {
        match parse("{\"sequence\": 0, \"width\": 1, \"height\": 1}\nnot json\n") {
            Err(SourceError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_source_and_detector_stay_paired() {
        let (mut source, detector) = from_frames(parse(RECORDING).unwrap());
        let f0 = source.next_frame().await.unwrap().unwrap();
        assert!(detector.detect(&f0).await.unwrap().is_empty());
        let f1 = source.next_frame().await.unwrap().unwrap();
        assert_eq!(detector.detect(&f1).await.unwrap().len(), 1);
        // Each frame's detections are handed out once.
        assert!(matches!(detector.detect(&f1).await, Err(DetectorError::Frame(_))));
        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let (mut source, _detector) = from_frames(parse(RECORDING).unwrap());
        source.close().await;
        assert!(source.is_closed());
        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            open(dir.path().join("nope.jsonl")).await,
            Err(SourceError::Open { .. })
        ));
    }
}
