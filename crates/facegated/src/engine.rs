//! Per-camera session loop.
//!
//! One task per session processes frames strictly one at a time:
//! acquire, detect, analyse, maybe match, emit one event, sleep. A new
//! cycle starts only after the previous one finished, so frames are never
//! queued. Stopping is cooperative: the loop checks the stop signal before
//! each iteration and while sleeping, and discards a cycle that completes
//! after the signal.

use crate::gallery::GalleryCache;
use crate::ports::{
    AttendanceSink, Detector, DetectorError, Frame, FrameEvent, FrameSource, GalleryError, GalleryStore, MatchObserver,
    SinkError, SourceError,
};
use facegate_core::capture::{CaptureStateMachine, FrameInput, Phase, Transition};
use facegate_core::{primary_face, DetectedFace, Embedding, FaceEngine, QualityAssessment, Strictness};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("detector unavailable: {0}")]
    DetectorUnavailable(String),
    #[error("frame source error: {0}")]
    Source(#[from] SourceError),
    #[error("gallery unavailable: {0}")]
    Gallery(#[from] GalleryError),
    #[error("session task failed: {0}")]
    Join(String),
}

/// Delay between cycles, chosen by the capture phase after each frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Throttle {
    pub idle: Duration,
    pub tracking: Duration,
    pub stabilizing: Duration,
    pub captured: Duration,
}

impl Default for Throttle {
    fn default() -> Self {
        Self {
            idle: Duration::from_millis(800),
            tracking: Duration::from_millis(300),
            stabilizing: Duration::from_millis(100),
            captured: Duration::from_millis(500),
        }
    }
}

impl Throttle {
    /// No delay at all, for offline replays.
    pub fn none() -> Self {
        Self {
            idle: Duration::ZERO,
            tracking: Duration::ZERO,
            stabilizing: Duration::ZERO,
            captured: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Idle => self.idle,
            Phase::Tracking => self.tracking,
            Phase::Stabilizing => self.stabilizing,
            Phase::Captured => self.captured,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub organization: String,
    /// Upper bound on one detector call; a slower call counts as "no face".
    pub detector_timeout: Duration,
    pub throttle: Throttle,
}

impl SessionSettings {
    pub fn new(organization: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            detector_timeout: Duration::from_secs(2),
            throttle: Throttle::default(),
        }
    }
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub frames: u64,
    pub captures: u64,
    pub matches: u64,
    pub attendance_recorded: u64,
}

/// Everything one session needs. Built by the caller, consumed by [`spawn_session`].
pub struct Session<S, D, G, A, O> {
    pub engine: FaceEngine,
    pub settings: SessionSettings,
    pub source: S,
    pub detector: D,
    pub gallery: Arc<GalleryCache<G>>,
    pub sink: A,
    pub observer: O,
}

/// Stop signal that can be cloned away from its [`SessionHandle`].
#[derive(Clone)]
pub struct Stopper {
    tx: Arc<watch::Sender<bool>>,
}

impl Stopper {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

pub struct SessionHandle {
    pub id: Uuid,
    stopper: Stopper,
    task: JoinHandle<Result<SessionSummary, SessionError>>,
}

impl SessionHandle {
    /// Halt the loop before its next iteration.
    pub fn stop(&self) {
        self.stopper.stop();
    }

    pub fn stopper(&self) -> Stopper {
        self.stopper.clone()
    }

    /// Wait for the session to end.
    pub async fn join(self) -> Result<SessionSummary, SessionError> {
        // The stopper must outlive the task; dropping it stops the session.
        let SessionHandle { stopper, task, .. } = self;
        let result = task.await.map_err(|e| SessionError::Join(e.to_string()))?;
        drop(stopper);
        result
    }
}

/// Spawn a session on the current tokio runtime.
pub fn spawn_session<S, D, G, A, O>(session: Session<S, D, G, A, O>) -> SessionHandle
where
    S: FrameSource + 'static,
    D: Detector + 'static,
    G: GalleryStore + 'static,
    A: AttendanceSink + 'static,
    O: MatchObserver + 'static,
{
    let Session {
        engine,
        settings,
        source,
        detector,
        gallery,
        sink,
        observer,
    } = session;

    let id = Uuid::new_v4();
    let (tx, rx) = watch::channel(false);
    let span = tracing::info_span!("session", %id, org = %settings.organization);
    let worker = Worker {
        engine,
        settings,
        detector,
        gallery,
        sink,
        observer,
    };
    let task = tokio::spawn(worker.run(source, rx).instrument(span));
    SessionHandle {
        id,
        stopper: Stopper { tx: Arc::new(tx) },
        task,
    }
}

fn stop_requested(rx: &watch::Receiver<bool>) -> bool {
    // A dropped sender means the handle is gone; nobody can stop us later.
    *rx.borrow() || rx.has_changed().is_err()
}

/// Side effects of one processed frame, applied only if the session is
/// still running when the frame completes.
struct FrameOutcome {
    event: FrameEvent,
    /// The frame was matched against the gallery.
    captured: bool,
    record: Option<(String, f32)>,
}

impl FrameOutcome {
    fn event(event: FrameEvent) -> Self {
        Self {
            event,
            captured: false,
            record: None,
        }
    }
}

/// The session minus its frame source, which is the only part that is
/// not shared by reference across awaits.
struct Worker<D, G, A, O> {
    engine: FaceEngine,
    settings: SessionSettings,
    detector: D,
    gallery: Arc<GalleryCache<G>>,
    sink: A,
    observer: O,
}

impl<D, G, A, O> Worker<D, G, A, O>
where
    D: Detector,
    G: GalleryStore,
    A: AttendanceSink,
    O: MatchObserver,
{
    async fn run<S: FrameSource>(
        self,
        mut source: S,
        mut stop: watch::Receiver<bool>,
    ) -> Result<SessionSummary, SessionError> {
        tracing::info!("session starting");
        let result = self.run_loop(&mut source, &mut stop).await;
        source.close().await;
        match &result {
            Ok(summary) => tracing::info!(
                frames = summary.frames,
                captures = summary.captures,
                matches = summary.matches,
                "session ended"
            ),
            Err(err) => tracing::warn!(error = %err, "session failed"),
        }
        result
    }

    async fn run_loop<S: FrameSource>(
        &self,
        source: &mut S,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<SessionSummary, SessionError> {
        self.detector
            .ready()
            .await
            .map_err(|e| SessionError::DetectorUnavailable(e.to_string()))?;

        let mut machine = self.engine.capture_machine();
        let mut summary = SessionSummary::default();

        loop {
            if stop_requested(stop) {
                tracing::debug!("stop requested");
                break;
            }
            let Some(frame) = source.next_frame().await? else {
                tracing::info!("frame source exhausted");
                break;
            };

            let faces = self.detect(&frame).await?;
            let outcome = self
                .process(primary_face(&faces), frame.width, frame.height, &mut machine)
                .await?;

            if stop_requested(stop) {
                tracing::debug!(sequence = frame.sequence, "stopped mid-frame; result discarded");
                break;
            }
            summary.frames += 1;
            self.apply(outcome, &mut summary).await;

            let delay = self.settings.throttle.delay_for(machine.phase());
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.changed() => {}
                }
            }
        }
        Ok(summary)
    }

    async fn detect(&self, frame: &Frame) -> Result<Vec<DetectedFace>, SessionError> {
        let timeout = self.settings.detector_timeout;
        match tokio::time::timeout(timeout, self.detector.detect(frame)).await {
            Ok(Ok(faces)) => Ok(faces),
            Ok(Err(DetectorError::Unavailable(msg))) => Err(SessionError::DetectorUnavailable(msg)),
            Ok(Err(err @ DetectorError::Frame(_))) => {
                tracing::debug!(sequence = frame.sequence, error = %err, "detection failed; treating as no face");
                Ok(Vec::new())
            }
            Err(_) => {
                tracing::warn!(
                    sequence = frame.sequence,
                    timeout_ms = timeout.as_millis() as u64,
                    "detector timed out; treating as no face"
                );
                Ok(Vec::new())
            }
        }
    }

    async fn process(
        &self,
        face: Option<&DetectedFace>,
        width: u32,
        height: u32,
        machine: &mut CaptureStateMachine,
    ) -> Result<FrameOutcome, SessionError> {
        let now = tokio::time::Instant::now().into_std();
        let Some(face) = face else {
            machine.observe(now, FrameInput::NoFace);
            return Ok(FrameOutcome::event(FrameEvent::NoFace));
        };

        let analysis = self.engine.analyze(face, width, height, Strictness::Relaxed);
        if !analysis.verdict.is_valid() {
            // Not a face, but not proof the subject left either.
            machine.observe(now, analysis.into_input());
            return Ok(FrameOutcome::event(FrameEvent::NoFace));
        }

        let reason = analysis.quality.reason.clone();
        let current_probe = analysis.probe.clone();
        let event = match machine.observe(now, analysis.into_input()) {
            Transition::Idle => FrameEvent::NoFace,
            Transition::Tracking { quality } => FrameEvent::LowQuality { score: quality, reason },
            Transition::Settling { quality } => FrameEvent::LowQuality {
                score: quality,
                reason: "subject change in progress".to_string(),
            },
            Transition::Stabilizing { stable_frames, quality } => FrameEvent::Stabilizing { stable_frames, quality },
            Transition::SubjectChanged => FrameEvent::SubjectChanged,
            Transition::Holding { quality } => match &machine.state().last_match {
                Some(result) if result.matched => FrameEvent::Matched(result.clone()),
                _ => match current_probe {
                    Some(probe) => FrameEvent::Unmatched { probe, quality },
                    None => FrameEvent::LowQuality { score: quality, reason },
                },
            },
            Transition::Capture { probe, quality, .. } => {
                return self.match_capture(face, width, height, probe, quality, machine).await;
            }
        };
        Ok(FrameOutcome::event(event))
    }

    #[allow(clippy::too_many_arguments)]
    async fn match_capture(
        &self,
        face: &DetectedFace,
        width: u32,
        height: u32,
        probe: Embedding,
        quality: f32,
        machine: &mut CaptureStateMachine,
    ) -> Result<FrameOutcome, SessionError> {
        let now = tokio::time::Instant::now().into_std();
        let verdict = self.engine.validator().validate(face, width, height, Strictness::Strict);
        if !verdict.is_valid() {
            let reason = verdict.reason();
            machine.observe(now, FrameInput::Face {
                quality: QualityAssessment::rejected(reason.clone()),
                probe: None,
            });
            return Ok(FrameOutcome::event(FrameEvent::LowQuality { score: quality, reason }));
        }

        let gallery = self.gallery.snapshot(&self.settings.organization).await?;
        let decision = self.engine.decide(&probe, &gallery);
        tracing::debug!(
            outcome = ?decision.outcome,
            best = decision.best_score,
            runner_up = decision.runner_up_score,
            threshold = decision.effective_threshold,
            "capture matched against gallery"
        );

        let result = decision.result;
        let record = machine
            .remember_match(&result, now)
            .then(|| result.member_id.clone().map(|id| (id, result.confidence)))
            .flatten();

        let event = if result.matched {
            FrameEvent::Matched(result)
        } else {
            FrameEvent::Unmatched { probe, quality }
        };
        Ok(FrameOutcome {
            event,
            captured: true,
            record,
        })
    }

    async fn apply(&self, outcome: FrameOutcome, summary: &mut SessionSummary) {
        if outcome.captured {
            summary.captures += 1;
            if matches!(outcome.event, FrameEvent::Matched(_)) {
                summary.matches += 1;
            }
        }
        self.observer.on_event(outcome.event);

        let Some((member_id, confidence)) = outcome.record else {
            return;
        };
        match self.sink.record_match(&member_id, confidence).await {
            Ok(()) => summary.attendance_recorded += 1,
            Err(SinkError::UnknownMember(id)) => {
                tracing::warn!(member_id = %id, "attendance store does not know member; invalidating gallery");
                self.gallery.invalidate(&self.settings.organization);
            }
            Err(err) => tracing::warn!(member_id = %member_id, error = %err, "failed to record attendance"),
        }
    }
}
