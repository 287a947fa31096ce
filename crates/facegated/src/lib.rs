//! facegated: Session runtime for the facegate recognition core.
//!
//! Drives [`facegate_core`] from a stream of camera frames: one cooperative
//! loop per camera, an organization-scoped gallery cache shared between
//! loops, and the ports that connect both to detectors, gallery storage and
//! the attendance log.

pub mod config;
pub mod engine;
pub mod gallery;
pub mod ports;
pub mod replay;
pub mod sink;

pub use config::Config;
pub use engine::{spawn_session, Session, SessionError, SessionHandle, SessionSettings, SessionSummary, Throttle};
pub use gallery::{GalleryCache, JsonGalleryStore};
pub use ports::{
    AttendanceSink, Detector, DetectorError, Frame, FrameEvent, FrameSource, GalleryError, GalleryStore,
    LoggingObserver, MatchObserver, SinkError, SourceError,
};
pub use sink::JsonlAttendanceSink;
