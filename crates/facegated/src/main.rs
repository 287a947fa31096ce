use anyhow::{Context, Result};
use facegate_core::{EngineConfig, FaceEngine};
use facegated::{
    replay, spawn_session, Config, GalleryCache, JsonGalleryStore, JsonlAttendanceSink, LoggingObserver, Session,
    SessionSettings,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        organization = %config.organization,
        gallery_dir = %config.gallery_dir.display(),
        sources = config.sources.len(),
        "facegated starting"
    );

    let engine_config = match &config.engine_config {
        Some(path) => EngineConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let engine = FaceEngine::new(engine_config);

    let store = JsonGalleryStore::new(&config.gallery_dir);
    let gallery = Arc::new(GalleryCache::new(store.clone(), config.gallery_ttl()));
    // Fail fast on an unreadable gallery rather than on the first capture.
    let members = gallery
        .snapshot(&config.organization)
        .await
        .context("loading gallery")?
        .len();
    tracing::info!(members, "gallery loaded");

    let mut handles = Vec::new();
    for path in &config.sources {
        let (source, detector) = replay::open(path)
            .await
            .with_context(|| format!("opening source {}", path.display()))?;
        let mut sink = JsonlAttendanceSink::new(&config.attendance_log, &config.organization);
        if config.check_members {
            sink = sink.with_roster(store.clone());
        }
        let handle = spawn_session(Session {
            engine: engine.clone(),
            settings: SessionSettings {
                organization: config.organization.clone(),
                detector_timeout: config.detector_timeout(),
                throttle: config.throttle.clone(),
            },
            source,
            detector,
            gallery: gallery.clone(),
            sink,
            observer: LoggingObserver,
        });
        tracing::info!(session = %handle.id, source = %path.display(), "session started");
        handles.push(handle);
    }

    if handles.is_empty() {
        tracing::warn!("no sources configured (FACEGATE_SOURCES); idling until signaled");
        tokio::signal::ctrl_c().await?;
        tracing::info!("facegated shutting down");
        return Ok(());
    }

    let stoppers: Vec<_> = handles.iter().map(|h| h.stopper()).collect();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested; stopping sessions");
            stoppers.iter().for_each(|s| s.stop());
        }
    });

    for handle in handles {
        let id = handle.id;
        match handle.join().await {
            Ok(summary) => tracing::info!(
                session = %id,
                frames = summary.frames,
                matches = summary.matches,
                attendance = summary.attendance_recorded,
                "session finished"
            ),
            Err(err) => tracing::error!(session = %id, error = %err, "session failed"),
        }
    }

    tracing::info!("facegated shutting down");
    Ok(())
}
