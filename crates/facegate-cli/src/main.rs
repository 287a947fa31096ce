use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{primary_face, DetectedFace, EngineConfig, FaceEngine, GalleryEntry, MemberStatus, Strictness};
use facegated::{
    replay, spawn_session, AttendanceSink, Config, FrameEvent, GalleryCache, JsonGalleryStore, JsonlAttendanceSink,
    Session, SessionSettings, SinkError, Throttle,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "facegate", about = "facegate face recognition CLI")]
struct Cli {
    /// Engine TOML (defaults to FACEGATE_ENGINE_CONFIG, then built-in values)
    #[arg(long, global = true)]
    engine_config: Option<PathBuf>,

    /// Organization (defaults to FACEGATE_ORGANIZATION)
    #[arg(long, global = true)]
    org: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate, score and embed a detection
    Inspect {
        #[command(flatten)]
        face: FaceArgs,
    },
    /// Enroll a member from a detection
    Enroll {
        /// Member identifier
        #[arg(short, long)]
        member: String,
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Allowed, Banned or VIP
        #[arg(short, long, default_value = "Allowed")]
        status: MemberStatus,
        #[command(flatten)]
        face: FaceArgs,
    },
    /// Match one detection against the gallery
    Match {
        #[command(flatten)]
        face: FaceArgs,
    },
    /// Run a session over a recorded detection stream
    Replay {
        /// JSONL recording, one frame per line
        recording: PathBuf,
        /// Append matches to the attendance log
        #[arg(long)]
        record: bool,
        /// Honour the per-phase delays instead of running flat out
        #[arg(long)]
        realtime: bool,
    },
    /// Manage the gallery
    Gallery {
        #[command(subcommand)]
        command: GalleryCommands,
    },
}

#[derive(Subcommand)]
enum GalleryCommands {
    /// List enrolled members
    List,
    /// Remove a member
    Remove {
        /// Member identifier
        member: String,
    },
}

#[derive(clap::Args)]
struct FaceArgs {
    /// JSON file holding one detection or an array of detections
    face: PathBuf,
    #[arg(long, default_value_t = 640)]
    width: u32,
    #[arg(long, default_value_t = 480)]
    height: u32,
}

/// Matches are reported but not persisted.
struct DryRunSink;

impl AttendanceSink for DryRunSink {
    async fn record_match(&self, _member_id: &str, _confidence: f32) -> Result<(), SinkError> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(org) = cli.org {
        config.organization = org;
    }
    let engine = load_engine(cli.engine_config.as_deref().or(config.engine_config.as_deref()))?;
    let store = JsonGalleryStore::new(&config.gallery_dir);
    tracing::debug!(
        organization = %config.organization,
        gallery_dir = %config.gallery_dir.display(),
        "cli configured"
    );

    match cli.command {
        Commands::Inspect { face } => {
            let detection = read_face(&face.face).await?;
            let analysis = engine.analyze(&detection, face.width, face.height, Strictness::Relaxed);
            let strict = engine
                .validator()
                .validate(&detection, face.width, face.height, Strictness::Strict);
            let embedding = engine.generator().generate(&detection);
            print_json(&serde_json::json!({
                "relaxed": analysis.verdict.reason(),
                "strict": strict.reason(),
                "quality": analysis.quality,
                "high_quality": analysis.probe.is_some(),
                "embedding": embedding,
            }))?;
        }
        Commands::Enroll {
            member,
            name,
            status,
            face,
        } => {
            let detection = read_face(&face.face).await?;
            let embedding = match engine.enroll_embedding(&detection, face.width, face.height) {
                Ok(e) => e,
                Err(verdict) if !verdict.is_valid() => bail!("detection rejected: {}", verdict.reason()),
                Err(_) => bail!("detection produced no embedding"),
            };
            let entry = GalleryEntry {
                member_id: member.clone(),
                name,
                status,
                embedding,
            };
            let total = store.add(&config.organization, entry).await?;
            println!("Enrolled {member} into {} ({total} members)", config.organization);
        }
        Commands::Match { face } => {
            let detection = read_face(&face.face).await?;
            let analysis = engine.analyze(&detection, face.width, face.height, Strictness::Strict);
            let Some(probe) = analysis.probe else {
                bail!(
                    "detection not usable for matching: {} (quality {:.2}, {})",
                    analysis.verdict.reason(),
                    analysis.quality.score,
                    analysis.quality.reason
                );
            };
            let gallery = store.load(&config.organization).await?;
            let decision = engine.decide(&probe, &gallery);
            print_json(&serde_json::json!({
                "outcome": format!("{:?}", decision.outcome),
                "result": decision.result,
                "best_score": decision.best_score,
                "runner_up_score": decision.runner_up_score,
                "gap": decision.gap,
                "effective_threshold": decision.effective_threshold,
            }))?;
        }
        Commands::Replay {
            recording,
            record,
            realtime,
        } => {
            let throttle = if realtime { config.throttle.clone() } else { Throttle::none() };
            if record {
                let sink = JsonlAttendanceSink::new(&config.attendance_log, &config.organization)
                    .with_roster(store.clone());
                replay_session(engine, &config, store, &recording, throttle, sink).await?;
            } else {
                replay_session(engine, &config, store, &recording, throttle, DryRunSink).await?;
            }
        }
        Commands::Gallery { command } => match command {
            GalleryCommands::List => {
                let entries = store.load(&config.organization).await?;
                if entries.is_empty() {
                    println!("No members enrolled in {}", config.organization);
                }
                for e in entries {
                    println!("{}\t{}\t{}\t{} values", e.member_id, e.name, e.status, e.embedding.len());
                }
            }
            GalleryCommands::Remove { member } => {
                let removed = store.remove(&config.organization, &member).await?;
                if removed == 0 {
                    bail!("{member} is not enrolled in {}", config.organization);
                }
                println!("Removed {member}");
            }
        },
    }

    Ok(())
}

fn load_engine(path: Option<&Path>) -> Result<FaceEngine> {
    let config = match path {
        Some(p) => EngineConfig::load(p).with_context(|| format!("loading {}", p.display()))?,
        None => EngineConfig::default(),
    };
    Ok(FaceEngine::new(config))
}

/// Accepts a single detection or a detector's full output; in the latter
/// case the largest face is used.
async fn read_face(path: &Path) -> Result<DetectedFace> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    if let Ok(faces) = serde_json::from_str::<Vec<DetectedFace>>(&text) {
        return primary_face(&faces)
            .cloned()
            .with_context(|| format!("{} holds no detections", path.display()));
    }
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn replay_session<A>(
    engine: FaceEngine,
    config: &Config,
    store: JsonGalleryStore,
    recording: &Path,
    throttle: Throttle,
    sink: A,
) -> Result<()>
where
    A: AttendanceSink + 'static,
{
    let (source, detector) = replay::open(recording)
        .await
        .with_context(|| format!("opening {}", recording.display()))?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = spawn_session(Session {
        engine,
        settings: SessionSettings {
            organization: config.organization.clone(),
            detector_timeout: config.detector_timeout(),
            throttle,
        },
        source,
        detector,
        gallery: Arc::new(GalleryCache::new(store, config.gallery_ttl())),
        sink,
        observer: tx,
    });

    let printer = tokio::spawn(async move {
        let mut n = 0u64;
        while let Some(event) = rx.recv().await {
            n += 1;
            println!("{n:>5}  {}", describe(&event));
        }
    });

    let summary = handle.join().await?;
    // The observer sender is dropped with the session, which ends the printer.
    printer.await?;
    println!(
        "frames={} captures={} matches={} attendance={}",
        summary.frames, summary.captures, summary.matches, summary.attendance_recorded
    );
    Ok(())
}

fn describe(event: &FrameEvent) -> String {
    match event {
        FrameEvent::NoFace => "no face".to_string(),
        FrameEvent::LowQuality { score, reason } => format!("low quality {score:.2} ({reason})"),
        FrameEvent::Stabilizing { stable_frames, quality } => {
            format!("stabilizing {stable_frames} frames, quality {quality:.2}")
        }
        FrameEvent::SubjectChanged => "subject changed".to_string(),
        FrameEvent::Matched(m) => format!(
            "matched {} ({}) {} confidence {:.3}",
            m.member_id.as_deref().unwrap_or("?"),
            m.name.as_deref().unwrap_or("?"),
            m.status.map(|s| s.to_string()).unwrap_or_default(),
            m.confidence
        ),
        FrameEvent::Unmatched { quality, .. } => format!("unknown face, quality {quality:.2}"),
    }
}
