use crate::engine::Throttle;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Organization whose gallery the sessions match against.
    pub organization: String,
    /// Directory holding `<organization>.json` galleries.
    pub gallery_dir: PathBuf,
    /// JSONL attendance log.
    pub attendance_log: PathBuf,
    /// Optional engine TOML; built-in defaults when unset.
    pub engine_config: Option<PathBuf>,
    /// Recorded detection streams, one session each.
    pub sources: Vec<PathBuf>,
    /// Upper bound on one detector call.
    pub detector_timeout_ms: u64,
    /// Gallery snapshot lifetime.
    pub gallery_ttl_secs: u64,
    /// Reject attendance for members missing from the gallery file.
    pub check_members: bool,
    pub throttle: Throttle,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        let defaults = Throttle::default();
        Self {
            organization: std::env::var("FACEGATE_ORGANIZATION").unwrap_or_else(|_| "default".to_string()),
            gallery_dir: std::env::var("FACEGATE_GALLERY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("galleries")),
            attendance_log: std::env::var("FACEGATE_ATTENDANCE_LOG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("attendance.jsonl")),
            engine_config: std::env::var("FACEGATE_ENGINE_CONFIG").ok().map(PathBuf::from),
            sources: std::env::var("FACEGATE_SOURCES")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
            detector_timeout_ms: env_u64("FACEGATE_DETECTOR_TIMEOUT_MS", 2000),
            gallery_ttl_secs: env_u64("FACEGATE_GALLERY_TTL_SECS", 30),
            check_members: std::env::var("FACEGATE_CHECK_MEMBERS")
                .map(|v| v != "0")
                .unwrap_or(true),
            throttle: Throttle {
                idle: env_ms("FACEGATE_DELAY_IDLE_MS", defaults.idle),
                tracking: env_ms("FACEGATE_DELAY_TRACKING_MS", defaults.tracking),
                stabilizing: env_ms("FACEGATE_DELAY_STABILIZING_MS", defaults.stabilizing),
                captured: env_ms("FACEGATE_DELAY_CAPTURED_MS", defaults.captured),
            },
        }
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_millis(self.detector_timeout_ms)
    }

    pub fn gallery_ttl(&self) -> Duration {
        Duration::from_secs(self.gallery_ttl_secs)
    }
}

fn parse_list(value: &str) -> Vec<PathBuf> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
