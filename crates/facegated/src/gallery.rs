//! Organization-scoped gallery cache and the JSON-file gallery store.

use crate::ports::{GalleryError, GalleryStore};
use facegate_core::GalleryEntry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

pub type Snapshot = Arc<Vec<GalleryEntry>>;

/// Delay before a failed refresh is retried, unless the gallery is
/// invalidated again in the meantime.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(5);

struct Cached {
    entries: Snapshot,
    loaded_at: Instant,
    /// Invalidation generation the load started under.
    generation: u64,
    /// After a failed refresh: no new attempt before this instant while
    /// the generation stays the same.
    backoff: Option<(Instant, u64)>,
}

impl Cached {
    fn is_fresh(&self, generation: u64, ttl: Duration) -> bool {
        if self.generation == generation && self.loaded_at.elapsed() < ttl {
            return true;
        }
        matches!(self.backoff, Some((until, g)) if g == generation && Instant::now() < until)
    }
}

#[derive(Default)]
struct OrgSlot {
    cached: Mutex<Option<Cached>>,
    /// Bumped by every invalidation, including ones that land mid-refresh.
    generation: AtomicU64,
    /// Held for the duration of one store load.
    refresh: tokio::sync::Mutex<()>,
}

impl OrgSlot {
    fn current(&self, ttl: Duration) -> Option<(Snapshot, bool)> {
        let generation = self.generation.load(Ordering::SeqCst);
        let cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        cached
            .as_ref()
            .map(|c| (c.entries.clone(), c.is_fresh(generation, ttl)))
    }

    fn store(&self, entries: Snapshot, generation: u64) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(Cached {
            entries,
            loaded_at: Instant::now(),
            generation,
            backoff: None,
        });
    }

    fn back_off(&self, generation: u64, delay: Duration) {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(c) = cached.as_mut() {
            c.backoff = Some((Instant::now() + delay, generation));
        }
    }
}

/// Read-mostly gallery cache shared by every session in the process.
///
/// Snapshots are refreshed after `ttl` or on [`invalidate`](Self::invalidate).
/// At most one refresh per organization is in flight; callers arriving
/// during a refresh get the previous snapshot instead of waiting. A failed
/// refresh keeps serving the last good snapshot and is retried after the
/// retry backoff.
pub struct GalleryCache<G> {
    store: G,
    ttl: Duration,
    retry_backoff: Duration,
    orgs: Mutex<HashMap<String, Arc<OrgSlot>>>,
}

impl<G: GalleryStore> GalleryCache<G> {
    pub fn new(store: G, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            retry_backoff: DEFAULT_RETRY_BACKOFF.min(ttl),
            orgs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry_backoff(mut self, delay: Duration) -> Self {
        self.retry_backoff = delay;
        self
    }

    pub fn store(&self) -> &G {
        &self.store
    }

    fn slot(&self, organization: &str) -> Arc<OrgSlot> {
        let mut orgs = self.orgs.lock().unwrap_or_else(PoisonError::into_inner);
        orgs.entry(organization.to_string()).or_default().clone()
    }

    /// Current gallery for `organization`.
    ///
    /// Errors only when the store fails and no snapshot was ever loaded.
    pub async fn snapshot(&self, organization: &str) -> Result<Snapshot, GalleryError> {
        let slot = self.slot(organization);
        let current = slot.current(self.ttl);
        if let Some((entries, true)) = &current {
            return Ok(entries.clone());
        }

        let _guard = match slot.refresh.try_lock() {
            Ok(guard) => guard,
            Err(_) => match &current {
                Some((entries, _)) => {
                    tracing::debug!(organization, "refresh in flight; serving previous snapshot");
                    return Ok(entries.clone());
                }
                None => {
                    let guard = slot.refresh.lock().await;
                    // The refresh we waited on may have produced a snapshot.
                    if let Some((entries, _)) = slot.current(self.ttl) {
                        return Ok(entries);
                    }
                    guard
                }
            },
        };

        // Read before loading: an invalidation during the load leaves the
        // result stale.
        let generation = slot.generation.load(Ordering::SeqCst);
        match self.store.load_gallery(organization).await {
            Ok(entries) => {
                tracing::info!(organization, members = entries.len(), "gallery refreshed");
                let entries = Arc::new(entries);
                slot.store(entries.clone(), generation);
                Ok(entries)
            }
            Err(err) => match current {
                Some((entries, _)) => {
                    tracing::warn!(
                        organization,
                        error = %err,
                        retry_in_ms = self.retry_backoff.as_millis() as u64,
                        "gallery refresh failed; serving last snapshot"
                    );
                    slot.back_off(generation, self.retry_backoff);
                    Ok(entries)
                }
                None => Err(err),
            },
        }
    }

    /// Gallery-changed hook: the next [`snapshot`](Self::snapshot) reloads,
    /// even if a refresh is already in flight.
    pub fn invalidate(&self, organization: &str) {
        let generation = self.slot(organization).generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(organization, generation, "gallery invalidated");
    }
}

/// Galleries stored as `<dir>/<organization>.json`, each a JSON array of
/// [`GalleryEntry`]. A missing file is an empty gallery.
#[derive(Debug, Clone)]
pub struct JsonGalleryStore {
    dir: PathBuf,
}

impl JsonGalleryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, organization: &str) -> Result<PathBuf, GalleryError> {
        let valid = !organization.is_empty()
            && organization
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(GalleryError::InvalidOrganization(organization.to_string()));
        }
        Ok(self.dir.join(format!("{organization}.json")))
    }

    pub async fn load(&self, organization: &str) -> Result<Vec<GalleryEntry>, GalleryError> {
        let path = self.path_for(organization)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(GalleryError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| GalleryError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Append an enrollment. A member may hold several entries.
    pub async fn add(&self, organization: &str, entry: GalleryEntry) -> Result<usize, GalleryError> {
        let mut entries = self.load(organization).await?;
        tracing::info!(organization, member_id = %entry.member_id, "enrolling member");
        entries.push(entry);
        self.save(organization, &entries).await?;
        Ok(entries.len())
    }

    /// Remove every entry of `member_id`; returns how many were removed.
    pub async fn remove(&self, organization: &str, member_id: &str) -> Result<usize, GalleryError> {
        let mut entries = self.load(organization).await?;
        let before = entries.len();
        entries.retain(|e| e.member_id != member_id);
        let removed = before - entries.len();
        if removed > 0 {
            self.save(organization, &entries).await?;
            tracing::info!(organization, member_id, removed, "member removed");
        }
        Ok(removed)
    }

    pub async fn contains(&self, organization: &str, member_id: &str) -> Result<bool, GalleryError> {
        Ok(self.load(organization).await?.iter().any(|e| e.member_id == member_id))
    }

    async fn save(&self, organization: &str, entries: &[GalleryEntry]) -> Result<(), GalleryError> {
        let path = self.path_for(organization)?;
        let io_err = |source: std::io::Error| GalleryError::Io {
            path: path.display().to_string(),
            source,
        };
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;

        let json = serde_json::to_vec_pretty(entries).map_err(|source| GalleryError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        // Write-then-rename so readers never see a partial file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        Ok(())
    }
}

impl GalleryStore for JsonGalleryStore {
    async fn load_gallery(&self, organization: &str) -> Result<Vec<GalleryEntry>, GalleryError> {
        self.load(organization).await
    }
}
