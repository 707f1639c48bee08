// ============================================================================
// SYNC ENGINE: commits edits to the remote store
// ============================================================================
//
// A commit runs in four steps:
//   1. ownership check   re-fetch the territory and compare its owner with
//                        the signed-in actor; a mismatch aborts, nothing is
//                        written
//   2. mode selection    delta when a full-snapshot base is known and the
//                        diff against it is small, otherwise full. A delta
//                        always carries every cell that differs from the
//                        base (tombstones for erased cells) so the remote
//                        can replace its previous delta instead of
//                        stacking them
//   3. fallback          a delta that fails for any reason other than
//                        ownership is retried once as a full write
//   4. bookkeeping       only a full write moves the delta base forward;
//                        the session snapshot is dropped
//
// At most one commit is in flight: a commit requested while another runs
// returns `Deferred` and the caller re-arms its debounce.
// ============================================================================

pub mod memory;
pub mod remote;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::{CommitMetadata, LocalCache, SessionSnapshot};
use crate::canvas::{CellKey, PixelSnapshot, PixelStore};
use crate::clock::Clock;
use crate::settings::EditorSettings;
use remote::{
    Actor, ActorProvider, PixelDataService, PixelPatch, SavePayload, SaveReceipt, Territory, TerritoryMetadata,
    TerritoryService, diff_snapshots,
};

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("Territory ownership changed (expected {expected}, found {found:?})")]
    OwnershipChanged { expected: String, found: Option<String> },
    #[error("Not signed in")]
    NotAuthenticated,
    #[error("Territory '{0}' not found")]
    NotFound(String),
    #[error("Remote store error: {0}")]
    Remote(String),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl SyncError {
    /// Errors that repeating the same request cannot fix.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SyncError::Remote(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Remote(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitMode {
    Delta,
    Full,
}

/// Everything a commit needs, captured from the store up front so editing
/// can continue while the commit is in flight.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitRequest {
    pub territory_id: String,
    pub pixels: PixelSnapshot,
    pub changed: Vec<CellKey>,
    pub grid_cells: usize,
}

impl CommitRequest {
    pub fn from_store(territory_id: &str, store: &PixelStore) -> Self {
        let n = store.grid_size() as usize;
        Self {
            territory_id: territory_id.to_string(),
            pixels: store.snapshot(),
            changed: store.changed().iter().copied().collect(),
            grid_cells: n * n,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommitReport {
    pub mode: CommitMode,
    /// A delta was attempted first and failed
    pub fell_back: bool,
    /// Keys the caller should acknowledge on its store
    pub committed: Vec<CellKey>,
    pub saved_at_ms: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CommitOutcome {
    Committed(CommitReport),
    /// Another commit was in flight; nothing was sent
    Deferred,
}

/// Where the pixels `load_pixels` returned came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelSource {
    Remote,
    Cache,
    Empty,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoadedPixels {
    pub pixels: PixelSnapshot,
    pub updated_at_ms: Option<u64>,
    pub source: PixelSource,
}

/// A local snapshot newer than the remote data, waiting for the user's
/// decision.
#[derive(Clone, Debug, PartialEq)]
pub struct RecoveryOffer {
    pub snapshot: SessionSnapshot,
    pub remote_updated_at_ms: Option<u64>,
}

#[derive(Clone, Copy, Debug)]
pub struct SyncOptions {
    pub delta_max_cells: usize,
    pub delta_max_ratio: f64,
    pub retries: u32,
    pub retry_backoff: Duration,
    pub session_snapshot_interval_ms: u64,
    pub cache_ttl_ms: u64,
}

impl From<&EditorSettings> for SyncOptions {
    fn from(s: &EditorSettings) -> Self {
        Self {
            delta_max_cells: s.delta_max_cells,
            delta_max_ratio: s.delta_max_ratio,
            retries: s.remote_retries,
            retry_backoff: Duration::from_millis(s.retry_backoff_ms),
            session_snapshot_interval_ms: s.session_snapshot_interval_ms,
            cache_ttl_ms: s.cache_ttl_ms,
        }
    }
}

/// Clears the in-flight flag however the commit ends.
struct SavingGuard<'a>(&'a AtomicBool);

impl Drop for SavingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncEngine {
    territories: Arc<dyn TerritoryService>,
    pixels: Arc<dyn PixelDataService>,
    actors: Arc<dyn ActorProvider>,
    cache: Arc<LocalCache>,
    clock: Arc<dyn Clock>,
    options: SyncOptions,
    is_saving: AtomicBool,
    /// A commit was requested while one was in flight
    pending: AtomicBool,
    metadata: parking_lot::Mutex<HashMap<String, CommitMetadata>>,
    last_session_write: parking_lot::Mutex<HashMap<String, u64>>,
}

impl SyncEngine {
    pub fn new(
        territories: Arc<dyn TerritoryService>,
        pixels: Arc<dyn PixelDataService>,
        actors: Arc<dyn ActorProvider>,
        cache: Arc<LocalCache>,
        clock: Arc<dyn Clock>,
        options: SyncOptions,
    ) -> Self {
        Self {
            territories,
            pixels,
            actors,
            cache,
            clock,
            options,
            is_saving: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            metadata: parking_lot::Mutex::new(HashMap::new()),
            last_session_write: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    pub fn is_saving(&self) -> bool {
        self.is_saving.load(Ordering::SeqCst)
    }

    /// Returns and clears the "requested while saving" flag.
    pub fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    pub async fn current_actor(&self) -> Option<Actor> {
        self.actors.current_actor().await
    }

    pub async fn fetch_territory(&self, territory_id: &str) -> Result<Territory, SyncError> {
        self.with_retry(|| self.territories.get_territory(territory_id)).await
    }

    // ---- loading ------------------------------------------------------------

    /// Remote data first; the cached copy if the remote cannot be reached;
    /// nothing if neither has data.
    pub async fn load_pixels(&self, territory_id: &str) -> LoadedPixels {
        match self.with_retry(|| self.pixels.load_pixel_data(territory_id)).await {
            Ok(Some(data)) => {
                self.cache
                    .save_pixels(territory_id, &data.pixels, data.updated_at_ms)
                    .await;
                LoadedPixels {
                    pixels: data.pixels,
                    updated_at_ms: data.updated_at_ms,
                    source: PixelSource::Remote,
                }
            }
            Ok(None) => LoadedPixels {
                pixels: Vec::new(),
                updated_at_ms: None,
                source: PixelSource::Empty,
            },
            Err(e) => {
                warn!("Remote load of {} failed: {}; trying local cache", territory_id, e);
                match self.cache.load_fresh_pixels(territory_id, self.options.cache_ttl_ms).await {
                    Some(cached) => LoadedPixels {
                        pixels: cached.pixels,
                        updated_at_ms: cached.updated_at_ms,
                        source: PixelSource::Cache,
                    },
                    None => LoadedPixels {
                        pixels: Vec::new(),
                        updated_at_ms: None,
                        source: PixelSource::Empty,
                    },
                }
            }
        }
    }

    // ---- commit -------------------------------------------------------------

    pub async fn commit(&self, request: CommitRequest) -> Result<CommitOutcome, SyncError> {
        if self.is_saving.swap(true, Ordering::SeqCst) {
            debug!("Commit for {} deferred: another commit in flight", request.territory_id);
            self.pending.store(true, Ordering::SeqCst);
            return Ok(CommitOutcome::Deferred);
        }
        let _guard = SavingGuard(&self.is_saving);
        self.commit_inner(request).await.map(CommitOutcome::Committed)
    }

    async fn commit_inner(&self, request: CommitRequest) -> Result<CommitReport, SyncError> {
        let id = request.territory_id.as_str();
        self.verify_ownership(id).await?;

        let base = self.commit_metadata(id).await;
        let diff = base
            .as_ref()
            .map(|b| diff_snapshots(&b.last_full_snapshot, &request.pixels, self.clock.now_ms()));
        let mode = self.select_mode(&request, diff.as_deref());
        info!(
            "Committing {} ({:?}, {} changed, {} differ from base, {} painted)",
            id,
            mode,
            request.changed.len(),
            diff.as_ref().map_or(0, Vec::len),
            request.pixels.len()
        );

        let mut fell_back = false;
        let mut receipt = None;
        if let (CommitMode::Delta, Some(base), Some(patches)) = (mode, base.as_ref(), diff) {
            let payload = Self::delta_payload(patches, base);
            // one attempt; the full write below is the retry
            match self.pixels.save_pixel_data(id, &payload).await {
                Ok(r) => receipt = Some((CommitMode::Delta, r)),
                Err(e @ SyncError::OwnershipChanged { .. }) => return Err(e),
                Err(e) => {
                    warn!("Delta save for {} failed ({}); falling back to full save", id, e);
                    fell_back = true;
                }
            }
        }

        let (mode, receipt) = match receipt {
            Some(done) => done,
            None => {
                let payload = self.full_payload(&request);
                let r = self
                    .with_retry(|| self.pixels.save_pixel_data(id, &payload))
                    .await
                    .inspect_err(|e| warn!("Full save for {} failed: {}", id, e))?;
                let meta = CommitMetadata {
                    last_full_snapshot: request.pixels.clone(),
                    last_full_save_at_ms: r.saved_at_ms,
                };
                self.cache.save_commit_metadata(id, &meta).await;
                self.metadata.lock().insert(id.to_string(), meta);
                (CommitMode::Full, r)
            }
        };

        self.after_commit(&request, receipt).await;
        Ok(CommitReport {
            mode,
            fell_back,
            committed: request.changed,
            saved_at_ms: receipt.saved_at_ms,
        })
    }

    async fn verify_ownership(&self, territory_id: &str) -> Result<(), SyncError> {
        let actor = self.actors.current_actor().await.ok_or(SyncError::NotAuthenticated)?;
        let territory = self.fetch_territory(territory_id).await?;
        if territory.owner_id.as_deref() != Some(actor.id.as_str()) {
            warn!(
                "Commit for {} aborted: owner is {:?}, editor is {}",
                territory_id, territory.owner_id, actor.id
            );
            return Err(SyncError::OwnershipChanged {
                expected: actor.id,
                found: territory.owner_id,
            });
        }
        Ok(())
    }

    /// `diff` is the delta against the last full snapshot, when one is
    /// known. Its size, not the changed set's, decides the mode.
    fn select_mode(&self, request: &CommitRequest, diff: Option<&[PixelPatch]>) -> CommitMode {
        let Some(diff) = diff else {
            return CommitMode::Full;
        };
        let ratio = diff.len() as f64 / request.grid_cells.max(1) as f64;
        if !request.changed.is_empty()
            && diff.len() < self.options.delta_max_cells
            && ratio < self.options.delta_max_ratio
        {
            CommitMode::Delta
        } else {
            CommitMode::Full
        }
    }

    fn delta_payload(patches: Vec<PixelPatch>, base: &CommitMetadata) -> SavePayload {
        SavePayload {
            changed_count: Some(patches.len()),
            pixels: patches,
            is_delta: true,
            base_snapshot_time: Some(base.last_full_save_at_ms),
        }
    }

    fn full_payload(&self, request: &CommitRequest) -> SavePayload {
        SavePayload {
            pixels: request.pixels.iter().map(PixelPatch::from).collect(),
            is_delta: false,
            changed_count: Some(request.changed.len()),
            base_snapshot_time: None,
        }
    }

    async fn after_commit(&self, request: &CommitRequest, receipt: SaveReceipt) {
        let id = request.territory_id.as_str();
        self.discard_session(id).await;
        self.cache
            .save_pixels(id, &request.pixels, Some(receipt.saved_at_ms))
            .await;
        let meta = TerritoryMetadata {
            painted_cells: request.pixels.len(),
            updated_at_ms: receipt.saved_at_ms,
        };
        if let Err(e) = self.territories.update_territory_metadata(id, meta).await {
            warn!("Could not update territory metadata for {}: {}", id, e);
        }
    }

    /// Delta base for a territory: memory first, then the local cache.
    pub async fn commit_metadata(&self, territory_id: &str) -> Option<CommitMetadata> {
        if let Some(meta) = self.metadata.lock().get(territory_id).cloned() {
            return Some(meta);
        }
        let meta = self.cache.load_commit_metadata(territory_id).await?;
        self.metadata.lock().insert(territory_id.to_string(), meta.clone());
        Some(meta)
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.options.retries => {
                    let delay = self.options.retry_backoff * 2u32.pow(attempt);
                    debug!("Remote call failed ({}); retry {} in {:?}", e, attempt + 1, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ---- session snapshot ---------------------------------------------------

    /// Write the session snapshot if there is something uncommitted and the
    /// last write is at least the configured interval old. Returns whether a
    /// snapshot was written.
    pub async fn refresh_session_snapshot(&self, territory_id: &str, store: &PixelStore, last_modified_ms: u64) -> bool {
        if store.changed().is_empty() {
            return false;
        }
        let now = self.clock.now_ms();
        {
            let mut last = self.last_session_write.lock();
            if let Some(&prev) = last.get(territory_id)
                && now.saturating_sub(prev) < self.options.session_snapshot_interval_ms
            {
                return false;
            }
            last.insert(territory_id.to_string(), now);
        }
        let snapshot = SessionSnapshot {
            territory_id: territory_id.to_string(),
            pixels: store.snapshot(),
            last_modified_ms,
            saved_at_ms: now,
        };
        self.cache.save_session(&snapshot).await;
        true
    }

    /// Offer the local session snapshot when it is newer than the remote
    /// data. An older snapshot is stale and removed.
    pub async fn recovery_offer(&self, territory_id: &str, remote_updated_at_ms: Option<u64>) -> Option<RecoveryOffer> {
        let snapshot = self.cache.load_session(territory_id).await?;
        if snapshot.last_modified_ms > remote_updated_at_ms.unwrap_or(0) {
            info!(
                "Unsaved session for {} from {} is newer than remote ({:?})",
                territory_id, snapshot.last_modified_ms, remote_updated_at_ms
            );
            Some(RecoveryOffer {
                snapshot,
                remote_updated_at_ms,
            })
        } else {
            debug!("Dropping stale session snapshot for {}", territory_id);
            self.cache.delete_session(territory_id).await;
            None
        }
    }

    pub async fn discard_session(&self, territory_id: &str) {
        self.last_session_write.lock().remove(territory_id);
        self.cache.delete_session(territory_id).await;
    }
}
