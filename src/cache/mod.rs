// ============================================================================
// LOCAL CACHE: optional offline copy of territory data
// ============================================================================
//
// State machine:
//
//   Uninitialized ──initialize()──▶ Initializing ──▶ Ready
//         ▲                              │
//         └──── failure (< attempts) ────┤
//                                        └── failure (= attempts) ──▶ Disabled
//
// Opening checks the store layout. Missing stores are first created in
// place; only if that fails is the database dropped and rebuilt, and that
// destructive path runs at most once per `LocalCache`. Disabling persists a
// marker with a cool-down so a restart does not hammer a broken database.
//
// Nothing in the public API returns an error: a cache that cannot answer
// reports a miss, and writes to it are dropped. The remote store is always
// the fallback of record. Once ready, each get/put/delete is retried with
// backoff; after `cache_init_attempts` operations in a row have exhausted
// their retries the cache disables itself the same way a failed
// initialisation does. A store that has vanished is a plain miss.
// ============================================================================

pub mod backend;
pub mod records;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::canvas::PixelRecord;
use crate::clock::Clock;
use crate::settings::EditorSettings;
use backend::{ALL_STORES, CACHE_VERSION, CacheBackend, STORE_META, STORE_PIXELS, STORE_SESSIONS};
use records::CacheRecord;

pub use backend::{FsBackend, MemoryBackend, StoreLayout};
pub use records::{CachedPixels, CommitMetadata, SessionSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialize(#[from] Box<bincode::ErrorKind>),
    #[error("Store '{0}' does not exist")]
    MissingStore(String),
    #[error("Unsupported record schema {0}")]
    UnsupportedSchema(u16),
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheState {
    Uninitialized,
    Initializing,
    Ready,
    Disabled,
}

pub struct LocalCache {
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    state: parking_lot::Mutex<CacheState>,
    /// Held for the whole of an initialisation run; late callers wait on it
    /// and then observe the result instead of starting their own run.
    init_lock: tokio::sync::Mutex<()>,
    failures: AtomicU32,
    /// Operations in a row that failed after all their retries
    io_failures: AtomicU32,
    recreate_attempted: AtomicBool,
    max_attempts: u32,
    retry_backoff: Duration,
    disable_cooldown_ms: u64,
}

impl LocalCache {
    pub fn new(backend: Arc<dyn CacheBackend>, clock: Arc<dyn Clock>, settings: &EditorSettings) -> Self {
        Self {
            backend,
            clock,
            state: parking_lot::Mutex::new(CacheState::Uninitialized),
            init_lock: tokio::sync::Mutex::new(()),
            failures: AtomicU32::new(0),
            io_failures: AtomicU32::new(0),
            recreate_attempted: AtomicBool::new(false),
            max_attempts: settings.cache_init_attempts.max(1),
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
            disable_cooldown_ms: settings.cache_disable_cooldown_ms,
        }
    }

    pub fn state(&self) -> CacheState {
        *self.state.lock()
    }

    pub fn is_disabled(&self) -> bool {
        self.state() == CacheState::Disabled
    }

    /// Bring the cache up (or observe that it is already up, or disabled).
    /// Safe to call from several tasks at once; only one run happens.
    pub async fn initialize(&self) -> CacheState {
        match self.state() {
            s @ (CacheState::Ready | CacheState::Disabled) => return s,
            _ => {}
        }
        let _guard = self.init_lock.lock().await;
        match self.state() {
            s @ (CacheState::Ready | CacheState::Disabled) => return s,
            _ => {}
        }
        self.set_state(CacheState::Initializing);

        let now = self.clock.now_ms();
        if let Ok(Some(until)) = self.backend.read_disabled_until().await {
            if until > now {
                info!("Local cache disabled until {} (persisted marker)", until);
                self.set_state(CacheState::Disabled);
                return CacheState::Disabled;
            }
            let _ = self.backend.write_disabled_until(None).await;
        }

        match self.open_and_upgrade().await {
            Ok(()) => {
                self.failures.store(0, Ordering::SeqCst);
                info!("Local cache ready");
                self.set_state(CacheState::Ready);
                CacheState::Ready
            }
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!("Local cache initialisation failed ({}/{}): {}", failures, self.max_attempts, e);
                if failures >= self.max_attempts {
                    self.disable(now).await;
                    CacheState::Disabled
                } else {
                    self.set_state(CacheState::Uninitialized);
                    CacheState::Uninitialized
                }
            }
        }
    }

    // ---- pixels store -------------------------------------------------------

    pub async fn load_pixels(&self, territory_id: &str) -> Option<CachedPixels> {
        self.read(STORE_PIXELS, territory_id).await
    }

    /// Cached pixels no older than `ttl_ms`.
    pub async fn load_fresh_pixels(&self, territory_id: &str, ttl_ms: u64) -> Option<CachedPixels> {
        let rec = self.load_pixels(territory_id).await?;
        rec.is_fresh(self.clock.now_ms(), ttl_ms).then_some(rec)
    }

    pub async fn save_pixels(&self, territory_id: &str, pixels: &[PixelRecord], updated_at_ms: Option<u64>) {
        let now = self.clock.now_ms();
        let previous_revision = self.load_pixels(territory_id).await.and_then(|p| p.revision);
        let rec = CachedPixels {
            territory_id: territory_id.to_string(),
            pixels: pixels.to_vec(),
            last_updated_ms: now,
            cached_at_ms: now,
            revision: Some(previous_revision.map_or(1, |r| r + 1)),
            updated_at_ms,
        };
        self.write(STORE_PIXELS, territory_id, &rec).await;
    }

    /// Remove `pixels` entries older than `ttl_ms`. Returns how many went.
    pub async fn prune_expired(&self, ttl_ms: u64) -> usize {
        if !self.ensure_ready().await {
            return 0;
        }
        let Some(keys) = self.with_retry("keys", STORE_PIXELS, "*", || self.backend.keys(STORE_PIXELS)).await
        else {
            return 0;
        };
        let now = self.clock.now_ms();
        let mut removed = 0;
        for key in keys {
            // undecodable entries are deleted by `read`
            let fresh = self
                .read::<CachedPixels>(STORE_PIXELS, &key)
                .await
                .is_some_and(|rec| rec.is_fresh(now, ttl_ms));
            if !fresh {
                self.remove(STORE_PIXELS, &key).await;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Pruned {} expired cache entries", removed);
        }
        removed
    }

    // ---- sessions store -----------------------------------------------------

    pub async fn load_session(&self, territory_id: &str) -> Option<SessionSnapshot> {
        self.read(STORE_SESSIONS, territory_id).await
    }

    pub async fn save_session(&self, snapshot: &SessionSnapshot) {
        self.write(STORE_SESSIONS, &snapshot.territory_id, snapshot).await;
    }

    pub async fn delete_session(&self, territory_id: &str) {
        self.remove(STORE_SESSIONS, territory_id).await;
    }

    // ---- meta store ---------------------------------------------------------

    pub async fn load_commit_metadata(&self, territory_id: &str) -> Option<CommitMetadata> {
        self.read(STORE_META, territory_id).await
    }

    pub async fn save_commit_metadata(&self, territory_id: &str, meta: &CommitMetadata) {
        self.write(STORE_META, territory_id, meta).await;
    }

    // ---- internals ----------------------------------------------------------

    fn set_state(&self, state: CacheState) {
        *self.state.lock() = state;
    }

    async fn ensure_ready(&self) -> bool {
        match self.state() {
            CacheState::Ready => true,
            CacheState::Disabled => false,
            _ => self.initialize().await == CacheState::Ready,
        }
    }

    async fn open_and_upgrade(&self) -> Result<(), CacheError> {
        let layout = self.backend.open().await?;
        if layout.is_current() {
            return Ok(());
        }
        let missing = layout.missing();
        info!(
            "Upgrading local cache from v{} (missing stores: {:?})",
            layout.version, missing
        );
        let upgrade_err = match self.backend.create_stores(&missing, CACHE_VERSION).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!("Non-destructive cache upgrade failed: {}", upgrade_err);

        if self.recreate_attempted.swap(true, Ordering::SeqCst) {
            return Err(upgrade_err);
        }
        warn!("Recreating local cache; cached data will be lost");
        self.backend.recreate(ALL_STORES, CACHE_VERSION).await
    }

    async fn disable(&self, now: u64) {
        let until = now.saturating_add(self.disable_cooldown_ms);
        warn!("Local cache disabled for this session (retry after {})", until);
        if let Err(e) = self.backend.write_disabled_until(Some(until)).await {
            debug!("Could not persist cache disable marker: {}", e);
        }
        self.set_state(CacheState::Disabled);
    }

    async fn read<T: CacheRecord>(&self, store: &str, key: &str) -> Option<T> {
        if !self.ensure_ready().await {
            return None;
        }
        let bytes = self
            .with_retry("read", store, key, || self.backend.get(store, key))
            .await
            .flatten()?;
        match records::decode(&bytes) {
            Ok(rec) => Some(rec),
            Err(e) => {
                warn!("Discarding unreadable cache record {}/{}: {}", store, key, e);
                let _ = self.backend.delete(store, key).await;
                None
            }
        }
    }

    async fn write<T: CacheRecord>(&self, store: &str, key: &str, record: &T) {
        if !self.ensure_ready().await {
            return;
        }
        let bytes = match records::encode(record) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cache encode {}/{} failed: {}", store, key, e);
                return;
            }
        };
        self.with_retry("write", store, key, || self.backend.put(store, key, &bytes))
            .await;
    }

    async fn remove(&self, store: &str, key: &str) {
        if !self.ensure_ready().await {
            return;
        }
        self.with_retry("delete", store, key, || self.backend.delete(store, key))
            .await;
    }

    /// Run one backend call, retrying with exponential backoff. `None` means
    /// the call gave up; enough of those in a row disable the cache.
    async fn with_retry<T, F, Fut>(&self, op_name: &str, store: &str, key: &str, mut op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => {
                    self.io_failures.store(0, Ordering::SeqCst);
                    return Some(v);
                }
                Err(CacheError::MissingStore(name)) => {
                    debug!("Cache {} {}/{}: store '{}' is gone", op_name, store, key, name);
                    return None;
                }
                Err(e) if attempt + 1 < self.max_attempts => {
                    let delay = self.retry_backoff * 2u32.pow(attempt);
                    debug!("Cache {} {}/{} failed ({}); retry in {:?}", op_name, store, key, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    let failures = self.io_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(
                        "Cache {} {}/{} failed ({}/{}): {}",
                        op_name, store, key, failures, self.max_attempts, e
                    );
                    if failures >= self.max_attempts && !self.is_disabled() {
                        self.disable(self.clock.now_ms()).await;
                    }
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::HexColor;
    use crate::clock::ManualClock;

    fn settings() -> EditorSettings {
        EditorSettings::default()
    }

    fn cache_on(backend: Arc<MemoryBackend>, clock: Arc<ManualClock>) -> LocalCache {
        LocalCache::new(backend, clock, &settings())
    }

    fn pixel(x: u32, y: u32) -> PixelRecord {
        PixelRecord {
            x,
            y,
            color: HexColor([10, 20, 30]),
            author_id: "u1".into(),
            written_at_ms: 5,
        }
    }

    #[tokio::test]
    async fn fresh_database_is_upgraded_in_place() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_on(backend.clone(), Arc::new(ManualClock::new(0)));
        assert_eq!(cache.initialize().await, CacheState::Ready);
        assert_eq!(backend.recreate_count(), 0);

        cache.save_pixels("t1", &[pixel(1, 1)], Some(7)).await;
        let rec = cache.load_pixels("t1").await.unwrap();
        assert_eq!(rec.pixels, vec![pixel(1, 1)]);
        assert_eq!(rec.updated_at_ms, Some(7));
        assert_eq!(rec.revision, Some(1));
    }

    #[tokio::test]
    async fn failed_upgrade_falls_back_to_recreate_once() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_fail_upgrade(true);
        let cache = cache_on(backend.clone(), Arc::new(ManualClock::new(0)));
        assert_eq!(cache.initialize().await, CacheState::Ready);
        assert_eq!(backend.recreate_count(), 1);
    }

    #[tokio::test]
    async fn two_failures_disable_the_cache() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_fail_upgrade(true);
        backend.set_fail_recreate(true);
        let cache = cache_on(backend.clone(), Arc::new(ManualClock::new(1_000)));

        assert_eq!(cache.initialize().await, CacheState::Uninitialized);
        assert_eq!(cache.initialize().await, CacheState::Disabled);
        // destructive path only tried once
        assert_eq!(backend.recreate_count(), 1);

        // reads miss and writes are dropped without raising
        cache.save_pixels("t1", &[pixel(0, 0)], None).await;
        assert!(cache.load_pixels("t1").await.is_none());
        cache.save_session(&SessionSnapshot {
            territory_id: "t1".into(),
            pixels: vec![],
            last_modified_ms: 1,
            saved_at_ms: 1,
        })
        .await;
        assert!(cache.load_session("t1").await.is_none());
        assert_eq!(cache.prune_expired(0).await, 0);
    }

    #[tokio::test]
    async fn disable_marker_survives_restart_until_cooldown() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_fail_open(true);
        let clock = Arc::new(ManualClock::new(1_000));
        let first = cache_on(backend.clone(), clock.clone());
        first.initialize().await;
        first.initialize().await;
        assert!(first.is_disabled());

        backend.set_fail_open(false);
        let second = cache_on(backend.clone(), clock.clone());
        assert_eq!(second.initialize().await, CacheState::Disabled);

        clock.advance(settings().cache_disable_cooldown_ms + 1);
        let third = cache_on(backend, clock);
        assert_eq!(third.initialize().await, CacheState::Ready);
    }

    #[tokio::test]
    async fn concurrent_initialisation_runs_once() {
        let backend = Arc::new(MemoryBackend::ready());
        backend.set_open_delay(Duration::from_millis(20));
        let cache = cache_on(backend.clone(), Arc::new(ManualClock::new(0)));
        let (a, b) = tokio::join!(cache.initialize(), cache.initialize());
        assert_eq!((a, b), (CacheState::Ready, CacheState::Ready));
        assert_eq!(backend.open_count(), 1);
    }

    #[tokio::test]
    async fn vanished_store_reads_as_miss() {
        let backend = Arc::new(MemoryBackend::ready());
        let cache = cache_on(backend.clone(), Arc::new(ManualClock::new(0)));
        cache.initialize().await;
        backend.remove_store(STORE_SESSIONS);
        assert!(cache.load_session("t1").await.is_none());
        cache.delete_session("t1").await;
    }

    #[tokio::test]
    async fn corrupt_record_is_deleted() {
        let backend = Arc::new(MemoryBackend::ready());
        backend.insert_raw(STORE_PIXELS, "t1", vec![1, 2, 3]);
        let cache = cache_on(backend.clone(), Arc::new(ManualClock::new(0)));
        assert!(cache.load_pixels("t1").await.is_none());
        assert!(!backend.contains(STORE_PIXELS, "t1"));
    }

    #[tokio::test]
    async fn legacy_record_is_served_in_current_shape() {
        let backend = Arc::new(MemoryBackend::ready());
        backend.insert_raw(
            STORE_PIXELS,
            "t1",
            records::tests::legacy_pixels_bytes("t1", &[("2,3", "#00FF00")], 10),
        );
        let cache = cache_on(backend, Arc::new(ManualClock::new(0)));
        let rec = cache.load_pixels("t1").await.unwrap();
        assert_eq!(rec.pixels[0].key(), (2, 3));
        assert_eq!(rec.last_updated_ms, 10_000);
    }

    #[tokio::test]
    async fn failing_io_is_retried_then_disables_the_cache() {
        let backend = Arc::new(MemoryBackend::ready());
        let settings = EditorSettings {
            retry_backoff_ms: 1,
            ..settings()
        };
        let clock = Arc::new(ManualClock::new(500));
        let cache = LocalCache::new(backend.clone(), clock, &settings);
        assert_eq!(cache.initialize().await, CacheState::Ready);
        cache.save_pixels("t1", &[pixel(0, 0)], None).await;

        backend.set_fail_io(true);
        assert!(cache.load_session("t1").await.is_none());
        assert_eq!(cache.state(), CacheState::Ready);
        assert!(cache.load_pixels("t1").await.is_none());
        assert_eq!(cache.state(), CacheState::Disabled);

        // healthy again, but the cache stays off for the session
        backend.set_fail_io(false);
        assert!(cache.load_pixels("t1").await.is_none());
        assert_eq!(backend.read_disabled_until().await.unwrap(), Some(500 + settings.cache_disable_cooldown_ms));
    }

    #[tokio::test]
    async fn one_success_resets_the_failure_count() {
        let backend = Arc::new(MemoryBackend::ready());
        let settings = EditorSettings {
            retry_backoff_ms: 1,
            ..settings()
        };
        let cache = LocalCache::new(backend.clone(), Arc::new(ManualClock::new(0)), &settings);
        cache.initialize().await;

        backend.set_fail_io(true);
        cache.delete_session("t1").await;
        backend.set_fail_io(false);
        assert!(cache.load_session("t1").await.is_none());
        backend.set_fail_io(true);
        cache.delete_session("t1").await;
        assert_eq!(cache.state(), CacheState::Ready);
    }

    #[tokio::test]
    async fn ttl_controls_freshness_and_pruning() {
        let backend = Arc::new(MemoryBackend::ready());
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_on(backend, clock.clone());
        cache.save_pixels("old", &[], None).await;
        clock.advance(10_000);
        cache.save_pixels("new", &[], None).await;

        assert!(cache.load_fresh_pixels("old", 5_000).await.is_none());
        assert!(cache.load_fresh_pixels("new", 5_000).await.is_some());
        assert_eq!(cache.prune_expired(5_000).await, 1);
        assert!(cache.load_pixels("old").await.is_none());
        assert!(cache.load_pixels("new").await.is_some());
    }
}
