//! Storage backends for [`LocalCache`](super::LocalCache).
//!
//! The contract mirrors a browser key-value database: a versioned set of
//! named stores, each a flat `key → bytes` map, opened once and upgraded in
//! place when stores are missing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::CacheError;

pub const STORE_PIXELS: &str = "pixels";
pub const STORE_SESSIONS: &str = "sessions";
pub const STORE_META: &str = "meta";
pub const ALL_STORES: &[&str] = &[STORE_PIXELS, STORE_SESSIONS, STORE_META];

/// Layout version written by this build.
pub const CACHE_VERSION: u32 = 2;

/// What `open()` found.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreLayout {
    pub version: u32,
    pub stores: Vec<String>,
}

impl StoreLayout {
    /// Expected stores that are absent.
    pub fn missing(&self) -> Vec<&'static str> {
        ALL_STORES
            .iter()
            .copied()
            .filter(|s| !self.stores.iter().any(|have| have == s))
            .collect()
    }

    pub fn is_current(&self) -> bool {
        self.version == CACHE_VERSION && self.missing().is_empty()
    }
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn open(&self) -> Result<StoreLayout, CacheError>;
    /// Add the given stores without touching existing ones.
    async fn create_stores(&self, stores: &[&str], version: u32) -> Result<(), CacheError>;
    /// Drop every store and create `stores` from scratch.
    async fn recreate(&self, stores: &[&str], version: u32) -> Result<(), CacheError>;
    async fn get(&self, store: &str, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn put(&self, store: &str, key: &str, value: &[u8]) -> Result<(), CacheError>;
    async fn delete(&self, store: &str, key: &str) -> Result<(), CacheError>;
    async fn keys(&self, store: &str) -> Result<Vec<String>, CacheError>;
    /// Disable marker; kept outside the stores so it survives `recreate`.
    async fn read_disabled_until(&self) -> Result<Option<u64>, CacheError>;
    async fn write_disabled_until(&self, until_ms: Option<u64>) -> Result<(), CacheError>;
}

// ============================================================================
// FILESYSTEM BACKEND
// ============================================================================

const VERSION_FILE: &str = "VERSION";
const DISABLED_FILE: &str = "DISABLED_UNTIL";

/// One directory per store, one file per key.
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<data dir>/terrapaint/cache`
    pub fn default_location() -> Self {
        Self::new(crate::logger::data_dir().join("terrapaint").join("cache"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn store_dir(&self, store: &str) -> PathBuf {
        self.root.join(store)
    }

    async fn existing_store_dir(&self, store: &str) -> Result<PathBuf, CacheError> {
        let dir = self.store_dir(store);
        match tokio::fs::metadata(&dir).await {
            Ok(m) if m.is_dir() => Ok(dir),
            Ok(_) => Err(CacheError::MissingStore(store.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CacheError::MissingStore(store.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Keys become file names: anything outside `[A-Za-z0-9_-]` is `%XX`-escaped.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn unescape_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[async_trait]
impl CacheBackend for FsBackend {
    async fn open(&self) -> Result<StoreLayout, CacheError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let version = match tokio::fs::read_to_string(self.root.join(VERSION_FILE)).await {
            Ok(text) => text.trim().parse().unwrap_or(0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let mut stores = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                stores.push(name.to_string());
            }
        }
        stores.sort();
        Ok(StoreLayout { version, stores })
    }

    async fn create_stores(&self, stores: &[&str], version: u32) -> Result<(), CacheError> {
        for store in stores {
            tokio::fs::create_dir_all(self.store_dir(store)).await?;
        }
        self.write_atomic(&self.root.join(VERSION_FILE), version.to_string().as_bytes())
            .await
    }

    async fn recreate(&self, stores: &[&str], version: u32) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await?;
            }
        }
        self.create_stores(stores, version).await
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let dir = self.existing_store_dir(store).await?;
        match tokio::fs::read(dir.join(escape_key(key))).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, store: &str, key: &str, value: &[u8]) -> Result<(), CacheError> {
        let dir = self.existing_store_dir(store).await?;
        self.write_atomic(&dir.join(escape_key(key)), value).await
    }

    async fn delete(&self, store: &str, key: &str) -> Result<(), CacheError> {
        let dir = self.existing_store_dir(store).await?;
        match tokio::fs::remove_file(dir.join(escape_key(key))).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, store: &str) -> Result<Vec<String>, CacheError> {
        let dir = self.existing_store_dir(store).await?;
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            // leftovers from an interrupted write
            if name.ends_with(".tmp") {
                continue;
            }
            if let Some(key) = unescape_key(&name) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn read_disabled_until(&self) -> Result<Option<u64>, CacheError> {
        match tokio::fs::read_to_string(self.root.join(DISABLED_FILE)).await {
            Ok(text) => Ok(text.trim().parse().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_disabled_until(&self, until_ms: Option<u64>) -> Result<(), CacheError> {
        let path = self.root.join(DISABLED_FILE);
        match until_ms {
            Some(until) => {
                tokio::fs::create_dir_all(&self.root).await?;
                self.write_atomic(&path, until.to_string().as_bytes()).await
            }
            None => match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }
}

// ============================================================================
// IN-MEMORY BACKEND
// ============================================================================

#[derive(Default)]
struct MemoryState {
    version: u32,
    stores: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    disabled_until: Option<u64>,
}

/// Process-local backend with switches for simulating a broken database.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    fail_open: AtomicBool,
    fail_upgrade: AtomicBool,
    fail_recreate: AtomicBool,
    fail_io: AtomicBool,
    open_delay_ms: AtomicU32,
    opens: AtomicU32,
    recreates: AtomicU32,
}

impl MemoryBackend {
    /// Empty database: no stores, version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// A database already at the current layout.
    pub fn ready() -> Self {
        let backend = Self::new();
        {
            let mut state = backend.state.lock();
            state.version = CACHE_VERSION;
            for store in ALL_STORES {
                state.stores.insert(store.to_string(), BTreeMap::new());
            }
        }
        backend
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_upgrade(&self, fail: bool) {
        self.fail_upgrade.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_recreate(&self, fail: bool) {
        self.fail_recreate.store(fail, Ordering::SeqCst);
    }

    /// Make every get/put/delete/keys call fail.
    pub fn set_fail_io(&self, fail: bool) {
        self.fail_io.store(fail, Ordering::SeqCst);
    }

    /// Hold `open()` for a while so concurrent callers overlap.
    pub fn set_open_delay(&self, delay: Duration) {
        self.open_delay_ms.store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn recreate_count(&self) -> u32 {
        self.recreates.load(Ordering::SeqCst)
    }

    /// Drop a store as if it had vanished from the database.
    pub fn remove_store(&self, store: &str) {
        self.state.lock().stores.remove(store);
    }

    /// Write bytes directly, bypassing record encoding.
    pub fn insert_raw(&self, store: &str, key: &str, value: Vec<u8>) {
        self.state
            .lock()
            .stores
            .entry(store.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn contains(&self, store: &str, key: &str) -> bool {
        self.state
            .lock()
            .stores
            .get(store)
            .is_some_and(|s| s.contains_key(key))
    }

    fn check_io(&self) -> Result<(), CacheError> {
        if self.fail_io.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("injected I/O failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn open(&self) -> Result<StoreLayout, CacheError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let delay = self.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("injected open failure".into()));
        }
        let state = self.state.lock();
        Ok(StoreLayout {
            version: state.version,
            stores: state.stores.keys().cloned().collect(),
        })
    }

    async fn create_stores(&self, stores: &[&str], version: u32) -> Result<(), CacheError> {
        if self.fail_upgrade.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("injected upgrade failure".into()));
        }
        let mut state = self.state.lock();
        for store in stores {
            state.stores.entry(store.to_string()).or_default();
        }
        state.version = version;
        Ok(())
    }

    async fn recreate(&self, stores: &[&str], version: u32) -> Result<(), CacheError> {
        self.recreates.fetch_add(1, Ordering::SeqCst);
        if self.fail_recreate.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("injected recreate failure".into()));
        }
        let mut state = self.state.lock();
        state.stores = stores.iter().map(|s| (s.to_string(), BTreeMap::new())).collect();
        state.version = version;
        Ok(())
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.check_io()?;
        let state = self.state.lock();
        let map = state
            .stores
            .get(store)
            .ok_or_else(|| CacheError::MissingStore(store.to_string()))?;
        Ok(map.get(key).cloned())
    }

    async fn put(&self, store: &str, key: &str, value: &[u8]) -> Result<(), CacheError> {
        self.check_io()?;
        let mut state = self.state.lock();
        let map = state
            .stores
            .get_mut(store)
            .ok_or_else(|| CacheError::MissingStore(store.to_string()))?;
        map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, store: &str, key: &str) -> Result<(), CacheError> {
        self.check_io()?;
        let mut state = self.state.lock();
        let map = state
            .stores
            .get_mut(store)
            .ok_or_else(|| CacheError::MissingStore(store.to_string()))?;
        map.remove(key);
        Ok(())
    }

    async fn keys(&self, store: &str) -> Result<Vec<String>, CacheError> {
        self.check_io()?;
        let state = self.state.lock();
        let map = state
            .stores
            .get(store)
            .ok_or_else(|| CacheError::MissingStore(store.to_string()))?;
        Ok(map.keys().cloned().collect())
    }

    async fn read_disabled_until(&self) -> Result<Option<u64>, CacheError> {
        Ok(self.state.lock().disabled_until)
    }

    async fn write_disabled_until(&self, until_ms: Option<u64>) -> Result<(), CacheError> {
        self.state.lock().disabled_until = until_ms;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_escaping_round_trips() {
        for key in ["plain", "with/slash", "unicode-é", "a%b", "..", ""] {
            let escaped = escape_key(key);
            assert!(escaped.chars().all(|c| c.is_ascii_alphanumeric() || "_-%".contains(c)));
            assert_eq!(unescape_key(&escaped).as_deref(), Some(key));
        }
    }

    #[test]
    fn layout_reports_missing_stores() {
        let layout = StoreLayout {
            version: CACHE_VERSION,
            stores: vec!["pixels".into()],
        };
        assert_eq!(layout.missing(), vec![STORE_SESSIONS, STORE_META]);
        assert!(!layout.is_current());
    }

    #[tokio::test]
    async fn fs_backend_upgrades_without_losing_data() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path().join("cache"));
        assert_eq!(backend.open().await.unwrap().version, 0);

        backend.create_stores(&[STORE_PIXELS], 1).await.unwrap();
        backend.put(STORE_PIXELS, "t/1", b"abc").await.unwrap();
        backend.create_stores(&[STORE_SESSIONS, STORE_META], CACHE_VERSION).await.unwrap();

        let layout = backend.open().await.unwrap();
        assert!(layout.is_current());
        assert_eq!(backend.get(STORE_PIXELS, "t/1").await.unwrap().as_deref(), Some(&b"abc"[..]));
        assert_eq!(backend.keys(STORE_PIXELS).await.unwrap(), vec!["t/1".to_string()]);
    }

    #[tokio::test]
    async fn fs_recreate_keeps_disable_marker() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        backend.create_stores(ALL_STORES, CACHE_VERSION).await.unwrap();
        backend.put(STORE_META, "k", b"v").await.unwrap();
        backend.write_disabled_until(Some(42)).await.unwrap();

        backend.recreate(ALL_STORES, CACHE_VERSION).await.unwrap();
        assert_eq!(backend.get(STORE_META, "k").await.unwrap(), None);
        assert_eq!(backend.read_disabled_until().await.unwrap(), Some(42));

        backend.write_disabled_until(None).await.unwrap();
        assert_eq!(backend.read_disabled_until().await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_store_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        assert!(matches!(
            backend.get(STORE_SESSIONS, "x").await,
            Err(CacheError::MissingStore(_))
        ));
        let mem = MemoryBackend::new();
        assert!(matches!(mem.put(STORE_SESSIONS, "x", b"1").await, Err(CacheError::MissingStore(_))));
    }
}
