//! In-process collaborators: a territory registry, a pixel store that keeps
//! a full snapshot plus the latest delta against it, and a fixed actor.
//! Used by the offline CLI and by tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::SyncError;
use super::remote::{
    Actor, ActorProvider, PixelDataService, PixelPatch, RemotePixelData, SaveReceipt, SavePayload, Territory,
    TerritoryMetadata, TerritoryService, apply_delta,
};
use crate::canvas::PixelSnapshot;
use crate::clock::Clock;

// ============================================================================
// TERRITORIES
// ============================================================================

#[derive(Default)]
pub struct MemoryTerritoryService {
    territories: Mutex<HashMap<String, Territory>>,
    metadata: Mutex<HashMap<String, TerritoryMetadata>>,
}

impl MemoryTerritoryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, territory: Territory) {
        self.territories.lock().insert(territory.id.clone(), territory);
    }

    /// Hand the territory to someone else (or nobody).
    pub fn set_owner(&self, territory_id: &str, owner_id: Option<&str>) {
        if let Some(t) = self.territories.lock().get_mut(territory_id) {
            t.owner_id = owner_id.map(str::to_string);
        }
    }

    pub fn metadata(&self, territory_id: &str) -> Option<TerritoryMetadata> {
        self.metadata.lock().get(territory_id).cloned()
    }
}

#[async_trait]
impl TerritoryService for MemoryTerritoryService {
    async fn get_territory(&self, territory_id: &str) -> Result<Territory, SyncError> {
        self.territories
            .lock()
            .get(territory_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(territory_id.to_string()))
    }

    async fn update_territory_metadata(&self, territory_id: &str, meta: TerritoryMetadata) -> Result<(), SyncError> {
        self.metadata.lock().insert(territory_id.to_string(), meta);
        Ok(())
    }
}

// ============================================================================
// PIXEL DATA
// ============================================================================

#[derive(Clone, Default)]
struct StoredPixels {
    full: PixelSnapshot,
    full_saved_at_ms: u64,
    /// Every cell that differs from `full`; each delta save replaces it
    delta: Option<Vec<PixelPatch>>,
    updated_at_ms: u64,
}

impl StoredPixels {
    fn current(&self) -> PixelSnapshot {
        match &self.delta {
            Some(delta) => apply_delta(&self.full, delta),
            None => self.full.clone(),
        }
    }
}

/// Remote pixel store with failure injection.
///
/// A full save replaces the snapshot and drops the pending delta. A delta
/// save is only accepted when its `base_snapshot_time` names the current
/// snapshot, and it replaces the previous delta outright: each delta is a
/// complete diff against the snapshot, never against an earlier delta.
/// Loads apply the pending delta over the snapshot.
pub struct MemoryPixelService {
    clock: Arc<dyn Clock>,
    grid_size: u32,
    data: Mutex<HashMap<String, StoredPixels>>,
    payloads: Mutex<Vec<SavePayload>>,
    fail_saves: AtomicU32,
    delta_error: Mutex<Option<SyncError>>,
    fail_loads: AtomicBool,
}

impl MemoryPixelService {
    pub fn new(clock: Arc<dyn Clock>, grid_size: u32) -> Self {
        Self {
            clock,
            grid_size,
            data: Mutex::new(HashMap::new()),
            payloads: Mutex::new(Vec::new()),
            fail_saves: AtomicU32::new(0),
            delta_error: Mutex::new(None),
            fail_loads: AtomicBool::new(false),
        }
    }

    /// Store a full snapshot directly.
    pub fn seed(&self, territory_id: &str, pixels: PixelSnapshot) {
        let now = self.clock.now_ms();
        self.data.lock().insert(
            territory_id.to_string(),
            StoredPixels {
                full: pixels,
                full_saved_at_ms: now,
                delta: None,
                updated_at_ms: now,
            },
        );
    }

    /// The next `n` saves fail with a transient error.
    pub fn fail_next_saves(&self, n: u32) {
        self.fail_saves.store(n, Ordering::SeqCst);
    }

    /// Reject every delta save with a transient error.
    pub fn set_fail_deltas(&self, fail: bool) {
        let error = fail.then(|| SyncError::Remote("delta rejected".into()));
        *self.delta_error.lock() = error;
    }

    /// Reject every delta save with `error`.
    pub fn reject_deltas_with(&self, error: SyncError) {
        *self.delta_error.lock() = Some(error);
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Every payload received, successful or not, in arrival order.
    pub fn payloads(&self) -> Vec<SavePayload> {
        self.payloads.lock().clone()
    }

    pub fn full_snapshot(&self, territory_id: &str) -> Option<PixelSnapshot> {
        self.data.lock().get(territory_id).map(|d| d.full.clone())
    }

    /// The delta currently stored on top of the full snapshot.
    pub fn pending_delta(&self, territory_id: &str) -> Option<Vec<PixelPatch>> {
        self.data.lock().get(territory_id).and_then(|d| d.delta.clone())
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PixelDataService for MemoryPixelService {
    async fn load_pixel_data(&self, territory_id: &str) -> Result<Option<RemotePixelData>, SyncError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(SyncError::Remote("injected load failure".into()));
        }
        let data = self.data.lock();
        Ok(data.get(territory_id).map(|stored| RemotePixelData {
            pixels: stored.current(),
            width: self.grid_size,
            height: self.grid_size,
            bounds: None,
            updated_at_ms: Some(stored.updated_at_ms),
        }))
    }

    async fn save_pixel_data(&self, territory_id: &str, payload: &SavePayload) -> Result<SaveReceipt, SyncError> {
        self.payloads.lock().push(payload.clone());
        if self.take_injected_failure() {
            return Err(SyncError::Remote("injected save failure".into()));
        }
        if payload.pixels.iter().any(|p| p.x >= self.grid_size || p.y >= self.grid_size) {
            return Err(SyncError::InvalidPayload("cell outside grid".into()));
        }

        let now = self.clock.now_ms();
        if payload.is_delta {
            if let Some(error) = self.delta_error.lock().clone() {
                return Err(error);
            }
            let mut data = self.data.lock();
            let stored = data
                .get_mut(territory_id)
                .ok_or_else(|| SyncError::Remote("delta without a base snapshot".into()))?;
            if payload.base_snapshot_time != Some(stored.full_saved_at_ms) {
                return Err(SyncError::Remote("stale delta base".into()));
            }
            stored.delta = Some(payload.pixels.clone());
            stored.updated_at_ms = now;
        } else {
            let full = apply_delta(&[], &payload.pixels);
            self.data.lock().insert(
                territory_id.to_string(),
                StoredPixels {
                    full,
                    full_saved_at_ms: now,
                    delta: None,
                    updated_at_ms: now,
                },
            );
        }
        Ok(SaveReceipt { saved_at_ms: now })
    }
}

// ============================================================================
// ACTOR
// ============================================================================

/// Always reports the same signed-in user (or nobody).
pub struct StaticActor(Mutex<Option<Actor>>);

impl StaticActor {
    pub fn new(id: &str, display_name: &str) -> Self {
        Self(Mutex::new(Some(Actor {
            id: id.to_string(),
            display_name: display_name.to_string(),
        })))
    }

    pub fn anonymous() -> Self {
        Self(Mutex::new(None))
    }

    pub fn sign_out(&self) {
        *self.0.lock() = None;
    }
}

#[async_trait]
impl ActorProvider for StaticActor {
    async fn current_actor(&self) -> Option<Actor> {
        self.0.lock().clone()
    }
}
