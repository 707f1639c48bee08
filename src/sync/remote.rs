//! Contracts of the services the editor talks to, and the payload shapes
//! exchanged with them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::SyncError;
use crate::canvas::{CellKey, HexColor, PixelRecord, PixelSnapshot};
use crate::geometry::{BoundingBox, RegionGeometry};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    pub display_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Territory {
    pub id: String,
    pub owner_id: Option<String>,
    pub geometry: RegionGeometry,
    /// Precomputed bounds; derived from the geometry when absent
    pub bounds: Option<BoundingBox>,
}

/// Summary pushed back to the territory service after a save.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerritoryMetadata {
    pub painted_cells: usize,
    pub updated_at_ms: u64,
}

/// What `load_pixel_data` returns: the current picture, deltas already
/// applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePixelData {
    pub pixels: PixelSnapshot,
    pub width: u32,
    pub height: u32,
    pub bounds: Option<BoundingBox>,
    pub updated_at_ms: Option<u64>,
}

/// One cell in a save payload. `color: None` is a tombstone (the cell was
/// erased).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PixelPatch {
    pub x: u32,
    pub y: u32,
    pub color: Option<HexColor>,
    pub author_id: String,
    pub written_at_ms: u64,
}

impl PixelPatch {
    pub fn key(&self) -> CellKey {
        (self.x, self.y)
    }

    pub fn tombstone(key: CellKey, written_at_ms: u64) -> Self {
        Self {
            x: key.0,
            y: key.1,
            color: None,
            author_id: String::new(),
            written_at_ms,
        }
    }
}

impl From<&PixelRecord> for PixelPatch {
    fn from(rec: &PixelRecord) -> Self {
        Self {
            x: rec.x,
            y: rec.y,
            color: Some(rec.color),
            author_id: rec.author_id.clone(),
            written_at_ms: rec.written_at_ms,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavePayload {
    pub pixels: Vec<PixelPatch>,
    pub is_delta: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_count: Option<usize>,
    /// Time of the full snapshot a delta is relative to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_snapshot_time: Option<u64>,
}

/// Acknowledgement of a save; `saved_at_ms` is the remote's timestamp for
/// the write (the base time of later deltas when the save was full).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaveReceipt {
    pub saved_at_ms: u64,
}

/// Replay `patches` over `base`. Later patches for a key win.
pub fn apply_delta(base: &[PixelRecord], patches: &[PixelPatch]) -> PixelSnapshot {
    let mut cells: BTreeMap<CellKey, PixelRecord> = base.iter().map(|r| (r.key(), r.clone())).collect();
    for patch in patches {
        match patch.color {
            Some(color) => {
                cells.insert(
                    patch.key(),
                    PixelRecord {
                        x: patch.x,
                        y: patch.y,
                        color,
                        author_id: patch.author_id.clone(),
                        written_at_ms: patch.written_at_ms,
                    },
                );
            }
            None => {
                cells.remove(&patch.key());
            }
        }
    }
    cells.into_values().collect()
}

/// Patches that turn `base` into `current`: every record that is new or
/// differs from the base, and a tombstone stamped `erased_at_ms` for every
/// base cell that `current` no longer has. Ordered by cell.
pub fn diff_snapshots(base: &[PixelRecord], current: &[PixelRecord], erased_at_ms: u64) -> Vec<PixelPatch> {
    let before: BTreeMap<CellKey, &PixelRecord> = base.iter().map(|r| (r.key(), r)).collect();
    let after: BTreeMap<CellKey, &PixelRecord> = current.iter().map(|r| (r.key(), r)).collect();
    let mut patches: Vec<PixelPatch> = after
        .iter()
        .filter(|&(key, rec)| before.get(key) != Some(rec))
        .map(|(_, rec)| PixelPatch::from(*rec))
        .collect();
    patches.extend(
        before
            .keys()
            .filter(|key| !after.contains_key(*key))
            .map(|key| PixelPatch::tombstone(*key, erased_at_ms)),
    );
    patches.sort_by_key(PixelPatch::key);
    patches
}

#[async_trait]
pub trait TerritoryService: Send + Sync {
    async fn get_territory(&self, territory_id: &str) -> Result<Territory, SyncError>;
    async fn update_territory_metadata(&self, territory_id: &str, meta: TerritoryMetadata) -> Result<(), SyncError>;
}

#[async_trait]
pub trait PixelDataService: Send + Sync {
    /// `Ok(None)` when nothing has been saved for the territory yet.
    async fn load_pixel_data(&self, territory_id: &str) -> Result<Option<RemotePixelData>, SyncError>;
    async fn save_pixel_data(&self, territory_id: &str, payload: &SavePayload) -> Result<SaveReceipt, SyncError>;
}

#[async_trait]
pub trait ActorProvider: Send + Sync {
    /// `None` when nobody is signed in.
    async fn current_actor(&self) -> Option<Actor>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(x: u32, y: u32, c: u8) -> PixelRecord {
        PixelRecord {
            x,
            y,
            color: HexColor([c, c, c]),
            author_id: "a".into(),
            written_at_ms: 1,
        }
    }

    #[test]
    fn delta_overwrites_and_erases() {
        let base = vec![rec(0, 0, 1), rec(1, 0, 2)];
        let patches = vec![
            PixelPatch::from(&rec(0, 0, 9)),
            PixelPatch::tombstone((1, 0), 3),
            PixelPatch::from(&rec(5, 5, 4)),
        ];
        assert_eq!(apply_delta(&base, &patches), vec![rec(0, 0, 9), rec(5, 5, 4)]);
    }

    #[test]
    fn diff_covers_changes_and_erasures_only() {
        let base = vec![rec(0, 0, 1), rec(1, 0, 2), rec(2, 0, 3)];
        let current = vec![rec(0, 0, 1), rec(1, 0, 7), rec(4, 4, 5)];
        let diff = diff_snapshots(&base, &current, 11);
        let keys: Vec<_> = diff.iter().map(PixelPatch::key).collect();
        assert_eq!(keys, vec![(1, 0), (2, 0), (4, 4)]);
        assert_eq!(diff[1], PixelPatch::tombstone((2, 0), 11));
        assert_eq!(apply_delta(&base, &diff), current);
        assert!(diff_snapshots(&current, &current, 0).is_empty());
    }

    #[test]
    fn payload_uses_wire_field_names() {
        let payload = SavePayload {
            pixels: vec![PixelPatch::tombstone((2, 3), 8)],
            is_delta: true,
            changed_count: Some(1),
            base_snapshot_time: Some(100),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["isDelta"], true);
        assert_eq!(json["changedCount"], 1);
        assert_eq!(json["baseSnapshotTime"], 100);
        assert_eq!(json["pixels"][0]["writtenAtMs"], 8);
        assert!(json["pixels"][0]["color"].is_null());
    }
}
