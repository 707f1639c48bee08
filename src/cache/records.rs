//! On-disk record shapes for the local cache.
//!
//! Every value is stored as a bincode-encoded [`Envelope`] carrying the
//! schema number of its payload. Schema 2 is the canonical shape; schema 1
//! records written by older builds are normalised once, at decode time.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::CacheError;
use crate::canvas::{HexColor, PixelRecord, PixelSnapshot};

/// Schema written by this build.
pub const SCHEMA_VERSION: u16 = 2;
const LEGACY_SCHEMA_V1: u16 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope {
    schema: u16,
    payload: Vec<u8>,
}

/// A value that can live in the cache.
pub trait CacheRecord: Serialize + DeserializeOwned + Sized {
    /// Normalise a schema-1 payload. Records with no legacy form reject it.
    fn from_legacy_v1(_payload: &[u8]) -> Result<Self, CacheError> {
        Err(CacheError::UnsupportedSchema(LEGACY_SCHEMA_V1))
    }
}

pub fn encode<T: CacheRecord>(record: &T) -> Result<Vec<u8>, CacheError> {
    let envelope = Envelope {
        schema: SCHEMA_VERSION,
        payload: bincode::serialize(record)?,
    };
    Ok(bincode::serialize(&envelope)?)
}

pub fn decode<T: CacheRecord>(bytes: &[u8]) -> Result<T, CacheError> {
    let envelope: Envelope = bincode::deserialize(bytes)?;
    match envelope.schema {
        SCHEMA_VERSION => Ok(bincode::deserialize(&envelope.payload)?),
        LEGACY_SCHEMA_V1 => T::from_legacy_v1(&envelope.payload),
        other => Err(CacheError::UnsupportedSchema(other)),
    }
}

// ============================================================================
// CANONICAL (SCHEMA 2) RECORDS
// ============================================================================

/// Last pixel data fetched from the remote store (`pixels` store).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedPixels {
    pub territory_id: String,
    pub pixels: PixelSnapshot,
    pub last_updated_ms: u64,
    pub cached_at_ms: u64,
    pub revision: Option<u64>,
    /// Remote `updatedAt` the data corresponds to
    pub updated_at_ms: Option<u64>,
}

impl CachedPixels {
    /// Whether the entry is younger than `ttl_ms` at `now_ms`.
    pub fn is_fresh(&self, now_ms: u64, ttl_ms: u64) -> bool {
        now_ms.saturating_sub(self.cached_at_ms) <= ttl_ms
    }
}

/// In-progress edits not yet committed (`sessions` store).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub territory_id: String,
    pub pixels: PixelSnapshot,
    pub last_modified_ms: u64,
    pub saved_at_ms: u64,
}

/// Base of the next delta save (`meta` store).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitMetadata {
    pub last_full_snapshot: PixelSnapshot,
    pub last_full_save_at_ms: u64,
}

impl CacheRecord for CommitMetadata {}

// ============================================================================
// LEGACY (SCHEMA 1) RECORDS
// ============================================================================

/// Schema 1 kept pixels as a `"x,y" → "#RRGGBB"` map with second timestamps
/// and no author.
#[derive(Deserialize)]
struct LegacyPixelsV1 {
    territory_id: String,
    pixel_data: BTreeMap<String, String>,
    last_updated: u64,
    cached_at: u64,
}

#[derive(Deserialize)]
struct LegacySessionV1 {
    territory_id: String,
    pixel_data: BTreeMap<String, String>,
    last_modified: u64,
}

/// Entries with an unreadable key or color are dropped.
fn legacy_pixels(map: &BTreeMap<String, String>, written_at_ms: u64) -> PixelSnapshot {
    map.iter()
        .filter_map(|(key, color)| {
            let (x, y) = key.split_once(',')?;
            Some(PixelRecord {
                x: x.trim().parse().ok()?,
                y: y.trim().parse().ok()?,
                color: color.parse::<HexColor>().ok()?,
                author_id: String::new(),
                written_at_ms,
            })
        })
        .collect()
}

impl CacheRecord for CachedPixels {
    fn from_legacy_v1(payload: &[u8]) -> Result<Self, CacheError> {
        let old: LegacyPixelsV1 = bincode::deserialize(payload)?;
        let last_updated_ms = old.last_updated.saturating_mul(1000);
        Ok(Self {
            territory_id: old.territory_id,
            pixels: legacy_pixels(&old.pixel_data, last_updated_ms),
            last_updated_ms,
            cached_at_ms: old.cached_at.saturating_mul(1000),
            revision: None,
            updated_at_ms: None,
        })
    }
}

impl CacheRecord for SessionSnapshot {
    fn from_legacy_v1(payload: &[u8]) -> Result<Self, CacheError> {
        let old: LegacySessionV1 = bincode::deserialize(payload)?;
        let last_modified_ms = old.last_modified.saturating_mul(1000);
        Ok(Self {
            territory_id: old.territory_id,
            pixels: legacy_pixels(&old.pixel_data, last_modified_ms),
            last_modified_ms,
            saved_at_ms: last_modified_ms,
        })
    }
}
