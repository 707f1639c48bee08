use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::geometry::CellMask;

// ============================================================================
// COLOR
// ============================================================================

/// An opaque RGB color, written canonically as `#RRGGBB` (upper case).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HexColor(pub [u8; 3]);

impl HexColor {
    pub const BLACK: HexColor = HexColor([0, 0, 0]);
    pub const WHITE: HexColor = HexColor([255, 255, 255]);

    pub fn to_rgba(self) -> Rgba<u8> {
        Rgba([self.0[0], self.0[1], self.0[2], 255])
    }
}

impl fmt::Display for HexColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.0[0], self.0[1], self.0[2])
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("'{0}' is not a hex color")]
pub struct ParseColorError(pub String);

impl FromStr for HexColor {
    type Err = ParseColorError;

    /// Accepts `#RGB`, `#RRGGBB`, with or without the leading `#`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseColorError(s.to_string());
        let hex = s.trim().trim_start_matches('#');
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(err());
        }
        let channel = |i: usize, len: usize| u8::from_str_radix(&hex[i..i + len], 16).map_err(|_| err());
        match hex.len() {
            3 => {
                let [r, g, b] = [channel(0, 1)?, channel(1, 1)?, channel(2, 1)?];
                Ok(HexColor([r * 17, g * 17, b * 17]))
            }
            6 => Ok(HexColor([channel(0, 2)?, channel(2, 2)?, channel(4, 2)?])),
            _ => Err(err()),
        }
    }
}

impl TryFrom<String> for HexColor {
    type Error = ParseColorError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<HexColor> for String {
    fn from(c: HexColor) -> Self {
        c.to_string()
    }
}

// ============================================================================
// PIXEL RECORDS
// ============================================================================

pub type CellKey = (u32, u32);

/// One painted cell.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PixelRecord {
    pub x: u32,
    pub y: u32,
    pub color: HexColor,
    pub author_id: String,
    pub written_at_ms: u64,
}

impl PixelRecord {
    pub fn key(&self) -> CellKey {
        (self.x, self.y)
    }
}

/// Full copy of the store contents, ordered by `(x, y)`.
pub type PixelSnapshot = Vec<PixelRecord>;

// ============================================================================
// PIXEL STORE
// ============================================================================

/// Sparse, mask-constrained map of painted cells.
///
/// Every mutation goes through the mask: writes to cells outside it (or off
/// the grid) are dropped silently. Mutated keys are tracked in a changed
/// set until the sync layer acknowledges them.
pub struct PixelStore {
    mask: Arc<CellMask>,
    pixels: BTreeMap<CellKey, PixelRecord>,
    changed: BTreeSet<CellKey>,
    clock: Arc<dyn Clock>,
    flood_fill_budget: usize,
    /// Monotonically increasing counter, bumped on every effective mutation
    pub generation: u64,
}

impl PixelStore {
    pub fn new(mask: Arc<CellMask>, clock: Arc<dyn Clock>, flood_fill_budget: usize) -> Self {
        Self {
            mask,
            pixels: BTreeMap::new(),
            changed: BTreeSet::new(),
            clock,
            flood_fill_budget,
            generation: 0,
        }
    }

    pub fn mask(&self) -> &Arc<CellMask> {
        &self.mask
    }

    pub fn grid_size(&self) -> u32 {
        self.mask.grid_size()
    }

    // ---- queries ------------------------------------------------------------

    pub fn get(&self, x: i64, y: i64) -> Option<&PixelRecord> {
        let key = self.key_in_mask(x, y)?;
        self.pixels.get(&key)
    }

    pub fn color_at(&self, x: i64, y: i64) -> Option<HexColor> {
        self.get(x, y).map(|p| p.color)
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PixelRecord> {
        self.pixels.values()
    }

    /// Keys mutated since the last acknowledged save.
    pub fn changed(&self) -> &BTreeSet<CellKey> {
        &self.changed
    }

    pub fn snapshot(&self) -> PixelSnapshot {
        self.pixels.values().cloned().collect()
    }

    // ---- point writes -------------------------------------------------------

    /// Paint one cell. Returns false when the write was rejected or changed
    /// nothing.
    pub fn set(&mut self, x: i64, y: i64, color: HexColor, author_id: &str) -> bool {
        let Some(key) = self.key_in_mask(x, y) else {
            return false;
        };
        if let Some(existing) = self.pixels.get(&key)
            && existing.color == color
            && existing.author_id == author_id
        {
            return false;
        }
        let now = self.clock.now_ms();
        self.write(key, color, author_id, now);
        self.generation = self.generation.wrapping_add(1);
        true
    }

    /// Remove a painted cell. The key stays in the changed set so the next
    /// delta carries a tombstone for it.
    pub fn erase(&mut self, x: i64, y: i64) -> bool {
        let Some(key) = self.key_in_mask(x, y) else {
            return false;
        };
        if self.pixels.remove(&key).is_none() {
            return false;
        }
        self.changed.insert(key);
        self.generation = self.generation.wrapping_add(1);
        true
    }

    /// Paint many cells as one logical operation. Returns the number of
    /// cells actually written.
    pub fn apply_bulk<I>(&mut self, cells: I, author_id: &str) -> usize
    where
        I: IntoIterator<Item = (i64, i64, HexColor)>,
    {
        let now = self.clock.now_ms();
        let mut written = 0;
        for (x, y, color) in cells {
            let Some(key) = self.key_in_mask(x, y) else {
                continue;
            };
            if self.pixels.get(&key).is_some_and(|p| p.color == color && p.author_id == author_id) {
                continue;
            }
            self.write(key, color, author_id, now);
            written += 1;
        }
        if written > 0 {
            self.generation = self.generation.wrapping_add(1);
        }
        written
    }

    // ---- flood fill ---------------------------------------------------------

    /// 4-connected flood fill with an explicit stack.
    ///
    /// The region is every cell reachable from the seed through cells that
    /// are inside the mask and share the seed's current state (a color, or
    /// unpainted). At most `flood_fill_budget` cells are visited. Returns the
    /// number of cells painted.
    pub fn flood_fill(&mut self, x: i64, y: i64, color: HexColor, author_id: &str) -> usize {
        let Some(seed) = self.key_in_mask(x, y) else {
            return 0;
        };
        let target = self.pixels.get(&seed).map(|p| p.color);
        if target == Some(color) {
            return 0;
        }

        let n = self.grid_size() as usize;
        // visited doubles as the "already queued" marker
        let mut visited = vec![false; n * n];
        let mut stack: Vec<CellKey> = Vec::with_capacity(256);
        let mut region: Vec<CellKey> = Vec::new();
        visited[seed.1 as usize * n + seed.0 as usize] = true;
        stack.push(seed);

        while let Some((cx, cy)) = stack.pop() {
            if region.len() >= self.flood_fill_budget {
                break;
            }
            region.push((cx, cy));

            let neighbours = [
                (cx as i64 - 1, cy as i64),
                (cx as i64 + 1, cy as i64),
                (cx as i64, cy as i64 - 1),
                (cx as i64, cy as i64 + 1),
            ];
            for (nx, ny) in neighbours {
                let Some(key) = self.key_in_mask(nx, ny) else {
                    continue;
                };
                let idx = key.1 as usize * n + key.0 as usize;
                if visited[idx] {
                    continue;
                }
                if self.pixels.get(&key).map(|p| p.color) != target {
                    continue;
                }
                visited[idx] = true;
                stack.push(key);
            }
        }

        let now = self.clock.now_ms();
        for &key in &region {
            self.write(key, color, author_id, now);
        }
        if !region.is_empty() {
            self.generation = self.generation.wrapping_add(1);
        }
        region.len()
    }

    // ---- wholesale replacement ----------------------------------------------

    /// Replace the contents with `snapshot` (undo/redo). Cells whose state
    /// differs between the old and new contents are marked changed.
    pub fn restore(&mut self, snapshot: &[PixelRecord]) {
        let next = self.collect_in_mask(snapshot);
        for (key, rec) in &next {
            if self.pixels.get(key) != Some(rec) {
                self.changed.insert(*key);
            }
        }
        for key in self.pixels.keys() {
            if !next.contains_key(key) {
                self.changed.insert(*key);
            }
        }
        self.pixels = next;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Load contents from persistent storage. Nothing is marked changed;
    /// records outside the mask are discarded.
    pub fn hydrate(&mut self, records: &[PixelRecord]) {
        self.pixels = self.collect_in_mask(records);
        self.changed.clear();
        self.generation = self.generation.wrapping_add(1);
    }

    /// Load a recovered session: contents come from the snapshot and every
    /// cell that differs from what is currently loaded becomes changed.
    pub fn recover(&mut self, records: &[PixelRecord]) {
        self.restore(records);
    }

    // ---- changed set --------------------------------------------------------

    /// Forget every pending change.
    pub fn clear_changed(&mut self) {
        self.changed.clear();
    }

    /// Forget the given keys only; edits made after a commit started stay
    /// pending.
    pub fn acknowledge<'a, I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = &'a CellKey>,
    {
        for key in keys {
            self.changed.remove(key);
        }
    }

    /// Tear down: no pixels, no pending changes.
    pub fn clear(&mut self) {
        self.pixels.clear();
        self.changed.clear();
        self.generation = self.generation.wrapping_add(1);
    }

    // ---- export -------------------------------------------------------------

    /// Rasterise to a grid-sized image; unpainted cells are transparent.
    pub fn to_rgba_image(&self) -> RgbaImage {
        let n = self.grid_size();
        let mut img = RgbaImage::new(n, n);
        for rec in self.pixels.values() {
            img.put_pixel(rec.x, rec.y, rec.color.to_rgba());
        }
        img
    }

    // ---- internals ----------------------------------------------------------

    fn key_in_mask(&self, x: i64, y: i64) -> Option<CellKey> {
        if self.mask.contains(x, y) {
            Some((x as u32, y as u32))
        } else {
            None
        }
    }

    fn write(&mut self, key: CellKey, color: HexColor, author_id: &str, now: u64) {
        self.pixels.insert(
            key,
            PixelRecord {
                x: key.0,
                y: key.1,
                color,
                author_id: author_id.to_string(),
                written_at_ms: now,
            },
        );
        self.changed.insert(key);
    }

    fn collect_in_mask(&self, records: &[PixelRecord]) -> BTreeMap<CellKey, PixelRecord> {
        records
            .iter()
            .filter(|r| self.mask.contains(r.x as i64, r.y as i64))
            .map(|r| (r.key(), r.clone()))
            .collect()
    }
}
