use rayon::prelude::*;
use serde::{Deserialize, Serialize};

// ============================================================================
// REGION GEOMETRY
// ============================================================================

/// A closed ring of `[longitude, latitude]` pairs. The closing vertex may or
/// may not repeat the first one; the ray cast treats the ring as closed.
pub type Ring = Vec<[f64; 2]>;

/// Boundary of a territory, in geographic coordinates. Shaped like the
/// GeoJSON `Polygon` / `MultiPolygon` geometry objects so it can be read
/// straight from a territory service payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum RegionGeometry {
    Polygon(Vec<Ring>),
    MultiPolygon(Vec<Vec<Ring>>),
}

#[derive(Debug, thiserror::Error)]
pub enum GeometryError {
    #[error("Malformed geometry: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Geometry has no vertices")]
    Empty,
}

impl RegionGeometry {
    /// Parse a GeoJSON geometry, or a `Feature` wrapping one.
    pub fn from_geojson(text: &str) -> Result<Self, GeometryError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let geometry = match value.get("geometry") {
            Some(inner) if value.get("type").and_then(|t| t.as_str()) == Some("Feature") => {
                inner.clone()
            }
            _ => value,
        };
        Ok(serde_json::from_value(geometry)?)
    }

    /// All rings, flattened across polygons.
    pub fn rings(&self) -> Box<dyn Iterator<Item = &Ring> + '_> {
        match self {
            RegionGeometry::Polygon(rings) => Box::new(rings.iter()),
            RegionGeometry::MultiPolygon(polys) => Box::new(polys.iter().flatten()),
        }
    }

    pub fn bounding_box(&self) -> Result<BoundingBox, GeometryError> {
        let mut points = self.rings().flatten();
        let first = points.next().ok_or(GeometryError::Empty)?;
        let mut bbox = BoundingBox {
            min_lng: first[0],
            max_lng: first[0],
            min_lat: first[1],
            max_lat: first[1],
        };
        for p in points {
            bbox.min_lng = bbox.min_lng.min(p[0]);
            bbox.max_lng = bbox.max_lng.max(p[0]);
            bbox.min_lat = bbox.min_lat.min(p[1]);
            bbox.max_lat = bbox.max_lat.max(p[1]);
        }
        Ok(bbox)
    }

    /// Sum of absolute ring areas (shoelace). Zero means nothing can be inside.
    pub fn area(&self) -> f64 {
        self.rings().map(|r| ring_signed_area(r).abs()).sum()
    }

    /// Even-odd containment across every ring of every polygon. Holes and
    /// overlapping polygons both fall out of the parity sum.
    pub fn contains(&self, lng: f64, lat: f64) -> bool {
        let crossings: usize = self.rings().map(|r| ring_crossings(r, lng, lat)).sum();
        crossings % 2 == 1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lng: f64,
    pub max_lng: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn width(&self) -> f64 {
        self.max_lng - self.min_lng
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    pub fn contains(&self, lng: f64, lat: f64) -> bool {
        lng >= self.min_lng && lng <= self.max_lng && lat >= self.min_lat && lat <= self.max_lat
    }

    /// Geographic position of a normalized grid point. `ny` runs top to
    /// bottom, latitude runs south to north.
    pub fn lerp(&self, nx: f64, ny: f64) -> (f64, f64) {
        (
            self.min_lng + nx * self.width(),
            self.max_lat - ny * self.height(),
        )
    }
}

fn ring_signed_area(ring: &Ring) -> f64 {
    let n = ring.len();
    if n < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..n {
        let a = ring[i];
        let b = ring[(i + 1) % n];
        sum += a[0] * b[1] - b[0] * a[1];
    }
    sum * 0.5
}

/// Number of ring edges crossed by a ray cast from the point towards +lng.
fn ring_crossings(ring: &Ring, x: f64, y: f64) -> usize {
    let n = ring.len();
    if n < 3 {
        return 0;
    }
    let mut count = 0;
    let mut j = n - 1;
    for i in 0..n {
        let [xi, yi] = ring[i];
        let [xj, yj] = ring[j];
        if (yi > y) != (yj > y) {
            let x_cross = (xj - xi) * (y - yi) / (yj - yi) + xi;
            if x < x_cross {
                count += 1;
            }
        }
        j = i;
    }
    count
}

// ============================================================================
// CELL MASK
// ============================================================================

/// Inclusive rectangle of grid cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRect {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl CellRect {
    pub fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    pub fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    fn include(&mut self, x: u32, y: u32) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }
}

/// Which cells of the N×N grid lie inside the territory. Immutable once
/// built; rebuilt only when geometry is reloaded.
#[derive(Clone, Debug, PartialEq)]
pub struct CellMask {
    grid_size: u32,
    /// Row-major, `grid_size * grid_size` entries
    cells: Vec<bool>,
    bounds: Option<CellRect>,
    count: usize,
}

impl CellMask {
    /// Sample every cell centre against the geometry.
    ///
    /// Degenerate geometry (zero area or a flat bounding box) yields an
    /// all-false mask.
    pub fn build(geometry: &RegionGeometry, bbox: &BoundingBox, grid_size: u32) -> Self {
        let n = grid_size as usize;
        let mut cells = vec![false; n * n];
        let degenerate = !(bbox.width() > 0.0) || !(bbox.height() > 0.0) || !(geometry.area() > 0.0);

        if !degenerate && n > 0 {
            cells.par_chunks_mut(n).enumerate().for_each(|(y, row)| {
                let ny = (y as f64 + 0.5) / n as f64;
                for (x, cell) in row.iter_mut().enumerate() {
                    let nx = (x as f64 + 0.5) / n as f64;
                    let (lng, lat) = bbox.lerp(nx, ny);
                    *cell = geometry.contains(lng, lat);
                }
            });
        }

        Self::from_cells(grid_size, cells)
    }

    /// A mask where every cell is paintable.
    pub fn full(grid_size: u32) -> Self {
        let n = grid_size as usize;
        Self::from_cells(grid_size, vec![true; n * n])
    }

    /// Build from explicit row-major membership. Missing entries count as
    /// outside, extra entries are ignored.
    pub fn from_cells(grid_size: u32, mut cells: Vec<bool>) -> Self {
        let n = grid_size as usize;
        cells.resize(n * n, false);
        let mut bounds: Option<CellRect> = None;
        let mut count = 0;
        for (i, inside) in cells.iter().enumerate() {
            if !inside {
                continue;
            }
            count += 1;
            let (x, y) = ((i % n) as u32, (i / n) as u32);
            match bounds.as_mut() {
                Some(b) => b.include(x, y),
                None => {
                    bounds = Some(CellRect {
                        min_x: x,
                        min_y: y,
                        max_x: x,
                        max_y: y,
                    })
                }
            }
        }
        Self {
            grid_size,
            cells,
            bounds,
            count,
        }
    }

    pub fn grid_size(&self) -> u32 {
        self.grid_size
    }

    /// Whether `(x, y)` is on the grid and inside the territory.
    pub fn contains(&self, x: i64, y: i64) -> bool {
        let n = self.grid_size as i64;
        if x < 0 || y < 0 || x >= n || y >= n {
            return false;
        }
        self.cells[(y * n + x) as usize]
    }

    /// Number of paintable cells.
    pub fn count(&self) -> usize {
        self.count
    }

    /// True when the territory has no editable area.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Tight bounding rectangle of the paintable cells.
    pub fn bounds(&self) -> Option<CellRect> {
        self.bounds
    }

    /// Paintable cells in row-major order.
    pub fn iter_cells(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let n = self.grid_size as usize;
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, inside)| **inside)
            .map(move |(i, _)| ((i % n) as u32, (i / n) as u32))
    }
}
