use image::RgbaImage;

use crate::canvas::HexColor;
use crate::components::tools::Corner;
use crate::geometry::CellMask;
use crate::view::{Point, Rect};

/// Smallest stamp edge, in cells.
const MIN_STAMP_SIZE: f64 = 1.0;

#[derive(Debug, thiserror::Error)]
pub enum StampError {
    #[error("Could not decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Image has no pixels")]
    Empty,
    #[error("Territory has no editable area")]
    NoEditableArea,
}

/// What a pointer position hits on the stamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StampHit {
    Body,
    Handle(Corner),
}

/// An uploaded raster positioned over the grid in world space.
///
/// The rectangle stays inside the mask's bounding box; with `snap` on its
/// edges sit on whole cells.
pub struct ImageStamp {
    source: RgbaImage,
    rect: Rect,
    bounds: Rect,
    pub snap: bool,
    pub alpha_threshold: u8,
}

impl ImageStamp {
    /// Place `source` centred in the mask bounds, as large as fits while
    /// keeping its aspect ratio.
    pub fn new(source: RgbaImage, mask: &CellMask, alpha_threshold: u8) -> Result<Self, StampError> {
        if source.width() == 0 || source.height() == 0 {
            return Err(StampError::Empty);
        }
        let cells = mask.bounds().ok_or(StampError::NoEditableArea)?;
        let bounds = Rect::from_cells(&cells);

        let aspect = source.width() as f64 / source.height() as f64;
        let (mut w, mut h) = (bounds.width, bounds.width / aspect);
        if h > bounds.height {
            h = bounds.height;
            w = h * aspect;
        }
        let rect = Rect::new(
            bounds.x + (bounds.width - w) / 2.0,
            bounds.y + (bounds.height - h) / 2.0,
            w.max(MIN_STAMP_SIZE),
            h.max(MIN_STAMP_SIZE),
        );

        let mut stamp = Self {
            source,
            rect,
            bounds,
            snap: true,
            alpha_threshold,
        };
        stamp.normalize();
        Ok(stamp)
    }

    /// Decode an uploaded file (any format the `image` crate was built with).
    pub fn from_bytes(bytes: &[u8], mask: &CellMask, alpha_threshold: u8) -> Result<Self, StampError> {
        let source = image::load_from_memory(bytes)?.into_rgba8();
        Self::new(source, mask, alpha_threshold)
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    /// Place the stamp at an explicit rectangle (clamped and snapped).
    pub fn set_rect(&mut self, rect: Rect) {
        self.rect = rect;
        self.normalize();
    }

    /// Move so the top-left corner lands at `origin`.
    pub fn move_to(&mut self, origin: Point) {
        self.rect.x = origin.x;
        self.rect.y = origin.y;
        self.normalize();
    }

    /// Drag `corner` to `p`, keeping the opposite corner fixed.
    pub fn resize_corner(&mut self, corner: Corner, p: Point) {
        let (mut x0, mut y0, mut x1, mut y1) = (self.rect.x, self.rect.y, self.rect.right(), self.rect.bottom());
        match corner {
            Corner::TopLeft => {
                x0 = p.x.min(x1 - MIN_STAMP_SIZE);
                y0 = p.y.min(y1 - MIN_STAMP_SIZE);
            }
            Corner::TopRight => {
                x1 = p.x.max(x0 + MIN_STAMP_SIZE);
                y0 = p.y.min(y1 - MIN_STAMP_SIZE);
            }
            Corner::BottomLeft => {
                x0 = p.x.min(x1 - MIN_STAMP_SIZE);
                y1 = p.y.max(y0 + MIN_STAMP_SIZE);
            }
            Corner::BottomRight => {
                x1 = p.x.max(x0 + MIN_STAMP_SIZE);
                y1 = p.y.max(y0 + MIN_STAMP_SIZE);
            }
        }
        // Clamp the moving edges only
        x0 = x0.max(self.bounds.x);
        y0 = y0.max(self.bounds.y);
        x1 = x1.min(self.bounds.right());
        y1 = y1.min(self.bounds.bottom());
        self.rect = Rect::new(x0, y0, x1 - x0, y1 - y0);
        self.normalize();
    }

    /// Screen-independent hit test; `handle_radius` is in world units.
    pub fn hit_test(&self, p: Point, handle_radius: f64) -> Option<StampHit> {
        for corner in Corner::all() {
            let c = self.corner_point(corner);
            if (p.x - c.x).abs() <= handle_radius && (p.y - c.y).abs() <= handle_radius {
                return Some(StampHit::Handle(corner));
            }
        }
        if self.rect.contains(p) {
            return Some(StampHit::Body);
        }
        None
    }

    pub fn corner_point(&self, corner: Corner) -> Point {
        let r = self.rect;
        match corner {
            Corner::TopLeft => Point::new(r.x, r.y),
            Corner::TopRight => Point::new(r.right(), r.y),
            Corner::BottomLeft => Point::new(r.x, r.bottom()),
            Corner::BottomRight => Point::new(r.right(), r.bottom()),
        }
    }

    /// Cells the stamp would write: every mask cell whose centre lies in
    /// the rectangle and whose nearest source sample is opaque enough.
    pub fn rasterize(&self, mask: &CellMask) -> Vec<(i64, i64, HexColor)> {
        let Some(area) = self.rect.intersect(&self.bounds) else {
            return Vec::new();
        };
        let (sw, sh) = self.source.dimensions();
        let x_start = area.x.floor() as i64;
        let y_start = area.y.floor() as i64;
        let x_end = area.right().ceil() as i64;
        let y_end = area.bottom().ceil() as i64;

        let mut cells = Vec::new();
        for y in y_start..y_end {
            for x in x_start..x_end {
                let centre = Point::new(x as f64 + 0.5, y as f64 + 0.5);
                if !self.rect.contains(centre) || !mask.contains(x, y) {
                    continue;
                }
                let u = (centre.x - self.rect.x) / self.rect.width;
                let v = (centre.y - self.rect.y) / self.rect.height;
                let sx = ((u * sw as f64).floor() as u32).min(sw - 1);
                let sy = ((v * sh as f64).floor() as u32).min(sh - 1);
                let px = self.source.get_pixel(sx, sy);
                if px[3] > self.alpha_threshold {
                    cells.push((x, y, HexColor([px[0], px[1], px[2]])));
                }
            }
        }
        cells
    }

    /// Keep the rectangle inside the bounds and, when snapping, on whole cells.
    fn normalize(&mut self) {
        let b = self.bounds;
        let mut r = self.rect;
        if self.snap {
            r.x = r.x.round();
            r.y = r.y.round();
            r.width = r.width.round();
            r.height = r.height.round();
        }
        r.width = r.width.clamp(MIN_STAMP_SIZE, b.width);
        r.height = r.height.clamp(MIN_STAMP_SIZE, b.height);
        r.x = r.x.clamp(b.x, b.right() - r.width);
        r.y = r.y.clamp(b.y, b.bottom() - r.height);
        self.rect = r;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn two_by_two() -> RgbaImage {
        let mut img = RgbaImage::new(2, 2);
        img.put_pixel(0, 0, Rgba([255, 0, 0, 0]));
        img.put_pixel(1, 0, Rgba([0, 255, 0, 255]));
        img.put_pixel(0, 1, Rgba([0, 0, 255, 255]));
        img.put_pixel(1, 1, Rgba([10, 20, 30, 200]));
        img
    }

    #[test]
    fn transparent_sample_is_skipped() {
        let mask = CellMask::full(10);
        let mut stamp = ImageStamp::new(two_by_two(), &mask, 128).unwrap();
        stamp.set_rect(Rect::new(0.0, 0.0, 2.0, 2.0));
        let cells = stamp.rasterize(&mask);
        assert_eq!(cells.len(), 3);
        assert!(cells.contains(&(1, 0, HexColor([0, 255, 0]))));
        assert!(!cells.iter().any(|c| c.0 == 0 && c.1 == 0));
    }

    #[test]
    fn threshold_is_strict() {
        let mask = CellMask::full(10);
        let mut stamp = ImageStamp::new(two_by_two(), &mask, 200).unwrap();
        stamp.set_rect(Rect::new(4.0, 4.0, 2.0, 2.0));
        // alpha 200 does not exceed 200
        assert_eq!(stamp.rasterize(&mask).len(), 2);
    }

    #[test]
    fn initial_placement_fits_bounds() {
        let mask = CellMask::full(20);
        let stamp = ImageStamp::new(RgbaImage::new(40, 20), &mask, 128).unwrap();
        let r = stamp.rect();
        assert_eq!((r.width, r.height), (20.0, 10.0));
        assert_eq!(r.y, 5.0);
    }

    #[test]
    fn moves_are_clamped_to_mask_bounds() {
        let mask = CellMask::full(10);
        let mut stamp = ImageStamp::new(two_by_two(), &mask, 128).unwrap();
        stamp.set_rect(Rect::new(0.0, 0.0, 3.0, 3.0));
        stamp.move_to(Point::new(50.0, -4.0));
        assert_eq!(stamp.rect(), Rect::new(7.0, 0.0, 3.0, 3.0));
    }

    #[test]
    fn corner_resize_keeps_opposite_corner() {
        let mask = CellMask::full(10);
        let mut stamp = ImageStamp::new(two_by_two(), &mask, 128).unwrap();
        stamp.set_rect(Rect::new(2.0, 2.0, 4.0, 4.0));
        stamp.resize_corner(Corner::BottomRight, Point::new(8.4, 7.6));
        assert_eq!(stamp.rect(), Rect::new(2.0, 2.0, 6.0, 6.0));
        stamp.resize_corner(Corner::TopLeft, Point::new(9.0, 9.0));
        assert_eq!(stamp.rect(), Rect::new(7.0, 7.0, 1.0, 1.0));
    }

    #[test]
    fn hit_test_prefers_handles() {
        let mask = CellMask::full(10);
        let mut stamp = ImageStamp::new(two_by_two(), &mask, 128).unwrap();
        stamp.set_rect(Rect::new(2.0, 2.0, 4.0, 4.0));
        assert_eq!(stamp.hit_test(Point::new(2.1, 2.1), 0.5), Some(StampHit::Handle(Corner::TopLeft)));
        assert_eq!(stamp.hit_test(Point::new(4.0, 4.0), 0.5), Some(StampHit::Body));
        assert_eq!(stamp.hit_test(Point::new(9.0, 9.0), 0.5), None);
    }

    #[test]
    fn only_mask_cells_are_written() {
        let cells: Vec<bool> = (0..16).map(|i| i % 4 < 2).collect();
        let mask = CellMask::from_cells(4, cells);
        let mut img = RgbaImage::new(1, 1);
        img.put_pixel(0, 0, Rgba([1, 2, 3, 255]));
        let stamp = ImageStamp::new(img, &mask, 128).unwrap();
        assert!(stamp.rasterize(&mask).iter().all(|&(x, _, _)| x < 2));
        assert!(matches!(
            ImageStamp::new(RgbaImage::new(1, 1), &CellMask::from_cells(4, vec![]), 128),
            Err(StampError::NoEditableArea)
        ));
        assert!(matches!(
            ImageStamp::from_bytes(b"not an image", &mask, 128),
            Err(StampError::Decode(_))
        ));
    }
}
