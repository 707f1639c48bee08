use serde::{Deserialize, Serialize};

use crate::geometry::CellRect;

/// A point in either world (grid cell) or screen (viewport pixel) space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle given by its top-left corner and size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x && p.x < self.right() && p.y >= self.y && p.y < self.bottom()
    }

    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect::new(x0, y0, x1 - x0, y1 - y0))
    }

    /// World rectangle covered by a cell rectangle.
    pub fn from_cells(cells: &CellRect) -> Self {
        Rect::new(
            cells.min_x as f64,
            cells.min_y as f64,
            cells.width() as f64,
            cells.height() as f64,
        )
    }
}

/// `screen = world * scale + translate`.
///
/// Scale is kept inside `[min_scale, max_scale]` by every zoom mutation, so
/// it is never zero and `screen_to_world` is always the exact inverse.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewTransform {
    scale: f64,
    pub translate_x: f64,
    pub translate_y: f64,
    min_scale: f64,
    max_scale: f64,
}

impl ViewTransform {
    pub fn new(min_scale: f64, max_scale: f64) -> Self {
        Self {
            scale: 1.0_f64.clamp(min_scale, max_scale),
            translate_x: 0.0,
            translate_y: 0.0,
            min_scale,
            max_scale,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    // ---- conversions --------------------------------------------------------

    pub fn world_to_screen(&self, p: Point) -> Point {
        Point::new(
            p.x * self.scale + self.translate_x,
            p.y * self.scale + self.translate_y,
        )
    }

    pub fn screen_to_world(&self, p: Point) -> Point {
        Point::new(
            (p.x - self.translate_x) / self.scale,
            (p.y - self.translate_y) / self.scale,
        )
    }

    pub fn world_rect_to_screen(&self, r: &Rect) -> Rect {
        let origin = self.world_to_screen(Point::new(r.x, r.y));
        Rect::new(origin.x, origin.y, r.width * self.scale, r.height * self.scale)
    }

    pub fn screen_rect_to_world(&self, r: &Rect) -> Rect {
        let origin = self.screen_to_world(Point::new(r.x, r.y));
        Rect::new(origin.x, origin.y, r.width / self.scale, r.height / self.scale)
    }

    /// Grid cell under a screen position (may be off-grid or negative).
    pub fn screen_to_cell(&self, p: Point) -> (i64, i64) {
        let w = self.screen_to_world(p);
        (w.x.floor() as i64, w.y.floor() as i64)
    }

    // ---- mutations ----------------------------------------------------------

    /// Set the scale, clamped to the configured range. Returns the applied scale.
    pub fn set_scale(&mut self, scale: f64) -> f64 {
        self.scale = scale.clamp(self.min_scale, self.max_scale);
        self.scale
    }

    /// Zoom while keeping a screen-space point fixed (e.g. under the cursor).
    pub fn zoom_around(&mut self, factor: f64, anchor: Point) {
        let world_anchor = self.screen_to_world(anchor);
        self.set_scale(self.scale * factor);
        self.translate_x = anchor.x - world_anchor.x * self.scale;
        self.translate_y = anchor.y - world_anchor.y * self.scale;
    }

    /// Pan by a screen-space delta.
    pub fn pan_by(&mut self, dx: f64, dy: f64) {
        self.translate_x += dx;
        self.translate_y += dy;
    }

    /// Pick scale and translation so `world` fits inside the viewport with
    /// `padding` (a fraction of the viewport) left on every side.
    pub fn fit_to_view(&mut self, world: &Rect, viewport_w: f64, viewport_h: f64, padding: f64) {
        if world.width <= 0.0 || world.height <= 0.0 || viewport_w <= 0.0 || viewport_h <= 0.0 {
            return;
        }
        let avail_w = viewport_w * (1.0 - 2.0 * padding);
        let avail_h = viewport_h * (1.0 - 2.0 * padding);
        self.set_scale((avail_w / world.width).min(avail_h / world.height));
        self.center_view(world, viewport_w, viewport_h);
    }

    /// Centre `world` in the viewport at the current scale.
    pub fn center_view(&mut self, world: &Rect, viewport_w: f64, viewport_h: f64) {
        let cx = world.x + world.width / 2.0;
        let cy = world.y + world.height / 2.0;
        self.translate_x = viewport_w / 2.0 - cx * self.scale;
        self.translate_y = viewport_h / 2.0 - cy * self.scale;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    fn close(a: Point, b: Point) -> bool {
        (a.x - b.x).abs() < EPS && (a.y - b.y).abs() < EPS
    }

    #[test]
    fn round_trip_identity() {
        let mut view = ViewTransform::new(0.25, 64.0);
        for &(scale, tx, ty) in &[(1.0, 0.0, 0.0), (3.7, -120.5, 44.0), (0.25, 900.0, -3.0), (64.0, 1.5, 1.5)] {
            view.set_scale(scale);
            view.translate_x = tx;
            view.translate_y = ty;
            for &p in &[Point::new(0.0, 0.0), Point::new(12.25, -7.5), Point::new(99.9, 1e4)] {
                assert!(close(view.screen_to_world(view.world_to_screen(p)), p));
            }
        }
    }

    #[test]
    fn scale_is_clamped() {
        let mut view = ViewTransform::new(0.5, 4.0);
        assert_eq!(view.set_scale(100.0), 4.0);
        assert_eq!(view.set_scale(0.0), 0.5);
        view.zoom_around(1e-6, Point::new(10.0, 10.0));
        assert_eq!(view.scale(), 0.5);
    }

    #[test]
    fn zoom_keeps_anchor_fixed() {
        let mut view = ViewTransform::new(0.25, 64.0);
        view.translate_x = 30.0;
        view.translate_y = -12.0;
        let anchor = Point::new(200.0, 150.0);
        let before = view.screen_to_world(anchor);
        view.zoom_around(2.5, anchor);
        assert!(close(view.screen_to_world(anchor), before));
    }

    #[test]
    fn fit_to_view_shows_whole_rect() {
        let mut view = ViewTransform::new(0.25, 64.0);
        let world = Rect::new(10.0, 20.0, 40.0, 20.0);
        view.fit_to_view(&world, 800.0, 600.0, 0.1);
        // width-limited: 640 / 40 = 16
        assert!((view.scale() - 16.0).abs() < EPS);
        let screen = view.world_rect_to_screen(&world);
        assert!(screen.x >= 0.0 && screen.right() <= 800.0);
        assert!(screen.y >= 0.0 && screen.bottom() <= 600.0);
        assert!((screen.x + screen.width / 2.0 - 400.0).abs() < EPS);
    }

    #[test]
    fn center_view_holds_scale() {
        let mut view = ViewTransform::new(0.25, 64.0);
        view.set_scale(3.0);
        view.center_view(&Rect::new(0.0, 0.0, 10.0, 10.0), 100.0, 100.0);
        assert_eq!(view.scale(), 3.0);
        assert!(close(view.world_to_screen(Point::new(5.0, 5.0)), Point::new(50.0, 50.0)));
    }

    #[test]
    fn screen_to_cell_floors() {
        let mut view = ViewTransform::new(0.25, 64.0);
        view.set_scale(10.0);
        assert_eq!(view.screen_to_cell(Point::new(19.9, 0.0)), (1, 0));
        assert_eq!(view.screen_to_cell(Point::new(-0.1, 5.0)), (-1, 0));
    }
}
