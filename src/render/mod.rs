// ============================================================================
// RENDER MODULE: two-surface compositor for the territory editor
// ============================================================================
//
// Architecture:
//   surface.rs  Surface trait + CPU RasterSurface (RgbaImage backed)
//   mod.rs      RenderPipeline: static layer, dynamic layer, redraw
//               coalescing, device-pixel-ratio aware sizing
//
// The static layer is drawn once in world space (a fixed number of texels
// per cell) and only rebuilt when the mask, viewport size or pixel density
// changes.  The dynamic layer is drawn in device pixels on every frame that
// has a pending redraw.  `composite()` samples the static layer through the
// view transform and blends the dynamic layer on top.
// ============================================================================

pub mod surface;

use std::sync::Arc;

use image::{Rgba, RgbaImage};

use crate::canvas::{HexColor, PixelStore};
use crate::geometry::CellMask;
use crate::view::{Point, Rect, ViewTransform};

pub use surface::{RasterSurface, Surface, blend_over};

const CHECKER_LIGHT: Rgba<u8> = Rgba([220, 220, 220, 255]);
const CHECKER_DARK: Rgba<u8> = Rgba([180, 180, 180, 255]);
/// Cells outside the territory
const OUTSIDE_DIM: Rgba<u8> = Rgba([60, 60, 66, 255]);
const BOUNDARY: Rgba<u8> = Rgba([255, 190, 0, 255]);
/// Off-grid workspace behind everything
const WORKSPACE: Rgba<u8> = Rgba([32, 32, 36, 255]);
const PREVIEW_OUTLINE: Rgba<u8> = Rgba([255, 255, 255, 200]);
const STAMP_OUTLINE: Rgba<u8> = Rgba([0, 150, 255, 255]);
const HANDLE_FILL: Rgba<u8> = Rgba([255, 255, 255, 255]);
/// Handle edge in CSS pixels
pub const HANDLE_SIZE: f64 = 8.0;
/// Static-layer texels per cell at a pixel ratio of 1
const TEXELS_PER_CELL: u32 = 4;

/// Tool feedback drawn over the painted cells.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Overlay {
    /// Cell under the pointer, with the color a click would paint
    pub hover: Option<((i64, i64), Option<HexColor>)>,
    /// Stamp rectangle in world space
    pub stamp: Option<Rect>,
}

/// Everything a dynamic redraw reads.
pub struct FrameInput<'a> {
    pub store: &'a PixelStore,
    pub view: &'a ViewTransform,
    pub overlay: &'a Overlay,
}

pub struct RenderPipeline {
    static_layer: RasterSurface,
    dynamic_layer: RasterSurface,
    mask: Option<Arc<CellMask>>,
    css_size: (f64, f64),
    device_pixel_ratio: f64,
    checker_size: f64,
    static_dirty: bool,
    redraw_pending: bool,
    /// Number of static-layer rebuilds (diagnostics)
    pub static_redraws: u64,
    /// Number of dynamic-layer redraws (diagnostics)
    pub dynamic_redraws: u64,
}

impl RenderPipeline {
    pub fn new(checker_size: f64) -> Self {
        Self {
            static_layer: RasterSurface::default(),
            dynamic_layer: RasterSurface::default(),
            mask: None,
            css_size: (0.0, 0.0),
            device_pixel_ratio: 1.0,
            checker_size,
            static_dirty: true,
            redraw_pending: false,
            static_redraws: 0,
            dynamic_redraws: 0,
        }
    }

    pub fn set_mask(&mut self, mask: Arc<CellMask>) {
        self.mask = Some(mask);
        self.static_dirty = true;
        self.request_redraw();
    }

    pub fn css_size(&self) -> (f64, f64) {
        self.css_size
    }

    pub fn device_pixel_ratio(&self) -> f64 {
        self.device_pixel_ratio
    }

    /// Device-pixel size of the dynamic surface.
    pub fn device_size(&self) -> (u32, u32) {
        self.dynamic_layer.size()
    }

    /// Resize the surfaces for a viewport of `css_w × css_h` at `dpr`.
    /// Returns false (and does nothing) when the device size and ratio are
    /// unchanged.
    pub fn resize(&mut self, css_w: f64, css_h: f64, dpr: f64) -> bool {
        let dpr = if dpr > 0.0 { dpr } else { 1.0 };
        let device_w = (css_w.max(0.0) * dpr).floor() as u32;
        let device_h = (css_h.max(0.0) * dpr).floor() as u32;
        if self.dynamic_layer.size() == (device_w, device_h) && self.device_pixel_ratio == dpr {
            return false;
        }
        self.css_size = (css_w, css_h);
        self.device_pixel_ratio = dpr;
        self.dynamic_layer.resize(device_w, device_h);
        self.static_dirty = true;
        self.request_redraw();
        true
    }

    /// Ask for a redraw at the next frame. Any number of requests before
    /// that frame collapse into one.
    pub fn request_redraw(&mut self) {
        self.redraw_pending = true;
    }

    /// Drop a pending redraw (teardown).
    pub fn cancel_redraw(&mut self) {
        self.redraw_pending = false;
    }

    /// Called once per display refresh. Redraws only when something asked
    /// for it; returns whether it did.
    pub fn frame(&mut self, input: &FrameInput<'_>) -> bool {
        if !self.redraw_pending {
            return false;
        }
        if self.static_dirty {
            self.rebuild_static();
        }
        self.redraw_dynamic(input);
        self.redraw_pending = false;
        true
    }

    /// Final image as the user would see it, in device pixels.
    pub fn composite(&self, view: &ViewTransform) -> RgbaImage {
        let (w, h) = self.dynamic_layer.size();
        let mut out = RgbaImage::new(w, h);
        let grid = self.mask.as_ref().map_or(0, |m| m.grid_size()) as f64;
        let (sw, sh) = self.static_layer.size();
        let texels = if grid > 0.0 { sw as f64 / grid } else { 0.0 };

        for (x, y, px) in out.enumerate_pixels_mut() {
            let css = Point::new(
                (x as f64 + 0.5) / self.device_pixel_ratio,
                (y as f64 + 0.5) / self.device_pixel_ratio,
            );
            let world = view.screen_to_world(css);
            let mut base = WORKSPACE;
            if world.x >= 0.0 && world.y >= 0.0 && world.x < grid && world.y < grid {
                let tx = ((world.x * texels) as u32).min(sw.saturating_sub(1));
                let ty = ((world.y * texels) as u32).min(sh.saturating_sub(1));
                if sw > 0 && sh > 0 {
                    base = self.static_layer.pixel(tx, ty);
                }
            }
            *px = blend_over(base, self.dynamic_layer.pixel(x, y));
        }
        out
    }

    pub fn static_layer(&self) -> &RasterSurface {
        &self.static_layer
    }

    pub fn dynamic_layer(&self) -> &RasterSurface {
        &self.dynamic_layer
    }

    // ---- static layer -------------------------------------------------------

    fn rebuild_static(&mut self) {
        self.static_dirty = false;
        let Some(mask) = self.mask.clone() else {
            self.static_layer.resize(0, 0);
            return;
        };
        let n = mask.grid_size();
        let t = TEXELS_PER_CELL * self.device_pixel_ratio.ceil().max(1.0) as u32;
        self.static_layer.resize(n * t, n * t);
        self.static_layer.clear(OUTSIDE_DIM);

        let checker = self.checker_size;
        let tf = t as f64;
        for (x, y) in mask.iter_cells() {
            let cx = (x as f64 / checker).floor() as i64;
            let cy = (y as f64 / checker).floor() as i64;
            let color = if (cx + cy) % 2 == 0 { CHECKER_LIGHT } else { CHECKER_DARK };
            let cell = Rect::new(x as f64 * tf, y as f64 * tf, tf, tf);
            self.static_layer.fill_rect(&cell, color);

            let (xi, yi) = (x as i64, y as i64);
            if !mask.contains(xi - 1, yi) {
                self.static_layer.fill_rect(&Rect::new(cell.x, cell.y, 1.0, tf), BOUNDARY);
            }
            if !mask.contains(xi + 1, yi) {
                self.static_layer.fill_rect(&Rect::new(cell.right() - 1.0, cell.y, 1.0, tf), BOUNDARY);
            }
            if !mask.contains(xi, yi - 1) {
                self.static_layer.fill_rect(&Rect::new(cell.x, cell.y, tf, 1.0), BOUNDARY);
            }
            if !mask.contains(xi, yi + 1) {
                self.static_layer.fill_rect(&Rect::new(cell.x, cell.bottom() - 1.0, tf, 1.0), BOUNDARY);
            }
        }
        self.static_redraws += 1;
    }

    // ---- dynamic layer ------------------------------------------------------

    fn redraw_dynamic(&mut self, input: &FrameInput<'_>) {
        let dpr = self.device_pixel_ratio;
        let view = input.view;
        self.dynamic_layer.clear(Rgba([0, 0, 0, 0]));

        let to_device = |r: Rect| Rect::new(r.x * dpr, r.y * dpr, r.width * dpr, r.height * dpr);
        let viewport = Rect::new(0.0, 0.0, self.css_size.0, self.css_size.1);
        let visible = view.screen_rect_to_world(&viewport);

        for rec in input.store.iter() {
            let cell = Rect::new(rec.x as f64, rec.y as f64, 1.0, 1.0);
            if cell.intersect(&visible).is_none() {
                continue;
            }
            let screen = view.world_rect_to_screen(&cell);
            self.dynamic_layer.fill_rect(&to_device(screen), rec.color.to_rgba());
        }

        if let Some(((hx, hy), color)) = input.overlay.hover {
            let cell = Rect::new(hx as f64, hy as f64, 1.0, 1.0);
            let screen = to_device(view.world_rect_to_screen(&cell));
            if let Some(c) = color {
                let mut preview = c.to_rgba();
                preview[3] = 128;
                self.dynamic_layer.fill_rect(&screen, preview);
            }
            self.dynamic_layer.stroke_rect(&screen, dpr.max(1.0), PREVIEW_OUTLINE);
        }

        if let Some(stamp) = input.overlay.stamp {
            let screen = to_device(view.world_rect_to_screen(&stamp));
            self.dynamic_layer.stroke_rect(&screen, (2.0 * dpr).max(1.0), STAMP_OUTLINE);
            let hs = HANDLE_SIZE * dpr;
            for (cx, cy) in [
                (screen.x, screen.y),
                (screen.right(), screen.y),
                (screen.x, screen.bottom()),
                (screen.right(), screen.bottom()),
            ] {
                let handle = Rect::new(cx - hs / 2.0, cy - hs / 2.0, hs, hs);
                self.dynamic_layer.fill_rect(&handle, HANDLE_FILL);
                self.dynamic_layer.stroke_rect(&handle, dpr.max(1.0), STAMP_OUTLINE);
            }
        }

        self.dynamic_redraws += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn setup() -> (RenderPipeline, PixelStore, ViewTransform) {
        let mask = Arc::new(CellMask::full(10));
        let mut pipeline = RenderPipeline::new(1.0);
        pipeline.set_mask(mask.clone());
        pipeline.resize(100.0, 100.0, 1.0);
        let store = PixelStore::new(mask, Arc::new(ManualClock::new(0)), 1000);
        let mut view = ViewTransform::new(0.25, 64.0);
        view.set_scale(10.0);
        (pipeline, store, view)
    }

    #[test]
    fn redraw_requests_are_coalesced() {
        let (mut pipeline, store, view) = setup();
        let overlay = Overlay::default();
        pipeline.request_redraw();
        pipeline.request_redraw();
        pipeline.request_redraw();
        let input = FrameInput { store: &store, view: &view, overlay: &overlay };
        assert!(pipeline.frame(&input));
        assert!(!pipeline.frame(&input));
        assert_eq!(pipeline.dynamic_redraws, 1);
    }

    #[test]
    fn static_layer_rebuilt_only_on_size_or_mask_change() {
        let (mut pipeline, store, view) = setup();
        let overlay = Overlay::default();
        for _ in 0..3 {
            pipeline.request_redraw();
            pipeline.frame(&FrameInput { store: &store, view: &view, overlay: &overlay });
        }
        assert_eq!(pipeline.static_redraws, 1);

        assert!(!pipeline.resize(100.0, 100.0, 1.0));
        assert!(pipeline.resize(100.0, 100.0, 2.0));
        assert_eq!(pipeline.device_size(), (200, 200));
        pipeline.frame(&FrameInput { store: &store, view: &view, overlay: &overlay });
        assert_eq!(pipeline.static_redraws, 2);
    }

    #[test]
    fn cancelled_redraw_does_not_draw() {
        let (mut pipeline, store, view) = setup();
        pipeline.request_redraw();
        pipeline.cancel_redraw();
        let overlay = Overlay::default();
        assert!(!pipeline.frame(&FrameInput { store: &store, view: &view, overlay: &overlay }));
    }

    #[test]
    fn painted_cell_shows_in_composite() {
        let (mut pipeline, mut store, view) = setup();
        store.set(2, 3, HexColor([255, 0, 0]), "a");
        let overlay = Overlay::default();
        pipeline.request_redraw();
        pipeline.frame(&FrameInput { store: &store, view: &view, overlay: &overlay });
        let img = pipeline.composite(&view);
        assert_eq!(*img.get_pixel(25, 35), Rgba([255, 0, 0, 255]));
        // unpainted cell shows the checkerboard
        let bg = *img.get_pixel(55, 55);
        assert!(bg == CHECKER_LIGHT || bg == CHECKER_DARK);
    }

    #[test]
    fn outside_mask_is_dimmed_and_bordered() {
        let cells = (0..100).map(|i| i % 10 < 5).collect();
        let mask = Arc::new(CellMask::from_cells(10, cells));
        let mut pipeline = RenderPipeline::new(1.0);
        pipeline.set_mask(mask.clone());
        pipeline.resize(100.0, 100.0, 1.0);
        let store = PixelStore::new(mask, Arc::new(ManualClock::new(0)), 1000);
        let mut view = ViewTransform::new(0.25, 64.0);
        view.set_scale(10.0);
        let overlay = Overlay::default();
        pipeline.frame(&FrameInput { store: &store, view: &view, overlay: &overlay });
        let img = pipeline.composite(&view);
        assert_eq!(*img.get_pixel(85, 50), OUTSIDE_DIM);
        // right edge of the last mask column carries the boundary
        assert_eq!(*img.get_pixel(49, 50), BOUNDARY);
    }
}
