use image::{Rgba, RgbaImage};

use crate::view::Rect;

/// A drawable 2D target measured in device pixels.
pub trait Surface {
    fn size(&self) -> (u32, u32);
    fn resize(&mut self, width: u32, height: u32);
    fn clear(&mut self, color: Rgba<u8>);
    /// Alpha-blend a filled rectangle.
    fn fill_rect(&mut self, rect: &Rect, color: Rgba<u8>);
    fn pixel(&self, x: u32, y: u32) -> Rgba<u8>;

    /// Outline drawn inside `rect`, `width` device pixels thick.
    fn stroke_rect(&mut self, rect: &Rect, width: f64, color: Rgba<u8>) {
        let w = width.min(rect.width / 2.0).min(rect.height / 2.0).max(0.0);
        self.fill_rect(&Rect::new(rect.x, rect.y, rect.width, w), color);
        self.fill_rect(&Rect::new(rect.x, rect.bottom() - w, rect.width, w), color);
        self.fill_rect(&Rect::new(rect.x, rect.y + w, w, rect.height - 2.0 * w), color);
        self.fill_rect(&Rect::new(rect.right() - w, rect.y + w, w, rect.height - 2.0 * w), color);
    }
}

/// CPU surface backed by an `RgbaImage` (straight alpha).
#[derive(Clone, Debug)]
pub struct RasterSurface {
    image: RgbaImage,
}

impl Default for RasterSurface {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl RasterSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    /// Blend one pixel without bounds checks beyond the image's own.
    pub fn blend_pixel(&mut self, x: u32, y: u32, color: Rgba<u8>) {
        let dst = self.image.get_pixel_mut(x, y);
        *dst = blend_over(*dst, color);
    }
}

impl Surface for RasterSurface {
    fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn resize(&mut self, width: u32, height: u32) {
        if self.image.dimensions() != (width, height) {
            self.image = RgbaImage::new(width, height);
        }
    }

    fn clear(&mut self, color: Rgba<u8>) {
        for p in self.image.pixels_mut() {
            *p = color;
        }
    }

    fn fill_rect(&mut self, rect: &Rect, color: Rgba<u8>) {
        let (w, h) = self.image.dimensions();
        // Pixel-centre coverage: a pixel is inside when its centre is.
        let x0 = (rect.x.round().max(0.0) as u32).min(w);
        let y0 = (rect.y.round().max(0.0) as u32).min(h);
        let x1 = (rect.right().round().max(0.0) as u32).min(w);
        let y1 = (rect.bottom().round().max(0.0) as u32).min(h);
        if color[3] == 255 {
            for y in y0..y1 {
                for x in x0..x1 {
                    self.image.put_pixel(x, y, color);
                }
            }
        } else if color[3] > 0 {
            for y in y0..y1 {
                for x in x0..x1 {
                    self.blend_pixel(x, y, color);
                }
            }
        }
    }

    fn pixel(&self, x: u32, y: u32) -> Rgba<u8> {
        *self.image.get_pixel(x, y)
    }
}

/// Porter-Duff "over" for straight-alpha colors.
pub fn blend_over(base: Rgba<u8>, top: Rgba<u8>) -> Rgba<u8> {
    let ta = top[3] as f32 / 255.0;
    if ta >= 1.0 {
        return top;
    }
    if ta <= 0.0 {
        return base;
    }
    let ba = base[3] as f32 / 255.0;
    let out_a = ta + ba * (1.0 - ta);
    if out_a <= 0.0 {
        return Rgba([0, 0, 0, 0]);
    }
    let mut out = [0u8; 4];
    for i in 0..3 {
        let c = (top[i] as f32 * ta + base[i] as f32 * ba * (1.0 - ta)) / out_a;
        out[i] = c.round().clamp(0.0, 255.0) as u8;
    }
    out[3] = (out_a * 255.0).round() as u8;
    Rgba(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_rect_clips_to_surface() {
        let mut s = RasterSurface::new(4, 4);
        s.fill_rect(&Rect::new(-2.0, 2.0, 10.0, 10.0), Rgba([9, 9, 9, 255]));
        assert_eq!(s.pixel(0, 1)[3], 0);
        assert_eq!(s.pixel(3, 3), Rgba([9, 9, 9, 255]));
    }

    #[test]
    fn over_blends_half_alpha() {
        let out = blend_over(Rgba([0, 0, 0, 255]), Rgba([255, 255, 255, 128]));
        assert!((out[0] as i32 - 128).abs() <= 1);
        assert_eq!(out[3], 255);
        assert_eq!(blend_over(Rgba([1, 2, 3, 4]), Rgba([0, 0, 0, 0])), Rgba([1, 2, 3, 4]));
    }

    #[test]
    fn stroke_leaves_interior_untouched() {
        let mut s = RasterSurface::new(10, 10);
        s.stroke_rect(&Rect::new(0.0, 0.0, 10.0, 10.0), 1.0, Rgba([255, 0, 0, 255]));
        assert_eq!(s.pixel(0, 5)[0], 255);
        assert_eq!(s.pixel(9, 9)[0], 255);
        assert_eq!(s.pixel(5, 5)[3], 0);
    }

    #[test]
    fn resize_is_noop_when_unchanged() {
        let mut s = RasterSurface::new(3, 3);
        s.clear(Rgba([1, 1, 1, 255]));
        s.resize(3, 3);
        assert_eq!(s.pixel(1, 1), Rgba([1, 1, 1, 255]));
        s.resize(5, 2);
        assert_eq!(s.size(), (5, 2));
    }
}
