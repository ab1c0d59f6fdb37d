//! Bitmap drawing context
//!
//! A mutable BGRA drawing surface borrowed from a pooled pixel buffer. The
//! snapshot provider, the text label and the overlay hook all draw through
//! this type, so nothing ever needs a second copy of the frame.

use crate::pipeline::types::PixelFormat;
use font8x8::{UnicodeFonts, BASIC_FONTS};

/// Glyph cell size of the built-in label font
const GLYPH_SIZE: u32 = 8;

/// A BGRA color
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const WHITE: Color = Color::rgb(255, 255, 255);
    pub const TRANSPARENT: Color = Color { r: 0, g: 0, b: 0, a: 0 };

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

/// Drawing surface over a BGRA pixel slice
pub struct BitmapContext<'a> {
    data: &'a mut [u8],
    width: u32,
    height: u32,
    stride: usize,
}

impl<'a> BitmapContext<'a> {
    /// Wrap a tightly packed BGRA buffer of `width * height * 4` bytes
    pub fn new(data: &'a mut [u8], width: u32, height: u32) -> Self {
        let stride = width as usize * PixelFormat::Bgra.bytes_per_pixel();
        debug_assert!(data.len() >= stride * height as usize);
        Self {
            data,
            width,
            height,
            stride,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per row
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Raw BGRA bytes, row-major
    pub fn data(&self) -> &[u8] {
        &*self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut *self.data
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        y as usize * self.stride + x as usize * 4
    }

    /// Read one pixel, `None` outside the surface
    pub fn pixel(&self, x: u32, y: u32) -> Option<Color> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = self.offset(x, y);
        Some(Color {
            b: self.data[i],
            g: self.data[i + 1],
            r: self.data[i + 2],
            a: self.data[i + 3],
        })
    }

    /// Write one pixel without blending; out-of-bounds writes are ignored
    pub fn set_pixel(&mut self, x: u32, y: u32, color: Color) {
        if x >= self.width || y >= self.height {
            return;
        }
        let i = self.offset(x, y);
        self.data[i] = color.b;
        self.data[i + 1] = color.g;
        self.data[i + 2] = color.r;
        self.data[i + 3] = color.a;
    }

    /// Alpha-blend one pixel over the existing content
    pub fn blend_pixel(&mut self, x: u32, y: u32, color: Color) {
        if color.a == 255 {
            self.set_pixel(x, y, color);
            return;
        }
        if color.a == 0 || x >= self.width || y >= self.height {
            return;
        }

        let i = self.offset(x, y);
        let alpha = color.a as f32 / 255.0;
        let mix = |src: u8, dst: u8| {
            (src as f32 * alpha + dst as f32 * (1.0 - alpha)).clamp(0.0, 255.0) as u8
        };

        self.data[i] = mix(color.b, self.data[i]);
        self.data[i + 1] = mix(color.g, self.data[i + 1]);
        self.data[i + 2] = mix(color.r, self.data[i + 2]);
        self.data[i + 3] = 255;
    }

    /// Fill the whole surface
    pub fn clear(&mut self, color: Color) {
        for px in self.data.chunks_exact_mut(4) {
            px.copy_from_slice(&[color.b, color.g, color.r, color.a]);
        }
    }

    /// Fill a rectangle, clipped to the surface
    pub fn fill_rect(&mut self, x: i32, y: i32, width: u32, height: u32, color: Color) {
        self.fill_area(x as i64, y as i64, width as i64, height as i64, color);
    }

    // Coordinates are widened so extents past i32::MAX clip instead of wrapping
    fn fill_area(&mut self, x: i64, y: i64, width: i64, height: i64, color: Color) {
        let x0 = x.clamp(0, self.width as i64) as u32;
        let y0 = y.clamp(0, self.height as i64) as u32;
        let x1 = x.saturating_add(width).clamp(0, self.width as i64) as u32;
        let y1 = y.saturating_add(height).clamp(0, self.height as i64) as u32;

        for py in y0..y1 {
            for px in x0..x1 {
                self.blend_pixel(px, py, color);
            }
        }
    }

    /// Copy a BGRA image into the surface at (x, y), nearest-neighbor scaled
    /// by `scale`, clipped to the surface
    pub fn blit_scaled(
        &mut self,
        src: &[u8],
        src_width: u32,
        src_height: u32,
        x: i32,
        y: i32,
        scale: f64,
    ) {
        if src_width == 0 || src_height == 0 || scale <= 0.0 {
            return;
        }
        let dst_width = (src_width as f64 * scale).round() as i64;
        let dst_height = (src_height as f64 * scale).round() as i64;

        // Only destination rows and columns that land on the surface
        let (x, y) = (x as i64, y as i64);
        let rows = (-y).max(0)..dst_height.min(self.height as i64 - y);
        let columns = (-x).max(0)..dst_width.min(self.width as i64 - x);

        for dy in rows {
            let ty = (y + dy) as u32;
            let sy = ((dy as f64 / scale) as usize).min(src_height as usize - 1);

            for dx in columns.clone() {
                let tx = (x + dx) as u32;
                let sx = ((dx as f64 / scale) as usize).min(src_width as usize - 1);
                let si = (sy * src_width as usize + sx) * 4;
                if si + 3 >= src.len() {
                    continue;
                }
                let di = self.offset(tx, ty);
                self.data[di..di + 4].copy_from_slice(&src[si..si + 4]);
            }
        }
    }

    /// Size in pixels of `text` rendered at the given glyph scale
    pub fn measure_text(text: &str, scale: u32) -> (u32, u32) {
        let scale = scale.max(1);
        let columns = text.lines().map(|l| l.chars().count()).max().unwrap_or(0) as u32;
        let rows = text.lines().count().max(1) as u32;
        (
            columns.saturating_mul(GLYPH_SIZE).saturating_mul(scale),
            rows.saturating_mul(GLYPH_SIZE).saturating_mul(scale),
        )
    }

    /// Draw text with the built-in 8x8 font. Characters without a glyph are
    /// rendered as blanks.
    pub fn draw_text(&mut self, text: &str, x: i32, y: i32, scale: u32, color: Color) {
        let scale = scale.max(1) as i64;
        let cell = GLYPH_SIZE as i64 * scale;

        for (row, line) in text.lines().enumerate() {
            let origin_y = y as i64 + row as i64 * cell;
            if origin_y >= self.height as i64 {
                break;
            }
            for (column, ch) in line.chars().enumerate() {
                let origin_x = x as i64 + column as i64 * cell;
                if origin_x >= self.width as i64 {
                    break;
                }
                let Some(glyph) = BASIC_FONTS.get(ch) else {
                    continue;
                };

                for (gy, bits) in glyph.iter().enumerate() {
                    for gx in 0..GLYPH_SIZE {
                        if bits & (1 << gx) == 0 {
                            continue;
                        }
                        let px = origin_x + gx as i64 * scale;
                        let py = origin_y + gy as i64 * scale;
                        self.fill_area(px, py, scale, scale, color);
                    }
                }
            }
        }
    }
}
