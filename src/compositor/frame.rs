//! RGBA frame buffers and the drawing primitives the compositor needs.
//!
//! All buffers are tightly packed 8-bit RGBA, row-major, no padding.

use crate::utils::error::{SessionError, SessionResult};

/// An RGBA color
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgba(0, 0, 0, 255);
    pub const WHITE: Color = Color::rgba(255, 255, 255, 255);
    pub const TRANSPARENT: Color = Color::rgba(0, 0, 0, 0);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Parse `#rrggbb` or `#rrggbbaa`
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim().trim_start_matches('#');
        if hex.len() != 6 && hex.len() != 8 {
            return None;
        }
        let byte = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
        let a = if hex.len() == 8 { byte(6)? } else { 255 };
        Some(Self::rgba(byte(0)?, byte(2)?, byte(4)?, a))
    }

    pub fn to_array(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// Axis-aligned rectangle in surface pixels; may extend past the edges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Grow by `amount` pixels on every side
    pub fn inflate(&self, amount: u32) -> Self {
        Self {
            x: self.x - amount as i32,
            y: self.y - amount as i32,
            width: self.width + amount * 2,
            height: self.height + amount * 2,
        }
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x
            && y >= self.y
            && x < self.x + self.width as i32
            && y < self.y + self.height as i32
    }
}

/// How a source frame is placed when drawn
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawOptions {
    /// Flip horizontally (selfie convention)
    pub mirror: bool,
    /// Global opacity multiplied with the source alpha, 0.0..=1.0
    pub opacity: f32,
}

impl Default for DrawOptions {
    fn default() -> Self {
        Self {
            mirror: false,
            opacity: 1.0,
        }
    }
}

/// An RGBA pixel buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Frame {
    /// Fully transparent frame
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; (width as usize) * (height as usize) * 4],
        }
    }

    pub fn filled(width: u32, height: u32, color: Color) -> Self {
        let mut frame = Self::new(width, height);
        frame.clear(color);
        frame
    }

    /// Wrap raw RGBA data, validating its length
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> SessionResult<Self> {
        let expected = (width as usize) * (height as usize) * 4;
        if data.len() != expected {
            return Err(SessionError::FrameDraw(format!(
                "Frame size mismatch: got {} bytes, expected {} ({}x{}x4)",
                data.len(),
                expected,
                width,
                height
            )));
        }
        Ok(Self { width, height, data })
    }

    /// Frame whose buffer does not match its dimensions
    #[cfg(test)]
    pub(crate) fn corrupted(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; 3],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Pixel at (x, y); transparent when out of bounds
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        if x >= self.width || y >= self.height {
            return [0; 4];
        }
        let idx = self.index(x, y);
        [
            self.data[idx],
            self.data[idx + 1],
            self.data[idx + 2],
            self.data[idx + 3],
        ]
    }

    pub fn clear(&mut self, color: Color) {
        let rgba = color.to_array();
        for px in self.data.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba);
        }
    }

    fn index(&self, x: u32, y: u32) -> usize {
        ((y as usize) * (self.width as usize) + x as usize) * 4
    }

    fn check(&self) -> SessionResult<()> {
        let expected = (self.width as usize) * (self.height as usize) * 4;
        if self.data.len() != expected {
            return Err(SessionError::FrameDraw(format!(
                "Corrupt {}x{} frame: {} bytes",
                self.width,
                self.height,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Blend one source pixel over (x, y) with the given extra opacity
    fn blend_pixel(&mut self, x: u32, y: u32, src: [u8; 4], opacity: f32) {
        let src_a = (src[3] as f32 / 255.0) * opacity;
        if src_a < 0.004 {
            return;
        }
        let idx = self.index(x, y);
        if src_a >= 0.996 {
            self.data[idx..idx + 4].copy_from_slice(&[src[0], src[1], src[2], 255]);
            return;
        }
        for c in 0..3 {
            let dst = self.data[idx + c] as f32;
            let out = src[c] as f32 * src_a + dst * (1.0 - src_a);
            self.data[idx + c] = out.round().clamp(0.0, 255.0) as u8;
        }
        let dst_a = self.data[idx + 3] as f32 / 255.0;
        let out_a = src_a + dst_a * (1.0 - src_a);
        self.data[idx + 3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
    }

    /// Draw `src` stretched over the whole frame
    pub fn draw_scaled(&mut self, src: &Frame, options: DrawOptions) -> SessionResult<()> {
        let dest = Rect::new(0, 0, self.width, self.height);
        self.draw_into(src, dest, options)
    }

    /// Draw `src` scaled (nearest neighbour) into `dest`, clipped to the frame
    pub fn draw_into(&mut self, src: &Frame, dest: Rect, options: DrawOptions) -> SessionResult<()> {
        src.check()?;
        self.check()?;
        if src.is_empty() || dest.width == 0 || dest.height == 0 {
            return Ok(());
        }
        let opacity = options.opacity.clamp(0.0, 1.0);
        if opacity <= 0.0 {
            return Ok(());
        }

        for dy in 0..dest.height {
            let fy = dest.y + dy as i32;
            if fy < 0 || fy >= self.height as i32 {
                continue;
            }
            let sy = ((dy as u64 * src.height as u64) / dest.height as u64) as u32;
            let sy = sy.min(src.height - 1);

            for dx in 0..dest.width {
                let fx = dest.x + dx as i32;
                if fx < 0 || fx >= self.width as i32 {
                    continue;
                }
                let sx = ((dx as u64 * src.width as u64) / dest.width as u64) as u32;
                let sx = sx.min(src.width - 1);
                let sx = if options.mirror { src.width - 1 - sx } else { sx };

                let px = src.pixel(sx, sy);
                self.blend_pixel(fx as u32, fy as u32, px, opacity);
            }
        }
        Ok(())
    }

    /// Alpha-blended solid fill, clipped to the frame
    pub fn fill_rect(&mut self, rect: Rect, color: Color) {
        let rgba = color.to_array();
        let x0 = rect.x.max(0);
        let y0 = rect.y.max(0);
        let x1 = (rect.x + rect.width as i32).min(self.width as i32);
        let y1 = (rect.y + rect.height as i32).min(self.height as i32);
        for y in y0..y1 {
            for x in x0..x1 {
                self.blend_pixel(x as u32, y as u32, rgba, 1.0);
            }
        }
    }

    /// Rectangle outline of the given thickness drawn inside `rect`
    pub fn stroke_rect(&mut self, rect: Rect, thickness: u32, color: Color) {
        if thickness == 0 {
            return;
        }
        let t = thickness.min(rect.width / 2 + 1).min(rect.height / 2 + 1);
        let bottom = rect.y + rect.height as i32 - t as i32;
        let right = rect.x + rect.width as i32 - t as i32;
        let inner_height = rect.height.saturating_sub(t * 2);

        self.fill_rect(Rect::new(rect.x, rect.y, rect.width, t), color);
        self.fill_rect(Rect::new(rect.x, bottom, rect.width, t), color);
        self.fill_rect(Rect::new(rect.x, rect.y + t as i32, t, inner_height), color);
        self.fill_rect(Rect::new(right, rect.y + t as i32, t, inner_height), color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_pixel_frame() -> Frame {
        // left red, right blue
        Frame::from_rgba(2, 1, vec![255, 0, 0, 255, 0, 0, 255, 255]).unwrap()
    }

    #[test]
    fn test_from_rgba_rejects_wrong_size() {
        let err = Frame::from_rgba(2, 2, vec![0; 15]).unwrap_err();
        assert!(matches!(err, SessionError::FrameDraw(_)));
    }

    #[test]
    fn test_mirror_flips_horizontally() {
        let src = two_pixel_frame();
        let mut dst = Frame::new(4, 2);
        dst.draw_scaled(&src, DrawOptions { mirror: true, opacity: 1.0 }).unwrap();

        assert_eq!(dst.pixel(0, 0), [0, 0, 255, 255]);
        assert_eq!(dst.pixel(3, 1), [255, 0, 0, 255]);
    }

    #[test]
    fn test_scaled_draw_without_mirror() {
        let src = two_pixel_frame();
        let mut dst = Frame::new(4, 2);
        dst.draw_scaled(&src, DrawOptions::default()).unwrap();

        assert_eq!(dst.pixel(1, 0), [255, 0, 0, 255]);
        assert_eq!(dst.pixel(2, 0), [0, 0, 255, 255]);
    }

    #[test]
    fn test_opacity_blends() {
        let src = Frame::filled(1, 1, Color::WHITE);
        let mut dst = Frame::filled(1, 1, Color::BLACK);
        dst.draw_scaled(&src, DrawOptions { mirror: false, opacity: 0.4 }).unwrap();

        let [r, g, b, a] = dst.pixel(0, 0);
        assert_eq!((r, g, b), (102, 102, 102));
        assert_eq!(a, 255);
    }

    #[test]
    fn test_fill_and_stroke_clip_to_bounds() {
        let mut frame = Frame::filled(10, 10, Color::BLACK);
        frame.fill_rect(Rect::new(8, 8, 5, 5), Color::WHITE);
        assert_eq!(frame.pixel(9, 9), [255, 255, 255, 255]);
        assert_eq!(frame.pixel(7, 7), [0, 0, 0, 255]);

        frame.stroke_rect(Rect::new(0, 0, 6, 6), 1, Color::rgba(255, 0, 0, 255));
        assert_eq!(frame.pixel(0, 3), [255, 0, 0, 255]);
        assert_eq!(frame.pixel(5, 5), [255, 0, 0, 255]);
        assert_eq!(frame.pixel(2, 2), [0, 0, 0, 255]);
    }

    #[test]
    fn test_corrupt_source_is_a_draw_error() {
        let bad = Frame {
            width: 4,
            height: 4,
            data: vec![0; 3],
        };
        let mut dst = Frame::new(2, 2);
        assert!(dst.draw_scaled(&bad, DrawOptions::default()).is_err());
    }

    #[test]
    fn test_hex_colors() {
        assert_eq!(Color::from_hex("#ff8000"), Some(Color::rgba(255, 128, 0, 255)));
        assert_eq!(Color::from_hex("00000080"), Some(Color::rgba(0, 0, 0, 128)));
        assert_eq!(Color::from_hex("#xyz"), None);
    }
}
