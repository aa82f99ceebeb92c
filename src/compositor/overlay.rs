//! Branding overlay
//!
//! The event logo, loaded asynchronously from an ordered list of candidate
//! locations. Until (or unless) it loads, a text badge rendered from a
//! built-in bitmap font stands in, so the corner is never blank.

use super::frame::{Color, Frame, Rect};
use crate::services::AssetLoader;
use crate::utils::error::{SessionError, SessionResult};
use crate::utils::fallback::try_each;
use parking_lot::RwLock;
use std::io::Cursor;
use std::sync::Arc;

/// Default badge background (deep violet)
pub const DEFAULT_BADGE_BACKGROUND: Color = Color::rgba(88, 28, 135, 255);

const BADGE_WIDTH: u32 = 240;
const BADGE_HEIGHT: u32 = 80;
const BADGE_PADDING: u32 = 10;

/// The logo layer shared by the compositor and the loader
pub struct BrandingOverlay {
    logo: RwLock<Option<Arc<Frame>>>,
    badge_text: String,
    badge: RwLock<Arc<Frame>>,
}

impl BrandingOverlay {
    pub fn new(badge_text: &str, badge_background: Color) -> Self {
        Self {
            logo: RwLock::new(None),
            badge_text: badge_text.to_string(),
            badge: RwLock::new(Arc::new(render_badge(
                badge_text,
                badge_background,
                Color::WHITE,
                BADGE_WIDTH,
                BADGE_HEIGHT,
            ))),
        }
    }

    /// Logo if loaded, otherwise the fallback badge. Never blocks on loading.
    pub fn current(&self) -> Arc<Frame> {
        match self.logo.read().clone() {
            Some(logo) => logo,
            None => self.badge(),
        }
    }

    pub fn is_logo_loaded(&self) -> bool {
        self.logo.read().is_some()
    }

    pub fn badge(&self) -> Arc<Frame> {
        self.badge.read().clone()
    }

    /// Re-render the badge on an event's brand color
    pub fn set_badge_background(&self, background: Color) {
        let badge = render_badge(
            &self.badge_text,
            background,
            Color::WHITE,
            BADGE_WIDTH,
            BADGE_HEIGHT,
        );
        *self.badge.write() = Arc::new(badge);
    }

    pub fn set_logo(&self, logo: Frame) {
        *self.logo.write() = Some(Arc::new(logo));
    }

    /// Try each candidate location in order; the first decodable PNG wins.
    pub async fn load(&self, loader: &dyn AssetLoader, candidates: &[String]) -> SessionResult<()> {
        let result = try_each(candidates.iter(), |url| async move {
            let bytes = loader
                .fetch(url)
                .await
                .map_err(|e| SessionError::OverlayLoad(format!("{}: {}", url, e)))?;
            let frame = decode_png(&bytes)
                .map_err(|e| SessionError::OverlayLoad(format!("{}: {}", url, e)))?;
            tracing::info!(
                "Loaded logo from {} ({}x{})",
                url,
                frame.width(),
                frame.height()
            );
            Ok::<_, SessionError>(frame)
        })
        .await;

        match result {
            Ok(frame) => {
                self.set_logo(frame);
                Ok(())
            }
            Err(failures) if failures.is_empty() => Err(SessionError::OverlayLoad(
                "no logo configured".to_string(),
            )),
            Err(failures) => Err(failures
                .into_last()
                .unwrap_or_else(|| SessionError::OverlayLoad("logo unavailable".to_string()))),
        }
    }
}

/// Decode a PNG into an RGBA frame
pub fn decode_png(bytes: &[u8]) -> SessionResult<Frame> {
    let mut decoder = png::Decoder::new(Cursor::new(bytes));
    decoder.set_transformations(png::Transformations::normalize_to_color8());
    let mut reader = decoder
        .read_info()
        .map_err(|e| SessionError::OverlayLoad(format!("PNG decode error: {}", e)))?;

    let mut buf = vec![0; reader.output_buffer_size()];
    let info = reader
        .next_frame(&mut buf)
        .map_err(|e| SessionError::OverlayLoad(format!("PNG frame error: {}", e)))?;
    let pixels = &buf[..info.buffer_size()];

    // Convert to RGBA if needed
    let data = match info.color_type {
        png::ColorType::Rgba => pixels.to_vec(),
        png::ColorType::Rgb => pixels
            .chunks_exact(3)
            .flat_map(|px| [px[0], px[1], px[2], 255])
            .collect(),
        png::ColorType::GrayscaleAlpha => pixels
            .chunks_exact(2)
            .flat_map(|px| [px[0], px[0], px[0], px[1]])
            .collect(),
        png::ColorType::Grayscale => pixels.iter().flat_map(|&v| [v, v, v, 255]).collect(),
        other => {
            return Err(SessionError::OverlayLoad(format!(
                "Unsupported PNG color type: {:?}",
                other
            )))
        }
    };

    Frame::from_rgba(info.width, info.height, data)
        .map_err(|e| SessionError::OverlayLoad(e.to_string()))
}

/// Render `text` centered on a solid badge
pub fn render_badge(
    text: &str,
    background: Color,
    foreground: Color,
    width: u32,
    height: u32,
) -> Frame {
    let mut frame = Frame::filled(width, height, background);
    let text: Vec<char> = text.trim().to_uppercase().chars().take(12).collect();
    if text.is_empty() {
        return frame;
    }

    // 3x5 glyphs with a one-cell gap between letters
    let cells_wide = text.len() as u32 * 4 - 1;
    let scale = ((width.saturating_sub(BADGE_PADDING * 2)) / cells_wide)
        .min(height.saturating_sub(BADGE_PADDING * 2) / 5)
        .max(1);

    let text_width = cells_wide * scale;
    let text_height = 5 * scale;
    let origin_x = (width.saturating_sub(text_width) / 2) as i32;
    let origin_y = (height.saturating_sub(text_height) / 2) as i32;

    for (i, ch) in text.iter().enumerate() {
        let rows = glyph(*ch);
        let glyph_x = origin_x + (i as u32 * 4 * scale) as i32;
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..3u32 {
                if bits & (0b100 >> col) == 0 {
                    continue;
                }
                frame.fill_rect(
                    Rect::new(
                        glyph_x + (col * scale) as i32,
                        origin_y + (row as u32 * scale) as i32,
                        scale,
                        scale,
                    ),
                    foreground,
                );
            }
        }
    }
    frame
}

/// 3x5 bitmap rows, most significant of the three bits on the left
fn glyph(ch: char) -> [u8; 5] {
    match ch {
        'A' => [0b010, 0b101, 0b111, 0b101, 0b101],
        'B' => [0b110, 0b101, 0b110, 0b101, 0b110],
        'C' => [0b011, 0b100, 0b100, 0b100, 0b011],
        'D' => [0b110, 0b101, 0b101, 0b101, 0b110],
        'E' => [0b111, 0b100, 0b110, 0b100, 0b111],
        'F' => [0b111, 0b100, 0b110, 0b100, 0b100],
        'G' => [0b011, 0b100, 0b101, 0b101, 0b011],
        'H' => [0b101, 0b101, 0b111, 0b101, 0b101],
        'I' => [0b111, 0b010, 0b010, 0b010, 0b111],
        'J' => [0b001, 0b001, 0b001, 0b101, 0b010],
        'K' => [0b101, 0b101, 0b110, 0b101, 0b101],
        'L' => [0b100, 0b100, 0b100, 0b100, 0b111],
        'M' => [0b101, 0b111, 0b111, 0b101, 0b101],
        'N' => [0b110, 0b101, 0b101, 0b101, 0b101],
        'O' => [0b010, 0b101, 0b101, 0b101, 0b010],
        'P' => [0b110, 0b101, 0b110, 0b100, 0b100],
        'Q' => [0b010, 0b101, 0b101, 0b110, 0b011],
        'R' => [0b110, 0b101, 0b110, 0b101, 0b101],
        'S' => [0b011, 0b100, 0b010, 0b001, 0b110],
        'T' => [0b111, 0b010, 0b010, 0b010, 0b010],
        'U' => [0b101, 0b101, 0b101, 0b101, 0b111],
        'V' => [0b101, 0b101, 0b101, 0b101, 0b010],
        'W' => [0b101, 0b101, 0b111, 0b111, 0b101],
        'X' => [0b101, 0b101, 0b010, 0b101, 0b101],
        'Y' => [0b101, 0b101, 0b010, 0b010, 0b010],
        'Z' => [0b111, 0b001, 0b010, 0b100, 0b111],
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b110, 0b001, 0b010, 0b100, 0b111],
        '3' => [0b110, 0b001, 0b010, 0b001, 0b110],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b110, 0b001, 0b110],
        '6' => [0b011, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b010, 0b010, 0b010],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b110],
        '-' => [0b000, 0b000, 0b111, 0b000, 0b000],
        '!' => [0b010, 0b010, 0b010, 0b000, 0b010],
        ' ' => [0; 5],
        _ => [0b110, 0b001, 0b010, 0b000, 0b010],
    }
}
