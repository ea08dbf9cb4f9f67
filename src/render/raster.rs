//! Rasterization seam.
//!
//! Vector and text rasterization proper is supplied by an external 2-D
//! graphics implementation behind the [`Rasterizer`] trait; the engine only
//! ever consumes measured ink bounds and finished pixels. The deterministic
//! [`BlockRasterizer`] ships in-tree as the default and test
//! implementation: monospaced filled cells with fixed metrics, so layout
//! and diffing behavior is pixel-exact without a font stack.

use crate::error::{DisplayError, Result};
use crate::render::color::{is_color, parse_color};
use image::{Rgba, RgbaImage};

/// Font selection for text drawing. `weight` is 100..=900 or 0 (unset),
/// `width` is 1..=9 or 0 (unset).
#[derive(Debug, Clone, Default)]
pub struct FontSpec {
    pub family: Option<String>,
    pub size: f32,
    pub weight: u32,
    pub width: u32,
    pub bold: bool,
}

/// Ink bounding box relative to the baseline draw origin. `top` is
/// negative for glyphs above the baseline.
#[derive(Debug, Clone, Copy)]
pub struct InkBounds {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl InkBounds {
    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn mid_x(&self) -> f32 {
        (self.left + self.right) / 2.0
    }

    pub fn mid_y(&self) -> f32 {
        (self.top + self.bottom) / 2.0
    }
}

/// Measured text: total advance plus the ink bounds.
#[derive(Debug, Clone, Copy)]
pub struct TextMetrics {
    pub advance: f32,
    pub ink: InkBounds,
}

/// Placement derived from metrics and the requested alignment: the offsets
/// to add to the anchor when drawing, plus the resulting ink rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextLayout {
    pub hoffset: i32,
    pub voffset: i32,
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

/// Derive per-alignment offsets so the anchor `(x, y)` lands on the same
/// visual edge regardless of font and size. Horizontal: -1 left, 0 center,
/// 1 right. Vertical: -1 top, 0 middle, 1 bottom.
pub fn layout_text(metrics: &TextMetrics, x: i32, y: i32, horiz: i8, vert: i8) -> TextLayout {
    let width = metrics.advance;
    let ink = metrics.ink;

    let (hoffset, left) = match horiz {
        -1 => (0.0, x as f32 + ink.left),
        1 => (1.0 - width - ink.left, x as f32 - width + 1.0),
        _ => (0.0 - ink.mid_x(), x as f32 - ink.mid_x() + ink.left),
    };
    let (voffset, top) = match vert {
        -1 => (0.0 - ink.top, y as f32),
        1 => (0.0, y as f32 + ink.top),
        _ => (1.0 - ink.mid_y(), y as f32 - ink.mid_y() + ink.top + 1.0),
    };

    TextLayout {
        hoffset: hoffset.round() as i32,
        voffset: voffset.round() as i32,
        left: left.round() as i32,
        top: top.round() as i32,
        width: width.round() as u32,
        height: ink.height().round() as u32,
    }
}

/// Pixel supplier for text and vector fragments.
pub trait Rasterizer: Send + Sync {
    /// Measure `text` without drawing. Fails for unknown fonts or invalid
    /// specs.
    fn measure_text(&self, text: &str, font: &FontSpec) -> Result<TextMetrics>;

    /// Draw `text` with its baseline origin at `(x, y)`, clipped to the
    /// canvas.
    fn draw_text(
        &self,
        canvas: &mut RgbaImage,
        x: i32,
        y: i32,
        text: &str,
        font: &FontSpec,
        color: Rgba<u8>,
    ) -> Result<()>;

    /// Rasterize a vector fragment wrapped in a fixed `width`×`height`
    /// canvas.
    fn draw_fragment(&self, width: u32, height: u32, fragment: &str) -> Result<RgbaImage>;
}

/// Deterministic built-in rasterizer: every glyph is a filled cell of
/// `0.6 × size` advance, ink spanning `size` above the baseline.
/// Whitespace advances without ink. Bold fills the whole cell (no gap),
/// which also makes it suitable for overpainting previous text.
#[derive(Debug, Default)]
pub struct BlockRasterizer;

impl BlockRasterizer {
    fn cell_advance(size: f32) -> f32 {
        (size * 0.6).round().max(1.0)
    }
}

impl Rasterizer for BlockRasterizer {
    fn measure_text(&self, text: &str, font: &FontSpec) -> Result<TextMetrics> {
        if font.size <= 0.0 {
            return Err(DisplayError::validation(
                "fontSize",
                "font size must be greater than zero",
            ));
        }
        let advance = Self::cell_advance(font.size) * text.chars().count() as f32;
        Ok(TextMetrics {
            advance,
            ink: InkBounds {
                left: 0.0,
                top: -font.size,
                right: advance,
                bottom: 0.0,
            },
        })
    }

    fn draw_text(
        &self,
        canvas: &mut RgbaImage,
        x: i32,
        y: i32,
        text: &str,
        font: &FontSpec,
        color: Rgba<u8>,
    ) -> Result<()> {
        let cell = Self::cell_advance(font.size) as i32;
        let height = font.size.round() as i32;
        let fill = if font.bold || font.weight >= 600 {
            cell
        } else {
            (cell - 1).max(1)
        };
        for (i, ch) in text.chars().enumerate() {
            if ch.is_whitespace() {
                continue;
            }
            let gx = x + i as i32 * cell;
            fill_rect(canvas, gx, y - height, fill as u32, height as u32, color);
        }
        Ok(())
    }

    fn draw_fragment(&self, width: u32, height: u32, fragment: &str) -> Result<RgbaImage> {
        if is_color(fragment) {
            let color = parse_color(fragment)?;
            return Ok(RgbaImage::from_pixel(width, height, color));
        }
        Err(DisplayError::validation(
            "svgCommands",
            "the block rasterizer only renders solid color fragments",
        ))
    }
}

/// Fill a rectangle on the canvas, clipping to its bounds.
pub fn fill_rect(canvas: &mut RgbaImage, x: i32, y: i32, width: u32, height: u32, color: Rgba<u8>) {
    let (cw, ch) = canvas.dimensions();
    let x0 = x.max(0) as u32;
    let y0 = y.max(0) as u32;
    let x1 = (x + width as i32).clamp(0, cw as i32) as u32;
    let y1 = (y + height as i32).clamp(0, ch as i32) as u32;
    for py in y0..y1 {
        for px in x0..x1 {
            canvas.put_pixel(px, py, color);
        }
    }
}
