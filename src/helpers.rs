use std::io::Cursor;
use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

/// Stage 1 candidates.
pub const CANDIDATE_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
/// Classified mitotic above the confidence gate.
pub const CONFIRMED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LINE_THICKNESS: i32 = 2;
const LABEL_SCALE: f32 = 18.0;
const LABEL_OFFSET: i32 = 10;

/// Draws an outline of `LINE_THICKNESS` pixels, growing outward from the
/// given corners. Parts outside the image are clipped.
pub fn draw_box(image: &mut RgbImage, xyxy: [i32; 4], color: Rgb<u8>) {
    let [x1, y1, x2, y2] = xyxy;
    for t in 0..LINE_THICKNESS {
        let width = x2 - x1 + 1 + 2 * t;
        let height = y2 - y1 + 1 + 2 * t;
        if width <= 0 || height <= 0 {
            continue;
        }
        let rect = Rect::at(x1 - t, y1 - t).of_size(width as u32, height as u32);
        draw_hollow_rect_mut(image, rect, color);
    }
}

/// Label font compiled into the binary, used unless `--font` overrides it.
static LABEL_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

/// Box and label renderer.
pub struct Renderer {
    font: FontArc,
}

impl Default for Renderer {
    fn default() -> Self {
        let font = FontArc::try_from_slice(LABEL_FONT).expect("embedded label font is a valid TTF");
        Self::new(font)
    }
}

impl Renderer {
    pub fn new(font: FontArc) -> Self {
        Self { font }
    }

    /// Loads `path` as the label font, or falls back to the embedded one.
    pub fn from_font_file(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let bytes = std::fs::read(path).with_context(|| format!("reading font {}", path.display()))?;
        let font = FontArc::try_from_vec(bytes).with_context(|| format!("parsing font {}", path.display()))?;
        Ok(Self::new(font))
    }

    pub fn draw_candidate(&self, image: &mut RgbImage, xyxy: [i32; 4]) {
        draw_box(image, xyxy, CANDIDATE_COLOR);
    }

    /// Confirmed box with an `M: 0.85` label ending `LABEL_OFFSET` px above
    /// its top-left corner.
    pub fn draw_confirmed(&self, image: &mut RgbImage, xyxy: [i32; 4], confidence: f32) {
        draw_box(image, xyxy, CONFIRMED_COLOR);
        let label = format!("M: {confidence:.2}");
        let scale = PxScale::from(LABEL_SCALE);
        let (_, text_height) = text_size(scale, &self.font, &label);
        let baseline = xyxy[1] - LABEL_OFFSET;
        draw_text_mut(image, CONFIRMED_COLOR, xyxy[0], baseline - text_height as i32, scale, &self.font, &label);
    }
}

/// PNG-encodes the image and returns it as standard base64.
pub fn encode_png_base64(image: &RgbImage) -> Result<String, image::ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(B64.encode(buffer.into_inner()))
}
