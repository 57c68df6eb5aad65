use fast_image_resize::images::{Image, ImageRef};
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use image::{Rgb, RgbImage};
use ndarray::{Array4, s};
use rayon::prelude::*;

use crate::error::ModelError;

/// Letterbox settings of the detector input.
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    pub height: u32,
    pub width: u32,
    pub fill: [u8; 3],
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            height: 640,
            width: 640,
            fill: [114, 114, 114],
        }
    }
}

/// A letterboxed detector input and the transform back to source pixels.
#[derive(Debug)]
pub struct Letterbox {
    pub tensor: Array4<f32>,
    pub scale: f32,
    pub pad_x: u32,
    pub pad_y: u32,
    pub source_width: u32,
    pub source_height: u32,
}

impl Letterbox {
    /// Maps a point of the letterboxed input back onto the source image.
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

#[derive(Debug, Default)]
pub struct Processor {
    pub config: PreprocessConfig,
}

impl Processor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Letterbox a batch of windows in parallel.
    pub fn preprocess(&self, xs: &[RgbImage]) -> Result<Vec<Letterbox>, ModelError> {
        xs.par_iter().map(|x| self.letterbox(x)).collect()
    }

    /// Resize with preserved aspect ratio, pad to the target size and
    /// convert to a normalized NCHW tensor.
    pub fn letterbox(&self, x: &RgbImage) -> Result<Letterbox, ModelError> {
        let (orig_width, orig_height) = x.dimensions();
        let scale = (self.config.width as f32 / orig_width as f32)
            .min(self.config.height as f32 / orig_height as f32);
        let new_width = ((orig_width as f32 * scale).round() as u32).clamp(1, self.config.width);
        let new_height = ((orig_height as f32 * scale).round() as u32).clamp(1, self.config.height);

        let resized = resize_rgb(x, new_width, new_height)?;
        let mut padded = RgbImage::from_pixel(self.config.width, self.config.height, Rgb(self.config.fill));
        let pad_x = (self.config.width - new_width) / 2;
        let pad_y = (self.config.height - new_height) / 2;
        image::imageops::overlay(&mut padded, &resized, pad_x as i64, pad_y as i64);

        let (w, h) = (self.config.width as usize, self.config.height as usize);
        let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
        for (x, y, rgb) in padded.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            tensor[[0, 0, y, x]] = rgb[0] as f32 / 255.0;
            tensor[[0, 1, y, x]] = rgb[1] as f32 / 255.0;
            tensor[[0, 2, y, x]] = rgb[2] as f32 / 255.0;
        }

        Ok(Letterbox {
            tensor,
            scale,
            pad_x,
            pad_y,
            source_width: orig_width,
            source_height: orig_height,
        })
    }
}

/// Evaluation transform of the B-cos classifier: shorter side resized to
/// `resize`, centre crop to `crop`, scaled to [0,1] and extended with the
/// inverted channels.
#[derive(Debug, Clone)]
pub struct PatchTransform {
    pub resize: u32,
    pub crop: u32,
}

impl Default for PatchTransform {
    fn default() -> Self {
        Self { resize: 256, crop: 256 }
    }
}

impl PatchTransform {
    pub fn apply(&self, patch: &RgbImage) -> Result<Array4<f32>, ModelError> {
        let (w, h) = patch.dimensions();
        let (new_w, new_h) = if w <= h {
            (self.resize, ((self.resize as f64 * h as f64 / w.max(1) as f64) as u32).max(1))
        } else {
            (((self.resize as f64 * w as f64 / h.max(1) as f64) as u32).max(1), self.resize)
        };
        let resized = if (new_w, new_h) == (w, h) {
            patch.clone()
        } else {
            resize_rgb(patch, new_w, new_h)?
        };

        let top = ((new_h as f64 - self.crop as f64) / 2.0).round().max(0.0) as u32;
        let left = ((new_w as f64 - self.crop as f64) / 2.0).round().max(0.0) as u32;
        let crop = self.crop as usize;

        let mut tensor = Array4::<f32>::zeros((1, 6, crop, crop));
        for y in 0..crop {
            for x in 0..crop {
                let (sx, sy) = (left + x as u32, top + y as u32);
                if sx >= new_w || sy >= new_h {
                    continue;
                }
                let px = resized.get_pixel(sx, sy);
                for c in 0..3 {
                    tensor[[0, c, y, x]] = px[c] as f32 / 255.0;
                }
            }
        }
        let rgb = tensor.slice(s![.., 0..3, .., ..]).mapv(|v| 1.0 - v);
        tensor.slice_mut(s![.., 3..6, .., ..]).assign(&rgb);
        Ok(tensor)
    }
}

/// Bilinear (antialiased) resize of an RGB image.
pub fn resize_rgb(image: &RgbImage, width: u32, height: u32) -> Result<RgbImage, ModelError> {
    let src = ImageRef::new(image.width(), image.height(), image.as_raw(), PixelType::U8x3)?;
    let mut dst = Image::new(width, height, PixelType::U8x3);
    let options = ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear));
    let mut resizer = Resizer::new();
    resizer.resize(&src, &mut dst, Some(&options))?;
    RgbImage::from_raw(width, height, dst.into_vec())
        .ok_or_else(|| ModelError::output("resized buffer has the wrong length"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letterbox_pads_wide_window_vertically() {
        let processor = Processor::default();
        let img = RgbImage::from_pixel(640, 320, Rgb([255, 0, 0]));
        let lb = processor.letterbox(&img).unwrap();
        assert_eq!(lb.tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(lb.pad_x, 0);
        assert_eq!(lb.pad_y, 160);
        assert!((lb.scale - 1.0).abs() < 1e-6);
        // padding row keeps the fill colour
        assert!((lb.tensor[[0, 0, 10, 10]] - 114.0 / 255.0).abs() < 1e-6);
        // content row is red
        assert!((lb.tensor[[0, 0, 320, 320]] - 1.0).abs() < 1e-6);
        assert_eq!(lb.tensor[[0, 1, 320, 320]], 0.0);
        let (x, y) = lb.to_source(320.0, 320.0);
        assert!((x - 320.0).abs() < 1e-4 && (y - 160.0).abs() < 1e-4);
    }

    #[test]
    fn odd_padding_puts_the_extra_row_at_the_bottom() {
        let processor = Processor::default();
        let img = RgbImage::from_pixel(640, 319, Rgb([0, 255, 0]));
        let lb = processor.letterbox(&img).unwrap();
        // 321 rows of padding: 160 above, 161 below
        assert_eq!(lb.pad_y, 160);
        assert!((lb.tensor[[0, 1, 159, 0]] - 114.0 / 255.0).abs() < 1e-6);
        assert!((lb.tensor[[0, 1, 160, 0]] - 1.0).abs() < 1e-6);
        assert!((lb.tensor[[0, 1, 478, 0]] - 1.0).abs() < 1e-6);
        assert!((lb.tensor[[0, 1, 479, 0]] - 114.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn letterbox_upscales_small_window() {
        let processor = Processor::default();
        let img = RgbImage::from_pixel(512, 512, Rgb([10, 20, 30]));
        let lb = processor.letterbox(&img).unwrap();
        assert!((lb.scale - 1.25).abs() < 1e-6);
        assert_eq!((lb.pad_x, lb.pad_y), (0, 0));
        let (x, y) = lb.to_source(640.0, 320.0);
        assert!((x - 512.0).abs() < 1e-3 && (y - 256.0).abs() < 1e-3);
    }

    #[test]
    fn preprocess_keeps_batch_order() {
        let processor = Processor::default();
        let xs = vec![
            RgbImage::from_pixel(100, 50, Rgb([0, 0, 0])),
            RgbImage::from_pixel(50, 100, Rgb([0, 0, 0])),
        ];
        let out = processor.preprocess(&xs).unwrap();
        assert_eq!(out[0].source_width, 100);
        assert_eq!(out[1].source_width, 50);
    }

    #[test]
    fn patch_transform_appends_inverse_channels() {
        let transform = PatchTransform::default();
        let patch = RgbImage::from_fn(256, 256, |x, y| Rgb([x as u8, y as u8, 200]));
        let t = transform.apply(&patch).unwrap();
        assert_eq!(t.shape(), &[1, 6, 256, 256]);
        for (y, x) in [(0, 0), (17, 99), (255, 255)] {
            for c in 0..3 {
                let sum = t[[0, c, y, x]] + t[[0, c + 3, y, x]];
                assert!((sum - 1.0).abs() < 1e-6);
            }
        }
        assert!((t[[0, 0, 17, 99]] - 99.0 / 255.0).abs() < 1e-6);
        assert!((t[[0, 2, 3, 3]] - 200.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn patch_transform_resizes_and_crops_to_square() {
        let transform = PatchTransform::default();
        let patch = RgbImage::from_pixel(128, 64, Rgb([50, 50, 50]));
        let t = transform.apply(&patch).unwrap();
        assert_eq!(t.shape(), &[1, 6, 256, 256]);
        assert!((t[[0, 0, 128, 128]] - 50.0 / 255.0).abs() < 0.01);
    }

    #[test]
    fn resize_rgb_produces_requested_size() {
        let img = RgbImage::from_pixel(33, 17, Rgb([1, 2, 3]));
        let out = resize_rgb(&img, 64, 40).unwrap();
        assert_eq!(out.dimensions(), (64, 40));
        assert_eq!(out.get_pixel(10, 10), &Rgb([1, 2, 3]));
    }
}
