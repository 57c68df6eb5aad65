//! Focus compositing: sharp where salient, heavily blurred elsewhere.

use image::{Rgb, RgbImage};
use imageproc::filter::separable_filter_equal;
use ndarray::{Array2, s};

use crate::patch::CropBounds;
use crate::saliency::{normalize_min_max, resize_bilinear};

pub const BLUR_KERNEL_SIZE: usize = 51;

/// Normalized 1D Gaussian of `size` taps. Sigma follows the OpenCV rule for
/// an unspecified sigma: `0.3 * ((size - 1) / 2 - 1) + 0.8`.
pub fn gaussian_kernel(size: usize) -> Vec<f32> {
    let sigma = 0.3 * ((size as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let center = (size / 2) as f32;
    let mut kernel: Vec<f32> = (0..size)
        .map(|i| {
            let d = i as f32 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

pub fn gaussian_blur(image: &RgbImage) -> RgbImage {
    if image.width() == 0 || image.height() == 0 {
        return image.clone();
    }
    separable_filter_equal(image, &gaussian_kernel(BLUR_KERNEL_SIZE))
}

/// `sharp * mask + blurred * (1 - mask)` per channel, truncated to `u8`.
/// `mask` is `(height, width)` with values in [0, 1].
pub fn blend(sharp: &RgbImage, blurred: &RgbImage, mask: &Array2<f32>) -> RgbImage {
    debug_assert_eq!(sharp.dimensions(), blurred.dimensions());
    debug_assert_eq!(mask.dim(), (sharp.height() as usize, sharp.width() as usize));
    RgbImage::from_fn(sharp.width(), sharp.height(), |x, y| {
        let m = mask[[y as usize, x as usize]];
        let (a, b) = (sharp.get_pixel(x, y), blurred.get_pixel(x, y));
        Rgb([0, 1, 2].map(|c| (a[c] as f32 * m + b[c] as f32 * (1.0 - m)) as u8))
    })
}

/// Per-patch focus: the saliency map is resampled to the crop, renormalized
/// and gamma-lifted with a square root before blending with a blurred copy.
pub fn smart_focus(crop: &RgbImage, saliency: &Array2<f32>) -> RgbImage {
    let (w, h) = (crop.width() as usize, crop.height() as usize);
    if w == 0 || h == 0 {
        return crop.clone();
    }
    let resized = resize_bilinear(saliency.view(), h, w);
    let mask = normalize_min_max(&resized).mapv(f32::sqrt);
    blend(crop, &gaussian_blur(crop), &mask)
}

/// Image-sized saliency accumulator for one request. Only ever raised.
#[derive(Debug, Clone)]
pub struct GlobalMask {
    mask: Array2<f32>,
}

impl GlobalMask {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            mask: Array2::zeros((height as usize, width as usize)),
        }
    }

    /// Resamples `saliency` onto `bounds` and keeps the elementwise maximum.
    pub fn fold(&mut self, bounds: &CropBounds, saliency: &Array2<f32>) {
        if bounds.is_empty() {
            return;
        }
        let (h, w) = (bounds.height() as usize, bounds.width() as usize);
        let resized = resize_bilinear(saliency.view(), h, w);
        let mut region = self.mask.slice_mut(s![
            bounds.y1 as usize..bounds.y2 as usize,
            bounds.x1 as usize..bounds.x2 as usize
        ]);
        region.zip_mut_with(&resized, |current, &new| *current = current.max(new));
    }

    pub fn as_array(&self) -> &Array2<f32> {
        &self.mask
    }
}

/// Whole-image focus from the accumulated mask and a precomputed blur.
pub fn global_focus(original: &RgbImage, blurred: &RgbImage, mask: &GlobalMask) -> RgbImage {
    let mask = mask.as_array().mapv(f32::sqrt);
    blend(original, blurred, &mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_is_normalized_and_symmetric() {
        let k = gaussian_kernel(BLUR_KERNEL_SIZE);
        assert_eq!(k.len(), 51);
        assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!((k[0] - k[50]).abs() < 1e-9);
        assert!(k[25] > k[24] && k[24] > k[0]);
    }

    #[test]
    fn blur_keeps_flat_image_flat() {
        let img = RgbImage::from_pixel(40, 30, Rgb([100, 150, 200]));
        let out = gaussian_blur(&img);
        for p in out.pixels() {
            for c in 0..3 {
                assert!((p[c] as i32 - img.get_pixel(0, 0)[c] as i32).abs() <= 1);
            }
        }
    }

    #[test]
    fn blend_extremes_pick_sources() {
        let sharp = RgbImage::from_pixel(2, 1, Rgb([200, 200, 200]));
        let blurred = RgbImage::from_pixel(2, 1, Rgb([100, 100, 100]));
        let mask = Array2::from_shape_vec((1, 2), vec![1.0, 0.0]).unwrap();
        let out = blend(&sharp, &blurred, &mask);
        assert_eq!(out.get_pixel(0, 0), &Rgb([200, 200, 200]));
        assert_eq!(out.get_pixel(1, 0), &Rgb([100, 100, 100]));
    }

    #[test]
    fn blend_truncates() {
        let sharp = RgbImage::from_pixel(1, 1, Rgb([101, 0, 255]));
        let blurred = RgbImage::from_pixel(1, 1, Rgb([100, 0, 0]));
        let mask = Array2::from_elem((1, 1), 0.5);
        assert_eq!(blend(&sharp, &blurred, &mask).get_pixel(0, 0), &Rgb([100, 0, 127]));
    }

    #[test]
    fn smart_focus_keeps_salient_pixels_sharp() {
        let crop = RgbImage::from_fn(64, 64, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 { Rgb([255, 255, 255]) } else { Rgb([0, 0, 0]) }
        });
        let mut saliency = Array2::<f32>::zeros((256, 256));
        saliency.slice_mut(s![0..128, 0..128]).fill(1.0);
        let out = smart_focus(&crop, &saliency);
        assert_eq!(out.dimensions(), (64, 64));
        // fully salient corner untouched
        assert_eq!(out.get_pixel(2, 2), crop.get_pixel(2, 2));
        // non-salient corner is washed out toward the mean
        let p = out.get_pixel(60, 60)[0];
        assert!(p > 40 && p < 215, "got {p}");
    }

    #[test]
    fn global_mask_never_decreases() {
        let mut mask = GlobalMask::new(300, 200);
        let bounds = CropBounds { x1: 10, y1: 20, x2: 110, y2: 120 };
        let high = Array2::from_elem((256, 256), 0.8);
        let low = Array2::from_elem((256, 256), 0.3);
        mask.fold(&bounds, &high);
        let snapshot = mask.as_array().clone();
        mask.fold(&bounds, &low);
        let overlap = CropBounds { x1: 60, y1: 60, x2: 300, y2: 200 };
        mask.fold(&overlap, &low);
        for (after, before) in mask.as_array().iter().zip(snapshot.iter()) {
            assert!(after >= before);
        }
        assert!((mask.as_array()[[50, 50]] - 0.8).abs() < 1e-6);
        assert!((mask.as_array()[[150, 200]] - 0.3).abs() < 1e-6);
        assert_eq!(mask.as_array()[[0, 0]], 0.0);
    }

    #[test]
    fn global_focus_with_empty_mask_is_the_blur() {
        let original = RgbImage::from_pixel(8, 8, Rgb([250, 10, 10]));
        let blurred = RgbImage::from_pixel(8, 8, Rgb([20, 20, 20]));
        let out = global_focus(&original, &blurred, &GlobalMask::new(8, 8));
        assert_eq!(out, blurred);
    }
}
