//! Stage 3: saliency maps for confident positive patches.

use ndarray::{Array2, Array4, ArrayView2, Axis, s};

use crate::error::ModelError;
use crate::provider::Explainer;

/// Side length every saliency map is resampled to.
pub const SALIENCY_SIZE: usize = 256;
const NORM_EPS: f32 = 1e-8;

/// The classifier input handed to the explainer. Built as a fresh copy so
/// attribution never touches the tensor used for classification.
#[derive(Debug, Clone)]
pub struct DifferentiableInput {
    tensor: Array4<f32>,
}

impl DifferentiableInput {
    pub fn from_tensor(tensor: &Array4<f32>) -> Self {
        Self { tensor: tensor.clone() }
    }

    pub fn tensor(&self) -> &Array4<f32> {
        &self.tensor
    }
}

/// Bilinear resampling with half-pixel centres and no antialiasing.
pub fn resize_bilinear(src: ArrayView2<f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (in_h, in_w) = src.dim();
    if in_h == 0 || in_w == 0 || out_h == 0 || out_w == 0 {
        return Array2::zeros((out_h, out_w));
    }
    let scale_y = in_h as f32 / out_h as f32;
    let scale_x = in_w as f32 / out_w as f32;
    let coord = |o: usize, scale: f32, len: usize| {
        let pos = ((o as f32 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (pos.floor() as usize).min(len - 1);
        let i1 = (i0 + 1).min(len - 1);
        (i0, i1, pos - i0 as f32)
    };

    let xs: Vec<_> = (0..out_w).map(|x| coord(x, scale_x, in_w)).collect();
    Array2::from_shape_fn((out_h, out_w), |(y, x)| {
        let (y0, y1, ly) = coord(y, scale_y, in_h);
        let (x0, x1, lx) = xs[x];
        let top = src[[y0, x0]] * (1.0 - lx) + src[[y0, x1]] * lx;
        let bottom = src[[y1, x0]] * (1.0 - lx) + src[[y1, x1]] * lx;
        top * (1.0 - ly) + bottom * ly
    })
}

/// Min-max normalisation into [0, 1]. A constant map becomes all zeros.
pub fn normalize_min_max(map: &Array2<f32>) -> Array2<f32> {
    let min = map.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = map.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if !min.is_finite() || !max.is_finite() {
        return Array2::zeros(map.dim());
    }
    let denom = max - min + NORM_EPS;
    map.mapv(|v| (v - min) / denom)
}

/// Collapses a raw `[1, C, H, W]` attribution into a normalized
/// `SALIENCY_SIZE`² map: first three channels summed, resized, absolute
/// value, min-max normalized.
pub fn attribution_to_saliency(attribution: &Array4<f32>) -> Result<Array2<f32>, ModelError> {
    let (batch, channels, _, _) = attribution.dim();
    if batch == 0 {
        return Err(ModelError::output("explainer returned an empty batch"));
    }
    let kept = channels.min(3);
    let summed = attribution
        .slice(s![0, 0..kept, .., ..])
        .sum_axis(Axis(0));
    let resized = resize_bilinear(summed.view(), SALIENCY_SIZE, SALIENCY_SIZE).mapv(f32::abs);
    Ok(normalize_min_max(&resized))
}

/// Runs the explainer for `target_class` and post-processes its output.
pub fn generate_saliency_map(
    explainer: &dyn Explainer,
    input: &Array4<f32>,
    target_class: usize,
) -> Result<Array2<f32>, ModelError> {
    let input = DifferentiableInput::from_tensor(input);
    let attribution = explainer.explain(&input, target_class)?;
    attribution_to_saliency(&attribution)
}
