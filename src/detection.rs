//! Stage 1: sliced-window detection.
//!
//! The image is tiled into overlapping windows, every window (and, when
//! there is more than one, the whole image) goes through the detector, and
//! the shifted detections are merged with greedy non-maximum merging.

use image::RgbImage;
use image::imageops;
use tracing::debug;

use crate::error::ModelError;
use crate::postprocess::greedy_nmm;
use crate::provider::ObjectDetector;

/// Axis-aligned box in pixel coordinates of the image it was detected on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
    pub class_id: usize,
}

impl DetectionBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Smallest box covering both; keeps the higher score and its class.
    pub fn union(&self, other: &DetectionBox) -> DetectionBox {
        let (score, class_id) = if other.score > self.score {
            (other.score, other.class_id)
        } else {
            (self.score, self.class_id)
        };
        DetectionBox {
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
            x2: self.x2.max(other.x2),
            y2: self.y2.max(other.y2),
            score,
            class_id,
        }
    }

    /// Moves the box by a window origin and clips it to the image extent.
    pub fn shift_and_clip(&self, dx: f32, dy: f32, width: f32, height: f32) -> DetectionBox {
        DetectionBox {
            x1: (self.x1 + dx).clamp(0.0, width),
            y1: (self.y1 + dy).clamp(0.0, height),
            x2: (self.x2 + dx).clamp(0.0, width),
            y2: (self.y2 + dy).clamp(0.0, height),
            ..*self
        }
    }

    /// Integer corners, truncated toward zero.
    pub fn to_xyxy(&self) -> [i32; 4] {
        [self.x1 as i32, self.y1 as i32, self.x2 as i32, self.y2 as i32]
    }
}

#[derive(Debug, Clone)]
pub struct SliceConfig {
    pub slice_width: u32,
    pub slice_height: u32,
    pub overlap_width_ratio: f32,
    pub overlap_height_ratio: f32,
    /// Also run the detector on the full image when it spans several windows.
    pub standard_prediction: bool,
    pub match_threshold: f32,
    /// Windows cropped and handed to the detector at once. Bounds peak
    /// memory independently of the image size.
    pub batch_size: usize,
}

impl Default for SliceConfig {
    fn default() -> Self {
        Self {
            slice_width: 512,
            slice_height: 512,
            overlap_width_ratio: 0.2,
            overlap_height_ratio: 0.2,
            standard_prediction: true,
            match_threshold: 0.5,
            batch_size: rayon::current_num_threads(),
        }
    }
}

/// Window as `[x1, y1, x2, y2]` in image pixels.
pub type Window = [u32; 4];

/// Tiles a `width`×`height` image row by row. Windows overflowing the right or
/// bottom edge are pushed back inside the image.
pub fn slice_windows(width: u32, height: u32, config: &SliceConfig) -> Vec<Window> {
    let (sw, sh) = (config.slice_width, config.slice_height);
    let x_overlap = (config.overlap_width_ratio * sw as f32) as u32;
    let y_overlap = (config.overlap_height_ratio * sh as f32) as u32;

    let mut windows = Vec::new();
    let (mut y_min, mut y_max) = (0u32, 0u32);
    while y_max < height {
        let (mut x_min, mut x_max) = (0u32, 0u32);
        y_max = y_min + sh;
        while x_max < width {
            x_max = x_min + sw;
            if y_max > height || x_max > width {
                let xmax = width.min(x_max);
                let ymax = height.min(y_max);
                windows.push([xmax.saturating_sub(sw), ymax.saturating_sub(sh), xmax, ymax]);
            } else {
                windows.push([x_min, y_min, x_max, y_max]);
            }
            x_min = x_max - x_overlap;
        }
        y_min = y_max - y_overlap;
    }
    windows
}

/// Runs `detector` over overlapping windows of `image` and merges the
/// results into boxes in image coordinates, highest score first.
pub fn sliced_prediction(
    detector: &dyn ObjectDetector,
    image: &RgbImage,
    config: &SliceConfig,
) -> Result<Vec<DetectionBox>, ModelError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Ok(Vec::new());
    }
    let windows = slice_windows(width, height, config);
    let mut candidates = Vec::new();
    for chunk in windows.chunks(config.batch_size.max(1)) {
        let crops: Vec<RgbImage> = chunk
            .iter()
            .map(|&[x1, y1, x2, y2]| imageops::crop_imm(image, x1, y1, x2 - x1, y2 - y1).to_image())
            .collect();
        let per_window = detector.predict_batch(&crops)?;
        for (window, boxes) in chunk.iter().zip(per_window) {
            candidates.extend(
                boxes
                    .iter()
                    .map(|b| b.shift_and_clip(window[0] as f32, window[1] as f32, width as f32, height as f32)),
            );
        }
    }

    if config.standard_prediction && windows.len() > 1 {
        candidates.extend(detector.predict(image)?);
    }

    let raw = candidates.len();
    let merged = greedy_nmm(candidates, config.match_threshold);
    debug!(windows = windows.len(), raw, merged = merged.len(), "sliced prediction finished");
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn single_window_for_small_image() {
        let windows = slice_windows(300, 200, &SliceConfig::default());
        assert_eq!(windows, vec![[0, 0, 300, 200]]);
    }

    #[test]
    fn windows_overlap_and_stay_inside() {
        let config = SliceConfig::default();
        let windows = slice_windows(1000, 700, &config);
        // x: 0..512, 410..922, 488..1000 ; y: 0..512, 188..700
        assert_eq!(
            windows,
            vec![
                [0, 0, 512, 512],
                [410, 0, 922, 512],
                [488, 0, 1000, 512],
                [0, 188, 512, 700],
                [410, 188, 922, 700],
                [488, 188, 1000, 700],
            ]
        );
        for w in &windows {
            assert!(w[2] <= 1000 && w[3] <= 700);
            assert_eq!(w[2] - w[0], 512);
            assert_eq!(w[3] - w[1], 512);
        }
    }

    #[test]
    fn windows_cover_every_pixel() {
        let config = SliceConfig::default();
        let (w, h) = (1337, 901);
        let windows = slice_windows(w, h, &config);
        for (px, py) in [(0, 0), (w - 1, h - 1), (700, 450), (w - 1, 0), (0, h - 1)] {
            assert!(windows.iter().any(|win| px >= win[0] && px < win[2] && py >= win[1] && py < win[3]));
        }
    }

    #[test]
    fn shift_and_clip_moves_into_image_space() {
        let b = DetectionBox { x1: 10.0, y1: 10.0, x2: 600.0, y2: 20.0, score: 0.9, class_id: 0 };
        let s = b.shift_and_clip(100.0, 50.0, 640.0, 480.0);
        assert_eq!((s.x1, s.y1, s.x2, s.y2), (110.0, 60.0, 640.0, 70.0));
        assert_eq!(s.score, 0.9);
    }

    #[test]
    fn to_xyxy_truncates() {
        let b = DetectionBox { x1: 1.9, y1: 2.1, x2: 10.99, y2: 3.5, score: 0.5, class_id: 0 };
        assert_eq!(b.to_xyxy(), [1, 2, 10, 3]);
    }

    /// Reports one fixed box (in window coordinates) per call.
    struct FixedDetector {
        calls: Mutex<Vec<(u32, u32)>>,
    }

    impl ObjectDetector for FixedDetector {
        fn predict(&self, window: &RgbImage) -> Result<Vec<DetectionBox>, ModelError> {
            self.calls.lock().unwrap().push(window.dimensions());
            Ok(vec![DetectionBox { x1: 10.0, y1: 10.0, x2: 30.0, y2: 30.0, score: 0.8, class_id: 0 }])
        }
    }

    #[test]
    fn sliced_prediction_single_window_skips_standard_pass() {
        let detector = FixedDetector { calls: Mutex::new(Vec::new()) };
        let image = RgbImage::new(400, 300);
        let boxes = sliced_prediction(&detector, &image, &SliceConfig::default()).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(detector.calls.lock().unwrap().as_slice(), &[(400, 300)]);
    }

    #[test]
    fn sliced_prediction_shifts_and_runs_full_image() {
        let detector = FixedDetector { calls: Mutex::new(Vec::new()) };
        let image = RgbImage::new(1000, 512);
        let boxes = sliced_prediction(&detector, &image, &SliceConfig::default()).unwrap();
        let calls = detector.calls.lock().unwrap();
        // three windows plus the full image
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[3], (1000, 512));
        // window at x=0 and the full-image pass coincide and merge
        let origins: Vec<f32> = boxes.iter().map(|b| b.x1).collect();
        assert_eq!(boxes.len(), 3);
        assert!(origins.contains(&10.0));
        assert!(origins.contains(&420.0));
        assert!(origins.contains(&498.0));
    }

    /// Records the size of every batch it is handed.
    struct BatchRecorder {
        batches: Mutex<Vec<usize>>,
    }

    impl ObjectDetector for BatchRecorder {
        fn predict(&self, _window: &RgbImage) -> Result<Vec<DetectionBox>, ModelError> {
            Ok(Vec::new())
        }

        fn predict_batch(&self, windows: &[RgbImage]) -> Result<Vec<Vec<DetectionBox>>, ModelError> {
            self.batches.lock().unwrap().push(windows.len());
            Ok(vec![Vec::new(); windows.len()])
        }
    }

    #[test]
    fn large_images_are_detected_in_bounded_batches() {
        let detector = BatchRecorder { batches: Mutex::new(Vec::new()) };
        let config = SliceConfig { batch_size: 4, ..SliceConfig::default() };
        let image = RgbImage::new(2500, 2500);
        sliced_prediction(&detector, &image, &config).unwrap();

        let batches = detector.batches.lock().unwrap();
        let total = slice_windows(2500, 2500, &config).len();
        assert_eq!(total, 36);
        assert_eq!(batches.iter().sum::<usize>(), total);
        assert!(batches.iter().all(|&n| n <= 4), "batches {batches:?}");
        assert_eq!(batches.len(), 9);
    }

    #[test]
    fn default_batch_is_never_empty() {
        assert!(SliceConfig::default().batch_size >= 1);
        let detector = BatchRecorder { batches: Mutex::new(Vec::new()) };
        let config = SliceConfig { batch_size: 0, ..SliceConfig::default() };
        sliced_prediction(&detector, &RgbImage::new(1000, 600), &config).unwrap();
        assert!(detector.batches.lock().unwrap().iter().all(|&n| n == 1));
    }

    #[test]
    fn empty_image_has_no_detections() {
        let detector = FixedDetector { calls: Mutex::new(Vec::new()) };
        let image = RgbImage::new(0, 0);
        assert!(sliced_prediction(&detector, &image, &SliceConfig::default()).unwrap().is_empty());
        assert!(detector.calls.lock().unwrap().is_empty());
    }
}
