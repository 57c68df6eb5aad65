use image::RgbImage;
use ndarray::CowArray;
use ort::session::Session;

use crate::detection::DetectionBox;
use crate::error::ModelError;
use crate::model::extract_f32_outputs;
use crate::postprocess::{decode_yolov8, non_maximum_suppression};
use crate::preprocess::{Letterbox, PreprocessConfig, Processor};
use crate::provider::ObjectDetector;

const CONFIDENCE_THRESHOLD: f32 = 0.5;
const IOU_THRESHOLD: f32 = 0.7;
const MAX_DETECTIONS: usize = 300;

/// YOLOv8 detector exported to ONNX with a `[1, 4 + nc, anchors]` head.
pub struct YoloDetector {
    session: Session,
    processor: Processor,
    confidence_threshold: f32,
    iou_threshold: f32,
    max_detections: usize,
}

impl YoloDetector {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            processor: Processor::new(PreprocessConfig::default()),
            confidence_threshold: CONFIDENCE_THRESHOLD,
            iou_threshold: IOU_THRESHOLD,
            max_detections: MAX_DETECTIONS,
        }
    }

    fn infer(&self, letterbox: &Letterbox) -> Result<Vec<DetectionBox>, ModelError> {
        let xs = CowArray::from(letterbox.tensor.view().into_dyn());
        let input_data = ort::inputs![xs.view()]?;
        let ys = self.session.run(input_data)?;
        let outputs = extract_f32_outputs(&ys)?;
        let boxes = decode_yolov8(&outputs[0], letterbox, self.confidence_threshold)?;
        Ok(non_maximum_suppression(boxes, self.iou_threshold, self.max_detections))
    }
}

impl ObjectDetector for YoloDetector {
    fn predict(&self, window: &RgbImage) -> Result<Vec<DetectionBox>, ModelError> {
        let letterbox = self.processor.letterbox(window)?;
        self.infer(&letterbox)
    }

    fn predict_batch(&self, windows: &[RgbImage]) -> Result<Vec<Vec<DetectionBox>>, ModelError> {
        self.processor
            .preprocess(windows)?
            .iter()
            .map(|lb| self.infer(lb))
            .collect()
    }
}
