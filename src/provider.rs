use image::RgbImage;
use ndarray::{Array1, Array4};
use tracing::info;

use crate::bcos::{BcosClassifier, BcosExplainer};
use crate::cli::Args;
use crate::detection::{DetectionBox, SliceConfig, sliced_prediction};
use crate::error::ModelError;
use crate::model::OnnxModel;
use crate::preprocess::PatchTransform;
use crate::saliency::DifferentiableInput;
use crate::yolo::YoloDetector;

/// Single-window object detector. Boxes are in the window's pixel space.
pub trait ObjectDetector: Send + Sync {
    fn predict(&self, window: &RgbImage) -> Result<Vec<DetectionBox>, ModelError>;

    fn predict_batch(&self, windows: &[RgbImage]) -> Result<Vec<Vec<DetectionBox>>, ModelError> {
        windows.iter().map(|w| self.predict(w)).collect()
    }
}

/// Patch classifier returning raw class logits for one transformed patch.
pub trait PatchClassifier: Send + Sync {
    fn logits(&self, input: &Array4<f32>) -> Result<Array1<f32>, ModelError>;
}

/// Attribution of `target_class` over the input, shaped like the input.
pub trait Explainer: Send + Sync {
    fn explain(&self, input: &DifferentiableInput, target_class: usize) -> Result<Array4<f32>, ModelError>;
}

/// Every model capability a request needs. Built once at startup and only
/// read afterwards.
pub struct ModelProvider {
    pub detector: Box<dyn ObjectDetector>,
    pub classifier: Box<dyn PatchClassifier>,
    pub explainer: Box<dyn Explainer>,
    pub transform: PatchTransform,
    pub slicing: SliceConfig,
}

impl ModelProvider {
    pub fn new(
        detector: Box<dyn ObjectDetector>,
        classifier: Box<dyn PatchClassifier>,
        explainer: Box<dyn Explainer>,
    ) -> Self {
        Self {
            detector,
            classifier,
            explainer,
            transform: PatchTransform::default(),
            slicing: SliceConfig::default(),
        }
    }

    /// Loads the three ONNX graphs named in `args`.
    pub fn load(args: &Args) -> Result<Self, ModelError> {
        let onnx = OnnxModel::new(args.cuda);
        info!(device = if args.cuda { "cuda" } else { "cpu" }, "loading models");

        info!("loading detector");
        let detector = YoloDetector::new(onnx.load_model(&args.detector_model)?);
        info!("loading classifier");
        let classifier = BcosClassifier::new(onnx.load_model(&args.classifier_model)?);
        info!("initializing explainer");
        let explainer = BcosExplainer::new(onnx.load_model(&args.explainer_model)?);

        info!("models loaded");
        Ok(Self::new(Box::new(detector), Box::new(classifier), Box::new(explainer)))
    }

    pub fn detect(&self, image: &RgbImage) -> Result<Vec<DetectionBox>, ModelError> {
        sliced_prediction(self.detector.as_ref(), image, &self.slicing)
    }

    pub fn preprocess(&self, patch: &RgbImage) -> Result<Array4<f32>, ModelError> {
        self.transform.apply(patch)
    }
}
