pub mod bcos;
pub mod cli;
pub mod compositor;
pub mod detection;
pub mod error;
pub mod helpers;
pub mod model;
pub mod patch;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod provider;
pub mod saliency;
pub mod service;
pub mod yolo;

pub use crate::cli::Args;
pub use crate::detection::{DetectionBox, SliceConfig, sliced_prediction};
pub use crate::error::{ModelError, PipelineError};
pub use crate::helpers::Renderer;
pub use crate::model::OnnxModel;
pub use crate::pipeline::{CellClass, DetectionRecord, Pipeline, Prediction, PredictionReport, Summary};
pub use crate::preprocess::{PatchTransform, PreprocessConfig, Processor};
pub use crate::provider::{Explainer, ModelProvider, ObjectDetector, PatchClassifier};
pub use crate::saliency::DifferentiableInput;
pub use crate::service::{AppState, router};
