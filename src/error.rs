use thiserror::Error;

/// Faults raised by the model provider while loading or running a graph.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("failed to load model {path}: {source}")]
    Load { path: String, source: ort::Error },
    #[error("ONNX Runtime error: {0}")]
    Runtime(#[from] ort::Error),
    #[error("unexpected tensor shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("unexpected model output: {0}")]
    Output(String),
    #[error("image resize failed: {0}")]
    Resize(#[from] fast_image_resize::ResizeError),
    #[error("invalid image buffer: {0}")]
    Buffer(#[from] fast_image_resize::ImageBufferError),
}

impl ModelError {
    pub fn output(msg: impl Into<String>) -> Self {
        ModelError::Output(msg.into())
    }
}

/// Per-request faults of the prediction pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("cannot decode uploaded image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("inference failed: {0}")]
    Inference(#[from] ModelError),
    #[error("cannot encode result image: {0}")]
    Encode(#[source] image::ImageError),
}

impl PipelineError {
    /// True when the fault was caused by the uploaded payload rather than the server.
    pub fn is_client_fault(&self) -> bool {
        matches!(self, PipelineError::Decode(_))
    }
}
