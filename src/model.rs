use ndarray::ArrayD;
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch};
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionOutputs};
use tracing::info;

use crate::error::ModelError;

pub struct OnnxModel {
    provider: [ExecutionProviderDispatch; 1],
}

impl OnnxModel {
    pub fn new(cuda: bool) -> Self {
        let provider = if cuda {
            [CUDAExecutionProvider::default().build().error_on_failure()]
        } else {
            [CPUExecutionProvider::default().build()]
        };
        Self { provider }
    }

    pub fn load_model(&self, model_path: &str) -> Result<Session, ModelError> {
        let load = |source: ort::Error| ModelError::Load {
            path: model_path.to_string(),
            source,
        };
        let session = SessionBuilder::new()
            .map_err(load)?
            .with_execution_providers(self.provider.clone())
            .map_err(load)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(load)?
            .commit_from_file(model_path)
            .map_err(load)?;
        info!(model = model_path, "loaded ONNX session");
        Ok(session)
    }
}

/// Copies every output of a session run out as an owned `f32` array, in output order.
pub fn extract_f32_outputs(outputs: &SessionOutputs) -> Result<Vec<ArrayD<f32>>, ModelError> {
    let ys = outputs
        .iter()
        .map(|(_k, v)| v.try_extract_tensor::<f32>().map(|t| t.into_owned()))
        .collect::<Result<Vec<_>, _>>()?;
    if ys.is_empty() {
        return Err(ModelError::output("model produced no outputs"));
    }
    Ok(ys)
}
