use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Clone, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// YOLOv8 candidate detector (ONNX)
    #[arg(long, env = "MITOLENS_DETECTOR_MODEL", default_value = "weights/detector.onnx")]
    pub detector_model: String,

    /// B-cos patch classifier (ONNX)
    #[arg(long, env = "MITOLENS_CLASSIFIER_MODEL", default_value = "weights/classifier.onnx")]
    pub classifier_model: String,

    /// B-cos explanation graph (ONNX)
    #[arg(long, env = "MITOLENS_EXPLAINER_MODEL", default_value = "weights/explainer.onnx")]
    pub explainer_model: String,

    /// TrueType font for confidence labels, replacing the embedded one
    #[arg(long, env = "MITOLENS_FONT")]
    pub font: Option<PathBuf>,

    /// run inference on the CUDA execution provider
    #[arg(long, env = "MITOLENS_CUDA", default_value_t = false)]
    pub cuda: bool,

    #[arg(long, env = "MITOLENS_HOST", default_value_t = String::from("0.0.0.0"))]
    pub host: String,

    #[arg(long, env = "MITOLENS_PORT", default_value_t = 8000)]
    pub port: u16,

    /// largest accepted upload, in MiB
    #[arg(long, env = "MITOLENS_MAX_UPLOAD_MB", default_value_t = 64)]
    pub max_upload_mb: usize,

    /// log filter used when RUST_LOG is unset
    #[arg(long, env = "MITOLENS_LOG_LEVEL", default_value_t = String::from("info"))]
    pub log_level: String,
}

impl Args {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb * 1024 * 1024
    }
}
