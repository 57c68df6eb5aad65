//! Per-request orchestration: detection, classification, saliency and
//! rendering of one uploaded image.

use std::time::Instant;

use image::RgbImage;
use ndarray::{Array1, Array4};
use serde::Serialize;
use tracing::{debug, info};

use crate::compositor::{GlobalMask, gaussian_blur, global_focus, smart_focus};
use crate::error::{ModelError, PipelineError};
use crate::helpers::{Renderer, encode_png_base64};
use crate::patch::{PATCH_SIZE, extract_patch};
use crate::postprocess::{argmax_and_max, softmax};
use crate::provider::ModelProvider;
use crate::saliency::generate_saliency_map;

/// Index of the mitotic class in the classifier output.
pub const MITOTIC_CLASS_ID: usize = 0;
/// Minimum mitotic probability for a saliency map and a confirmed box.
pub const CONFIDENCE_GATE: f32 = 0.7;
pub const NO_CANDIDATES_MESSAGE: &str = "No candidates found.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CellClass {
    Mitotic,
    NotMitotic,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub class_id: usize,
    /// Probability of the mitotic class, whatever the predicted class.
    pub confidence: f32,
    pub probabilities: Array1<f32>,
}

impl Classification {
    pub fn from_logits(logits: &Array1<f32>) -> Result<Self, ModelError> {
        if logits.len() <= MITOTIC_CLASS_ID {
            return Err(ModelError::output(format!("classifier returned {} logits", logits.len())));
        }
        let probabilities = softmax(logits);
        let (class_id, _) = argmax_and_max(&probabilities);
        Ok(Self {
            class_id,
            confidence: probabilities[MITOTIC_CLASS_ID],
            probabilities,
        })
    }

    pub fn label(&self) -> CellClass {
        if self.class_id == MITOTIC_CLASS_ID {
            CellClass::Mitotic
        } else {
            CellClass::NotMitotic
        }
    }

    /// Predicted mitotic and at or above the confidence gate.
    pub fn is_confirmed(&self) -> bool {
        self.class_id == MITOTIC_CLASS_ID && self.confidence >= CONFIDENCE_GATE
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionRecord {
    pub id: usize,
    pub class: CellClass,
    pub confidence: f32,
    pub bbox: [i32; 4],
    pub heatmap_image: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub total_candidates: usize,
    pub mitotic_count: usize,
    pub non_mitotic_count: usize,
}

impl Summary {
    /// `mitotic_count` uses the confidence gate, so a record labelled
    /// mitotic below the gate counts as non-mitotic here.
    pub fn from_records(records: &[DetectionRecord]) -> Self {
        let mitotic_count = records
            .iter()
            .filter(|r| r.class == CellClass::Mitotic && r.confidence >= CONFIDENCE_GATE)
            .count();
        Self {
            total_candidates: records.len(),
            mitotic_count,
            non_mitotic_count: records.len() - mitotic_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionReport {
    pub original_image: String,
    pub yolo_annotated_image: String,
    pub final_annotated_image: String,
    pub detections: Vec<DetectionRecord>,
    pub summary: Summary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Prediction {
    NoCandidates { message: &'static str },
    Report(PredictionReport),
}

impl Prediction {
    pub fn no_candidates() -> Self {
        Prediction::NoCandidates {
            message: NO_CANDIDATES_MESSAGE,
        }
    }
}

/// Padded window of a confirmed detection, kept for the final overlay.
#[derive(Debug, Clone, Copy)]
struct ConfirmedBox {
    window: [i32; 4],
    confidence: f32,
}

pub struct Pipeline {
    provider: ModelProvider,
    renderer: Renderer,
}

impl Pipeline {
    pub fn new(provider: ModelProvider, renderer: Renderer) -> Self {
        Self { provider, renderer }
    }

    /// Decodes an uploaded file and runs the full pipeline on it.
    pub fn predict(&self, bytes: &[u8]) -> Result<Prediction, PipelineError> {
        let image = image::load_from_memory(bytes)
            .map_err(PipelineError::Decode)?
            .to_rgb8();
        self.predict_image(image)
    }

    /// Runs the classifier on one patch. Also returns the transformed tensor
    /// so the explainer sees exactly what the classifier saw.
    pub fn classify(&self, patch: &RgbImage) -> Result<(Classification, Array4<f32>), ModelError> {
        let input = self.provider.preprocess(patch)?;
        let logits = self.provider.classifier.logits(&input)?;
        Ok((Classification::from_logits(&logits)?, input))
    }

    pub fn predict_image(&self, original: RgbImage) -> Result<Prediction, PipelineError> {
        let started = Instant::now();
        let (width, height) = original.dimensions();
        info!(width, height, "received image");

        let mut candidates_image = original.clone();
        let blurred = gaussian_blur(&original);
        let mut global_mask = GlobalMask::new(width, height);
        let mut confirmed: Vec<ConfirmedBox> = Vec::new();

        info!("running stage 1: sliced detection");
        let detections = self.provider.detect(&original)?;
        if detections.is_empty() {
            info!("no candidates found");
            return Ok(Prediction::no_candidates());
        }
        debug!(candidates = detections.len(), elapsed = ?started.elapsed(), "detection finished");

        let mut records = Vec::with_capacity(detections.len());
        for (id, detection) in detections.iter().enumerate() {
            let bbox = detection.to_xyxy();
            self.renderer.draw_candidate(&mut candidates_image, bbox);

            let patch = extract_patch(&original, bbox, PATCH_SIZE);
            let (classification, input) = self.classify(&patch.image)?;
            debug!(id, class_id = classification.class_id, confidence = classification.confidence, "classified");

            let mut heatmap_image = None;
            if classification.is_confirmed() {
                let saliency =
                    generate_saliency_map(self.provider.explainer.as_ref(), &input, MITOTIC_CLASS_ID)?;
                global_mask.fold(&patch.bounds, &saliency);
                confirmed.push(ConfirmedBox {
                    window: patch.window,
                    confidence: classification.confidence,
                });

                if !patch.bounds.is_empty() {
                    let b = patch.bounds;
                    let crop = image::imageops::crop_imm(&original, b.x1, b.y1, b.width(), b.height()).to_image();
                    let focused = smart_focus(&crop, &saliency);
                    heatmap_image = Some(encode_png_base64(&focused).map_err(PipelineError::Encode)?);
                }
            }

            records.push(DetectionRecord {
                id,
                class: classification.label(),
                confidence: classification.confidence,
                bbox,
                heatmap_image,
            });
        }

        let mut final_image = global_focus(&original, &blurred, &global_mask);
        for c in &confirmed {
            self.renderer.draw_confirmed(&mut final_image, c.window, c.confidence);
        }

        let summary = Summary::from_records(&records);
        info!(
            candidates = summary.total_candidates,
            mitotic = summary.mitotic_count,
            elapsed = ?started.elapsed(),
            "prediction complete"
        );

        Ok(Prediction::Report(PredictionReport {
            original_image: encode_png_base64(&original).map_err(PipelineError::Encode)?,
            yolo_annotated_image: encode_png_base64(&candidates_image).map_err(PipelineError::Encode)?,
            final_annotated_image: encode_png_base64(&final_image).map_err(PipelineError::Encode)?,
            detections: records,
            summary,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn record(class: CellClass, confidence: f32) -> DetectionRecord {
        DetectionRecord {
            id: 0,
            class,
            confidence,
            bbox: [0, 0, 1, 1],
            heatmap_image: None,
        }
    }

    #[test]
    fn confidence_is_mitotic_probability() {
        let c = Classification::from_logits(&array![0.0, 2.0]).unwrap();
        assert_eq!(c.class_id, 1);
        assert_eq!(c.label(), CellClass::NotMitotic);
        assert!(c.confidence < 0.5);
        assert!((c.probabilities.sum() - 1.0).abs() < 1e-6);
        assert!(!c.is_confirmed());
    }

    #[test]
    fn low_confidence_mitotic_is_labelled_but_not_confirmed() {
        // three classes so the argmax can be mitotic at 0.4
        let c = Classification::from_logits(&array![0.4f32.ln(), 0.3f32.ln(), 0.3f32.ln()]).unwrap();
        assert_eq!(c.label(), CellClass::Mitotic);
        assert!((c.confidence - 0.4).abs() < 1e-5);
        assert!(!c.is_confirmed());
    }

    #[test]
    fn gate_is_inclusive() {
        let at_gate = Classification {
            class_id: MITOTIC_CLASS_ID,
            confidence: CONFIDENCE_GATE,
            probabilities: array![0.7, 0.3],
        };
        assert!(at_gate.is_confirmed());
        let below = Classification { confidence: 0.69, ..at_gate };
        assert!(!below.is_confirmed());
    }

    #[test]
    fn empty_logits_are_rejected() {
        assert!(Classification::from_logits(&Array1::zeros(0)).is_err());
    }

    #[test]
    fn summary_counts_only_gated_mitotic() {
        let records = vec![
            record(CellClass::Mitotic, 0.85),
            record(CellClass::Mitotic, 0.4),
            record(CellClass::NotMitotic, 0.1),
        ];
        let s = Summary::from_records(&records);
        assert_eq!(s.total_candidates, 3);
        assert_eq!(s.mitotic_count, 1);
        assert_eq!(s.non_mitotic_count, 2);
        assert_eq!(s.mitotic_count + s.non_mitotic_count, records.len());
    }

    #[test]
    fn no_candidates_serializes_to_message_only() {
        let json = serde_json::to_value(Prediction::no_candidates()).unwrap();
        assert_eq!(json, serde_json::json!({ "message": "No candidates found." }));
    }

    #[test]
    fn record_serializes_with_wire_names() {
        let json = serde_json::to_value(record(CellClass::NotMitotic, 0.25)).unwrap();
        assert_eq!(json["class"], "not_mitotic");
        assert_eq!(json["bbox"], serde_json::json!([0, 0, 1, 1]));
        assert!(json["heatmap_image"].is_null());
        assert_eq!(json["confidence"], 0.25);
    }
}
