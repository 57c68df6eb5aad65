use std::cmp::Reverse;
use std::collections::BTreeMap;

use ndarray::{Array1, ArrayD, Axis, Ix3};
use ordered_float::OrderedFloat;

use crate::detection::DetectionBox;
use crate::error::ModelError;
use crate::preprocess::Letterbox;

/// Applies softmax to a 1D array (slice) and returns a new Array1<f32>.
pub fn softmax(slice: &Array1<f32>) -> Array1<f32> {
    let max_val = slice.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Array1<f32> = slice.mapv(|x| (x - max_val).exp());
    let sum_exp: f32 = exp_vals.sum();
    exp_vals.mapv(|v| v / sum_exp)
}

pub fn argmax_and_max(softmaxed: &Array1<f32>) -> (usize, f32) {
    softmaxed
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(max_idx, max_val), (i, &val)| {
            if val > max_val { (i, val) } else { (max_idx, max_val) }
        })
}

fn intersection(b1: &DetectionBox, b2: &DetectionBox) -> f32 {
    let inter_x1 = b1.x1.max(b2.x1);
    let inter_y1 = b1.y1.max(b2.y1);
    let inter_x2 = b1.x2.min(b2.x2);
    let inter_y2 = b1.y2.min(b2.y2);
    (inter_x2 - inter_x1).max(0.0) * (inter_y2 - inter_y1).max(0.0)
}

/// Intersection over union of two corner-format boxes.
pub fn compute_iou(b1: &DetectionBox, b2: &DetectionBox) -> f32 {
    let inter_area = intersection(b1, b2);
    let union_area = b1.area() + b2.area() - inter_area;
    if union_area <= 0.0 { 0.0 } else { inter_area / union_area }
}

/// Intersection over the area of the smaller box.
pub fn compute_ios(b1: &DetectionBox, b2: &DetectionBox) -> f32 {
    let smaller = b1.area().min(b2.area());
    if smaller <= 0.0 { 0.0 } else { intersection(b1, b2) / smaller }
}

/// Indices of `boxes` per class, classes ascending, scores descending.
fn group_by_class(boxes: &[DetectionBox]) -> BTreeMap<usize, Vec<usize>> {
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, b) in boxes.iter().enumerate() {
        by_class.entry(b.class_id).or_default().push(i);
    }
    for indices in by_class.values_mut() {
        indices.sort_by_key(|&i| Reverse(OrderedFloat(boxes[i].score)));
    }
    by_class
}

fn sort_by_score(boxes: &mut [DetectionBox]) {
    boxes.sort_by_key(|b| Reverse(OrderedFloat(b.score)));
}

/// Per-class NMS. Returns survivors sorted by descending score.
pub fn non_maximum_suppression(
    boxes: Vec<DetectionBox>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<DetectionBox> {
    let by_class = group_by_class(&boxes);
    let mut keep = Vec::new();

    for indices in by_class.values() {
        let mut suppressed = vec![false; indices.len()];
        for i in 0..indices.len() {
            if suppressed[i] {
                continue;
            }
            let idx_i = indices[i];
            keep.push(boxes[idx_i]);
            for j in (i + 1)..indices.len() {
                if !suppressed[j] && compute_iou(&boxes[idx_i], &boxes[indices[j]]) > iou_threshold {
                    suppressed[j] = true;
                }
            }
        }
    }

    sort_by_score(&mut keep);
    keep.truncate(max_detections);
    keep
}

/// Greedy non-maximum merging per class. The highest-scoring remaining box
/// claims every lower box whose intersection over the smaller area with it
/// reaches `ios_threshold`. Claimed boxes are folded in, highest score first,
/// only while they still overlap the grown box by more than `ios_threshold`;
/// the others are dropped. A merged box is the union of its members and
/// keeps the highest score.
pub fn greedy_nmm(boxes: Vec<DetectionBox>, ios_threshold: f32) -> Vec<DetectionBox> {
    let by_class = group_by_class(&boxes);
    let mut merged = Vec::new();

    for indices in by_class.values() {
        let mut claimed = vec![false; indices.len()];
        for i in 0..indices.len() {
            if claimed[i] {
                continue;
            }
            let keep = boxes[indices[i]];
            let mut acc = keep;
            for j in (i + 1)..indices.len() {
                if claimed[j] {
                    continue;
                }
                let other = &boxes[indices[j]];
                if compute_ios(&keep, other) < ios_threshold {
                    continue;
                }
                claimed[j] = true;
                if compute_ios(&acc, other) > ios_threshold {
                    acc = acc.union(other);
                }
            }
            merged.push(acc);
        }
    }

    sort_by_score(&mut merged);
    merged
}

/// Decodes a YOLOv8 head of shape `[1, 4 + nc, anchors]` into boxes in the
/// pixel space of the window that was letterboxed.
pub fn decode_yolov8(
    output: &ArrayD<f32>,
    letterbox: &Letterbox,
    confidence_threshold: f32,
) -> Result<Vec<DetectionBox>, ModelError> {
    let output = output.view().into_dimensionality::<Ix3>()?;
    let preds = output.index_axis(Axis(0), 0);
    let rows = preds.shape()[0];
    if rows <= 4 {
        return Err(ModelError::output(format!(
            "detector head has {rows} rows, expected box coordinates plus class scores"
        )));
    }
    let (max_x, max_y) = (letterbox.source_width as f32, letterbox.source_height as f32);

    let mut boxes = Vec::new();
    for anchor in preds.axis_iter(Axis(1)) {
        let (class_id, score) = anchor
            .iter()
            .skip(4)
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(bi, bs), (i, &s)| if s > bs { (i, s) } else { (bi, bs) });
        if score < confidence_threshold {
            continue;
        }
        let (cx, cy, w, h) = (anchor[0], anchor[1], anchor[2], anchor[3]);
        let (x1, y1) = letterbox.to_source(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = letterbox.to_source(cx + w / 2.0, cy + h / 2.0);
        let b = DetectionBox {
            x1: x1.clamp(0.0, max_x),
            y1: y1.clamp(0.0, max_y),
            x2: x2.clamp(0.0, max_x),
            y2: y2.clamp(0.0, max_y),
            score,
            class_id,
        };
        if b.area() > 0.0 {
            boxes.push(b);
        }
    }
    Ok(boxes)
}
