//! Model-output decoding shared by the ONNX backends.

use std::cmp::Ordering;
use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::detect::{BoundingBox, Confidence, DetectedObject, DetectionParams};
use crate::stage::backend::Classification;

/// Softmax over raw logits. Empty input gives an empty output.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return vec![0.0; logits.len()];
    }
    exps.into_iter().map(|v| v / sum).collect()
}

/// Highest-probability label; confidence rounded to three decimals.
pub fn best_label(labels: &[String], logits: &[f32]) -> Result<Classification> {
    if labels.len() != logits.len() {
        return Err(anyhow!(
            "model produced {} scores for {} labels",
            logits.len(),
            labels.len()
        ));
    }
    let probs = softmax(logits);
    let (index, prob) = probs
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
        .ok_or_else(|| anyhow!("no labels to classify against"))?;
    Ok(Classification {
        label: labels[index].clone(),
        confidence: (prob * 1000.0).round() / 1000.0,
    })
}

/// Shape of a YOLOv8-style output tensor `[1, 4 + classes, boxes]` and the
/// geometry needed to map boxes back onto the source image.
#[derive(Clone, Copy, Debug)]
pub struct YoloLayout {
    pub channels: usize,
    pub boxes: usize,
    pub input_size: u32,
    pub image_width: u32,
    pub image_height: u32,
}

#[derive(Clone, Debug)]
struct Candidate {
    class_id: usize,
    score: f32,
    bbox: BoundingBox,
}

/// Decode a channel-major YOLO output, threshold it, and suppress overlaps per class.
///
/// Results are sorted by descending confidence, boxes clamped to the image.
pub fn decode_yolo(
    data: &[f32],
    layout: &YoloLayout,
    labels: &[String],
    params: DetectionParams,
) -> Result<Vec<DetectedObject>> {
    if layout.channels <= 4 {
        return Err(anyhow!("output has {} channels, expected > 4", layout.channels));
    }
    let expected = layout.channels * layout.boxes;
    if data.len() != expected {
        return Err(anyhow!(
            "output has {} values, expected {}x{}",
            data.len(),
            layout.channels,
            layout.boxes
        ));
    }

    let at = |channel: usize, index: usize| data[channel * layout.boxes + index];
    let scale_x = layout.image_width as f32 / layout.input_size as f32;
    let scale_y = layout.image_height as f32 / layout.input_size as f32;
    let max_x = layout.image_width as f32;
    let max_y = layout.image_height as f32;

    let mut candidates = Vec::new();
    for i in 0..layout.boxes {
        let mut best = (0usize, 0.0f32);
        for class_id in 0..layout.channels - 4 {
            let score = at(4 + class_id, i);
            if score > best.1 {
                best = (class_id, score);
            }
        }
        if best.1 < params.conf_threshold {
            continue;
        }
        let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
        let bbox = BoundingBox::new(
            ((cx - w / 2.0) * scale_x).clamp(0.0, max_x),
            ((cy - h / 2.0) * scale_y).clamp(0.0, max_y),
            ((cx + w / 2.0) * scale_x).clamp(0.0, max_x),
            ((cy + h / 2.0) * scale_y).clamp(0.0, max_y),
        );
        candidates.push(Candidate {
            class_id: best.0,
            score: best.1,
            bbox,
        });
    }

    let mut kept = non_max_suppression(candidates, params.iou_threshold);
    kept.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    Ok(kept
        .into_iter()
        .map(|c| DetectedObject {
            label: labels
                .get(c.class_id)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", c.class_id)),
            confidence: Confidence::from_score(c.score),
            bbox: c.bbox,
        })
        .collect())
}

fn non_max_suppression(candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    let mut by_class: HashMap<usize, Vec<Candidate>> = HashMap::new();
    for candidate in candidates {
        by_class.entry(candidate.class_id).or_default().push(candidate);
    }

    let mut kept = Vec::new();
    for (_, mut group) in by_class {
        group.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        let mut suppressed = vec![false; group.len()];
        for i in 0..group.len() {
            if suppressed[i] {
                continue;
            }
            for j in (i + 1)..group.len() {
                if !suppressed[j] && group[i].bbox.iou(&group[j].bbox) > iou_threshold {
                    suppressed[j] = true;
                }
            }
            kept.push(group[i].clone());
        }
    }
    kept
}
