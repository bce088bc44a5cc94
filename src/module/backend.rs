//! Inference Backends
//!
//! Every backend takes a preprocessed tensor and answers with a detection, with
//! nothing (below threshold or crop mismatch) or with an error. The cascade only
//! sees the `InferenceBackend` trait.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::classes::{ClassEntry, CropType};
use super::error::InferenceError;
use super::vision::preprocess::{InputContract, Tensor};

pub mod classifier;
pub mod detector;
pub mod remote;

/// Which backend produced a detection.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectionSource {
    /// On-device unified detector.
    #[serde(rename = "local_a")]
    LocalDetector,
    /// On-device per-crop classifier.
    #[serde(rename = "local_b")]
    LocalClassifier,
    #[serde(rename = "remote")]
    Remote,
}

impl fmt::Display for DetectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DetectionSource::LocalDetector => "local_a",
            DetectionSource::LocalClassifier => "local_b",
            DetectionSource::Remote => "remote",
        };
        f.write_str(name)
    }
}

/// A qualifying classification.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub disease_name: String,
    pub confidence_score: f32,
    pub is_healthy: bool,
    pub crop_type: CropType,
    pub source: DetectionSource,
}

impl DetectionResult {
    pub fn from_entry(entry: &ClassEntry, confidence: f32, source: DetectionSource) -> Self {
        Self {
            disease_name: entry.disease_name.to_owned(),
            confidence_score: confidence,
            is_healthy: entry.is_healthy(),
            crop_type: entry.crop_type,
            source,
        }
    }
}

/// Normalized box in [0, 1] relative to the sampled frame.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub label: String,
    pub confidence: f32,
}

impl BoundingBox {
    /// Box in display pixels `(x, y, width, height)`, clamped to the viewport.
    pub fn to_display(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let clamp = |v: f32| v.clamp(0.0, 1.0);
        let x0 = clamp(self.x);
        let y0 = clamp(self.y);
        let x1 = clamp(self.x + self.width);
        let y1 = clamp(self.y + self.height);
        let (w, h) = (width as f32, height as f32);
        (
            (x0 * w).round() as u32,
            (y0 * h).round() as u32,
            ((x1 - x0) * w).round() as u32,
            ((y1 - y0) * h).round() as u32,
        )
    }
}

/// Common predict contract.
pub trait InferenceBackend: Send + Sync {
    fn source(&self) -> DetectionSource;

    /// Tensor this backend consumes.
    fn contract(&self) -> InputContract;

    /// Classify `tensor`. The tensor is consumed and released on every path.
    fn predict(
        &self,
        tensor: Tensor,
        crop_filter: Option<CropType>,
    ) -> Result<Option<DetectionResult>, InferenceError>;
}

/// Fast path used by the live sampler.
pub trait BoxDetector: Send + Sync {
    fn contract(&self) -> InputContract;

    fn detect_boxes(
        &self,
        tensor: Tensor,
        crop_filter: Option<CropType>,
    ) -> Result<Vec<BoundingBox>, InferenceError>;
}

/// Index and value of the highest score. Ties go to the lowest index, NaN is skipped.
pub fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &score) in scores.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if score <= b => (),
            _ => best = Some((i, score)),
        }
    }
    best
}

/// Applies the confidence threshold (inclusive) and the optional crop filter.
pub fn qualify(
    entry: &ClassEntry,
    confidence: f32,
    threshold: f32,
    crop_filter: Option<CropType>,
    source: DetectionSource,
) -> Option<DetectionResult> {
    if !(confidence >= threshold) {
        log::debug!(
            "[{}] {} below threshold ({:.3} < {:.3})",
            source,
            entry.disease_name,
            confidence,
            threshold
        );
        return None;
    }
    if let Some(crop) = crop_filter {
        if crop != entry.crop_type {
            log::debug!(
                "[{}] filter mismatch: detected {}, filtered for {}",
                source,
                entry.crop_type,
                crop
            );
            return None;
        }
    }
    Some(DetectionResult::from_entry(entry, confidence, source))
}
