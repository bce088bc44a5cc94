//! Cascade Dispatcher
//!
//! Tries the backends strictly in priority order and stops at the first
//! qualifying detection.

use image::DynamicImage;
use std::sync::Arc;

use super::backend::{DetectionResult, InferenceBackend};
use super::classes::CropType;
use super::error::CascadeError;
use super::vision::preprocess::Preprocessor;

/// Ordered backend list, cheapest first.
///
pub struct Cascade {
    backends: Vec<Arc<dyn InferenceBackend>>,
    preprocessor: Preprocessor,
}

impl Cascade {
    pub fn new(backends: Vec<Arc<dyn InferenceBackend>>, preprocessor: Preprocessor) -> Self {
        Self {
            backends,
            preprocessor,
        }
    }

    pub fn backends(&self) -> &[Arc<dyn InferenceBackend>] {
        &self.backends
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    /// Runs the cascade on one image.
    ///
    /// `Ok(None)` means no backend was confident. A backend error is logged and
    /// the next backend is tried; only when every backend errored is the
    /// outage reported as `AllBackendsFailed`.
    pub fn detect(
        &self,
        image: &DynamicImage,
        crop_filter: Option<CropType>,
    ) -> Result<Option<DetectionResult>, CascadeError> {
        if self.backends.is_empty() {
            return Err(CascadeError::NoBackends);
        }
        let mut failures = vec![];
        for backend in &self.backends {
            let source = backend.source();
            // Bad input is bad for every backend.
            let tensor = self.preprocessor.preprocess(image, &backend.contract())?;
            log::debug!("[{}] predict, crop filter {:?}", source, crop_filter);
            match backend.predict(tensor, crop_filter) {
                Ok(Some(detection)) => {
                    log::info!(
                        "[{}] {} ({:.3}, {})",
                        source,
                        detection.disease_name,
                        detection.confidence_score,
                        detection.crop_type
                    );
                    return Ok(Some(detection));
                }
                Ok(None) => log::debug!("[{}] no confident detection", source),
                Err(e) => {
                    log::warn!("[{}] backend failed: {}", source, e);
                    failures.push((source, e));
                }
            }
        }
        if failures.len() == self.backends.len() {
            return Err(CascadeError::AllBackendsFailed(failures));
        }
        log::info!("No confident detection from {} backends", self.backends.len());
        Ok(None)
    }
}
