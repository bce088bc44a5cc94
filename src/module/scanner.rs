//! Scanner
//!
//! Application context: owns the model registry, the cascade, the remedy table
//! and the live sampler. Single-shot scans run the full cascade, live mode runs
//! the unified detector only.

use image::DynamicImage;
use serde::Serialize;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use super::backend::classifier::CropClassifier;
use super::backend::detector::DiseaseDetector;
use super::backend::remote::RemoteClassifier;
use super::backend::{BoundingBox, BoxDetector, DetectionResult, InferenceBackend};
use super::cascade::Cascade;
use super::classes::CropType;
use super::error::{CaptureError, CascadeError, InferenceError};
use super::registry::{ModelRegistry, OnnxLoader, RegistryStatus};
use super::remedy::RemedyResolver;
use super::sampler::{BoxUpdate, LiveSampler, SamplerStats};
use super::util::conf::Config;
use super::vision::camera::FrameSource;
use super::vision::preprocess::Preprocessor;

/// A detection with its treatment tips.
///
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnosis {
    pub detection: DetectionResult,
    pub remedies: Vec<String>,
}

pub struct Scanner {
    registry: Arc<ModelRegistry>,
    cascade: Cascade,
    remedies: RemedyResolver,
    sampler: Option<LiveSampler>,
}

impl Scanner {
    pub fn new(registry: Arc<ModelRegistry>, cascade: Cascade, sampler: Option<LiveSampler>) -> Self {
        Self {
            registry,
            cascade,
            remedies: RemedyResolver::new(),
            sampler,
        }
    }

    /// Builds the backends named in `conf`. Live mode needs a frame source.
    pub fn from_config(
        conf: &Config,
        frames: Option<Box<dyn FrameSource>>,
    ) -> Result<Self, InferenceError> {
        let loader = OnnxLoader::new(
            &conf.system.model_dir,
            &conf.detector.model,
            &conf.classifier.model,
            conf.detector.threads,
        );
        let registry = Arc::new(ModelRegistry::new(Box::new(loader)));
        Self::with_registry(conf, registry, frames)
    }

    /// Same as `from_config` over an existing registry.
    pub fn with_registry(
        conf: &Config,
        registry: Arc<ModelRegistry>,
        frames: Option<Box<dyn FrameSource>>,
    ) -> Result<Self, InferenceError> {
        let preprocessor = Preprocessor::new();
        let detector = Arc::new(
            DiseaseDetector::new(
                Arc::clone(&registry),
                &conf.detector.variant,
                conf.detector.threshold,
            )
            .with_box_params(conf.live.box_threshold, conf.live.nms_iou),
        );

        let mut backends: Vec<Arc<dyn InferenceBackend>> = vec![];
        if conf.detector.enabled {
            backends.push(detector.clone());
        }
        if conf.classifier.enabled {
            backends.push(Arc::new(CropClassifier::new(
                Arc::clone(&registry),
                conf.classifier.threshold,
            )));
        }
        if conf.remote.enabled {
            let token = Some(conf.remote.token.clone());
            backends.push(Arc::new(RemoteClassifier::new(
                &conf.remote.url,
                token,
                Duration::from_millis(conf.remote.timeout_ms),
                conf.remote.threshold,
            )?));
        }
        log::info!(
            "Cascade: {}",
            backends
                .iter()
                .map(|b| b.source().to_string())
                .collect::<Vec<_>>()
                .join(" -> ")
        );

        let sampler = frames.map(|frames| {
            let live: Arc<dyn BoxDetector> = detector;
            LiveSampler::new(
                live,
                frames,
                preprocessor.clone(),
                Duration::from_millis(conf.live.interval_ms),
            )
        });
        let cascade = Cascade::new(backends, preprocessor);
        Ok(Self::new(registry, cascade, sampler))
    }

    pub fn cascade(&self) -> &Cascade {
        &self.cascade
    }

    /// Single-shot scan through the full cascade.
    pub fn scan(
        &self,
        image: &DynamicImage,
        crop: Option<CropType>,
    ) -> Result<Option<DetectionResult>, CascadeError> {
        self.cascade.detect(image, crop)
    }

    /// Scan plus remedies for the detected disease.
    pub fn diagnose(
        &self,
        image: &DynamicImage,
        crop: Option<CropType>,
    ) -> Result<Option<Diagnosis>, CascadeError> {
        Ok(self.scan(image, crop)?.map(|detection| Diagnosis {
            remedies: self.remedies.resolve(&detection.disease_name),
            detection,
        }))
    }

    /// Diagnoses an image file.
    pub fn diagnose_path(
        &self,
        path: &Path,
        crop: Option<CropType>,
    ) -> Result<Option<Diagnosis>, CascadeError> {
        let image = Preprocessor::open(path)?;
        self.diagnose(&image, crop)
    }

    pub fn remedies(&self, disease_name: &str) -> Vec<String> {
        self.remedies.resolve(disease_name)
    }

    fn sampler(&self) -> Result<&LiveSampler, CaptureError> {
        self.sampler.as_ref().ok_or(CaptureError::NoSource)
    }

    /// Starts live mode. `Ok(false)` when already running.
    pub fn start_live(&self, crop: Option<CropType>) -> Result<bool, CaptureError> {
        Ok(self.sampler()?.start(crop))
    }

    pub fn stop_live(&self) {
        if let Some(sampler) = &self.sampler {
            sampler.stop();
        }
    }

    pub fn is_live(&self) -> bool {
        self.sampler.as_ref().is_some_and(|s| s.is_running())
    }

    /// The latest published box set, empty when idle.
    pub fn live_boxes(&self) -> Vec<BoundingBox> {
        self.sampler
            .as_ref()
            .map(|s| s.current_boxes())
            .unwrap_or_default()
    }

    /// Box sets published by live mode.
    pub fn subscribe(&self) -> Result<Receiver<BoxUpdate>, CaptureError> {
        Ok(self.sampler()?.subscribe())
    }

    pub fn live_stats(&self) -> Option<SamplerStats> {
        self.sampler.as_ref().map(|s| s.stats())
    }

    pub fn registry_status(&self) -> RegistryStatus {
        self.registry.status()
    }

    /// Stops live mode, waits for its worker and drops every loaded model.
    pub fn shutdown(&self) {
        if let Some(sampler) = &self.sampler {
            sampler.shutdown();
        }
        self.registry.release_all();
    }
}
