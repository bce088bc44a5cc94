//! Model Registry
//!
//! Lazily loads backend models and caches one handle per key. Handles are shared
//! by reference across predict calls and only torn down by `release_all`.

use ndarray::ArrayD;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::classes::CropType;
use super::define;
use super::error::{InferenceError, ModelUnavailable};
use super::vision::preprocess::Tensor;

/// Model families known to the registry.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModelKind {
    Detector,
    Classifier,
}

/// Registry key: model family plus crop or version variant.
///
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelKey {
    pub kind: ModelKind,
    pub variant: String,
}

impl ModelKey {
    pub fn detector(variant: &str) -> Self {
        Self {
            kind: ModelKind::Detector,
            variant: variant.to_owned(),
        }
    }

    pub fn classifier(crop: CropType) -> Self {
        Self {
            kind: ModelKind::Classifier,
            variant: crop.as_str().to_owned(),
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ModelKind::Detector => "detector",
            ModelKind::Classifier => "classifier",
        };
        write!(f, "{}/{}", kind, self.variant)
    }
}

/// A loaded, ready-to-run model.
pub trait ModelRunner: Send + Sync {
    /// Run one input tensor, return the first output.
    fn run(&self, input: &Tensor) -> Result<ArrayD<f32>, InferenceError>;
}

/// Shared handle to a cached model.
pub type ModelHandle = Arc<dyn ModelRunner>;

/// Loads a model for a key from its bundled asset.
pub trait ModelLoader: Send + Sync {
    fn load(&self, key: &ModelKey) -> Result<ModelHandle, String>;
}

enum Slot {
    Loaded(ModelHandle),
    Unavailable(String),
}

/// Snapshot of what the registry holds.
///
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryStatus {
    pub loaded: Vec<ModelKey>,
    pub unavailable: Vec<(ModelKey, String)>,
}

/// Lazily populated model cache, owned by the application context.
///
pub struct ModelRegistry {
    loader: Box<dyn ModelLoader>,
    slots: Mutex<HashMap<ModelKey, Slot>>,
}

impl ModelRegistry {
    pub fn new(loader: Box<dyn ModelLoader>) -> Self {
        Self {
            loader,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached handle for `key`, loading it on first use.
    ///
    /// A failed load is remembered, later calls fail fast until `release_all`.
    pub fn acquire(&self, key: &ModelKey) -> Result<ModelHandle, ModelUnavailable> {
        {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            match slots.get(key) {
                Some(Slot::Loaded(handle)) => return Ok(Arc::clone(handle)),
                Some(Slot::Unavailable(reason)) => {
                    return Err(ModelUnavailable {
                        key: key.clone(),
                        reason: reason.clone(),
                    })
                }
                None => (),
            }
        }

        // Load outside the lock so a slow model doesn't hold up other keys.
        let loaded = self.loader.load(key);

        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        // Another caller may have finished first, keep its slot.
        let slot = slots.entry(key.clone()).or_insert_with(|| match loaded {
            Ok(handle) => {
                log::info!("Model {} loaded", key);
                Slot::Loaded(handle)
            }
            Err(reason) => {
                log::warn!("Model {} unavailable: {}", key, reason);
                Slot::Unavailable(reason)
            }
        });
        match slot {
            Slot::Loaded(handle) => Ok(Arc::clone(handle)),
            Slot::Unavailable(reason) => Err(ModelUnavailable {
                key: key.clone(),
                reason: reason.clone(),
            }),
        }
    }

    /// Drops every cached handle. Later `acquire` calls load again.
    pub fn release_all(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let count = slots.len();
        slots.clear();
        log::info!("Released {} model slots", count);
    }

    pub fn status(&self) -> RegistryStatus {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut status = RegistryStatus::default();
        for (key, slot) in slots.iter() {
            match slot {
                Slot::Loaded(_) => status.loaded.push(key.clone()),
                Slot::Unavailable(reason) => status.unavailable.push((key.clone(), reason.clone())),
            }
        }
        status.loaded.sort();
        status.unavailable.sort_by(|a, b| a.0.cmp(&b.0));
        status
    }
}

/// ONNX Runtime model.
///
pub struct OnnxModel {
    session: Session,
    output: String,
}

impl OnnxModel {
    /// Build a CPU session for the model at `model_path`.
    ///
    pub fn load(name: &str, model_path: &Path, intra_threads: i16) -> Result<Self, String> {
        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level1))
            .and_then(|b| b.with_intra_threads(intra_threads.max(1) as usize))
            .and_then(|b| b.commit_from_file(model_path))
            .map_err(|e| format!("{}: {}", name, e))?;
        let output = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| format!("{}: model declares no outputs", name))?;
        Ok(Self { session, output })
    }
}

impl ModelRunner for OnnxModel {
    fn run(&self, input: &Tensor) -> Result<ArrayD<f32>, InferenceError> {
        let runtime = |e: ort::Error| InferenceError::Runtime(e.to_string());
        let inputs = ort::inputs![input.view()].map_err(runtime)?;
        let outputs = self.session.run(inputs).map_err(runtime)?;
        let out = outputs[self.output.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(runtime)?
            .to_owned();
        Ok(out)
    }
}

/// Loads bundled ONNX assets from a model directory.
///
pub struct OnnxLoader {
    model_dir: PathBuf,
    detector_model: String,
    classifier_model: String,
    intra_threads: i16,
}

impl OnnxLoader {
    pub fn new(
        model_dir: &str,
        detector_model: &str,
        classifier_model: &str,
        intra_threads: i16,
    ) -> Self {
        Self {
            model_dir: PathBuf::from(model_dir),
            detector_model: detector_model.to_owned(),
            classifier_model: classifier_model.to_owned(),
            intra_threads,
        }
    }

    /// Asset file for a key.
    pub fn asset_path(&self, key: &ModelKey) -> PathBuf {
        match key.kind {
            ModelKind::Detector => self.model_dir.join(&self.detector_model),
            ModelKind::Classifier => self
                .model_dir
                .join(self.classifier_model.replace("{crop}", &key.variant)),
        }
    }
}

impl Default for OnnxLoader {
    fn default() -> Self {
        Self::new(
            define::path::MODEL_DIR,
            define::path::DETECTOR_416_MODEL,
            define::path::CLASSIFIER_256_MODEL,
            4,
        )
    }
}

impl ModelLoader for OnnxLoader {
    fn load(&self, key: &ModelKey) -> Result<ModelHandle, String> {
        let path = self.asset_path(key);
        if !path.is_file() {
            return Err(format!("asset not found: {}", path.display()));
        }
        let model = OnnxModel::load(&key.to_string(), &path, self.intra_threads)?;
        Ok(Arc::new(model))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Zeros;

    impl ModelRunner for Zeros {
        fn run(&self, _input: &Tensor) -> Result<ArrayD<f32>, InferenceError> {
            Ok(ArrayD::zeros(ndarray::IxDyn(&[1, 3])))
        }
    }

    /// Loads everything except potato, counting loads.
    struct CountingLoader {
        loads: Arc<AtomicUsize>,
    }

    impl ModelLoader for CountingLoader {
        fn load(&self, key: &ModelKey) -> Result<ModelHandle, String> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if key.variant == "potato" {
                return Err("no potato asset".into());
            }
            Ok(Arc::new(Zeros))
        }
    }

    fn registry() -> (ModelRegistry, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let loader = CountingLoader {
            loads: Arc::clone(&loads),
        };
        (ModelRegistry::new(Box::new(loader)), loads)
    }

    #[test]
    fn acquire_is_idempotent_test() {
        let (registry, loads) = registry();
        let key = ModelKey::classifier(CropType::Tomato);
        let a = registry.acquire(&key).unwrap();
        let b = registry.acquire(&key).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_load_is_isolated_test() {
        let (registry, loads) = registry();
        let potato = ModelKey::classifier(CropType::Potato);
        let err = registry.acquire(&potato).err().unwrap();
        assert_eq!(err.key, potato);
        // Remembered, no second load attempt.
        assert!(registry.acquire(&potato).is_err());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        // Other keys still load.
        assert!(registry.acquire(&ModelKey::detector("yolov8_416")).is_ok());
        let status = registry.status();
        assert_eq!(status.loaded, vec![ModelKey::detector("yolov8_416")]);
        assert_eq!(status.unavailable.len(), 1);
    }

    #[test]
    fn release_all_reloads_test() {
        let (registry, loads) = registry();
        let key = ModelKey::detector("yolov8_416");
        let before = registry.acquire(&key).unwrap();
        registry.release_all();
        assert_eq!(registry.status(), RegistryStatus::default());
        let after = registry.acquire(&key).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn onnx_loader_missing_asset_test() {
        let loader = OnnxLoader::new("/nonexistent/leafscan", "det.onnx", "{crop}_cls.onnx", 1);
        let key = ModelKey::classifier(CropType::Corn);
        assert_eq!(
            loader.asset_path(&key),
            PathBuf::from("/nonexistent/leafscan/corn_cls.onnx")
        );
        let registry = ModelRegistry::new(Box::new(loader));
        let err = registry.acquire(&key).err().unwrap();
        assert!(err.reason.contains("asset not found"));
    }
}
