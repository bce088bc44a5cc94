//! Per-crop Disease Classifier
//!
//! One small classification model per crop. The models carry their own
//! rescaling layer and take raw [0, 255] pixels.
//!
use std::sync::Arc;

use super::{argmax, qualify, DetectionResult, DetectionSource, InferenceBackend};
use crate::module::classes::{ClassTable, CropType};
use crate::module::error::InferenceError;
use crate::module::registry::{ModelKey, ModelRegistry};
use crate::module::vision::preprocess::{
    InputContract, Layout, Normalization, ResizePolicy, Tensor,
};

/// 256 * 256 center-cropped, raw [0, 255] values, NHWC.
pub const CONTRACT: InputContract = InputContract {
    size: 256,
    resize: ResizePolicy::Cover,
    normalization: Normalization::Raw,
    layout: Layout::Nhwc,
};

/// Local backend B.
///
pub struct CropClassifier {
    registry: Arc<ModelRegistry>,
    threshold: f32,
}

impl CropClassifier {
    pub fn new(registry: Arc<ModelRegistry>, threshold: f32) -> Self {
        Self {
            registry,
            threshold,
        }
    }

    /// Runs the model of one crop.
    fn classify(
        &self,
        tensor: &Tensor,
        crop: CropType,
    ) -> Result<Option<DetectionResult>, InferenceError> {
        let model = self.registry.acquire(&ModelKey::classifier(crop))?;
        let output = tensor.derive(model.run(tensor)?, Layout::Output);
        let scores: Vec<f32> = output.view().iter().copied().collect();
        drop(output);

        let table = ClassTable::for_crop(crop);
        if scores.len() != table.len() {
            return Err(InferenceError::UnexpectedOutput(format!(
                "{} model returned {} scores for {} classes",
                crop,
                scores.len(),
                table.len()
            )));
        }
        let (index, confidence) = argmax(&scores)
            .ok_or_else(|| InferenceError::UnexpectedOutput("no class scores".into()))?;
        let entry = table.get(index).ok_or_else(|| {
            InferenceError::UnexpectedOutput(format!("class index {} out of range", index))
        })?;
        Ok(qualify(
            entry,
            confidence,
            self.threshold,
            Some(crop),
            self.source(),
        ))
    }
}

impl InferenceBackend for CropClassifier {
    fn source(&self) -> DetectionSource {
        DetectionSource::LocalClassifier
    }

    fn contract(&self) -> InputContract {
        CONTRACT
    }

    /// With a crop filter only that crop's model runs. Otherwise every
    /// available crop model runs and the strongest qualifying result wins.
    fn predict(
        &self,
        tensor: Tensor,
        crop_filter: Option<CropType>,
    ) -> Result<Option<DetectionResult>, InferenceError> {
        tensor.check_contract(&CONTRACT)?;
        if let Some(crop) = crop_filter {
            return self.classify(&tensor, crop);
        }

        let mut best: Option<DetectionResult> = None;
        let mut answered = false;
        let mut last_err = None;
        for crop in CropType::ALL {
            match self.classify(&tensor, crop) {
                Ok(Some(res)) => {
                    answered = true;
                    // Strictly greater keeps the earlier crop on ties.
                    if best
                        .as_ref()
                        .map_or(true, |b| res.confidence_score > b.confidence_score)
                    {
                        best = Some(res);
                    }
                }
                Ok(None) => answered = true,
                Err(e) => {
                    log::warn!("[{}] {} model skipped: {}", self.source(), crop, e);
                    last_err = Some(e);
                }
            }
        }
        match (answered, last_err) {
            (false, Some(e)) => Err(e),
            _ => Ok(best),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::registry::fake::MapLoader;
    use crate::module::vision::preprocess::Preprocessor;
    use image::{DynamicImage, RgbImage};
    use ndarray::{Array2, ArrayD};

    fn leaf(pre: &Preprocessor) -> Tensor {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 200, image::Rgb([90, 140, 30])));
        pre.preprocess(&img, &CONTRACT).unwrap()
    }

    fn out(scores: &[f32]) -> ArrayD<f32> {
        Array2::from_shape_vec((1, scores.len()), scores.to_vec())
            .unwrap()
            .into_dyn()
    }

    fn key(crop: CropType) -> ModelKey {
        ModelKey::classifier(crop)
    }

    #[test]
    fn filtered_crop_test() {
        let (registry, calls) = MapLoader::default()
            .with(key(CropType::Tomato), out(&[0.05, 0.7, 0.1, 0.05, 0.05, 0.05]))
            .with(key(CropType::Apple), out(&[0.9, 0.0, 0.0, 0.0, 0.0, 0.0, 0.1]))
            .into_registry();
        let cls = CropClassifier::new(registry, 0.6);
        let pre = Preprocessor::new();
        let res = cls.predict(leaf(&pre), Some(CropType::Tomato)).unwrap().unwrap();
        assert_eq!(res.disease_name, "Early Blight");
        assert_eq!(res.crop_type, CropType::Tomato);
        assert_eq!(res.source, DetectionSource::LocalClassifier);
        // Only the tomato model ran.
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(pre.ledger().live(), 0);
    }

    #[test]
    fn best_crop_without_filter_test() {
        let (registry, _) = MapLoader::default()
            .with(key(CropType::Apple), out(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.35, 0.65]))
            .with(key(CropType::Tomato), out(&[0.02, 0.02, 0.02, 0.02, 0.02, 0.9]))
            .into_registry();
        let cls = CropClassifier::new(registry, 0.6);
        let pre = Preprocessor::new();
        let res = cls.predict(leaf(&pre), None).unwrap().unwrap();
        assert_eq!(res.disease_name, "Healthy");
        assert_eq!(res.crop_type, CropType::Tomato);
        assert!(res.is_healthy);
        assert_eq!(pre.ledger().live(), 0);
    }

    #[test]
    fn tie_keeps_crop_order_test() {
        let (registry, _) = MapLoader::default()
            .with(key(CropType::Corn), out(&[0.8, 0.1, 0.1]))
            .with(key(CropType::Apple), out(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.2, 0.8]))
            .into_registry();
        let cls = CropClassifier::new(registry, 0.6);
        let res = cls.predict(leaf(&Preprocessor::new()), None).unwrap().unwrap();
        assert_eq!(res.crop_type, CropType::Apple);
        assert_eq!(res.disease_name, "Scab");
    }

    #[test]
    fn skips_missing_crop_models_test() {
        let (registry, _) = MapLoader::default()
            .with(key(CropType::Tomato), out(&[0.05, 0.05, 0.8, 0.05, 0.025, 0.025]))
            .into_registry();
        let cls = CropClassifier::new(Arc::clone(&registry), 0.6);
        let res = cls.predict(leaf(&Preprocessor::new()), None).unwrap().unwrap();
        assert_eq!(res.crop_type, CropType::Tomato);
        let status = registry.status();
        assert_eq!(status.loaded, vec![key(CropType::Tomato)]);
        let missing: Vec<_> = status.unavailable.into_iter().map(|(k, _)| k).collect();
        for crop in [CropType::Apple, CropType::Corn, CropType::Potato] {
            assert!(missing.contains(&key(crop)), "{}", crop);
        }
    }

    #[test]
    fn nothing_qualifies_test() {
        let (registry, _) = MapLoader::default()
            .with(key(CropType::Potato), out(&[0.4, 0.3, 0.3]))
            .into_registry();
        let cls = CropClassifier::new(registry, 0.6);
        assert!(cls.predict(leaf(&Preprocessor::new()), None).unwrap().is_none());
    }

    #[test]
    fn all_models_missing_test() {
        let (registry, _) = MapLoader::default().into_registry();
        let cls = CropClassifier::new(registry, 0.6);
        let pre = Preprocessor::new();
        let err = cls.predict(leaf(&pre), None).unwrap_err();
        assert!(matches!(err, InferenceError::ModelUnavailable(_)));
        let err = cls.predict(leaf(&pre), Some(CropType::Corn)).unwrap_err();
        assert!(matches!(err, InferenceError::ModelUnavailable(_)));
        assert_eq!(pre.ledger().live(), 0);
    }

    #[test]
    fn wrong_class_count_test() {
        let (registry, _) = MapLoader::default()
            .with(key(CropType::Corn), out(&[0.9, 0.1]))
            .into_registry();
        let cls = CropClassifier::new(registry, 0.6);
        let err = cls
            .predict(leaf(&Preprocessor::new()), Some(CropType::Corn))
            .unwrap_err();
        assert!(matches!(err, InferenceError::UnexpectedOutput(_)));
    }

    #[test]
    fn rejects_unit_tensor_test() {
        let (registry, calls) = MapLoader::default()
            .with(key(CropType::Corn), out(&[0.9, 0.05, 0.05]))
            .into_registry();
        let cls = CropClassifier::new(registry, 0.6);
        let pre = Preprocessor::new();
        let unit = InputContract {
            normalization: Normalization::Unit,
            ..CONTRACT
        };
        let img = DynamicImage::ImageRgb8(RgbImage::new(16, 16));
        let tensor = pre.preprocess(&img, &unit).unwrap();
        let err = cls.predict(tensor, Some(CropType::Corn)).unwrap_err();
        assert!(matches!(err, InferenceError::Contract(_)));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
