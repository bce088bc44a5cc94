//! Unified Disease Detector
//!
//! YOLOv8-style ONNX model trained on every supported crop at once. Serves
//! single-shot classification for the cascade and boxes for the live sampler.
//!
use ndarray::{s, ArrayView2, ArrayViewD, Axis, Ix3};
use std::sync::Arc;

use super::{
    argmax, qualify, BoundingBox, BoxDetector, DetectionResult, DetectionSource, InferenceBackend,
};
use crate::module::classes::{ClassEntry, ClassTable, CropType};
use crate::module::define;
use crate::module::error::InferenceError;
use crate::module::registry::{ModelKey, ModelRegistry};
use crate::module::vision::preprocess::{
    InputContract, Layout, Normalization, ResizePolicy, Tensor,
};

/// 416 * 416 stretched, values in [0, 1], NCHW.
pub const CONTRACT: InputContract = InputContract {
    size: 416,
    resize: ResizePolicy::Stretch,
    normalization: Normalization::Unit,
    layout: Layout::Nchw,
};

/// Decoded model output.
#[derive(Debug)]
enum Decoded {
    /// One score per class.
    Scores(Vec<f32>),
    /// One candidate per anchor, coordinates in input pixels.
    Boxes(Vec<Candidate>),
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    cls: usize,
    prob: f32,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// Local backend A.
///
pub struct DiseaseDetector {
    registry: Arc<ModelRegistry>,
    key: ModelKey,
    classes: ClassTable,
    threshold: f32,
    box_threshold: f32,
    nms_iou: f32,
}

impl DiseaseDetector {
    pub fn new(registry: Arc<ModelRegistry>, variant: &str, threshold: f32) -> Self {
        Self {
            registry,
            key: ModelKey::detector(variant),
            classes: ClassTable::unified(),
            threshold,
            box_threshold: define::inference::BOX_THRESHOLD,
            nms_iou: define::inference::NMS_IOU,
        }
    }

    /// Per-box threshold and merge IoU for live boxes.
    pub fn with_box_params(mut self, box_threshold: f32, nms_iou: f32) -> Self {
        self.box_threshold = box_threshold;
        self.nms_iou = nms_iou;
        self
    }

    fn infer(&self, tensor: Tensor) -> Result<Decoded, InferenceError> {
        tensor.check_contract(&CONTRACT)?;
        let model = self.registry.acquire(&self.key)?;
        let input = tensor.to_layout(CONTRACT.layout)?;
        drop(tensor);
        let output = input.derive(model.run(&input)?, Layout::Output);
        decode(output.view(), self.classes.len())
    }

    fn entry(&self, cls: usize) -> Result<&ClassEntry, InferenceError> {
        self.classes.get(cls).ok_or_else(|| {
            InferenceError::UnexpectedOutput(format!("class index {} out of range", cls))
        })
    }
}

impl InferenceBackend for DiseaseDetector {
    fn source(&self) -> DetectionSource {
        DetectionSource::LocalDetector
    }

    fn contract(&self) -> InputContract {
        CONTRACT
    }

    fn predict(
        &self,
        tensor: Tensor,
        crop_filter: Option<CropType>,
    ) -> Result<Option<DetectionResult>, InferenceError> {
        let (cls, prob) = match self.infer(tensor)? {
            Decoded::Scores(scores) => match argmax(&scores) {
                Some(best) => best,
                None => return Err(InferenceError::UnexpectedOutput("no class scores".into())),
            },
            Decoded::Boxes(candidates) => {
                // Highest probability first, ties to the lowest class index.
                let best = candidates
                    .iter()
                    .filter(|c| !c.prob.is_nan())
                    .reduce(|acc, c| {
                        if c.prob > acc.prob || (c.prob == acc.prob && c.cls < acc.cls) {
                            c
                        } else {
                            acc
                        }
                    });
                match best {
                    Some(c) => (c.cls, c.prob),
                    None => return Ok(None),
                }
            }
        };
        let entry = self.entry(cls)?;
        Ok(qualify(entry, prob, self.threshold, crop_filter, self.source()))
    }
}

impl BoxDetector for DiseaseDetector {
    fn contract(&self) -> InputContract {
        CONTRACT
    }

    fn detect_boxes(
        &self,
        tensor: Tensor,
        crop_filter: Option<CropType>,
    ) -> Result<Vec<BoundingBox>, InferenceError> {
        let sz = CONTRACT.size as f32;
        let candidates = match self.infer(tensor)? {
            Decoded::Boxes(candidates) => candidates,
            // A classification head covers the whole frame.
            Decoded::Scores(scores) => match argmax(&scores) {
                Some((cls, prob)) => vec![Candidate {
                    cls,
                    prob,
                    x1: 0.0,
                    y1: 0.0,
                    x2: sz,
                    y2: sz,
                }],
                None => vec![],
            },
        };

        let mut kept = vec![];
        for c in candidates {
            if !(c.prob >= self.box_threshold) {
                continue;
            }
            let entry = self.entry(c.cls)?;
            if crop_filter.map_or(false, |crop| crop != entry.crop_type) {
                continue;
            }
            kept.push(c);
        }

        let mut boxes = vec![];
        for c in merge_candidates(kept, self.nms_iou) {
            let entry = self.entry(c.cls)?;
            let x1 = (c.x1 / sz).clamp(0.0, 1.0);
            let y1 = (c.y1 / sz).clamp(0.0, 1.0);
            let x2 = (c.x2 / sz).clamp(0.0, 1.0);
            let y2 = (c.y2 / sz).clamp(0.0, 1.0);
            boxes.push(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                label: entry.disease_name.to_owned(),
                confidence: c.prob,
            });
        }
        Ok(boxes)
    }
}

/// Accepts a score vector (`[N]` or `[1, N]`) or a YOLOv8 head
/// (`[1, 4 + N, anchors]`, or anchors first).
fn decode(out: ArrayViewD<'_, f32>, num_classes: usize) -> Result<Decoded, InferenceError> {
    let shape = out.shape().to_vec();
    let unexpected = || {
        InferenceError::UnexpectedOutput(format!(
            "shape {:?} for {} classes",
            shape, num_classes
        ))
    };
    match out.ndim() {
        1 | 2 if out.len() == num_classes => Ok(Decoded::Scores(out.iter().copied().collect())),
        3 if shape[0] == 1 => {
            let width = 4 + num_classes;
            let out = out.into_dimensionality::<Ix3>().map_err(|_| unexpected())?;
            let rows: ArrayView2<'_, f32> = if shape[1] == width {
                out.slice_move(s![0, .., ..]).reversed_axes()
            } else if shape[2] == width {
                out.slice_move(s![0, .., ..])
            } else {
                return Err(unexpected());
            };
            Ok(Decoded::Boxes(convert_yolo_fmt(rows)))
        }
        _ => Err(unexpected()),
    }
}

/// One row per anchor: `xc, yc, w, h, score_0 .. score_N`.
fn convert_yolo_fmt(rows: ArrayView2<'_, f32>) -> Vec<Candidate> {
    let mut candidates = vec![];
    for row in rows.axis_iter(Axis(0)) {
        let scores = row.slice(s![4..]).to_vec();
        let (cls, prob) = match argmax(&scores) {
            Some(best) => best,
            None => continue,
        };
        let (xc, yc, w, h) = (row[0], row[1], row[2], row[3]);
        candidates.push(Candidate {
            cls,
            prob,
            x1: xc - w / 2.0,
            y1: yc - h / 2.0,
            x2: xc + w / 2.0,
            y2: yc + h / 2.0,
        });
    }
    candidates
}

/// IoU of two boxes.
///
fn iou(r1: &Candidate, r2: &Candidate) -> f32 {
    let w = (r1.x2.min(r2.x2) - r1.x1.max(r2.x1)).max(0.0);
    let h = (r1.y2.min(r2.y2) - r1.y1.max(r2.y1)).max(0.0);
    let intersection = w * h;
    let union = r1.area() + r2.area() - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Merges same-class boxes whose IoU with the strongest one reaches `iou_threshold`.
///
/// The merged box spans all members and keeps the strongest probability.
fn merge_candidates(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.prob.total_cmp(&a.prob));
    let mut merged = vec![];
    let mut used = vec![false; candidates.len()];
    for i in 0..candidates.len() {
        if used[i] {
            continue;
        }
        used[i] = true;
        let mut group = candidates[i].clone();
        for j in (i + 1)..candidates.len() {
            if used[j] || candidates[i].cls != candidates[j].cls {
                continue;
            }
            if iou(&candidates[i], &candidates[j]) >= iou_threshold {
                group.x1 = group.x1.min(candidates[j].x1);
                group.y1 = group.y1.min(candidates[j].y1);
                group.x2 = group.x2.max(candidates[j].x2);
                group.y2 = group.y2.max(candidates[j].y2);
                used[j] = true;
            }
        }
        merged.push(group);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::registry::fake::MapLoader;
    use crate::module::vision::preprocess::Preprocessor;
    use image::{DynamicImage, RgbImage};
    use ndarray::{Array2, Array3, ArrayD};
    use std::sync::atomic::Ordering;

    const VARIANT: &str = "yolov8_416";

    fn detector(output: ArrayD<f32>) -> (DiseaseDetector, Arc<std::sync::atomic::AtomicUsize>) {
        let (registry, calls) = MapLoader::default()
            .with(ModelKey::detector(VARIANT), output)
            .into_registry();
        (DiseaseDetector::new(registry, VARIANT, 0.6), calls)
    }

    fn leaf(pre: &Preprocessor) -> Tensor {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, image::Rgb([40, 160, 60])));
        pre.preprocess(&img, &CONTRACT).unwrap()
    }

    fn scores(hot: usize, value: f32) -> ArrayD<f32> {
        let mut out = Array2::<f32>::from_elem((1, 16), 0.01);
        out[[0, hot]] = value;
        out.into_dyn()
    }

    /// `[1, 20, 3]` head: two overlapping tomato early blight boxes and a weak apple scab.
    fn yolo_head() -> ArrayD<f32> {
        let mut out = Array3::<f32>::zeros((1, 20, 3));
        let anchors = [
            (104.0, 104.0, 208.0, 208.0, 11, 0.9),
            (110.0, 104.0, 208.0, 208.0, 11, 0.7),
            (312.0, 312.0, 104.0, 104.0, 0, 0.3),
        ];
        for (a, &(xc, yc, w, h, cls, prob)) in anchors.iter().enumerate() {
            out[[0, 0, a]] = xc;
            out[[0, 1, a]] = yc;
            out[[0, 2, a]] = w;
            out[[0, 3, a]] = h;
            out[[0, 4 + cls, a]] = prob;
        }
        out.into_dyn()
    }

    #[test]
    fn classify_scores_test() {
        let (det, calls) = detector(scores(11, 0.82));
        let pre = Preprocessor::new();
        let res = det.predict(leaf(&pre), None).unwrap().unwrap();
        assert_eq!(res.disease_name, "Tomato Early Blight");
        assert_eq!(res.crop_type, CropType::Tomato);
        assert_eq!(res.source, DetectionSource::LocalDetector);
        assert!((res.confidence_score - 0.82).abs() < 1e-6);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pre.ledger().live(), 0);
    }

    #[test]
    fn below_threshold_and_filter_test() {
        let pre = Preprocessor::new();
        let (det, _) = detector(scores(11, 0.59));
        assert!(det.predict(leaf(&pre), None).unwrap().is_none());
        let (det, _) = detector(scores(11, 0.95));
        assert!(det.predict(leaf(&pre), Some(CropType::Potato)).unwrap().is_none());
        assert_eq!(pre.ledger().live(), 0);
    }

    #[test]
    fn classify_yolo_head_test() {
        let (det, _) = detector(yolo_head());
        let pre = Preprocessor::new();
        let res = det.predict(leaf(&pre), None).unwrap().unwrap();
        assert_eq!(res.disease_name, "Tomato Early Blight");
        assert!((res.confidence_score - 0.9).abs() < 1e-6);
        // The strongest box is tomato, so an apple filter yields nothing.
        assert!(det.predict(leaf(&pre), Some(CropType::Apple)).unwrap().is_none());
    }

    #[test]
    fn live_boxes_test() {
        let (det, _) = detector(yolo_head());
        let pre = Preprocessor::new();
        let boxes = det.detect_boxes(leaf(&pre), None).unwrap();
        assert_eq!(boxes.len(), 2);
        let first = &boxes[0];
        assert_eq!(first.label, "Tomato Early Blight");
        assert!((first.confidence - 0.9).abs() < 1e-6);
        assert!(first.x.abs() < 1e-6 && first.y.abs() < 1e-6);
        // Merged with the overlapping box, spans 0..214 px.
        assert!((first.width - 214.0 / 416.0).abs() < 1e-4);
        assert!((first.height - 0.5).abs() < 1e-4);
        assert_eq!(boxes[1].label, "Apple Scab");

        let tomato = det.detect_boxes(leaf(&pre), Some(CropType::Tomato)).unwrap();
        assert_eq!(tomato.len(), 1);

        let strict = DiseaseDetector::new(Arc::clone(&det.registry), VARIANT, 0.6)
            .with_box_params(0.5, 0.45);
        assert_eq!(strict.detect_boxes(leaf(&pre), None).unwrap().len(), 1);
        assert_eq!(pre.ledger().live(), 0);
    }

    #[test]
    fn unexpected_output_test() {
        let (det, _) = detector(ArrayD::zeros(ndarray::IxDyn(&[1, 7])));
        let pre = Preprocessor::new();
        let err = det.predict(leaf(&pre), None).unwrap_err();
        assert!(matches!(err, InferenceError::UnexpectedOutput(_)));
        assert_eq!(pre.ledger().live(), 0);
    }

    #[test]
    fn contract_violation_skips_model_test() {
        let (det, calls) = detector(scores(0, 0.9));
        let pre = Preprocessor::new();
        let raw = InputContract {
            normalization: Normalization::Raw,
            ..CONTRACT
        };
        let img = DynamicImage::ImageRgb8(RgbImage::new(8, 8));
        let tensor = pre.preprocess(&img, &raw).unwrap();
        let err = det.predict(tensor, None).unwrap_err();
        assert!(matches!(err, InferenceError::Contract(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_model_test() {
        let (registry, _) = MapLoader::default().into_registry();
        let det = DiseaseDetector::new(registry, VARIANT, 0.6);
        let pre = Preprocessor::new();
        let err = det.predict(leaf(&pre), None).unwrap_err();
        assert!(matches!(err, InferenceError::ModelUnavailable(_)));
        assert_eq!(pre.ledger().live(), 0);
    }

    #[test]
    fn iou_test() {
        let a = Candidate {
            cls: 0,
            prob: 0.9,
            x1: 0.0,
            y1: 0.0,
            x2: 10.0,
            y2: 10.0,
        };
        let b = Candidate {
            x1: 5.0,
            x2: 15.0,
            ..a.clone()
        };
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }
}
