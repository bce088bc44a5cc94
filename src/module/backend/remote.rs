//! Remote Classification Service
//!
//! Uploads the preprocessed frame as JPEG to the crop classification service.
//! The service answers for one crop at a time, so a request needs a crop filter.
//!
use image::codecs::jpeg::JpegEncoder;
use reqwest::blocking::{multipart, Client};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use std::time::Duration;

use super::{DetectionResult, DetectionSource, InferenceBackend};
use crate::module::classes::CropType;
use crate::module::define;
use crate::module::error::InferenceError;
use crate::module::vision::preprocess::{
    InputContract, Layout, Normalization, ResizePolicy, Tensor,
};

/// 256 * 256 stretched, raw [0, 255] values. Re-encoded to JPEG for upload.
pub const CONTRACT: InputContract = InputContract {
    size: 256,
    resize: ResizePolicy::Stretch,
    normalization: Normalization::Raw,
    layout: Layout::Nhwc,
};

/// Service response body.
///
#[derive(Debug, Deserialize)]
struct Prediction {
    disease_name: String,
    confidence_score: f32,
    #[serde(default)]
    remedies: Vec<String>,
    #[serde(default)]
    all_predictions: Vec<ClassScore>,
}

#[derive(Debug, Deserialize)]
struct ClassScore {
    class: String,
    confidence: f32,
}

/// Remote backend.
///
pub struct RemoteClassifier {
    client: Client,
    url: String,
    token: Option<String>,
    threshold: f32,
}

impl RemoteClassifier {
    pub fn new(
        url: &str,
        token: Option<String>,
        timeout: Duration,
        threshold: f32,
    ) -> Result<Self, InferenceError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_owned(),
            token: token.filter(|t| !t.is_empty()),
            threshold,
        })
    }

    fn encode(tensor: &Tensor) -> Result<Vec<u8>, InferenceError> {
        let rgb = tensor.to_rgb_image()?;
        let mut jpeg = vec![];
        JpegEncoder::new_with_quality(&mut jpeg, define::inference::UPLOAD_JPEG_QUALITY)
            .encode_image(&rgb)
            .map_err(|e| InferenceError::Runtime(format!("can't encode upload: {}", e)))?;
        Ok(jpeg)
    }

    fn request(&self, jpeg: Vec<u8>, crop: CropType) -> Result<Prediction, InferenceError> {
        let mut head = HeaderMap::new();
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| InferenceError::Transport(format!("invalid token: {}", e)))?;
            head.insert(AUTHORIZATION, value);
        }

        let image = multipart::Part::bytes(jpeg)
            .file_name("image.jpg")
            .mime_str("image/jpeg")?;
        let form = multipart::Form::new()
            .text("crop_type", crop.as_str().to_owned())
            .part("image", image);

        let res = self
            .client
            .post(&self.url)
            .headers(head)
            .multipart(form)
            .send()?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().unwrap_or_default();
            return Err(InferenceError::Service {
                status: status.as_u16(),
                body,
            });
        }
        Ok(res.json::<Prediction>()?)
    }
}

impl InferenceBackend for RemoteClassifier {
    fn source(&self) -> DetectionSource {
        DetectionSource::Remote
    }

    fn contract(&self) -> InputContract {
        CONTRACT
    }

    fn predict(
        &self,
        tensor: Tensor,
        crop_filter: Option<CropType>,
    ) -> Result<Option<DetectionResult>, InferenceError> {
        tensor.check_contract(&CONTRACT)?;
        let crop = crop_filter.ok_or(InferenceError::CropRequired)?;
        let jpeg = Self::encode(&tensor)?;
        drop(tensor);

        let prediction = self.request(jpeg, crop)?;
        log::debug!(
            "[{}] {} ({:.3}), {} remedies, runner-up {:?}",
            self.source(),
            prediction.disease_name,
            prediction.confidence_score,
            prediction.remedies.len(),
            prediction
                .all_predictions
                .get(1)
                .map(|p| (&p.class, p.confidence))
        );

        let name = prediction.disease_name.trim();
        let confidence = prediction.confidence_score;
        if name.is_empty() {
            return Err(InferenceError::MalformedResponse("empty disease_name".into()));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(InferenceError::MalformedResponse(format!(
                "confidence_score {} out of range",
                confidence
            )));
        }
        if confidence < self.threshold {
            log::debug!(
                "[{}] {} below threshold ({:.3} < {:.3})",
                self.source(),
                name,
                confidence,
                self.threshold
            );
            return Ok(None);
        }
        Ok(Some(DetectionResult {
            disease_name: name.to_owned(),
            confidence_score: confidence,
            is_healthy: name.to_ascii_lowercase().contains("healthy"),
            crop_type: crop,
            source: self.source(),
        }))
    }
}
