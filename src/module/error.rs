//! Error taxonomy of the inference pipeline.
//!
//! Below-threshold and crop-mismatch outcomes are not errors, they are
//! represented as `Ok(None)` by the backends.

use thiserror::Error;

use super::backend::DetectionSource;
use super::registry::ModelKey;

/// The source image could not be decoded or resized. Fatal for the call.
#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("can't decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("can't read image {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("image has no pixels ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("invalid target size {0}")]
    TargetSize(u32),
}

/// A model could not be loaded for a registry key.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("model {key} unavailable: {reason}")]
pub struct ModelUnavailable {
    pub key: ModelKey,
    pub reason: String,
}

/// A single backend failed to produce an answer.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error(transparent)]
    ModelUnavailable(#[from] ModelUnavailable),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("unexpected model output: {0}")]
    UnexpectedOutput(String),
    #[error("tensor contract violated: {0}")]
    Contract(String),
    #[error("service unreachable: {0}")]
    Transport(String),
    #[error("service returned {status}: {body}")]
    Service { status: u16, body: String },
    #[error("malformed service response: {0}")]
    MalformedResponse(String),
    #[error("a crop type is required")]
    CropRequired,
}

impl From<reqwest::Error> for InferenceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            InferenceError::MalformedResponse(e.to_string())
        } else {
            InferenceError::Transport(e.to_string())
        }
    }
}

/// Failure of a whole cascade run.
#[derive(Error, Debug)]
pub enum CascadeError {
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error("all {} backends failed", .0.len())]
    AllBackendsFailed(Vec<(DetectionSource, InferenceError)>),
    #[error("no backends configured")]
    NoBackends,
}

impl CascadeError {
    /// Message shown to the user for a failed single-shot scan.
    pub fn user_message(&self) -> &'static str {
        match self {
            CascadeError::Preprocess(_) => "could not read image, try another photo",
            CascadeError::AllBackendsFailed(_) | CascadeError::NoBackends => {
                "could not analyze image, try again"
            }
        }
    }
}

/// A frame could not be captured from a frame source.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera error: {0}")]
    Device(String),
    #[error("frame source exhausted")]
    Exhausted,
    #[error("no frame source configured")]
    NoSource,
    #[error(transparent)]
    Decode(#[from] PreprocessError),
}

/// Configuration could not be loaded or saved.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("can't parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("can't serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("can't prepare directory {0}")]
    Dir(String),
}

/// A crop name outside the supported set.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("unsupported crop type '{0}', expected one of apple, corn, potato, tomato")]
pub struct CropParseError(pub String);
