//! Module for Constants and Paths Definitions
//!
//! This module defines various constants and paths used throughout the application.

/// System Constants
pub mod system {
    /// Name of the system
    pub const NAME: &str = "leafscan";
}

/// File Paths
pub mod path {

    // Persistent Data Directory
    pub const PERSISTENT_DIR: &str = "/data/";

    // Log Directory
    pub const LOG_DIR: &str = "log";

    // Image Directory
    pub const IMG_DIR: &str = "img";

    // Configuration File
    pub const CONF_FILE: &str = "conf.toml";

    // Last Captured Live Frame
    pub const LAST_FRAME: &str = "live.jpg";

    // Bundled model directory
    pub const MODEL_DIR: &str = "asset/model";

    // Unified YOLOv8 disease detector (416x416)
    pub const DETECTOR_416_MODEL: &str = "plant_disease_yolov8_416.onnx";

    // Per-crop classifier, `{crop}` is replaced by the crop name (256x256)
    pub const CLASSIFIER_256_MODEL: &str = "{crop}_classifier_256.onnx";
}

/// Inference defaults
pub mod inference {
    /// Minimum confidence for a detection to be accepted.
    pub const CONFIDENCE_THRESHOLD: f32 = 0.6;

    /// Minimum per-box score for live bounding boxes.
    pub const BOX_THRESHOLD: f32 = 0.25;

    /// IoU above which two live boxes of the same class are merged.
    pub const NMS_IOU: f32 = 0.45;

    /// Live sampler tick period in milliseconds (2 fps).
    pub const LIVE_INTERVAL_MS: u64 = 500;

    /// Remote service request timeout in milliseconds.
    pub const REMOTE_TIMEOUT_MS: u64 = 15000;

    /// JPEG quality for images uploaded to the remote service.
    pub const UPLOAD_JPEG_QUALITY: u8 = 90;
}
