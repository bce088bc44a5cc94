//! Config Handler.

use serde::{Deserialize, Serialize};

use crate::module::define;
use crate::module::error::ConfigError;

/// Provides TOML config file handling.
pub mod toml {

    use super::DEFAULT_CONFIG;
    use crate::module::define;
    use crate::module::error::ConfigError;
    use std::fs::File;
    use std::io::prelude::*;
    use std::path::Path;

    /// Loads a configuration file from the given directory.
    /// If not found, generates a default config file.
    ///
    /// # Arguments
    ///
    /// * `dir` - The directory where the configuration file is located or should be created.
    ///
    pub fn load(dir: &str) -> Result<super::Config, ConfigError> {
        let path = Path::new(dir).join(define::path::CONF_FILE);

        if !path.is_file() {
            // Create the default config if it doesn't exist
            let config: super::Config = toml::from_str(DEFAULT_CONFIG)?;
            let toml_str = toml::to_string(&config)?;
            let mut file = File::create(&path)?;
            file.write_all(toml_str.as_bytes())?;
            log::info!("Created default config at {}", path.display());
        }

        let conf_str: String = std::fs::read_to_string(&path)?;
        Ok(toml::from_str(&conf_str)?)
    }

    /// Saves a configuration file to the given directory.
    ///
    /// # Arguments
    ///
    /// * `dir` - The directory where the configuration file should be saved.
    /// * `conf` - The configuration data to be saved.
    ///
    pub fn save(dir: &str, conf: &super::Config) -> Result<(), ConfigError> {
        let toml_str = toml::to_string(conf)?;
        let path = crate::module::util::path::join(&[dir, define::path::CONF_FILE]);
        let mut file = File::create(path)?;
        file.write_all(toml_str.as_bytes())?;
        Ok(())
    }
}

/// Represents the configuration data structure.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    pub system: System,
    pub detector: Detector,
    pub classifier: Classifier,
    pub remote: Remote,
    pub live: Live,
    pub camera: Camera,
}

impl Config {
    /// The built-in configuration.
    pub fn defaults() -> Result<Self, ConfigError> {
        Ok(::toml::from_str(DEFAULT_CONFIG)?)
    }
}

/// Represents system-related configuration parameters.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct System {
    pub log_level: String,
    pub model_dir: String,
}

/// Local unified detector.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Detector {
    pub enabled: bool,
    pub model: String,
    pub variant: String,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    pub threads: i16,
}

/// Local per-crop classifiers.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Classifier {
    pub enabled: bool,
    pub model: String,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
}

/// Remote classification service.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Remote {
    pub enabled: bool,
    pub url: String,
    pub token: String,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Represents live detection parameters.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Live {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_box_threshold")]
    pub box_threshold: f32,
    #[serde(default = "default_nms_iou")]
    pub nms_iou: f32,
}

/// Represents camera-related configuration parameters.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Camera {
    pub device: String,
    pub width: u32,
    pub height: u32,
}

// Tunables missing from a config file fall back to these.
fn default_threshold() -> f32 {
    define::inference::CONFIDENCE_THRESHOLD
}

fn default_timeout_ms() -> u64 {
    define::inference::REMOTE_TIMEOUT_MS
}

fn default_interval_ms() -> u64 {
    define::inference::LIVE_INTERVAL_MS
}

fn default_box_threshold() -> f32 {
    define::inference::BOX_THRESHOLD
}

fn default_nms_iou() -> f32 {
    define::inference::NMS_IOU
}

// Default configuration data in TOML format
const DEFAULT_CONFIG: &str = r#"
[system]
  log_level = 'INFO' # Log level ('DEBUG', 'INFO', 'WARN', 'ERROR')
  model_dir = 'asset/model' # Directory of bundled models

[detector]
  enabled = true # Try the unified detector first
  model = 'plant_disease_yolov8_416.onnx' # Model file in model_dir
  variant = 'yolov8_416' # Registry variant of the model
  threshold = 0.6 # Minimum confidence to accept a detection
  threads = 4 # Intra-op threads per model session

[classifier]
  enabled = true # Fall back to the per-crop classifiers
  model = '{crop}_classifier_256.onnx' # Model file, {crop} is apple, corn, potato or tomato
  threshold = 0.6 # Minimum confidence to accept a detection

[remote]
  enabled = false # Fall back to the classification service
  url = 'http://localhost:8000/predict' # Service endpoint
  token = '' # Bearer token, empty for none
  threshold = 0.6 # Minimum confidence to accept a detection

[live]
  interval_ms = 500 # Sampling period
  box_threshold = 0.25 # Minimum score per box
  nms_iou = 0.45 # Same-class boxes overlapping more than this are merged

[camera]
  device = '/dev/video0' # V4L2 device
  width = 1280 # Image width
  height = 720 # Image height
"#;

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    fn test_dir(name: &str) -> String {
        let dir = std::env::temp_dir().join("leafscantest").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir.to_string_lossy().into_owned()
    }

    #[test]
    fn run_load() {
        let dir = test_dir("conf_load");
        let res = toml::load(&dir).unwrap();
        assert_eq!(res.system.log_level, "INFO");
        assert_eq!(res.live.interval_ms, define::inference::LIVE_INTERVAL_MS);
        assert_eq!(res.detector.threshold, define::inference::CONFIDENCE_THRESHOLD);
        assert_eq!(res.detector.model, define::path::DETECTOR_416_MODEL);
        assert_eq!(res.classifier.model, define::path::CLASSIFIER_256_MODEL);
        assert!(!res.remote.enabled);
        assert_eq!(res.remote.timeout_ms, define::inference::REMOTE_TIMEOUT_MS);
        assert_eq!(res, Config::defaults().unwrap());
        // The written file carries the filled-in defaults.
        let written = fs::read_to_string(std::path::Path::new(&dir).join(define::path::CONF_FILE));
        assert!(written.unwrap().contains("timeout_ms = 15000"));
    }

    #[test]
    fn missing_tunables() {
        let dir = test_dir("conf_tunables");
        let mut text = ::toml::to_string(&Config::defaults().unwrap()).unwrap();
        for key in ["threshold", "timeout_ms", "interval_ms", "box_threshold", "nms_iou"] {
            text = text
                .lines()
                .filter(|l| !l.starts_with(&format!("{} =", key)))
                .collect::<Vec<_>>()
                .join("\n");
        }
        fs::write(std::path::Path::new(&dir).join(define::path::CONF_FILE), text).unwrap();
        let conf = toml::load(&dir).unwrap();
        assert_eq!(conf, Config::defaults().unwrap());
        assert_eq!(conf.classifier.threshold, define::inference::CONFIDENCE_THRESHOLD);
        assert_eq!(conf.live.box_threshold, define::inference::BOX_THRESHOLD);
    }

    #[test]
    fn save_and_reload() {
        let dir = test_dir("conf_save");
        let mut conf = toml::load(&dir).unwrap();
        conf.remote.enabled = true;
        conf.live.interval_ms = 250;
        toml::save(&dir, &conf).unwrap();
        let reloaded = toml::load(&dir).unwrap();
        assert!(reloaded.remote.enabled);
        assert_eq!(reloaded.live.interval_ms, 250);
    }

    #[test]
    fn broken_config() {
        let dir = test_dir("conf_broken");
        fs::write(
            std::path::Path::new(&dir).join(define::path::CONF_FILE),
            "[system\nlog_level = ",
        )
        .unwrap();
        assert!(matches!(toml::load(&dir), Err(ConfigError::Parse(_))));
    }
}
