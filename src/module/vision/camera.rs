//! Frame Sources
//!
//! Where the live sampler gets its frames from.

use image::DynamicImage;
use rscam::{Camera, Config};
use std::fs;
use std::path::PathBuf;

use super::preprocess::Preprocessor;
use crate::module::error::CaptureError;

/// Something that yields the current frame on demand.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<DynamicImage, CaptureError>;
}

/// Represents a V4L2 camera delivering MJPEG frames.
///
pub struct V4l2Camera {
    cap: Camera,
    // Last frame is mirrored here when set.
    last_frame: Option<PathBuf>,
}

impl V4l2Camera {
    /// Opens and starts the camera at `device`.
    ///
    /// # Arguments
    ///
    /// * `device` - V4L2 device node, e.g. `/dev/video0`.
    /// * `resolution` - Capture width and height.
    /// * `last_frame` - File the latest raw frame is written to, if any.
    ///
    pub fn new(
        device: &str,
        resolution: (u32, u32),
        last_frame: Option<PathBuf>,
    ) -> Result<Self, CaptureError> {
        let mut cap = Camera::new(device)
            .map_err(|e| CaptureError::Device(format!("can't open {}: {}", device, e)))?;

        cap.start(&Config {
            interval: (1, 30), // 30 fps.
            resolution,
            format: b"MJPG",
            nbuffers: 1,
            ..Default::default()
        })
        .map_err(|e| CaptureError::Device(format!("can't start {}: {}", device, e)))?;

        log::info!(
            "Camera {} started at {}x{}",
            device,
            resolution.0,
            resolution.1
        );
        Ok(Self { cap, last_frame })
    }
}

impl FrameSource for V4l2Camera {
    fn capture(&mut self) -> Result<DynamicImage, CaptureError> {
        let _ = self.cap.capture(); // Grab a frame to reduce delay.
        let frame = self
            .cap
            .capture()
            .map_err(|e| CaptureError::Device(e.to_string()))?;

        if let Some(path) = &self.last_frame {
            if let Err(e) = fs::write(path, &frame[..]) {
                log::warn!("Can't save frame to {}: {}", path.display(), e);
            }
        }
        Ok(Preprocessor::decode(&frame[..])?)
    }
}

/// Replays a fixed list of images.
///
pub struct StillFrames {
    frames: Vec<DynamicImage>,
    next: usize,
    repeat: bool,
}

impl StillFrames {
    /// Cycles through `frames` forever.
    pub fn repeating(frames: Vec<DynamicImage>) -> Self {
        Self {
            frames,
            next: 0,
            repeat: true,
        }
    }

    /// Yields every frame once, then reports `Exhausted`.
    pub fn once(frames: Vec<DynamicImage>) -> Self {
        Self {
            frames,
            next: 0,
            repeat: false,
        }
    }
}

impl FrameSource for StillFrames {
    fn capture(&mut self) -> Result<DynamicImage, CaptureError> {
        if self.frames.is_empty() || (!self.repeat && self.next >= self.frames.len()) {
            return Err(CaptureError::Exhausted);
        }
        let frame = self.frames[self.next % self.frames.len()].clone();
        self.next += 1;
        Ok(frame)
    }
}
