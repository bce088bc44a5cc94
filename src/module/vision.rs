//! Processing related to visual information.
//!
pub mod camera;
pub mod preprocess;
