//! Path Operations Module
//!
//! This module handles path operations for directories and files.

use std::path::PathBuf;

/// Join Paths
///
/// Joins path segments with the platform separator.
pub fn join(paths: &[&str]) -> String {
    let mut path: PathBuf = PathBuf::new();
    for p in paths {
        path.push(p);
    }
    path.to_string_lossy().into_owned()
}

pub mod dir {
    //! Directory Operations Submodule
    //!
    //! This submodule provides functions for directory operations.

    use std::fs;
    use std::path::Path;

    use super::{LeafscanDir, LeafscanImg, LeafscanPath};
    use crate::module::define;
    use crate::module::error::ConfigError;

    /// Create Directory from Path List
    ///
    /// Returns `Some(path)` if the directory exists afterwards.
    pub fn create_dir_from_path_list(paths: &[&str]) -> Option<String> {
        let path = super::join(paths);
        match fs::create_dir_all(Path::new(&path)) {
            Ok(_) => Some(path),
            Err(e) => {
                log::warn!("Can't create {}: {}", path, e);
                None
            }
        }
    }

    /// Create Subdirectory in Either Directory
    ///
    /// Uses `dir1` as parent when it exists, else `dir2`.
    pub fn create_subdir_in_either_dir(dir1: &str, dir2: &str, name: &str) -> Option<String> {
        let parent: &str = match Path::new(dir1).is_dir() {
            true => dir1,
            false => dir2,
        };
        create_dir_from_path_list(&[parent, name])
    }

    /// Create Data Directory
    ///
    /// Under `define::path::PERSISTENT_DIR` on a device, the system temp
    /// directory elsewhere.
    pub fn create_data_dir() -> Result<String, ConfigError> {
        let tmp = std::env::temp_dir();
        let tmp = tmp.to_string_lossy();
        create_subdir_in_either_dir(define::path::PERSISTENT_DIR, &tmp, define::system::NAME)
            .ok_or_else(|| ConfigError::Dir(define::system::NAME.to_owned()))
    }

    /// Create Application Subdirectory and Paths
    ///
    /// Creates the data directory with its `img` and `log` subdirectories.
    pub fn create_app_sub_dir() -> Result<LeafscanPath, ConfigError> {
        let data_dir = create_data_dir()?;
        create_app_sub_dir_in(&data_dir)
    }

    /// Same as `create_app_sub_dir` for an explicit data directory.
    pub fn create_app_sub_dir_in(data_dir: &str) -> Result<LeafscanPath, ConfigError> {
        let sub = |name: &str| {
            create_dir_from_path_list(&[data_dir, name])
                .ok_or_else(|| ConfigError::Dir(super::join(&[data_dir, name])))
        };
        let img_dir = sub(define::path::IMG_DIR)?;
        let log_dir = sub(define::path::LOG_DIR)?;
        Ok(LeafscanPath {
            dir: LeafscanDir {
                data: data_dir.to_owned(),
                img: img_dir.clone(),
                log: log_dir,
            },
            img: LeafscanImg {
                last: super::join(&[&img_dir, define::path::LAST_FRAME]),
            },
        })
    }
}

/// Paths of Resources
///
#[derive(Debug, Clone)]
pub struct LeafscanPath {
    /// Directories Paths
    pub dir: LeafscanDir,
    /// Images Paths
    pub img: LeafscanImg,
}

/// Paths of Directories
///
#[derive(Debug, Clone)]
pub struct LeafscanDir {
    /// Data Directory Path
    pub data: String,
    /// Image Directory Path
    pub img: String,
    /// Log Directory Path
    pub log: String,
}

/// Paths of Images
///
#[derive(Debug, Clone)]
pub struct LeafscanImg {
    /// Last live frame
    pub last: String,
}
