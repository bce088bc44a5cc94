//! This module is responsible for preparing the resources needed by the application, such as directories and configurations.
//!

pub mod resource {
    use super::LeafscanProperty;
    use crate::module::error::ConfigError;

    /// Prepare the data directory and load the configuration.
    ///
    pub fn init() -> Result<LeafscanProperty, ConfigError> {
        let paths = crate::module::util::path::dir::create_app_sub_dir()?;
        let conf = crate::module::util::conf::toml::load(&paths.dir.data)?;
        Ok(LeafscanProperty { path: paths, conf })
    }
}

/// Paths and configuration of the app.
///
#[derive(Debug, Clone)]
pub struct LeafscanProperty {
    pub path: crate::module::util::path::LeafscanPath,
    pub conf: crate::module::util::conf::Config,
}
