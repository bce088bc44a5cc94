//! This module contains all the sub-modules of the project.

pub mod backend; // Backend module: Local and remote classifiers behind one predict contract.
pub mod cascade; // Cascade module: Ordered fallback over the backends.
pub mod classes; // Classes module: Class tables and crop types.
pub mod define; // Definition module: Contains definitions and constants used throughout the project.
pub mod error; // Error module: Error types of the pipeline.
pub mod registry; // Registry module: Lazily loaded, cached models.
pub mod remedy; // Remedy module: Treatment tips per disease.
pub mod sampler; // Sampler module: Live detection loop.
pub mod scanner; // Scanner module: Application context.
pub mod util; // Utility module: Provides various utility functions and helpers.
pub mod vision; // Vision module: Frame sources and preprocessing.
