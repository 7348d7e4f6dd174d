//! The core module of the recognition pipeline.
//!
//! This module contains the fundamental building blocks shared by every other
//! module:
//! - Configuration of the network and its validation
//! - Error handling
//! - Input validation helpers

pub mod config;
pub mod errors;
pub mod validation;

pub use config::{
    BackboneConfig, BackboneGeometry, ConfigError, ConfigValidator, FusionConfig, HeadConfig,
    RecognizerConfig, StnConfig, ThetaActivation,
};
pub use errors::{LprError, LprResult, ProcessingStage, candle_to_lpr_inference};
