//! Network stages of the plate recognizer.
//!
//! Inner layers return `candle_core::Result`; [`LprNet`] wraps them with stage
//! context into [`LprError`](crate::core::LprError).

pub mod backbone;
pub mod checkpoint;
pub mod fusion;
pub mod head;
pub mod layers;
pub mod localization;
pub mod recognizer;
pub mod rectifier;

pub use backbone::{BackboneFeatures, FeatureBackbone, SmallBasicBlock};
pub use checkpoint::{LoadMode, LoadReport, load_safetensors, restore};
pub use fusion::GlobalContextFusion;
pub use head::SequenceHead;
pub use localization::{IDENTITY_THETA, LocalizationNetwork};
pub use recognizer::LprNet;
pub use rectifier::{SpatialRectifier, affine_grid, grid_sample, rectify};
