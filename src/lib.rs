//! # ICVLPR
//!
//! License plate recognition for Indonesian commercial vehicles, built on candle.
//!
//! A cropped plate image passes through an optional spatial transformer that
//! straightens it, a small convolutional backbone, an optional global-context
//! fusion of multi-scale features and a per-column classifier. The resulting
//! `(N, classes, T)` scores are turned into plate strings by CTC decoding.
//!
//! ## Components
//!
//! - **Spatial rectification**: a localization network predicts a 2x3 affine
//!   transform that resamples the input before recognition
//! - **Feature backbone**: convolution and small basic blocks producing four feature maps
//! - **Global context fusion**: pooled multi-scale maps merged by a 1x1 convolution
//! - **Sequence head**: per-column class scores over `T` time-steps
//! - **CTC decoding**: greedy and beam search sharing one collapse rule
//! - **Training support**: CTC loss and the letter-and-number recognition rate
//!
//! ## Modules
//!
//! * [`core`] - Configuration, error handling and input validation
//! * [`domain`] - Vocabulary and pipeline modes
//! * [`models`] - Network stages and checkpoint loading
//! * [`processors`] - Image preprocessing, CTC decoding and CTC loss
//! * [`metrics`] - Recognition rate and related counters
//! * [`pipeline`] - End-to-end plate reader
//! * [`utils`] - Image loading and logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use icvlpr::prelude::*;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let reader = PlateReaderBuilder::new()
//!     .decoder(DecoderKind::Beam { beam_width: 5 })
//!     .build(&["models/lprnet.safetensors"])?;
//!
//! let image = load_image(Path::new("plate.jpg"))?;
//! let recognition = reader.recognize(&[image])?;
//! println!("{} ({:.3})", recognition.texts[0], recognition.scores[0]);
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod core;
pub mod domain;
pub mod models;

pub mod metrics;
pub mod pipeline;
pub mod processors;
pub mod utils;

/// Prelude module for convenient imports.
///
/// ```rust
/// use icvlpr::prelude::*;
/// ```
///
/// Included items cover reading plates and scoring the results. For
/// training and custom networks, import from [`models`](crate::models) and
/// [`processors`](crate::processors) directly.
pub mod prelude {
    pub use crate::pipeline::{PlateReader, PlateReaderBuilder, PlateRecognition};

    pub use crate::core::{LprError, LprResult, RecognizerConfig};
    pub use crate::domain::{PipelineMode, Vocabulary};
    pub use crate::metrics::RecognitionRate;
    pub use crate::processors::DecoderKind;

    pub use crate::utils::{load_image, load_images};
}
