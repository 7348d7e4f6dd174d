//! Error types for the plate recognition pipeline.
//!
//! This module defines the errors that can occur while building the network,
//! restoring weights, preprocessing images, running inference and decoding.
//! Helper constructors attach the failing stage and some context to the
//! underlying error.

use thiserror::Error;

use super::config::ConfigError;

/// Stage of processing in which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    /// Error occurred during tensor operations.
    TensorOperation,
    /// Error occurred while resizing or converting an image.
    Resize,
    /// Error occurred while computing the training loss.
    Loss,
    /// Error occurred during decoding or metric computation.
    PostProcessing,
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingStage::TensorOperation => write!(f, "tensor operation"),
            ProcessingStage::Resize => write!(f, "resize"),
            ProcessingStage::Loss => write!(f, "loss"),
            ProcessingStage::PostProcessing => write!(f, "post-processing"),
        }
    }
}

/// Errors produced by the recognition pipeline.
#[derive(Error, Debug)]
pub enum LprError {
    /// Error occurred while loading an image.
    #[error("image load")]
    ImageLoad(#[source] image::ImageError),

    /// Error occurred during processing.
    #[error("{kind} failed: {context}")]
    Processing {
        /// The stage of processing where the error occurred.
        kind: ProcessingStage,
        /// Additional context about the error.
        context: String,
        /// The underlying error that caused this error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Error occurred while running one of the network stages.
    #[error("inference in {stage}: {context}")]
    Inference {
        /// Network stage that failed.
        stage: String,
        /// Additional context about the error.
        context: String,
        /// The underlying error that caused this error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Error indicating invalid input.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// A message describing the invalid input.
        message: String,
    },

    /// Error indicating a configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A checkpoint does not match the network parameters.
    #[error(
        "checkpoint does not match the network: missing keys [{}], unexpected keys [{}]",
        missing.join(", "),
        unexpected.join(", ")
    )]
    CheckpointMismatch {
        /// Parameters the network expects but the checkpoint lacks.
        missing: Vec<String>,
        /// Checkpoint entries with no matching parameter.
        unexpected: Vec<String>,
    },

    /// IO error.
    #[error("io")]
    Io(#[from] std::io::Error),
}

/// Convenient result alias for pipeline operations.
pub type LprResult<T> = Result<T, LprError>;

impl LprError {
    /// Creates an error for a failed tensor operation.
    pub fn tensor_operation(
        context: &str,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Processing {
            kind: ProcessingStage::TensorOperation,
            context: context.to_string(),
            source: Box::new(error),
        }
    }

    /// Creates an error for a failed loss computation.
    pub fn loss(context: &str, error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Processing {
            kind: ProcessingStage::Loss,
            context: context.to_string(),
            source: Box::new(error),
        }
    }

    /// Creates an error for post-processing operations.
    pub fn post_processing(
        context: &str,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Processing {
            kind: ProcessingStage::PostProcessing,
            context: context.to_string(),
            source: Box::new(error),
        }
    }

    /// Creates an error for image resize or conversion failures.
    pub fn resize_error(
        context: &str,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Processing {
            kind: ProcessingStage::Resize,
            context: context.to_string(),
            source: Box::new(error),
        }
    }

    /// Creates an error for a failing network stage.
    ///
    /// # Arguments
    ///
    /// * `stage` - Name of the network stage (e.g. `"backbone"`).
    /// * `context` - What the stage was doing.
    /// * `error` - The underlying tensor error.
    pub fn inference(
        stage: &str,
        context: impl Into<String>,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Inference {
            stage: stage.to_string(),
            context: context.into(),
            source: Box::new(error),
        }
    }

    /// Creates an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Creates a configuration error with a free-form message.
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config(ConfigError::InvalidConfig {
            message: message.into(),
        })
    }
}

impl From<image::ImageError> for LprError {
    fn from(error: image::ImageError) -> Self {
        Self::ImageLoad(error)
    }
}

/// Maps a candle error raised inside a network stage to an [`LprError`].
pub fn candle_to_lpr_inference(
    stage: &str,
    context: impl Into<String>,
    err: candle_core::Error,
) -> LprError {
    LprError::inference(stage, context, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_mismatch_lists_keys() {
        let err = LprError::CheckpointMismatch {
            missing: vec!["pre_decoder.0.weight".to_string()],
            unexpected: vec!["head.bias".to_string(), "head.weight".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("missing keys [pre_decoder.0.weight]"));
        assert!(message.contains("unexpected keys [head.bias, head.weight]"));
    }

    #[test]
    fn config_error_is_transparent() {
        let err = LprError::config_error("bad decoder");
        assert_eq!(err.to_string(), "invalid configuration: bad decoder");
    }
}
