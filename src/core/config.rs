//! Network configuration, configuration errors and validation traits.
//!
//! [`RecognizerConfig`] describes the geometry and layer widths of the plate
//! recognition network. Every field has a serde default so partial JSON files
//! can be loaded with [`RecognizerConfig::from_path`]. Structural contracts
//! between stages (spatial sizes, fusion channel counts, time-step budget) are
//! checked by [`ConfigValidator::validate`] before any layer is created.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during configuration validation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Error indicating that a configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The number of input channels is not supported.
    #[error("input channels must be either 1 or 3, got {0}")]
    UnsupportedInputChannels(usize),

    /// A requested decoder kind does not exist.
    #[error("decoder must be either 'greedy' or 'beam', got '{0}'")]
    UnknownDecoder(String),

    /// The concatenated fusion inputs do not match the projection layer.
    #[error(
        "global context fusion expects {expected} input channels but the backbone provides {actual}"
    )]
    FusionChannelMismatch { expected: usize, actual: usize },

    /// A stage would produce an empty feature map.
    #[error("stage '{stage}' produces an empty feature map for input {height}x{width}")]
    EmptyFeatureMap {
        stage: &'static str,
        height: usize,
        width: usize,
    },

    /// Error indicating that validation failed.
    #[error("validation failed: {message}")]
    ValidationFailed { message: String },
}

/// A trait for validating configuration parameters.
pub trait ConfigValidator {
    /// Validates the configuration.
    fn validate(&self) -> Result<(), ConfigError>;

    /// Returns the default configuration.
    fn get_defaults() -> Self
    where
        Self: Sized;

    /// Validates that a size-like parameter is greater than zero.
    fn validate_positive(&self, value: usize, name: &str) -> Result<(), ConfigError> {
        if value == 0 {
            Err(ConfigError::InvalidConfig {
                message: format!("{name} must be greater than 0"),
            })
        } else {
            Ok(())
        }
    }

    /// Validates a dropout probability.
    fn validate_probability(&self, value: f32, name: &str) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&value) {
            Err(ConfigError::InvalidConfig {
                message: format!("{name} must be in [0, 1), got {value}"),
            })
        } else {
            Ok(())
        }
    }
}

/// Activation bounding the predicted affine parameters to `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThetaActivation {
    /// Hard clamp; the identity bias maps exactly to the identity transform.
    #[default]
    HardTanh,
    /// Hyperbolic tangent, for weights trained with a smooth bound.
    Tanh,
}

/// Spatial transformer (localization network + sampler) settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StnConfig {
    /// Size `(height, width)` of the adaptive max-pool in the first path
    #[serde(default = "default_stn_pooled_size")]
    pub pooled_size: (usize, usize),

    /// Output channels of each convolutional path
    #[serde(default = "default_stn_conv_channels")]
    pub conv_channels: usize,

    /// Width of the hidden fully-connected layer
    #[serde(default = "default_stn_hidden_size")]
    pub hidden_size: usize,

    /// Dropout before the fully-connected layers
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    /// Corner alignment convention of the sampling grid
    #[serde(default = "default_align_corners")]
    pub align_corners: bool,

    /// Bounding activation applied to theta
    #[serde(default)]
    pub theta_activation: ThetaActivation,
}

/// Backbone stage widths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneConfig {
    #[serde(default = "default_stem_channels")]
    pub stem_channels: usize,

    #[serde(default = "default_block_1_channels")]
    pub block_1_channels: usize,

    #[serde(default = "default_block_channels")]
    pub block_2_channels: usize,

    #[serde(default = "default_block_channels")]
    pub block_3_channels: usize,

    /// Width of the final convolution, also the working depth of the head
    #[serde(default = "default_block_channels")]
    pub output_channels: usize,

    /// Channel dropout probability
    #[serde(default = "default_dropout")]
    pub dropout: f32,
}

/// Global context fusion settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Common spatial size `(height, width)` every branch is brought to
    #[serde(default = "default_fusion_pooled_size")]
    pub pooled_size: (usize, usize),

    /// Channels expected by the 1x1 projection
    #[serde(default = "default_fusion_in_channels")]
    pub in_channels: usize,

    /// Channels produced by the projection
    #[serde(default = "default_block_channels")]
    pub out_channels: usize,
}

/// Sequence head settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadConfig {
    /// Width of the horizontal kernel projecting to class scores
    #[serde(default = "default_head_kernel_width")]
    pub kernel_width: usize,
}

/// Configuration of the whole recognition network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizerConfig {
    /// Number of output classes, BLANK included
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,

    /// Number of image channels (1 or 3)
    #[serde(default = "default_input_channels")]
    pub input_channels: usize,

    /// Input image height
    #[serde(default = "default_input_height")]
    pub input_height: usize,

    /// Input image width
    #[serde(default = "default_input_width")]
    pub input_width: usize,

    /// Longest label the decoder must be able to emit
    #[serde(default = "default_max_label_length")]
    pub max_label_length: usize,

    #[serde(default)]
    pub stn: StnConfig,

    #[serde(default)]
    pub backbone: BackboneConfig,

    #[serde(default)]
    pub fusion: FusionConfig,

    #[serde(default)]
    pub head: HeadConfig,
}

fn default_num_classes() -> usize {
    37
}

fn default_input_channels() -> usize {
    3
}

fn default_input_height() -> usize {
    24
}

fn default_input_width() -> usize {
    94
}

fn default_max_label_length() -> usize {
    9
}

fn default_stn_pooled_size() -> (usize, usize) {
    (16, 58)
}

fn default_stn_conv_channels() -> usize {
    32
}

fn default_stn_hidden_size() -> usize {
    32
}

fn default_dropout() -> f32 {
    0.5
}

fn default_align_corners() -> bool {
    true
}

fn default_stem_channels() -> usize {
    64
}

fn default_block_1_channels() -> usize {
    128
}

fn default_block_channels() -> usize {
    256
}

fn default_fusion_pooled_size() -> (usize, usize) {
    (3, 90)
}

fn default_fusion_in_channels() -> usize {
    960
}

fn default_head_kernel_width() -> usize {
    13
}

impl Default for StnConfig {
    fn default() -> Self {
        Self {
            pooled_size: default_stn_pooled_size(),
            conv_channels: default_stn_conv_channels(),
            hidden_size: default_stn_hidden_size(),
            dropout: default_dropout(),
            align_corners: default_align_corners(),
            theta_activation: ThetaActivation::default(),
        }
    }
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            stem_channels: default_stem_channels(),
            block_1_channels: default_block_1_channels(),
            block_2_channels: default_block_channels(),
            block_3_channels: default_block_channels(),
            output_channels: default_block_channels(),
            dropout: default_dropout(),
        }
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            pooled_size: default_fusion_pooled_size(),
            in_channels: default_fusion_in_channels(),
            out_channels: default_block_channels(),
        }
    }
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            kernel_width: default_head_kernel_width(),
        }
    }
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            num_classes: default_num_classes(),
            input_channels: default_input_channels(),
            input_height: default_input_height(),
            input_width: default_input_width(),
            max_label_length: default_max_label_length(),
            stn: StnConfig::default(),
            backbone: BackboneConfig::default(),
            fusion: FusionConfig::default(),
            head: HeadConfig::default(),
        }
    }
}

impl BackboneConfig {
    /// Sum of the channels the fusion stage concatenates.
    pub fn fused_channels(&self) -> usize {
        self.stem_channels
            + self.block_1_channels
            + self.block_2_channels
            + self.block_3_channels
            + self.output_channels
    }
}

impl FusionConfig {
    /// Checks the channel contract between backbone widths and the projection.
    pub fn check_contract(&self, backbone: &BackboneConfig) -> Result<(), ConfigError> {
        let actual = backbone.fused_channels();
        if actual != self.in_channels {
            return Err(ConfigError::FusionChannelMismatch {
                expected: self.in_channels,
                actual,
            });
        }
        if self.out_channels != backbone.output_channels {
            return Err(ConfigError::InvalidConfig {
                message: format!(
                    "fusion output channels ({}) must equal the backbone output channels ({})",
                    self.out_channels, backbone.output_channels
                ),
            });
        }
        Ok(())
    }
}

/// Spatial sizes `(height, width)` at the backbone boundaries that matter downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackboneGeometry {
    /// After the first max-pool (also `block_1`).
    pub pool_1: (usize, usize),
    /// After the second max-pool (also `block_2` and `block_3`).
    pub pool_2: (usize, usize),
    /// After the third max-pool.
    pub pool_3: (usize, usize),
    /// Final backbone output.
    pub output: (usize, usize),
}

fn pooled(size: usize, kernel: usize, stride: usize) -> Option<usize> {
    size.checked_sub(kernel).map(|s| s / stride + 1)
}

fn non_empty(
    stage: &'static str,
    hw: (Option<usize>, Option<usize>),
    input: (usize, usize),
) -> Result<(usize, usize), ConfigError> {
    match hw {
        (Some(h), Some(w)) if h > 0 && w > 0 => Ok((h, w)),
        _ => Err(ConfigError::EmptyFeatureMap {
            stage,
            height: input.0,
            width: input.1,
        }),
    }
}

impl RecognizerConfig {
    /// Load configuration from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidConfig {
            message: format!("failed to read recognizer config from {:?}: {}", path, e),
        })?;
        serde_json::from_str(&content).map_err(|e| ConfigError::InvalidConfig {
            message: format!("failed to parse recognizer config: {}", e),
        })
    }

    /// Computes the spatial size at each backbone boundary for the configured input.
    pub fn backbone_geometry(&self) -> Result<BackboneGeometry, ConfigError> {
        let input = (self.input_height, self.input_width);
        // conv_1 keeps the size (3x3, padding 1); max_pool_1 is 3x3 stride 1
        let pool_1 = non_empty(
            "max_pool_1",
            (pooled(input.0, 3, 1), pooled(input.1, 3, 1)),
            input,
        )?;
        let pool_2 = non_empty(
            "max_pool_2",
            (pooled(pool_1.0, 3, 2), pooled(pool_1.1, 3, 1)),
            input,
        )?;
        let pool_3 = non_empty(
            "max_pool_3",
            (pooled(pool_2.0, 3, 2), pooled(pool_2.1, 3, 1)),
            input,
        )?;
        // conv_2: kernel (4, 1), padding 1
        let output = non_empty(
            "conv_2",
            (pooled(pool_3.0 + 2, 4, 1), pooled(pool_3.1 + 2, 1, 1)),
            input,
        )?;
        Ok(BackboneGeometry {
            pool_1,
            pool_2,
            pool_3,
            output,
        })
    }

    /// Spatial size of each localization path, which must agree.
    pub fn localization_geometry(&self) -> Result<(usize, usize), ConfigError> {
        let input = (self.input_height, self.input_width);
        let (ph, pw) = self.stn.pooled_size;
        let pooled_path = non_empty(
            "localization.conv1",
            (pooled(ph, 5, 3), pooled(pw, 5, 3)),
            input,
        )?;
        let raw_path = non_empty(
            "localization.conv2",
            (pooled(input.0, 5, 5), pooled(input.1, 5, 5)),
            input,
        )?;
        if pooled_path != raw_path {
            return Err(ConfigError::InvalidConfig {
                message: format!(
                    "localization paths disagree: pooled path gives {:?}, raw path gives {:?}",
                    pooled_path, raw_path
                ),
            });
        }
        Ok(pooled_path)
    }

    /// Number of flattened features entering the localization fully-connected layers.
    pub fn localization_features(&self) -> Result<usize, ConfigError> {
        let (h, w) = self.localization_geometry()?;
        Ok(2 * self.stn.conv_channels * h * w)
    }

    /// Number of decoding time-steps produced by the sequence head.
    pub fn time_steps(&self) -> Result<usize, ConfigError> {
        Ok(self.backbone_geometry()?.output.1)
    }
}

impl ConfigValidator for RecognizerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.input_channels, 1 | 3) {
            return Err(ConfigError::UnsupportedInputChannels(self.input_channels));
        }
        if self.num_classes < 2 {
            return Err(ConfigError::InvalidConfig {
                message: format!(
                    "num_classes must include BLANK and at least one symbol, got {}",
                    self.num_classes
                ),
            });
        }
        self.validate_positive(self.max_label_length, "max_label_length")?;
        self.validate_positive(self.stn.conv_channels, "stn.conv_channels")?;
        self.validate_positive(self.stn.hidden_size, "stn.hidden_size")?;
        self.validate_probability(self.stn.dropout, "stn.dropout")?;
        self.validate_probability(self.backbone.dropout, "backbone.dropout")?;
        self.validate_positive(self.head.kernel_width, "head.kernel_width")?;
        if self.head.kernel_width % 2 == 0 {
            return Err(ConfigError::InvalidConfig {
                message: format!(
                    "head.kernel_width must be odd to preserve the time axis, got {}",
                    self.head.kernel_width
                ),
            });
        }
        for (name, channels) in [
            ("backbone.block_1_channels", self.backbone.block_1_channels),
            ("backbone.block_2_channels", self.backbone.block_2_channels),
            ("backbone.block_3_channels", self.backbone.block_3_channels),
        ] {
            if channels < 4 || channels % 4 != 0 {
                return Err(ConfigError::InvalidConfig {
                    message: format!("{name} must be a positive multiple of 4, got {channels}"),
                });
            }
        }

        self.localization_geometry()?;
        let geometry = self.backbone_geometry()?;
        self.fusion.check_contract(&self.backbone)?;
        if geometry.output != self.fusion.pooled_size {
            return Err(ConfigError::InvalidConfig {
                message: format!(
                    "fusion pooled size {:?} must equal the backbone output size {:?}",
                    self.fusion.pooled_size, geometry.output
                ),
            });
        }

        let time_steps = geometry.output.1;
        if time_steps < self.max_label_length {
            return Err(ConfigError::ValidationFailed {
                message: format!(
                    "{} time-steps cannot align labels of length {}",
                    time_steps, self.max_label_length
                ),
            });
        }
        Ok(())
    }

    fn get_defaults() -> Self {
        Self::default()
    }
}
