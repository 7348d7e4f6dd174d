//! Sequence head producing the per-timestep class logits.

use candle_core::{ModuleT, Result, Tensor};
use candle_nn::VarBuilder;

use super::layers::ConvBnRelu;
use crate::core::{ConfigError, LprResult, RecognizerConfig, candle_to_lpr_inference};

/// Wide horizontal convolution to `num_classes` channels, then a mean over the
/// height axis. The width of the feature map becomes the time axis.
#[derive(Debug, Clone)]
pub struct SequenceHead {
    pre_decoder: ConvBnRelu,
    time_steps: usize,
}

impl SequenceHead {
    /// Builds the head under `vb` (conventionally `pre_decoder`).
    ///
    /// Fails when the configured geometry yields fewer time-steps than the
    /// longest label, since CTC could not align such labels.
    pub fn new(config: &RecognizerConfig, vb: VarBuilder) -> LprResult<Self> {
        let time_steps = config.time_steps()?;
        if time_steps < config.max_label_length {
            return Err(ConfigError::ValidationFailed {
                message: format!(
                    "{} time-steps cannot align labels of length {}",
                    time_steps, config.max_label_length
                ),
            }
            .into());
        }
        let kernel_width = config.head.kernel_width;
        let pre_decoder = ConvBnRelu::new(
            config.backbone.output_channels,
            config.num_classes,
            (1, kernel_width),
            (0, kernel_width / 2),
            vb,
        )
        .map_err(|e| candle_to_lpr_inference("sequence_head", "load pre_decoder", e))?;
        Ok(Self {
            pre_decoder,
            time_steps,
        })
    }

    /// Number of time-steps `T` this head emits for the configured input.
    pub fn time_steps(&self) -> usize {
        self.time_steps
    }

    /// `(N, C_in, H, T)` features to `(N, num_classes, T)` logits.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.pre_decoder.forward_t(x, train)?.mean(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LprError;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn keeps_time_axis() {
        let config = RecognizerConfig::default();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = SequenceHead::new(&config, vb.pp("pre_decoder")).unwrap();
        assert_eq!(head.time_steps(), 90);

        let x = Tensor::randn(0f32, 1f32, (4, 256, 3, 90), &Device::Cpu).unwrap();
        let logits = head.forward_t(&x, false).unwrap();
        assert_eq!(logits.dims(), &[4, 37, 90]);
    }

    #[test]
    fn rejects_labels_longer_than_time_axis() {
        let config = RecognizerConfig {
            max_label_length: 91,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(matches!(
            SequenceHead::new(&config, vb),
            Err(LprError::Config(ConfigError::ValidationFailed { .. }))
        ));
    }
}
