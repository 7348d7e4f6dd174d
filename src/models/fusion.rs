//! Global context fusion of multi-scale backbone features.

use candle_core::{ModuleT, Result, Tensor};
use candle_nn::VarBuilder;

use super::backbone::BackboneFeatures;
use super::layers::{ConvBnRelu, adaptive_avg_pool2d};
use crate::core::{LprResult, RecognizerConfig, candle_to_lpr_inference};

/// Pools the intermediate backbone maps to the output size, rescales the
/// deepest map by its mean square, concatenates everything and projects back
/// to the working depth with a 1x1 convolution.
#[derive(Debug, Clone)]
pub struct GlobalContextFusion {
    pooled_size: (usize, usize),
    depth_adjust: ConvBnRelu,
}

impl GlobalContextFusion {
    /// Builds the projection under `vb` (conventionally `gc_depth_adjust_layer`).
    ///
    /// # Errors
    ///
    /// [`ConfigError::FusionChannelMismatch`](crate::core::ConfigError::FusionChannelMismatch)
    /// when the backbone widths do not sum to the projection input, before any
    /// parameter is created.
    pub fn new(config: &RecognizerConfig, vb: VarBuilder) -> LprResult<Self> {
        config.fusion.check_contract(&config.backbone)?;
        let fusion = &config.fusion;
        let depth_adjust = ConvBnRelu::new(
            fusion.in_channels,
            fusion.out_channels,
            (1, 1),
            (0, 0),
            vb,
        )
        .map_err(|e| {
            candle_to_lpr_inference("global_context_fusion", "load depth adjust layer", e)
        })?;
        Ok(Self {
            pooled_size: fusion.pooled_size,
            depth_adjust,
        })
    }

    pub fn forward_t(&self, features: &BackboneFeatures, train: bool) -> Result<Tensor> {
        let fused = self.concat_branches(features)?;
        self.depth_adjust.forward_t(&fused, train)
    }

    /// Average-pooled intermediate maps followed by the rescaled output map,
    /// concatenated along channels.
    pub(crate) fn concat_branches(&self, features: &BackboneFeatures) -> Result<Tensor> {
        let mut branches = [
            &features.pool_1,
            &features.block_1,
            &features.block_2,
            &features.block_3,
        ]
        .into_iter()
        .map(|map| adaptive_avg_pool2d(map, self.pooled_size))
        .collect::<Result<Vec<_>>>()?;

        // Mean over the whole batch tensor, not per sample.
        let deepest = &features.output;
        let mean_square = deepest.sqr()?.mean_all()?;
        branches.push(deepest.broadcast_div(&mean_square)?);

        Tensor::cat(&branches, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ConfigError, LprError};
    use crate::models::backbone::FeatureBackbone;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn fuses_to_working_depth() {
        let config = RecognizerConfig::default();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let backbone = FeatureBackbone::new(&config, vb.pp("backbone")).unwrap();
        let fusion = GlobalContextFusion::new(&config, vb.pp("gc_depth_adjust_layer")).unwrap();

        let x = Tensor::randn(0f32, 1f32, (2, 3, 24, 94), &Device::Cpu).unwrap();
        let features = backbone.forward_t(&x, false).unwrap();
        let fused = fusion.forward_t(&features, false).unwrap();
        assert_eq!(fused.dims(), &[2, 256, 3, 90]);
        assert!(
            varmap
                .data()
                .lock()
                .unwrap()
                .contains_key("gc_depth_adjust_layer.0.weight")
        );
    }

    #[test]
    fn branches_are_average_pooled_and_output_scaled_by_global_mean_square() {
        let config = RecognizerConfig::default();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let fusion = GlobalContextFusion::new(&config, vb.pp("gc_depth_adjust_layer")).unwrap();

        let device = Device::Cpu;
        // Every pool_1 value equals its column index.
        let columns = Tensor::arange(0f32, 180f32, &device).unwrap();
        let pool_1 = columns.reshape((1, 1, 1, 180)).unwrap().broadcast_as((2, 64, 3, 180)).unwrap();
        let zeros = |channels: usize| Tensor::zeros((2, channels, 3, 90), DType::F32, &device).unwrap();
        let output = Tensor::randn(0f32, 1f32, (2, 256, 3, 90), &device).unwrap();
        let features = BackboneFeatures {
            pool_1: pool_1.contiguous().unwrap(),
            block_1: zeros(128),
            block_2: zeros(256),
            block_3: zeros(256),
            output: output.clone(),
        };

        let fused = fusion.concat_branches(&features).unwrap();
        assert_eq!(fused.dims(), &[2, 960, 3, 90]);

        let pooled = fused.narrow(1, 0, 64).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (i, value) in pooled.iter().enumerate() {
            let column = (i % 90) as f32;
            assert!((value - (2.0 * column + 0.5)).abs() < 1e-4);
        }

        let values = output.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let mean_square = values.iter().map(|v| v * v).sum::<f32>() / values.len() as f32;
        let scaled = fused
            .narrow(1, 704, 256)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for (got, raw) in scaled.iter().zip(&values) {
            assert!((got - raw / mean_square).abs() < 1e-4);
        }
    }

    #[test]
    fn rejects_mismatched_widths_before_creating_parameters() {
        let mut config = RecognizerConfig::default();
        config.fusion.in_channels = 896;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let err = GlobalContextFusion::new(&config, vb.pp("gc_depth_adjust_layer")).unwrap_err();
        assert!(matches!(
            err,
            LprError::Config(ConfigError::FusionChannelMismatch {
                expected: 896,
                actual: 960
            })
        ));
        assert!(varmap.all_vars().is_empty());
    }
}
