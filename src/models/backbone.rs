//! Convolutional feature backbone built from small-basic blocks.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, VarBuilder};

use super::layers::{ConvBnRelu, Dropout2d, RectConv2d};
use crate::core::RecognizerConfig;

/// Bottleneck block: 1x1 reduce, 3x1, 1x3, 1x1 expand.
///
/// The reduced width is a quarter of the output width.
#[derive(Debug, Clone)]
pub struct SmallBasicBlock {
    block1: ConvBnRelu,
    block2: ConvBnRelu,
    block3: ConvBnRelu,
    block4: ConvBnRelu,
}

impl SmallBasicBlock {
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let reduced = out_channels / 4;
        Ok(Self {
            block1: ConvBnRelu::new(in_channels, reduced, (1, 1), (0, 0), vb.pp("block1"))?,
            block2: ConvBnRelu::new(reduced, reduced, (3, 1), (1, 0), vb.pp("block2"))?,
            block3: ConvBnRelu::new(reduced, reduced, (1, 3), (0, 1), vb.pp("block3"))?,
            block4: ConvBnRelu::new(reduced, out_channels, (1, 1), (0, 0), vb.pp("block4"))?,
        })
    }
}

impl ModuleT for SmallBasicBlock {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.block1.forward_t(x, train)?;
        let x = self.block2.forward_t(&x, train)?;
        let x = self.block3.forward_t(&x, train)?;
        self.block4.forward_t(&x, train)
    }
}

/// The backbone intermediates consumed downstream, by name.
#[derive(Debug, Clone)]
pub struct BackboneFeatures {
    /// After the first max-pool.
    pub pool_1: Tensor,
    /// After the first small-basic block.
    pub block_1: Tensor,
    /// After the second small-basic block.
    pub block_2: Tensor,
    /// After the third small-basic block.
    pub block_3: Tensor,
    /// Final output.
    pub output: Tensor,
}

/// Stem convolution, three small-basic blocks with interleaved pooling, and
/// a tall `4x1` convolution collapsing most of the height.
#[derive(Debug, Clone)]
pub struct FeatureBackbone {
    conv_1: RectConv2d,
    bn_1: BatchNorm,
    basic_block_1: SmallBasicBlock,
    basic_block_2: SmallBasicBlock,
    basic_block_3: SmallBasicBlock,
    dropout_1: Dropout2d,
    conv_2: RectConv2d,
    bn_2: BatchNorm,
    dropout_2: Dropout2d,
}

impl FeatureBackbone {
    /// Builds the backbone under `vb` (conventionally `backbone`).
    pub fn new(config: &RecognizerConfig, vb: VarBuilder) -> Result<Self> {
        let widths = &config.backbone;
        Ok(Self {
            conv_1: RectConv2d::new(
                config.input_channels,
                widths.stem_channels,
                (3, 3),
                1,
                (1, 1),
                vb.pp("conv_1"),
            )?,
            bn_1: candle_nn::batch_norm(widths.stem_channels, 1e-5, vb.pp("bn_1"))?,
            basic_block_1: SmallBasicBlock::new(
                widths.stem_channels,
                widths.block_1_channels,
                vb.pp("basic_block_1"),
            )?,
            basic_block_2: SmallBasicBlock::new(
                widths.block_1_channels,
                widths.block_2_channels,
                vb.pp("basic_block_2"),
            )?,
            basic_block_3: SmallBasicBlock::new(
                widths.block_2_channels,
                widths.block_3_channels,
                vb.pp("basic_block_3"),
            )?,
            dropout_1: Dropout2d::new(widths.dropout),
            conv_2: RectConv2d::new(
                widths.block_3_channels,
                widths.output_channels,
                (4, 1),
                1,
                (1, 1),
                vb.pp("conv_2"),
            )?,
            bn_2: candle_nn::batch_norm(widths.output_channels, 1e-5, vb.pp("bn_2"))?,
            dropout_2: Dropout2d::new(widths.dropout),
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<BackboneFeatures> {
        let x = self.conv_1.forward(x)?;
        let x = self.bn_1.forward_t(&x, train)?.relu()?;
        let pool_1 = x.max_pool2d_with_stride((3, 3), (1, 1))?;
        let block_1 = self.basic_block_1.forward_t(&pool_1, train)?;

        let x = block_1.max_pool2d_with_stride((3, 3), (2, 1))?;
        let block_2 = self.basic_block_2.forward_t(&x, train)?;
        let block_3 = self.basic_block_3.forward_t(&block_2, train)?;

        let x = block_3.max_pool2d_with_stride((3, 3), (2, 1))?;
        let x = self.dropout_1.forward_t(&x, train)?;
        let x = self.conv_2.forward(&x)?;
        let x = self.bn_2.forward_t(&x, train)?.relu()?;
        let output = self.dropout_2.forward_t(&x, train)?;

        Ok(BackboneFeatures {
            pool_1,
            block_1,
            block_2,
            block_3,
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn feature_shapes_follow_configured_geometry() {
        let config = RecognizerConfig::default();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let backbone = FeatureBackbone::new(&config, vb.pp("backbone")).unwrap();

        let x = Tensor::randn(0f32, 1f32, (2, 3, 24, 94), &Device::Cpu).unwrap();
        let features = backbone.forward_t(&x, false).unwrap();
        let geometry = config.backbone_geometry().unwrap();
        assert_eq!(features.pool_1.dims(), &[2, 64, geometry.pool_1.0, geometry.pool_1.1]);
        assert_eq!(features.block_1.dims(), &[2, 128, 22, 92]);
        assert_eq!(features.block_2.dims(), &[2, 256, geometry.pool_2.0, geometry.pool_2.1]);
        assert_eq!(features.block_3.dims(), &[2, 256, 10, 90]);
        assert_eq!(features.output.dims(), &[2, 256, geometry.output.0, geometry.output.1]);
    }

    #[test]
    fn small_basic_block_parameter_names() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = SmallBasicBlock::new(8, 16, vb.pp("basic_block_1")).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 8, 5, 7), &Device::Cpu).unwrap();
        assert_eq!(block.forward_t(&x, true).unwrap().dims(), &[1, 16, 5, 7]);

        let data = varmap.data().lock().unwrap();
        for key in [
            "basic_block_1.block1.0.weight",
            "basic_block_1.block2.0.bias",
            "basic_block_1.block3.1.running_mean",
            "basic_block_1.block4.1.running_var",
        ] {
            assert!(data.contains_key(key), "missing {key}");
        }
        assert_eq!(
            data["basic_block_1.block2.0.weight"].as_tensor().dims(),
            &[4, 4, 3, 1]
        );
    }
}
