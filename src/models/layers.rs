//! Shared convolutional building blocks.
//!
//! Kernels in this network are frequently rectangular (`3x1`, `1x3`, `4x1`,
//! `1x13`) with per-axis padding, which `candle_nn::conv2d` does not cover. The
//! helpers here build those layers with PyTorch-compatible parameter names so
//! that checkpoints exported from the reference training code restore directly.

use candle_core::{D, Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Init, VarBuilder};

/// Convolution with a rectangular kernel and per-axis zero padding.
#[derive(Debug, Clone)]
pub struct RectConv2d {
    conv: Conv2d,
    padding: (usize, usize),
}

impl RectConv2d {
    /// Creates the layer, reading `weight` and `bias` under `vb`.
    ///
    /// Fresh parameters use the same initialization as `candle_nn::conv2d`:
    /// Kaiming-normal weights and a uniform bias bounded by `1 / sqrt(fan_in)`.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: usize,
        padding: (usize, usize),
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_channels, in_channels, kernel.0, kernel.1),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bound = 1. / ((in_channels * kernel.0 * kernel.1) as f64).sqrt();
        let bias = vb.get_with_hints(
            out_channels,
            "bias",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;

        // Symmetric padding is handled by the convolution itself.
        let (conv_padding, padding) = if padding.0 == padding.1 {
            (padding.0, (0, 0))
        } else {
            (0, padding)
        };
        let cfg = Conv2dConfig {
            padding: conv_padding,
            stride,
            ..Default::default()
        };
        Ok(Self {
            conv: Conv2d::new(weight, Some(bias), cfg),
            padding,
        })
    }

    /// Convolution whose output keeps the input height and width (odd kernels only).
    pub fn same(
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        vb: VarBuilder,
    ) -> Result<Self> {
        Self::new(
            in_channels,
            out_channels,
            kernel,
            1,
            (kernel.0 / 2, kernel.1 / 2),
            vb,
        )
    }
}

impl Module for RectConv2d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (ph, pw) = self.padding;
        let x = if ph > 0 {
            x.pad_with_zeros(D::Minus2, ph, ph)?
        } else {
            x.clone()
        };
        let x = if pw > 0 {
            x.pad_with_zeros(D::Minus1, pw, pw)?
        } else {
            x
        };
        self.conv.forward(&x)
    }
}

/// Convolution + BatchNorm + ReLU, stored as a sequential container
/// (`<prefix>.0.*` for the convolution, `<prefix>.1.*` for the norm).
#[derive(Debug, Clone)]
pub struct ConvBnRelu {
    conv: RectConv2d,
    bn: BatchNorm,
}

impl ConvBnRelu {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        padding: (usize, usize),
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv = RectConv2d::new(in_channels, out_channels, kernel, 1, padding, vb.pp("0"))?;
        let bn = candle_nn::batch_norm(out_channels, 1e-5, vb.pp("1"))?;
        Ok(Self { conv, bn })
    }
}

impl ModuleT for ConvBnRelu {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        self.bn.forward_t(&x, train)?.relu()
    }
}

/// Channel dropout: zeroes whole feature maps with probability `p` in training.
#[derive(Debug, Clone, Copy)]
pub struct Dropout2d {
    p: f32,
}

impl Dropout2d {
    pub fn new(p: f32) -> Self {
        Self { p }
    }
}

impl ModuleT for Dropout2d {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.p == 0.0 {
            return Ok(x.clone());
        }
        let (n, c, _, _) = x.dims4()?;
        let keep = Tensor::rand(0f32, 1f32, (n, c, 1, 1), x.device())?
            .ge(self.p)?
            .to_dtype(x.dtype())?;
        let scale = 1.0 / (1.0 - self.p as f64);
        x.broadcast_mul(&keep.affine(scale, 0.0)?)
    }
}

#[derive(Debug, Clone, Copy)]
enum PoolReduce {
    Avg,
    Max,
}

/// Reduces axis `dim` to `out` bins using PyTorch's adaptive window bounds.
fn adaptive_pool_axis(x: &Tensor, dim: usize, out: usize, reduce: PoolReduce) -> Result<Tensor> {
    let size = x.dim(dim)?;
    if size == out {
        return Ok(x.clone());
    }
    if out == 0 || size == 0 {
        candle_core::bail!("adaptive pooling from {size} to {out} bins on dim {dim}");
    }
    let bins = (0..out)
        .map(|i| {
            let start = i * size / out;
            let end = ((i + 1) * size).div_ceil(out);
            let window = x.narrow(dim, start, end - start)?;
            match reduce {
                PoolReduce::Avg => window.mean_keepdim(dim),
                PoolReduce::Max => window.max_keepdim(dim),
            }
        })
        .collect::<Result<Vec<_>>>()?;
    Tensor::cat(&bins, dim)
}

/// `F.adaptive_avg_pool2d` on an `(N, C, H, W)` tensor.
pub fn adaptive_avg_pool2d(x: &Tensor, size: (usize, usize)) -> Result<Tensor> {
    let x = adaptive_pool_axis(x, 2, size.0, PoolReduce::Avg)?;
    adaptive_pool_axis(&x, 3, size.1, PoolReduce::Avg)
}

/// `F.adaptive_max_pool2d` on an `(N, C, H, W)` tensor.
pub fn adaptive_max_pool2d(x: &Tensor, size: (usize, usize)) -> Result<Tensor> {
    let x = adaptive_pool_axis(x, 2, size.0, PoolReduce::Max)?;
    adaptive_pool_axis(&x, 3, size.1, PoolReduce::Max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn rect_conv_same_keeps_size() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let conv = RectConv2d::same(4, 6, (1, 13), vb.pp("head")).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 4, 3, 90), &Device::Cpu).unwrap();
        assert_eq!(conv.forward(&x).unwrap().dims(), &[2, 6, 3, 90]);

        let names = varmap.data().lock().unwrap().keys().cloned().collect::<Vec<_>>();
        assert!(names.contains(&"head.weight".to_string()));
        assert!(names.contains(&"head.bias".to_string()));
    }

    #[test]
    fn rect_conv_asymmetric_kernel() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let conv = RectConv2d::new(8, 8, (4, 1), 1, (1, 1), vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 8, 4, 88), &Device::Cpu).unwrap();
        assert_eq!(conv.forward(&x).unwrap().dims(), &[1, 8, 3, 90]);
    }

    #[test]
    fn adaptive_avg_pool_matches_manual_windows() {
        // 1x1x1x5 -> 1x1x1x2: windows [0, 3) and [2, 5)
        let x = Tensor::new(&[[[[1f32, 2., 3., 4., 5.]]]], &Device::Cpu).unwrap();
        let y = adaptive_avg_pool2d(&x, (1, 2)).unwrap();
        let values = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(values, vec![2.0, 4.0]);
    }

    #[test]
    fn adaptive_max_pool_shape() {
        let x = Tensor::randn(0f32, 1f32, (2, 3, 24, 94), &Device::Cpu).unwrap();
        let y = adaptive_max_pool2d(&x, (16, 58)).unwrap();
        assert_eq!(y.dims(), &[2, 3, 16, 58]);
    }

    #[test]
    fn dropout2d_is_identity_in_eval() {
        let x = Tensor::ones((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let y = Dropout2d::new(0.5).forward_t(&x, false).unwrap();
        let diff = (x - y).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn dropout2d_drops_whole_channels() {
        let x = Tensor::ones((2, 16, 3, 3), DType::F32, &Device::Cpu).unwrap();
        let y = Dropout2d::new(0.5).forward_t(&x, true).unwrap();
        let maps = y.flatten_from(2).unwrap().to_vec3::<f32>().unwrap();
        for channel in maps.iter().flatten() {
            let first = channel[0];
            assert!(first == 0.0 || (first - 2.0).abs() < 1e-6);
            assert!(channel.iter().all(|&v| v == first));
        }
    }
}
