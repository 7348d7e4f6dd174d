//! Spatial rectifier: warps plates into a canonical view with a predicted affine transform.
//!
//! [`affine_grid`] and [`grid_sample`] follow the conventions of their PyTorch
//! namesakes (normalized `[-1, 1]` coordinates, bilinear interpolation, zero
//! padding outside the source image) so weights trained there behave the same.
//! Both are built from differentiable tensor ops; only the integer corner
//! indices are detached, so gradients reach theta through the interpolation
//! weights.

use candle_core::{D, DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};

use super::localization::{LocalizationNetwork, theta_determinants};
use crate::core::RecognizerConfig;

/// Parameter prefix of the rectifier in checkpoints.
pub const STN_PREFIX: &str = "stn_layer";

/// Matrices with `|det|` below this are reported as degenerate.
const DEGENERATE_DET: f32 = 1e-6;

fn normalized_coords(size: usize, align_corners: bool) -> Vec<f32> {
    (0..size)
        .map(|i| {
            if align_corners {
                if size > 1 {
                    -1.0 + 2.0 * i as f32 / (size - 1) as f32
                } else {
                    0.0
                }
            } else {
                (2 * i + 1) as f32 / size as f32 - 1.0
            }
        })
        .collect()
}

/// Builds the `(N, H, W, 2)` source-coordinate grid for `theta` `(N, 2, 3)`.
///
/// Each output pixel `(x, y)` in normalized coordinates maps to
/// `theta @ [x, y, 1]`.
pub fn affine_grid(
    theta: &Tensor,
    height: usize,
    width: usize,
    align_corners: bool,
) -> Result<Tensor> {
    let n = theta.dim(0)?;
    let xs = normalized_coords(width, align_corners);
    let ys = normalized_coords(height, align_corners);
    let mut base = Vec::with_capacity(height * width * 3);
    for &y in &ys {
        for &x in &xs {
            base.extend_from_slice(&[x, y, 1.0]);
        }
    }
    let base = Tensor::from_vec(base, (1, height * width, 3), theta.device())?
        .to_dtype(theta.dtype())?;
    let grid = base.broadcast_matmul(&theta.transpose(1, 2)?.contiguous()?)?;
    grid.reshape((n, height, width, 2))
}

/// Maps normalized grid coordinates to pixel coordinates along an axis of `size`.
fn unnormalize(coord: &Tensor, size: usize, align_corners: bool) -> Result<Tensor> {
    let size = size as f64;
    if align_corners {
        coord.affine((size - 1.0) / 2.0, (size - 1.0) / 2.0)
    } else {
        coord.affine(size / 2.0, (size - 1.0) / 2.0)
    }
}

/// Samples one bilinear corner, weighted and masked outside the image.
fn sample_corner(
    flat: &Tensor,
    xi: &Tensor,
    yi: &Tensor,
    weight: &Tensor,
    height: usize,
    width: usize,
) -> Result<Tensor> {
    let (n, c, _) = flat.dims3()?;
    let points = xi.dim(1)?;
    let (h_max, w_max) = ((height - 1) as f64, (width - 1) as f64);

    let valid = xi
        .ge(0.0)?
        .mul(&xi.le(w_max)?)?
        .mul(&yi.ge(0.0)?)?
        .mul(&yi.le(h_max)?)?
        .to_dtype(weight.dtype())?;
    let index = (yi.clamp(0.0, h_max)?.affine(width as f64, 0.0)? + xi.clamp(0.0, w_max)?)?
        .to_dtype(DType::U32)?
        .unsqueeze(1)?
        .broadcast_as((n, c, points))?
        .contiguous()?;
    let values = flat.gather(&index, 2)?;
    values.broadcast_mul(&weight.mul(&valid)?.unsqueeze(1)?)
}

/// Bilinearly samples `input` `(N, C, H, W)` at `grid` `(N, Ho, Wo, 2)`.
///
/// Points outside the source image read zeros.
pub fn grid_sample(input: &Tensor, grid: &Tensor, align_corners: bool) -> Result<Tensor> {
    let (n, c, height, width) = input.dims4()?;
    let (_, out_h, out_w, _) = grid.dims4()?;
    let points = out_h * out_w;

    let gx = grid.narrow(D::Minus1, 0, 1)?.reshape((n, points))?;
    let gy = grid.narrow(D::Minus1, 1, 1)?.reshape((n, points))?;
    let ix = unnormalize(&gx, width, align_corners)?;
    let iy = unnormalize(&gy, height, align_corners)?;

    let x0 = ix.detach().floor()?;
    let y0 = iy.detach().floor()?;
    let x1 = (&x0 + 1.0)?;
    let y1 = (&y0 + 1.0)?;
    let wx1 = (&ix - &x0)?;
    let wx0 = (&x1 - &ix)?;
    let wy1 = (&iy - &y0)?;
    let wy0 = (&y1 - &iy)?;

    let flat = input.reshape((n, c, height * width))?;
    let top_left = sample_corner(&flat, &x0, &y0, &wx0.mul(&wy0)?, height, width)?;
    let top_right = sample_corner(&flat, &x1, &y0, &wx1.mul(&wy0)?, height, width)?;
    let bottom_left = sample_corner(&flat, &x0, &y1, &wx0.mul(&wy1)?, height, width)?;
    let bottom_right = sample_corner(&flat, &x1, &y1, &wx1.mul(&wy1)?, height, width)?;

    (top_left + top_right + bottom_left + bottom_right)?.reshape((n, c, out_h, out_w))
}

/// Warps `x` with `theta`; the output has the shape of `x`.
pub fn rectify(x: &Tensor, theta: &Tensor, align_corners: bool) -> Result<Tensor> {
    let (_, _, height, width) = x.dims4()?;
    let grid = affine_grid(theta, height, width, align_corners)?;
    grid_sample(x, &grid, align_corners)
}

/// Localization network plus sampler.
#[derive(Debug, Clone)]
pub struct SpatialRectifier {
    localization: LocalizationNetwork,
    align_corners: bool,
}

impl SpatialRectifier {
    /// Creates a fresh rectifier with its parameters in `varmap` under
    /// [`STN_PREFIX`]. Until trained it reproduces its input.
    pub fn new(config: &RecognizerConfig, varmap: &VarMap, device: &Device) -> Result<Self> {
        Ok(Self {
            localization: LocalizationNetwork::new(
                config,
                varmap,
                &format!("{STN_PREFIX}.localization"),
                device,
            )?,
            align_corners: config.stn.align_corners,
        })
    }

    /// Builds the rectifier over existing parameters under `vb` (conventionally [`STN_PREFIX`]).
    pub(crate) fn load(config: &RecognizerConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            localization: LocalizationNetwork::load(config, vb.pp("localization"))?,
            align_corners: config.stn.align_corners,
        })
    }

    /// Predicts theta for `x` without warping.
    pub fn theta(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.localization.forward_t(x, train)
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let theta = self.theta(x, train)?;
        let degenerate = theta_determinants(&theta)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?
            .iter()
            .filter(|det| det.abs() < DEGENERATE_DET)
            .count();
        if degenerate > 0 {
            tracing::warn!(
                degenerate,
                batch = x.dim(0)?,
                "rectifier received non-invertible transforms; output will be near constant"
            );
        }
        rectify(x, &theta, self.align_corners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(n: usize) -> Tensor {
        Tensor::new(&[[1f32, 0., 0.], [0., 1., 0.]], &Device::Cpu)
            .unwrap()
            .unsqueeze(0)
            .unwrap()
            .repeat((n, 1, 1))
            .unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn identity_theta_is_a_no_op() {
        let x = Tensor::randn(0f32, 1f32, (2, 3, 24, 94), &Device::Cpu).unwrap();
        for align_corners in [true, false] {
            let y = rectify(&x, &identity(2), align_corners).unwrap();
            assert_eq!(y.dims(), x.dims());
            assert!(max_abs_diff(&x, &y) < 1e-4, "align_corners = {align_corners}");
        }
    }

    #[test]
    fn fresh_rectifier_reproduces_its_input() {
        let varmap = VarMap::new();
        let config = RecognizerConfig::default();
        let rectifier = SpatialRectifier::new(&config, &varmap, &Device::Cpu).unwrap();
        let x = Tensor::rand(0f32, 1f32, (2, 3, 24, 94), &Device::Cpu).unwrap();

        let theta = rectifier.theta(&x, false).unwrap();
        for matrix in theta.to_vec3::<f32>().unwrap() {
            assert_eq!(matrix, vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]);
        }
        let y = rectifier.forward_t(&x, false).unwrap();
        assert!(max_abs_diff(&x, &y) < 1e-4);
        assert!(
            varmap
                .data()
                .lock()
                .unwrap()
                .contains_key("stn_layer.localization.fc2.bias")
        );
    }

    #[test]
    fn constant_image_stays_constant_under_identity() {
        let x = Tensor::full(0.25f32, (1, 1, 24, 94), &Device::Cpu).unwrap();
        let y = rectify(&x, &identity(1), true).unwrap();
        assert!(max_abs_diff(&x, &y) < 1e-5);
    }

    #[test]
    fn zero_theta_reads_the_center() {
        // Every output pixel samples the image center.
        let x = Tensor::arange(0f32, 9., &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 3, 3))
            .unwrap();
        let theta = Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let y = rectify(&x, &theta, true).unwrap();
        let values = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| (v - 4.0).abs() < 1e-5));
    }

    #[test]
    fn translation_outside_reads_zeros() {
        let x = Tensor::ones((1, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let theta = Tensor::new(&[[[1f32, 0., 5.], [0., 1., 0.]]], &Device::Cpu).unwrap();
        let y = rectify(&x, &theta, true).unwrap();
        let total = y.sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(total, 0.0);
    }

    #[test]
    fn gradients_reach_theta() {
        let x = Tensor::randn(0f32, 1f32, (1, 1, 6, 8), &Device::Cpu).unwrap();
        let theta = candle_core::Var::from_tensor(
            &Tensor::new(&[[[0.9f32, 0.1, 0.05], [-0.1, 0.8, 0.0]]], &Device::Cpu).unwrap(),
        )
        .unwrap();
        let y = rectify(&x, theta.as_tensor(), false).unwrap();
        let grads = y.sqr().unwrap().sum_all().unwrap().backward().unwrap();
        let grad = grads.get(theta.as_tensor()).unwrap();
        assert_eq!(grad.dims(), &[1, 2, 3]);
    }
}
