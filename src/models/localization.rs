//! Localization network predicting the affine rectification parameters.

use candle_core::{D, DType, Device, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Dropout, Init, Linear, VarBuilder, VarMap};

use super::layers::adaptive_max_pool2d;
use crate::core::{RecognizerConfig, ThetaActivation};

/// Number of affine parameters (a 2x3 matrix).
pub const THETA_PARAMS: usize = 6;

/// Row-major identity transform, the initial value of the final bias.
pub const IDENTITY_THETA: [f32; THETA_PARAMS] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];

/// Two-path CNN regressing theta `(N, 2, 3)` from the input image.
///
/// Path one max-pools the image to a fixed size before a strided convolution;
/// path two convolves the raw image with a larger stride. Both paths land on
/// the same spatial size, are concatenated and fed to two fully-connected
/// layers. The last layer starts with zero weights and an identity bias so an
/// untrained network predicts the identity transform.
#[derive(Debug, Clone)]
pub struct LocalizationNetwork {
    pooled_size: (usize, usize),
    conv1: Conv2d,
    conv2: Conv2d,
    dropout: Dropout,
    fc1: Linear,
    fc2: Linear,
    activation: ThetaActivation,
}

impl LocalizationNetwork {
    /// Creates a fresh network with its parameters in `varmap` under `prefix`
    /// (conventionally `stn_layer.localization`).
    ///
    /// `fc2` starts with zero weights and the identity bias, so the new network
    /// predicts the identity transform for every input.
    pub fn new(
        config: &RecognizerConfig,
        varmap: &VarMap,
        prefix: &str,
        device: &Device,
    ) -> Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device).pp(prefix);
        let net = Self::load(config, vb)?;
        init_identity_bias(varmap, &format!("{prefix}.fc2.bias"))?;
        Ok(net)
    }

    /// Builds the network over the parameters already reachable through `vb`.
    pub(crate) fn load(config: &RecognizerConfig, vb: VarBuilder) -> Result<Self> {
        let stn = &config.stn;
        let features = config
            .localization_features()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

        let conv1 = candle_nn::conv2d(
            config.input_channels,
            stn.conv_channels,
            5,
            Conv2dConfig {
                stride: 3,
                ..Default::default()
            },
            vb.pp("conv1"),
        )?;
        let conv2 = candle_nn::conv2d(
            config.input_channels,
            stn.conv_channels,
            5,
            Conv2dConfig {
                stride: 5,
                ..Default::default()
            },
            vb.pp("conv2"),
        )?;
        let fc1 = candle_nn::linear(features, stn.hidden_size, vb.pp("fc1"))?;

        let fc2_vb = vb.pp("fc2");
        let fc2_weight =
            fc2_vb.get_with_hints((THETA_PARAMS, stn.hidden_size), "weight", Init::Const(0.))?;
        let fc2_bias = fc2_vb.get_with_hints(THETA_PARAMS, "bias", Init::Const(0.))?;
        let fc2 = Linear::new(fc2_weight, Some(fc2_bias));

        Ok(Self {
            pooled_size: stn.pooled_size,
            conv1,
            conv2,
            dropout: Dropout::new(stn.dropout),
            fc1,
            fc2,
            activation: stn.theta_activation,
        })
    }

    /// Predicts theta for a batch of images.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let n = x.dim(0)?;
        let pooled = adaptive_max_pool2d(x, self.pooled_size)?;
        let x1 = self.conv1.forward(&pooled)?.relu()?;
        let x2 = self.conv2.forward(x)?.relu()?;
        let xs = Tensor::cat(&[&x1, &x2], 1)?.flatten_from(1)?;
        let xs = self.dropout.forward(&xs, train)?;
        let xs = self.fc1.forward(&xs)?.tanh()?;
        let theta = self.fc2.forward(&xs)?;
        let theta = match self.activation {
            ThetaActivation::HardTanh => theta.clamp(-1f32, 1f32)?,
            ThetaActivation::Tanh => theta.tanh()?,
        };
        theta.reshape((n, 2, 3))
    }
}

/// Writes the identity transform into the final localization bias stored under `key`.
pub(crate) fn init_identity_bias(varmap: &VarMap, key: &str) -> Result<()> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("variable store lock is poisoned".to_string()))?;
    let bias = vars
        .get(key)
        .ok_or_else(|| candle_core::Error::Msg(format!("no localization bias named '{key}'")))?;
    let identity = Tensor::new(&IDENTITY_THETA, bias.device())?.to_dtype(bias.dtype())?;
    bias.set(&identity)
}

/// Row-wise `(a*e - b*d)` of each predicted 2x3 matrix.
pub fn theta_determinants(theta: &Tensor) -> Result<Tensor> {
    let a = theta.narrow(D::Minus2, 0, 1)?.narrow(D::Minus1, 0, 1)?;
    let b = theta.narrow(D::Minus2, 0, 1)?.narrow(D::Minus1, 1, 1)?;
    let d = theta.narrow(D::Minus2, 1, 1)?.narrow(D::Minus1, 0, 1)?;
    let e = theta.narrow(D::Minus2, 1, 1)?.narrow(D::Minus1, 1, 1)?;
    (a.mul(&e)? - b.mul(&d)?)?.flatten_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(config: &RecognizerConfig) -> (VarMap, LocalizationNetwork) {
        let varmap = VarMap::new();
        let net =
            LocalizationNetwork::new(config, &varmap, "stn_layer.localization", &Device::Cpu)
                .unwrap();
        (varmap, net)
    }

    #[test]
    fn identity_initialization_predicts_identity() {
        let config = RecognizerConfig::default();
        let (_varmap, net) = build(&config);
        let x = Tensor::randn(0f32, 1f32, (3, 3, 24, 94), &Device::Cpu).unwrap();
        let theta = net.forward_t(&x, false).unwrap();
        assert_eq!(theta.dims(), &[3, 2, 3]);
        for matrix in theta.to_vec3::<f32>().unwrap() {
            assert_eq!(matrix, vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]);
        }
    }

    #[test]
    fn fresh_parameters_store_the_identity_bias() {
        let (varmap, _net) = build(&RecognizerConfig::default());
        let vars = varmap.data().lock().unwrap();
        let bias = vars["stn_layer.localization.fc2.bias"]
            .as_tensor()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(bias, IDENTITY_THETA.to_vec());
        let weight = vars["stn_layer.localization.fc2.weight"]
            .as_tensor()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(weight, 0.0);
    }

    #[test]
    fn single_channel_input() {
        let config = RecognizerConfig {
            input_channels: 1,
            ..Default::default()
        };
        let (_varmap, net) = build(&config);
        let x = Tensor::randn(0f32, 1f32, (2, 1, 24, 94), &Device::Cpu).unwrap();
        assert_eq!(net.forward_t(&x, true).unwrap().dims(), &[2, 2, 3]);
    }

    #[test]
    fn determinant_of_identity_is_one() {
        let theta = Tensor::new(
            &[[[1f32, 0., 0.], [0., 1., 0.]], [[0., 0., 0.], [0., 0., 0.]]],
            &Device::Cpu,
        )
        .unwrap();
        let det = theta_determinants(&theta).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(det, vec![1.0, 0.0]);
    }
}
