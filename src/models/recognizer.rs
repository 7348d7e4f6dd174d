//! The assembled plate recognition network.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::path::Path;

use super::backbone::FeatureBackbone;
use super::checkpoint::{LoadMode, LoadReport, load_safetensors, restore};
use super::fusion::GlobalContextFusion;
use super::head::SequenceHead;
use super::localization::init_identity_bias;
use super::rectifier::{STN_PREFIX, SpatialRectifier};
use crate::core::validation::{validate_device, validate_image_batch};
use crate::core::{ConfigValidator, LprError, LprResult, RecognizerConfig, candle_to_lpr_inference};
use crate::domain::PipelineMode;

/// Variable name of the localization bias that starts as the identity transform.
const THETA_BIAS: &str = "stn_layer.localization.fc2.bias";

/// Rectifier, backbone, optional global-context fusion and sequence head.
///
/// Maps an image batch `(N, C, H, W)` to logits `(N, num_classes, T)`. Which of
/// the optional stages run is decided per call by a [`PipelineMode`].
#[derive(Debug, Clone)]
pub struct LprNet {
    config: RecognizerConfig,
    device: Device,
    rectifier: SpatialRectifier,
    backbone: FeatureBackbone,
    fusion: GlobalContextFusion,
    head: SequenceHead,
}

impl LprNet {
    /// Builds the network over the parameters reachable through `vb`.
    ///
    /// The configuration is validated before any parameter is requested.
    /// Fresh variables are not initialized to the identity rectifier here; the
    /// public constructors take care of that.
    pub(crate) fn load(config: RecognizerConfig, vb: VarBuilder) -> LprResult<Self> {
        config.validate()?;
        let device = vb.device().clone();

        let rectifier = SpatialRectifier::load(&config, vb.pp(STN_PREFIX))
            .map_err(|e| candle_to_lpr_inference("rectifier", "load stn_layer", e))?;
        let backbone = FeatureBackbone::new(&config, vb.pp("backbone"))
            .map_err(|e| candle_to_lpr_inference("backbone", "load backbone", e))?;
        let fusion = GlobalContextFusion::new(&config, vb.pp("gc_depth_adjust_layer"))?;
        let head = SequenceHead::new(&config, vb.pp("pre_decoder"))?;

        Ok(Self {
            config,
            device,
            rectifier,
            backbone,
            fusion,
            head,
        })
    }

    /// Creates a freshly initialized, trainable network.
    ///
    /// The localization head starts at the identity transform, so the
    /// rectifier reproduces its input until trained. The returned [`VarMap`]
    /// owns every parameter; hand its variables to an optimizer or restore a
    /// checkpoint into it with [`checkpoint::restore`](super::checkpoint::restore).
    pub fn with_varmap(config: RecognizerConfig, device: &Device) -> LprResult<(Self, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net = Self::load(config, vb)?;
        init_identity_bias(&varmap, THETA_BIAS)
            .map_err(|e| LprError::tensor_operation("initialize localization bias", e))?;
        Ok((net, varmap))
    }

    /// Loads an inference network from safetensors files.
    ///
    /// Equivalent to [`from_checkpoint`](Self::from_checkpoint) in
    /// [`LoadMode::Strict`]: every network parameter must be present and the
    /// files may hold nothing else.
    pub fn from_safetensors<P: AsRef<Path>>(
        paths: &[P],
        config: RecognizerConfig,
        device: &Device,
    ) -> LprResult<Self> {
        let (net, _varmap, _report) = Self::from_checkpoint(paths, config, device, LoadMode::Strict)?;
        Ok(net)
    }

    /// Builds a trainable network and restores a checkpoint into it.
    pub fn from_checkpoint<P: AsRef<Path>>(
        paths: &[P],
        config: RecognizerConfig,
        device: &Device,
        mode: LoadMode,
    ) -> LprResult<(Self, VarMap, LoadReport)> {
        let tensors = load_safetensors(paths, device)?;
        let (net, varmap) = Self::with_varmap(config, device)?;
        let report = restore(&varmap, &tensors, mode)?;
        Ok((net, varmap, report))
    }

    pub fn config(&self) -> &RecognizerConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of decoding time-steps `T` in the output.
    pub fn time_steps(&self) -> usize {
        self.head.time_steps()
    }

    /// Inference forward pass.
    pub fn forward(&self, images: &Tensor, mode: &PipelineMode) -> LprResult<Tensor> {
        self.forward_t(images, mode, false)
    }

    /// Forward pass; `train` enables dropout and batch statistics.
    ///
    /// # Errors
    ///
    /// [`LprError::InvalidInput`] if `images` is not on the network device or
    /// does not have the configured `(C, H, W)`, before any computation.
    pub fn forward_t(&self, images: &Tensor, mode: &PipelineMode, train: bool) -> LprResult<Tensor> {
        validate_device(images, &self.device, "images")?;
        validate_image_batch(
            images,
            self.config.input_channels,
            self.config.input_height,
            self.config.input_width,
        )?;
        let images = images
            .to_dtype(DType::F32)
            .map_err(|e| LprError::tensor_operation("convert images to f32", e))?;

        let x = if mode.rectifier_enabled() {
            self.rectifier
                .forward_t(&images, train)
                .map_err(|e| candle_to_lpr_inference("rectifier", "forward", e))?
        } else {
            images
        };

        let features = self
            .backbone
            .forward_t(&x, train)
            .map_err(|e| candle_to_lpr_inference("backbone", "forward", e))?;

        let x = if mode.global_context {
            self.fusion
                .forward_t(&features, train)
                .map_err(|e| candle_to_lpr_inference("global_context_fusion", "forward", e))?
        } else {
            features.output
        };

        self.head
            .forward_t(&x, train)
            .map_err(|e| candle_to_lpr_inference("sequence_head", "forward", e))
    }
}
