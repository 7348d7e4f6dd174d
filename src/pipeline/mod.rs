//! End-to-end plate reading: images in, plate strings out.
//!
//! [`PlateReader`] ties together preprocessing, the network and a CTC decoder,
//! following the usual preprocess -> infer -> postprocess split.

use candle_core::{Device, Tensor};
use image::RgbImage;
use std::path::Path;
use std::sync::Arc;

use crate::core::{ConfigError, ConfigValidator, LprError, LprResult, RecognizerConfig};
use crate::domain::{PipelineMode, Vocabulary};
use crate::models::{LoadMode, LprNet};
use crate::processors::{CtcDecoder, DecoderKind, PlateImageProcessor};

/// Recognized plates for a batch of images.
#[derive(Debug, Clone, PartialEq)]
pub struct PlateRecognition {
    /// Plate text for each image
    pub texts: Vec<String>,
    /// Decoded class indices for each image
    pub sequences: Vec<Vec<usize>>,
    /// Decoder confidence for each image
    pub scores: Vec<f32>,
}

/// Reads plate text from cropped plate images.
#[derive(Debug, Clone)]
pub struct PlateReader {
    net: LprNet,
    processor: PlateImageProcessor,
    decoder: CtcDecoder,
    vocabulary: Arc<Vocabulary>,
    mode: PipelineMode,
}

impl PlateReader {
    /// Assembles a reader around an already built network.
    pub fn new(
        net: LprNet,
        vocabulary: Arc<Vocabulary>,
        decoder: DecoderKind,
        mode: PipelineMode,
    ) -> LprResult<Self> {
        check_vocabulary(net.config(), &vocabulary)?;
        let processor = PlateImageProcessor::from_config(net.config())?;
        let decoder = CtcDecoder::new(decoder)?;
        Ok(Self {
            net,
            processor,
            decoder,
            vocabulary,
            mode,
        })
    }

    pub fn net(&self) -> &LprNet {
        &self.net
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    /// Resizes and stacks images into an input batch on the network device.
    pub fn preprocess(&self, images: &[RgbImage]) -> LprResult<Tensor> {
        self.processor.process(images, self.net.device())
    }

    /// Runs the network on a preprocessed batch.
    pub fn infer(&self, batch: &Tensor, mode: &PipelineMode) -> LprResult<Tensor> {
        self.net.forward(batch, mode)
    }

    /// Decodes `(N, classes, T)` logits into plate strings.
    pub fn postprocess(&self, logits: &Tensor) -> LprResult<PlateRecognition> {
        let decoded = self.decoder.decode_tensor(logits)?;
        let texts = decoded
            .iter()
            .map(|d| self.vocabulary.decode(&d.indices))
            .collect();
        let scores = decoded.iter().map(|d| d.confidence()).collect();
        let sequences = decoded.into_iter().map(|d| d.indices).collect();
        Ok(PlateRecognition {
            texts,
            sequences,
            scores,
        })
    }

    /// Recognizes a batch of images with the reader's pipeline mode.
    pub fn recognize(&self, images: &[RgbImage]) -> LprResult<PlateRecognition> {
        self.recognize_with_mode(images, &self.mode)
    }

    /// Recognizes a batch of images with an explicit pipeline mode.
    pub fn recognize_with_mode(
        &self,
        images: &[RgbImage],
        mode: &PipelineMode,
    ) -> LprResult<PlateRecognition> {
        let batch = self.preprocess(images)?;
        let logits = self.infer(&batch, mode)?;
        let recognition = self.postprocess(&logits)?;
        tracing::debug!(
            images = images.len(),
            recognized = recognition.texts.iter().filter(|t| !t.is_empty()).count(),
            "plate batch recognized"
        );
        Ok(recognition)
    }
}

fn check_vocabulary(config: &RecognizerConfig, vocabulary: &Vocabulary) -> Result<(), ConfigError> {
    if vocabulary.num_classes() != config.num_classes {
        return Err(ConfigError::InvalidConfig {
            message: format!(
                "vocabulary has {} classes but the network predicts {}",
                vocabulary.num_classes(),
                config.num_classes
            ),
        });
    }
    Ok(())
}

/// Builder for [`PlateReader`].
#[derive(Debug, Clone)]
pub struct PlateReaderBuilder {
    config: RecognizerConfig,
    vocabulary: Arc<Vocabulary>,
    decoder: DecoderKind,
    mode: PipelineMode,
    device: Device,
    load_mode: LoadMode,
}

impl PlateReaderBuilder {
    /// Creates a builder for the default 37-class network on the CPU.
    pub fn new() -> Self {
        Self {
            config: RecognizerConfig::default(),
            vocabulary: Arc::new(Vocabulary::indonesian()),
            decoder: DecoderKind::default(),
            mode: PipelineMode::inference(),
            device: Device::Cpu,
            load_mode: LoadMode::Strict,
        }
    }

    /// Sets the network configuration.
    pub fn config(mut self, config: RecognizerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the vocabulary; its class count must match the network.
    pub fn vocabulary(mut self, vocabulary: impl Into<Arc<Vocabulary>>) -> Self {
        self.vocabulary = vocabulary.into();
        self
    }

    /// Sets the decoder.
    pub fn decoder(mut self, decoder: DecoderKind) -> Self {
        self.decoder = decoder;
        self
    }

    /// Sets the default pipeline mode.
    pub fn mode(mut self, mode: PipelineMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the device the network runs on.
    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Sets how checkpoint keys are matched against the network.
    ///
    /// Defaults to [`LoadMode::Strict`]: a missing or unexpected tensor fails the build.
    pub fn load_mode(mut self, mode: LoadMode) -> Self {
        self.load_mode = mode;
        self
    }

    /// Loads the weights and builds the reader.
    ///
    /// Configuration, vocabulary and decoder are validated before any file is read.
    pub fn build<P: AsRef<Path>>(self, weights: &[P]) -> LprResult<PlateReader> {
        self.config.validate()?;
        check_vocabulary(&self.config, &self.vocabulary)?;
        self.decoder.validate()?;
        if weights.is_empty() {
            return Err(LprError::config_error("no weight files given"));
        }

        let (net, _varmap, report) =
            LprNet::from_checkpoint(weights, self.config, &self.device, self.load_mode)?;
        if !report.is_complete() {
            tracing::warn!(
                missing = ?report.missing,
                unexpected = ?report.unexpected,
                "weights only partially matched the network"
            );
        }
        tracing::info!(
            decoder = ?self.decoder,
            time_steps = net.time_steps(),
            "plate reader ready"
        );
        PlateReader::new(net, self.vocabulary, self.decoder, self.mode)
    }
}

impl Default for PlateReaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}
