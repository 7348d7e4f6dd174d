//! Conversion of plate crops into network input tensors.

use candle_core::{Device, Tensor};
use image::RgbImage;
use image::imageops::FilterType;

use crate::core::{ConfigError, LprError, LprResult, RecognizerConfig};

/// Resizes plate crops to the network input size and stacks them into an
/// `(N, C, H, W)` batch with values in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlateImageProcessor {
    height: usize,
    width: usize,
    channels: usize,
}

impl PlateImageProcessor {
    pub fn new(height: usize, width: usize, channels: usize) -> Result<Self, ConfigError> {
        if !matches!(channels, 1 | 3) {
            return Err(ConfigError::UnsupportedInputChannels(channels));
        }
        if height == 0 || width == 0 {
            return Err(ConfigError::InvalidConfig {
                message: format!("input size must be non-empty, got {height}x{width}"),
            });
        }
        Ok(Self {
            height,
            width,
            channels,
        })
    }

    pub fn from_config(config: &RecognizerConfig) -> Result<Self, ConfigError> {
        Self::new(
            config.input_height,
            config.input_width,
            config.input_channels,
        )
    }

    /// Resizes one image and returns its pixels in CHW order.
    ///
    /// Single-channel processors convert to luma after resizing.
    pub fn to_chw(&self, image: &RgbImage) -> Vec<f32> {
        // Bicubic, the default resampling of the PIL pipeline the weights were trained with.
        let resized = image::imageops::resize(
            image,
            self.width as u32,
            self.height as u32,
            FilterType::CatmullRom,
        );
        let plane = self.height * self.width;
        let mut data = vec![0f32; self.channels * plane];
        if self.channels == 1 {
            let gray = image::imageops::grayscale(&resized);
            for (i, pixel) in gray.pixels().enumerate() {
                data[i] = pixel[0] as f32 / 255.0;
            }
        } else {
            for (i, pixel) in resized.pixels().enumerate() {
                for c in 0..3 {
                    data[c * plane + i] = pixel[c] as f32 / 255.0;
                }
            }
        }
        data
    }

    /// Builds the `(N, C, H, W)` input batch on `device`.
    pub fn process(&self, images: &[RgbImage], device: &Device) -> LprResult<Tensor> {
        if images.is_empty() {
            return Err(LprError::invalid_input("no images to process"));
        }
        let data = images
            .iter()
            .flat_map(|image| self.to_chw(image))
            .collect::<Vec<_>>();
        Tensor::from_vec(
            data,
            (images.len(), self.channels, self.height, self.width),
            device,
        )
        .map_err(|e| LprError::resize_error("stack image batch", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;
    use image::Rgb;

    #[test]
    fn produces_normalized_nchw_batch() {
        let processor = PlateImageProcessor::from_config(&RecognizerConfig::default()).unwrap();
        let red = RgbImage::from_pixel(120, 40, Rgb([255, 0, 0]));
        let gray = RgbImage::from_pixel(60, 20, Rgb([51, 51, 51]));
        let batch = processor.process(&[red, gray], &Device::Cpu).unwrap();
        assert_eq!(batch.dims(), &[2, 3, 24, 94]);

        let at = |index: (usize, usize, usize, usize)| {
            batch.i(index).unwrap().to_scalar::<f32>().unwrap()
        };
        assert!((at((0, 0, 10, 10)) - 1.0).abs() < 1e-6);
        assert!(at((0, 1, 10, 10)).abs() < 1e-6);
        assert!((at((1, 2, 3, 3)) - 0.2).abs() < 1e-6);
    }

    #[test]
    fn single_channel_uses_luma() {
        let processor = PlateImageProcessor::new(24, 94, 1).unwrap();
        let white = RgbImage::from_pixel(94, 24, Rgb([255, 255, 255]));
        let chw = processor.to_chw(&white);
        assert_eq!(chw.len(), 24 * 94);
        assert!(chw.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn rejects_bad_settings_and_empty_batches() {
        assert_eq!(
            PlateImageProcessor::new(24, 94, 2),
            Err(ConfigError::UnsupportedInputChannels(2))
        );
        let processor = PlateImageProcessor::new(24, 94, 3).unwrap();
        assert!(processor.process(&[], &Device::Cpu).is_err());
    }
}
