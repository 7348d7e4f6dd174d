//! Input Validation Utilities
//!
//! Checks run on caller-supplied tensors before any network stage executes, so
//! that shape and device problems surface as [`LprError::InvalidInput`] instead
//! of a tensor error deep inside a layer.

use candle_core::{Device, Tensor};

use crate::core::LprError;

/// Validates that a tensor has the expected rank.
#[inline]
pub fn validate_rank(tensor: &Tensor, rank: usize, name: &str) -> Result<(), LprError> {
    if tensor.rank() != rank {
        return Err(LprError::InvalidInput {
            message: format!(
                "expected '{}' to be a rank-{} tensor, got shape {:?}",
                name,
                rank,
                tensor.dims()
            ),
        });
    }
    Ok(())
}

/// Validates that a tensor lives on the given device.
#[inline]
pub fn validate_device(tensor: &Tensor, device: &Device, name: &str) -> Result<(), LprError> {
    if !tensor.device().same_device(device) {
        return Err(LprError::InvalidInput {
            message: format!(
                "'{}' is on {:?} but the network lives on {:?}",
                name,
                tensor.device().location(),
                device.location()
            ),
        });
    }
    Ok(())
}

/// Validates an `(N, C, H, W)` image batch against the expected channels and size.
pub fn validate_image_batch(
    images: &Tensor,
    channels: usize,
    height: usize,
    width: usize,
) -> Result<(), LprError> {
    validate_rank(images, 4, "images")?;
    let (n, c, h, w) = images
        .dims4()
        .map_err(|e| LprError::tensor_operation("read image batch dims", e))?;
    if n == 0 {
        return Err(LprError::invalid_input("image batch is empty"));
    }
    if c != channels || h != height || w != width {
        return Err(LprError::InvalidInput {
            message: format!(
                "expected images of shape (N, {}, {}, {}), got (N, {}, {}, {})",
                channels, height, width, c, h, w
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn accepts_matching_batch() {
        let images = Tensor::zeros((2, 3, 24, 94), DType::F32, &Device::Cpu).unwrap();
        assert!(validate_image_batch(&images, 3, 24, 94).is_ok());
    }

    #[test]
    fn rejects_wrong_channels_and_rank() {
        let images = Tensor::zeros((2, 1, 24, 94), DType::F32, &Device::Cpu).unwrap();
        assert!(validate_image_batch(&images, 3, 24, 94).is_err());

        let flat = Tensor::zeros((3, 24, 94), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            validate_image_batch(&flat, 3, 24, 94),
            Err(LprError::InvalidInput { .. })
        ));
    }

    #[test]
    fn cpu_tensors_match_cpu_device() {
        let t = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();
        assert!(validate_device(&t, &Device::Cpu, "t").is_ok());
    }
}
