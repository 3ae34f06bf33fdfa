use crate::utils::image_to_pixels;
use candle_core::{Device, Result, Tensor};
use image::{imageops::FilterType, DynamicImage, GenericImageView};

use crate::ImageTransform;

/// Convert an image to an RGB tensor, scaling the data from `[0, 255]` to `[0.0, 1.0]`.
/// The tensor's shape is (3, height, width).
pub struct ToTensor;

impl ImageTransform for ToTensor {
    type Input = DynamicImage;
    type Output = Tensor;
    fn map(&self, x: &Self::Input, device: &Device) -> Result<Self::Output> {
        // Rescale to between 0 and 1
        image_to_pixels(x, device)? / 255.0f64
    }
}

/// Normalize the image data based on the mean and standard deviation.
/// The value is computed as follows:
/// `
/// x[channel]=(x[channel] - mean[channel]) / std[channel]
/// `
///
/// Expects an input tensor of shape (channels, height, width).
pub struct Normalize {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl ImageTransform for Normalize {
    type Input = Tensor;
    type Output = Self::Input;

    fn map(&self, x: &Self::Input, device: &Device) -> Result<Self::Output> {
        let num_channels = x.dim(0)?;
        if self.mean.len() != num_channels || self.std.len() != num_channels {
            candle_core::bail!("Num channels must match number of mean and std.");
        }
        let mean = Tensor::new(self.mean.as_slice(), device)?
            .to_dtype(x.dtype())?
            .reshape((num_channels, 1, 1))?;
        let std = Tensor::new(self.std.as_slice(), device)?
            .to_dtype(x.dtype())?
            .reshape((num_channels, 1, 1))?;
        x.broadcast_sub(&mean)?.broadcast_div(&std)
    }
}

/// Resize the image to exactly `width` x `height`, ignoring the aspect ratio.
pub struct Resize {
    pub width: u32,
    pub height: u32,
    pub filter: FilterType,
}

impl Resize {
    /// Square bicubic resize.
    pub fn bicubic(size: u32) -> Self {
        Self {
            width: size,
            height: size,
            filter: FilterType::CatmullRom,
        }
    }
}

impl ImageTransform for Resize {
    type Input = DynamicImage;
    type Output = Self::Input;

    fn map(&self, x: &Self::Input, _: &Device) -> Result<Self::Output> {
        if x.dimensions() == (self.width, self.height) {
            return Ok(x.clone());
        }
        Ok(x.resize_exact(self.width, self.height, self.filter))
    }
}
