use candle_core::{Device, Result, Tensor};
use image::DynamicImage;
mod dynamic;
mod transforms;
pub(crate) mod utils;
pub use dynamic::{dynamic_preprocess, find_closest_aspect_ratio, target_ratios, TileGrid};
pub use transforms::{Normalize, Resize, ToTensor};

/// ImageNet per-channel mean, used by InternViT.
pub const IMAGENET_MEAN: [f64; 3] = [0.485, 0.456, 0.406];
/// ImageNet per-channel standard deviation, used by InternViT.
pub const IMAGENET_STD: [f64; 3] = [0.229, 0.224, 0.225];

pub trait ImageTransform {
    type Input;
    type Output;

    fn map(&self, x: &Self::Input, device: &Device) -> Result<Self::Output>;
}

/// A transform pipeline: image-space transforms, then conversion to a tensor, then
/// tensor-space transforms.
pub struct Transforms<'a> {
    pub image_transforms: &'a [&'a dyn ImageTransform<Input = DynamicImage, Output = DynamicImage>],
    pub input: &'a dyn ImageTransform<Input = DynamicImage, Output = Tensor>,
    pub inner_transforms: &'a [&'a dyn ImageTransform<Input = Tensor, Output = Tensor>],
}

pub trait ApplyTransforms<'a> {
    fn apply(&self, transforms: Transforms<'a>, device: &Device) -> Result<Tensor>;
}

impl<'a> ApplyTransforms<'a> for DynamicImage {
    fn apply(&self, transforms: Transforms<'a>, device: &Device) -> Result<Tensor> {
        let mut image = None;
        for transform in transforms.image_transforms {
            image = Some(transform.map(image.as_ref().unwrap_or(self), device)?);
        }
        let mut res = transforms
            .input
            .map(image.as_ref().unwrap_or(self), device)?;
        for transform in transforms.inner_transforms {
            res = transform.map(&res, device)?;
        }
        Ok(res)
    }
}
