use std::path::Path;

use anyhow::Context;
use candle_core::{Device, Tensor};
use internvl_vision::{
    dynamic_preprocess, ApplyTransforms, Normalize, Resize, ToTensor, Transforms, IMAGENET_MEAN,
    IMAGENET_STD,
};
use tracing::info;

use crate::IMAGE_PLACEHOLDER;

/// Tile edge the InternVL2 checkpoints expect.
pub const DEFAULT_INPUT_SIZE: u32 = 448;
/// Largest number of tiles before the thumbnail.
pub const DEFAULT_MAX_NUM: u32 = 12;

/// Decode an image, tile it and return normalized pixels of shape (tiles, 3, size, size).
pub fn load_image(
    path: impl AsRef<Path>,
    input_size: u32,
    max_num: u32,
    device: &Device,
) -> anyhow::Result<Tensor> {
    let path = path.as_ref();
    let image = image::open(path)
        .with_context(|| format!("opening image {}", path.display()))?
        .to_rgb8();
    let image = image::DynamicImage::ImageRgb8(image);

    let tiles = dynamic_preprocess(&image, 1, max_num, input_size, true);
    info!(
        "Image {} ({}x{}) split into {} tile(s).",
        path.display(),
        image.width(),
        image.height(),
        tiles.len()
    );

    let resize = Resize::bicubic(input_size);
    let normalize = Normalize {
        mean: IMAGENET_MEAN.to_vec(),
        std: IMAGENET_STD.to_vec(),
    };
    let pixel_values = tiles
        .iter()
        .map(|tile| {
            tile.apply(
                Transforms {
                    image_transforms: &[&resize],
                    input: &ToTensor,
                    inner_transforms: &[&normalize],
                },
                device,
            )
        })
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::stack(&pixel_values, 0)?)
}

/// An absent path and the literal `None` both mean no image.
pub fn resolve_image_path(image_path: Option<&str>) -> Option<&str> {
    image_path.filter(|p| *p != "None")
}

/// The question passed to the model: `<image>\n` is prefixed when an image is attached.
pub fn prompt_for(text: &str, has_image: bool) -> String {
    if has_image {
        format!("{IMAGE_PLACEHOLDER}\n{text}")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::cast_possible_truncation)]
mod tests {
    use candle_core::Device;
    use image::{ImageBuffer, Rgb};

    use super::{load_image, prompt_for, resolve_image_path};

    fn write_image(dir: &tempfile::TempDir, name: &str, w: u32, h: u32) -> std::path::PathBuf {
        let path = dir.path().join(name);
        ImageBuffer::from_fn(w, h, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]))
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn square_image_is_a_single_tile() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(&dir, "square.png", 64, 64);
        let pixels = load_image(&path, 28, 12, &Device::Cpu).unwrap();
        assert_eq!(pixels.dims(), &[1, 3, 28, 28]);
    }

    #[test]
    fn wide_image_gets_tiles_and_thumbnail() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(&dir, "wide.png", 200, 50);
        let pixels = load_image(&path, 28, 12, &Device::Cpu).unwrap();
        let (n, c, h, w) = pixels.dims4().unwrap();
        assert!((3..=13).contains(&n), "{n} tiles");
        assert_eq!((c, h, w), (3, 28, 28));
    }

    #[test]
    fn pixels_are_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(&dir, "gray.png", 28, 28);
        let pixels = load_image(&path, 28, 12, &Device::Cpu).unwrap();
        let max: f32 = pixels.flatten_all().unwrap().max(0).unwrap().to_scalar().unwrap();
        // (1 - 0.406) / 0.225 is the largest reachable value.
        assert!(max <= 2.65);
        let min: f32 = pixels.flatten_all().unwrap().min(0).unwrap().to_scalar().unwrap();
        assert!(min >= -2.12);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_image(dir.path().join("nope.png"), 28, 12, &Device::Cpu).is_err());
    }

    #[test]
    fn none_literal_means_no_image() {
        assert_eq!(resolve_image_path(None), None);
        assert_eq!(resolve_image_path(Some("None")), None);
        assert_eq!(resolve_image_path(Some("cat.jpg")), Some("cat.jpg"));
    }

    #[test]
    fn prompt_prefix() {
        assert_eq!(prompt_for("describe", true), "<image>\ndescribe");
        assert_eq!(prompt_for("describe", false), "describe");
    }
}
