#![allow(clippy::cast_precision_loss)]

use image::{imageops::FilterType, DynamicImage, GenericImageView};

/// A tiling layout: `cols` tiles across and `rows` tiles down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub cols: u32,
    pub rows: u32,
}

impl TileGrid {
    pub fn blocks(&self) -> u32 {
        self.cols * self.rows
    }

    fn aspect_ratio(&self) -> f64 {
        self.cols as f64 / self.rows as f64
    }
}

/// All grids with `min_num <= cols * rows <= max_num`, ordered by tile count.
pub fn target_ratios(min_num: u32, max_num: u32) -> Vec<TileGrid> {
    let mut ratios = Vec::new();
    for n in min_num..=max_num {
        for cols in 1..=n {
            for rows in 1..=n {
                let grid = TileGrid { cols, rows };
                let blocks = grid.blocks();
                if blocks >= min_num && blocks <= max_num && !ratios.contains(&grid) {
                    ratios.push(grid);
                }
            }
        }
    }
    // Stable, so grids with equal tile counts keep their discovery order.
    ratios.sort_by_key(TileGrid::blocks);
    ratios
}

/// Pick the grid whose aspect ratio is closest to the image's. On a tie the later (larger)
/// grid wins if the image has enough pixels to fill at least half of it.
pub fn find_closest_aspect_ratio(
    aspect_ratio: f64,
    target_ratios: &[TileGrid],
    width: u32,
    height: u32,
    image_size: u32,
) -> TileGrid {
    let mut best_ratio_diff = f64::INFINITY;
    let mut best_ratio = TileGrid { cols: 1, rows: 1 };
    let area = width as f64 * height as f64;
    for ratio in target_ratios {
        let ratio_diff = (aspect_ratio - ratio.aspect_ratio()).abs();
        if ratio_diff < best_ratio_diff {
            best_ratio_diff = ratio_diff;
            best_ratio = *ratio;
        } else if ratio_diff == best_ratio_diff
            && area > 0.5 * (image_size * image_size) as f64 * ratio.blocks() as f64
        {
            best_ratio = *ratio;
        }
    }
    best_ratio
}

/// Split an image into `image_size` square tiles laid out on the grid that best matches its
/// aspect ratio. Tiles are returned row-major. If `use_thumbnail` is set and more than one tile
/// was produced, a downscaled copy of the whole image is appended last.
pub fn dynamic_preprocess(
    image: &DynamicImage,
    min_num: u32,
    max_num: u32,
    image_size: u32,
    use_thumbnail: bool,
) -> Vec<DynamicImage> {
    let (orig_width, orig_height) = image.dimensions();
    let aspect_ratio = orig_width as f64 / orig_height as f64;

    let ratios = target_ratios(min_num, max_num);
    let grid =
        find_closest_aspect_ratio(aspect_ratio, &ratios, orig_width, orig_height, image_size);

    let target_width = image_size * grid.cols;
    let target_height = image_size * grid.rows;
    let resized = image.resize_exact(target_width, target_height, FilterType::CatmullRom);

    let mut processed = Vec::with_capacity(grid.blocks() as usize + 1);
    for i in 0..grid.blocks() {
        let x = (i % grid.cols) * image_size;
        let y = (i / grid.cols) * image_size;
        processed.push(resized.crop_imm(x, y, image_size, image_size));
    }

    if use_thumbnail && processed.len() != 1 {
        processed.push(image.resize_exact(image_size, image_size, FilterType::CatmullRom));
    }
    processed
}
