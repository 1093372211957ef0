use image::{imageops::FilterType, DynamicImage, GrayImage, Pixel, Rgb, RgbImage};
use ndarray::{Array2, Array3, Axis};
use rand::Rng;
use tracing::instrument;

use crate::{error::Result, raster::DistanceImage};

pub const MEAN_VALUES: [f32; 3] = [0.485, 0.456, 0.406];
pub const NORM_VALUES: [f32; 3] = [1.0 / 0.229, 1.0 / 0.224, 1.0 / 0.225];

const BRIGHTNESS_JITTER: f32 = 32.0 / 255.0;
const SATURATION_JITTER: f32 = 0.5;

/// `(x / 255 - mean) * norm` per channel, laid out as CHW.
#[instrument(level = "debug", skip(image))]
pub fn subtract_mean_normalize(
    image: &RgbImage,
    mean_vals: &[f32; 3],
    norm_vals: &[f32; 3],
) -> Array3<f32> {
    let image = DynamicImage::ImageRgb8(image.clone()).into_rgb32f();
    let norm = Rgb::<f32>(*norm_vals);
    let mean_vals = Rgb::<f32>(*mean_vals).map2(&norm, |c1, c2| c1 * c2);
    Array3::<f32>::from_shape_fn(
        (3, image.height() as usize, image.width() as usize),
        |(ch, y, x)| {
            let pixel = image
                .get_pixel(x as u32, y as u32)
                .map2(&norm, |c1, c2| c1 * c2)
                .map2(&mean_vals, |c1, c2| c1 - c2);
            pixel.channels()[ch]
        },
    )
}

/// Output size of scaling `(width, height)` by `scale`: each side rounded to
/// the nearest pixel, then up to the next multiple of 32.
pub fn aligned_size(width: u32, height: u32, scale: f32) -> (u32, u32) {
    let align = |side: u32| {
        let side = ((side as f32 * scale + 0.5) as u32).max(1);
        if side % 32 != 0 {
            side + (32 - side % 32)
        } else {
            side
        }
    };
    (align(width), align(height))
}

pub fn scale_aligned(image: &DynamicImage, scale: f32) -> DynamicImage {
    let (width, height) = aligned_size(image.width(), image.height(), scale);
    log::debug!(
        "Resizing from (w: {}, h: {}) to (w: {width}, h: {height}) with scale {scale}.",
        image.width(),
        image.height()
    );
    image.resize_exact(width, height, FilterType::Triangle)
}

/// Scales so the shorter side becomes `short_size`, both sides aligned to 32.
pub fn scale_aligned_short(image: &DynamicImage, short_size: u32) -> DynamicImage {
    let scale = short_size as f32 / image.width().min(image.height()) as f32;
    scale_aligned(image, scale)
}

fn adjust_brightness(pixel: Rgb<u8>, factor: f32) -> Rgb<u8> {
    pixel.map(|c| (c as f32 * factor).clamp(0.0, 255.0) as u8)
}

fn adjust_saturation(pixel: Rgb<u8>, factor: f32) -> Rgb<u8> {
    let [r, g, b] = pixel.0.map(|c| c as f32);
    let gray = 0.299 * r + 0.587 * g + 0.114 * b;
    pixel.map(|c| (gray + factor * (c as f32 - gray)).clamp(0.0, 255.0) as u8)
}

/// Random brightness and saturation change, the two applied in random order.
pub fn color_jitter<R: Rng + ?Sized>(image: &mut RgbImage, rng: &mut R) {
    let brightness = rng.gen_range(1.0 - BRIGHTNESS_JITTER..=1.0 + BRIGHTNESS_JITTER);
    let saturation = rng.gen_range(1.0 - SATURATION_JITTER..=1.0 + SATURATION_JITTER);
    let brightness_first = rng.gen_bool(0.5);
    log::trace!(
        "Color jitter: brightness {brightness}, saturation {saturation}, brightness first: {brightness_first}"
    );
    for pixel in image.pixels_mut() {
        *pixel = if brightness_first {
            adjust_saturation(adjust_brightness(*pixel, brightness), saturation)
        } else {
            adjust_brightness(adjust_saturation(*pixel, saturation), brightness)
        };
    }
}

pub fn gray_to_array(image: GrayImage) -> Result<Array2<u8>> {
    let shape = (image.height() as usize, image.width() as usize);
    Ok(Array2::from_shape_vec(shape, image.into_raw())?)
}

pub fn distance_to_array(image: DistanceImage) -> Result<Array2<f32>> {
    let shape = (image.height() as usize, image.width() as usize);
    Ok(Array2::from_shape_vec(shape, image.into_raw())?)
}

/// Stacks same-sized layers along a new leading axis.
pub fn stack_layers<T: Clone>(layers: Vec<Array2<T>>, (height, width): (usize, usize)) -> Result<Array3<T>> {
    let views = layers.iter().map(|layer| layer.view()).collect::<Vec<_>>();
    if views.is_empty() {
        return Ok(Array3::from_shape_vec((0, height, width), Vec::new())?);
    }
    Ok(ndarray::stack(Axis(0), &views)?)
}

/// Writes every layer of `stack` to `debug_samples/` as PNG, label layers
/// stretched to the full intensity range.
#[cfg(feature = "debug")]
pub(crate) fn save_debug_layers(stack: &crate::augment::RasterStack, index: usize, stage: &str) {
    let dir = std::path::Path::new("debug_samples");
    if let Err(err) = std::fs::create_dir_all(dir) {
        log::warn!("Can't create {dir:?}: {err}");
        return;
    }
    let stretch = |layer: &GrayImage, factor: u8| {
        GrayImage::from_fn(layer.width(), layer.height(), |x, y| {
            image::Luma([layer.get_pixel(x, y)[0].saturating_mul(factor)])
        })
    };
    let mut layers = vec![
        ("instance".to_string(), stretch(&stack.instance, 37)),
        ("training_mask".to_string(), stretch(&stack.training_mask, 255)),
    ];
    for (i, kernel) in stack.kernels.iter().enumerate() {
        layers.push((format!("kernel_{i}"), stretch(kernel, 255)));
    }
    for (i, distance) in stack.distances.iter().enumerate() {
        layers.push((format!("distance_{i}"), distance_to_gray(distance)));
    }
    let image_path = dir.join(format!("{index}_{stage}_image.png"));
    if let Err(err) = stack.image.save(&image_path) {
        log::warn!("Can't write {image_path:?}: {err}");
    }
    for (name, layer) in layers {
        let path = dir.join(format!("{index}_{stage}_{name}.png"));
        if let Err(err) = layer.save(&path) {
            log::warn!("Can't write {path:?}: {err}");
        }
    }
}

/// Maps a distance raster onto 0..=255, scaled by its largest value.
pub fn distance_to_gray(distance: &DistanceImage) -> GrayImage {
    let max = distance
        .pixels()
        .map(|p| float_ord::FloatOrd(p[0]))
        .max()
        .map(|max| max.0)
        .unwrap_or(0.0);
    let scale = if max > 0.0 { 255.0 / max } else { 0.0 };
    GrayImage::from_fn(distance.width(), distance.height(), |x, y| {
        image::Luma([(distance.get_pixel(x, y)[0] * scale).round().clamp(0.0, 255.0) as u8])
    })
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn aligned_sizes_are_multiples_of_32() {
        for (w, h) in [(1, 1), (100, 200), (1280, 720), (33, 4000), (641, 479)] {
            for short in [32u32, 100, 640, 736] {
                for factor in [0.7f32, 1.0, 1.3] {
                    let scale = factor * short as f32 / w.min(h) as f32;
                    let (tw, th) = aligned_size(w, h, scale);
                    assert_eq!(tw % 32, 0, "{w}x{h} scale {scale}");
                    assert_eq!(th % 32, 0, "{w}x{h} scale {scale}");
                    assert!(tw > 0 && th > 0);
                }
            }
        }
    }

    #[test]
    fn short_side_scaling() {
        let image = DynamicImage::new_rgb8(200, 100);
        let scaled = scale_aligned_short(&image, 640);
        assert_eq!((scaled.width(), scaled.height()), (1280, 640));

        let image = DynamicImage::new_rgb8(500, 333);
        let scaled = scale_aligned_short(&image, 640);
        // 500 * 640 / 333 = 960.96 -> 961 -> 992
        assert_eq!((scaled.width(), scaled.height()), (992, 640));
    }

    #[test]
    fn normalization_uses_imagenet_statistics() {
        let image = RgbImage::from_pixel(2, 1, Rgb([255, 0, 124]));
        let array = subtract_mean_normalize(&image, &MEAN_VALUES, &NORM_VALUES);
        assert_eq!(array.dim(), (3, 1, 2));
        assert!((array[[0, 0, 0]] - (1.0 - 0.485) / 0.229).abs() < 1e-4);
        assert!((array[[1, 0, 1]] - (0.0 - 0.456) / 0.224).abs() < 1e-4);
        assert!((array[[2, 0, 0]] - (124.0 / 255.0 - 0.406) / 0.225).abs() < 1e-4);
    }

    #[test]
    fn jitter_keeps_gray_pixels_gray() {
        let mut image = RgbImage::from_pixel(4, 4, Rgb([100, 100, 100]));
        let mut rng = StdRng::seed_from_u64(7);
        color_jitter(&mut image, &mut rng);
        let pixel = image.get_pixel(0, 0);
        assert_eq!(pixel[0], pixel[1]);
        assert_eq!(pixel[1], pixel[2]);
        assert!((pixel[0] as i32 - 100).abs() <= 13);
    }

    #[test]
    fn jitter_order_matters_once_channels_clip() {
        let pixel = Rgb([250, 40, 10]);
        let brightness_first = adjust_saturation(adjust_brightness(pixel, 1.12), 1.5);
        let saturation_first = adjust_brightness(adjust_saturation(pixel, 1.5), 1.12);
        assert_eq!(brightness_first, Rgb([255, 14, 0]));
        assert_eq!(saturation_first, Rgb([255, 11, 0]));
    }

    #[test]
    fn distance_scaled_to_full_range() {
        let mut distance = DistanceImage::new(3, 1);
        distance.put_pixel(1, 0, image::Luma([2.0]));
        distance.put_pixel(2, 0, image::Luma([4.0]));
        assert_eq!(distance_to_gray(&distance).into_raw(), vec![0, 128, 255]);
        assert_eq!(distance_to_gray(&DistanceImage::new(2, 2)).into_raw(), vec![0; 4]);
    }

    #[test]
    fn layers_stack_along_first_axis() {
        let a = gray_to_array(GrayImage::from_pixel(3, 2, image::Luma([1]))).unwrap();
        let b = gray_to_array(GrayImage::new(3, 2)).unwrap();
        let stacked = stack_layers(vec![a, b], (2, 3)).unwrap();
        assert_eq!(stacked.dim(), (2, 2, 3));
        assert_eq!(stacked[[0, 1, 2]], 1);
        assert_eq!(stacked[[1, 1, 2]], 0);
    }
}
