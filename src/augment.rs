use image::{imageops, DynamicImage, GrayImage, ImageBuffer, Luma, Pixel, Rgb, RgbImage};
use ndarray::Array1;
use rand::Rng;
use tracing::instrument;

use crate::{raster::foreground_bounds, raster::DistanceImage, util};

pub const RANDOM_SCALES: [f32; 7] = [0.7, 0.8, 0.9, 1.0, 1.1, 1.2, 1.3];
pub const MAX_ROTATION_DEGREES: f32 = 10.0;
/// Share of an instance's pixels that must survive cropping for its
/// transcription to stay supervised.
pub const MIN_VISIBLE_RATIO: f64 = 0.9;

/// Picks a scale from [`RANDOM_SCALES`] relative to `short_size` and resizes
/// to sides that are multiples of 32.
pub fn random_scale<R: Rng + ?Sized>(image: &DynamicImage, short_size: u32, rng: &mut R) -> DynamicImage {
    let factor = RANDOM_SCALES[rng.gen_range(0..RANDOM_SCALES.len())];
    let scale = factor * short_size as f32 / image.width().min(image.height()) as f32;
    util::scale_aligned(image, scale)
}

/// Image plus every label raster derived from it. Geometric augmentations go
/// through [`RasterStack::apply`] so all layers stay pixel-aligned.
#[derive(Debug, Clone)]
pub struct RasterStack {
    pub image: RgbImage,
    pub instance: GrayImage,
    pub training_mask: GrayImage,
    pub kernels: Vec<GrayImage>,
    pub distances: Vec<DistanceImage>,
}

/// A geometric transform applied identically to each layer type.
pub trait LayerTransform {
    fn rgb(&self, layer: &RgbImage) -> RgbImage;
    fn luma(&self, layer: &GrayImage) -> GrayImage;
    fn distance(&self, layer: &DistanceImage) -> DistanceImage;
}

impl RasterStack {
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn apply<T: LayerTransform>(&mut self, transform: &T) {
        self.image = transform.rgb(&self.image);
        self.instance = transform.luma(&self.instance);
        self.training_mask = transform.luma(&self.training_mask);
        for kernel in &mut self.kernels {
            *kernel = transform.luma(kernel);
        }
        for distance in &mut self.distances {
            *distance = transform.distance(distance);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HorizontalFlip;

impl LayerTransform for HorizontalFlip {
    fn rgb(&self, layer: &RgbImage) -> RgbImage {
        imageops::flip_horizontal(layer)
    }

    fn luma(&self, layer: &GrayImage) -> GrayImage {
        imageops::flip_horizontal(layer)
    }

    fn distance(&self, layer: &DistanceImage) -> DistanceImage {
        imageops::flip_horizontal(layer)
    }
}

/// Rotation about the image centre with nearest-neighbour sampling, so ids
/// and binary masks never get blended. Uncovered pixels become 0.
#[derive(Debug, Clone, Copy)]
pub struct Rotation {
    pub radians: f32,
}

impl Rotation {
    /// Inverse-maps every output pixel to its nearest source pixel about the
    /// centre `(w / 2, h / 2)`.
    fn rotate<P: Pixel>(
        &self,
        layer: &ImageBuffer<P, Vec<P::Subpixel>>,
        fill: P,
    ) -> ImageBuffer<P, Vec<P::Subpixel>> {
        let (width, height) = layer.dimensions();
        let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
        let (sin, cos) = self.radians.sin_cos();
        ImageBuffer::from_fn(width, height, |x, y| {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            let sx = (cos * dx + sin * dy + cx).round();
            let sy = (-sin * dx + cos * dy + cy).round();
            if sx >= 0.0 && sy >= 0.0 && (sx as u32) < width && (sy as u32) < height {
                *layer.get_pixel(sx as u32, sy as u32)
            } else {
                fill
            }
        })
    }
}

impl LayerTransform for Rotation {
    fn rgb(&self, layer: &RgbImage) -> RgbImage {
        self.rotate(layer, Rgb([0, 0, 0]))
    }

    fn luma(&self, layer: &GrayImage) -> GrayImage {
        self.rotate(layer, Luma([0]))
    }

    fn distance(&self, layer: &DistanceImage) -> DistanceImage {
        self.rotate(layer, Luma([0.0]))
    }
}

/// Cuts a `width x height` window at `(x, y)` and pads it with zeros at the
/// bottom and right up to `target_width x target_height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropPad {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub target_width: u32,
    pub target_height: u32,
}

impl CropPad {
    fn crop_pad<P: Pixel + 'static>(
        &self,
        layer: &ImageBuffer<P, Vec<P::Subpixel>>,
    ) -> ImageBuffer<P, Vec<P::Subpixel>> {
        let cropped = imageops::crop_imm(layer, self.x, self.y, self.width, self.height).to_image();
        let mut padded = ImageBuffer::new(self.target_width, self.target_height);
        imageops::replace(&mut padded, &cropped, 0, 0);
        padded
    }
}

impl LayerTransform for CropPad {
    fn rgb(&self, layer: &RgbImage) -> RgbImage {
        self.crop_pad(layer)
    }

    fn luma(&self, layer: &GrayImage) -> GrayImage {
        self.crop_pad(layer)
    }

    fn distance(&self, layer: &DistanceImage) -> DistanceImage {
        self.crop_pad(layer)
    }
}

/// Flips every layer with probability 0.5.
pub fn random_horizontal_flip<R: Rng + ?Sized>(stack: &mut RasterStack, rng: &mut R) -> bool {
    let flip = rng.gen::<f64>() < 0.5;
    if flip {
        stack.apply(&HorizontalFlip);
    }
    flip
}

/// Rotates every layer by an angle drawn uniformly from
/// `[-MAX_ROTATION_DEGREES, MAX_ROTATION_DEGREES]`. Returns the angle in degrees.
pub fn random_rotate<R: Rng + ?Sized>(stack: &mut RasterStack, rng: &mut R) -> f32 {
    let angle = rng.gen::<f32>() * 2.0 * MAX_ROTATION_DEGREES - MAX_ROTATION_DEGREES;
    stack.apply(&Rotation {
        radians: angle.to_radians(),
    });
    angle
}

/// Crops at `(x, y)` with a window of `target` clamped to the stack size and
/// pads back up to exactly `target`.
pub fn crop_padding(stack: &mut RasterStack, (x, y): (u32, u32), target: (u32, u32)) {
    let (width, height) = stack.dimensions();
    let (target_width, target_height) = target;
    let crop_width = target_width.min(width);
    let crop_height = target_height.min(height);
    stack.apply(&CropPad {
        x: x.min(width - crop_width),
        y: y.min(height - crop_height),
        width: crop_width,
        height: crop_height,
        target_width,
        target_height,
    });
}

/// Origin along one axis that keeps the text span `[min, max]` in view as far
/// as the window allows.
fn text_biased_origin<R: Rng + ?Sized>(min: u32, max: u32, crop: u32, size: u32, rng: &mut R) -> u32 {
    let low = min.saturating_sub(crop);
    let high = max.saturating_sub(crop).min(size - crop);
    if low < high {
        rng.gen_range(low..=high)
    } else {
        0
    }
}

fn uniform_origin<R: Rng + ?Sized>(crop: u32, size: u32, rng: &mut R) -> u32 {
    if size > crop {
        rng.gen_range(0..=size - crop)
    } else {
        0
    }
}

/// Random crop to `target` followed by zero padding. With probability 5/8,
/// when the instance map has any text, the window is placed so that it
/// overlaps the text region.
#[instrument(level = "trace", skip(stack, rng))]
pub fn random_crop_padding<R: Rng + ?Sized>(stack: &mut RasterStack, target: (u32, u32), rng: &mut R) {
    let (width, height) = stack.dimensions();
    if (width, height) == target {
        return;
    }
    let crop_width = target.0.min(width);
    let crop_height = target.1.min(height);

    let text_biased = rng.gen::<f64>() > 3.0 / 8.0;
    let origin = match foreground_bounds(&stack.instance) {
        Some((min_x, min_y, max_x, max_y)) if text_biased => {
            let y = text_biased_origin(min_y, max_y, crop_height, height, rng);
            let x = text_biased_origin(min_x, max_x, crop_width, width, rng);
            (x, y)
        }
        _ => {
            let y = uniform_origin(crop_height, height, rng);
            let x = uniform_origin(crop_width, width, rng);
            (x, y)
        }
    };
    log::trace!("Cropping {crop_width}x{crop_height} at {origin:?} from {width}x{height}");
    crop_padding(stack, origin, target);
}

fn instance_areas(instance: &GrayImage) -> [u64; 256] {
    let mut areas = [0u64; 256];
    for pixel in instance.pixels() {
        areas[pixel[0] as usize] += 1;
    }
    areas
}

/// Clears the word-mask slot of every id without a single pixel in
/// `instance`, e.g. polygons outside the image or hidden under later ones.
pub fn drop_empty_words(instance: &GrayImage, word_mask: &mut Array1<i32>) {
    let areas = instance_areas(instance);
    for (id, slot) in word_mask.iter_mut().enumerate().skip(1).take(areas.len() - 1) {
        if *slot != 0 && areas[id] == 0 {
            log::debug!("Instance {id} has no pixels, dropping its word");
            *slot = 0;
        }
    }
}

/// Clears the word-mask slot of every instance that the crop removed or left
/// with less than [`MIN_VISIBLE_RATIO`] of its pixels. Such words still
/// supervise detection but no longer supervise recognition.
pub fn prune_word_mask(before: &GrayImage, after: &GrayImage, word_mask: &mut Array1<i32>) {
    let before = instance_areas(before);
    let after = instance_areas(after);
    for id in 1..before.len() {
        if before[id] == 0 || id >= word_mask.len() {
            continue;
        }
        let visible = after[id] as f64 / before[id] as f64;
        if visible < MIN_VISIBLE_RATIO {
            log::trace!("Instance {id} keeps {:.0}% of its pixels, dropping its word", visible * 100.0);
            word_mask[id] = 0;
        }
    }
}
