use image::{imageops, GrayImage, ImageBuffer, Luma};
use imageproc::{
    distance_transform::euclidean_squared_distance_transform, drawing::draw_polygon_mut,
    point::Point,
};
use ndarray::Array2;
use tracing::instrument;

use crate::annotation::WordLabel;

pub type DistanceImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Removes repeated and closing points so the contour can be handed to
/// `draw_polygon_mut`, which rejects rings whose first and last point match.
fn open_contour(polygon: &[Point<i32>]) -> Vec<Point<i32>> {
    let mut contour: Vec<Point<i32>> = Vec::with_capacity(polygon.len());
    for point in polygon {
        if contour.last() != Some(point) {
            contour.push(*point);
        }
    }
    while contour.len() > 1 && contour.first() == contour.last() {
        contour.pop();
    }
    contour
}

/// Fills `polygon` (boundary included) with `value`. A polygon collapsed to a
/// single point still covers that pixel.
pub fn fill_polygon(canvas: &mut GrayImage, polygon: &[Point<i32>], value: u8) {
    let contour = open_contour(polygon);
    match contour.as_slice() {
        [] => {}
        [point] => {
            let inside = point.x >= 0
                && point.y >= 0
                && (point.x as u32) < canvas.width()
                && (point.y as u32) < canvas.height();
            if inside {
                canvas.put_pixel(point.x as u32, point.y as u32, Luma([value]));
            }
        }
        _ => draw_polygon_mut(canvas, &contour, Luma([value])),
    }
}

/// Rasterizes polygons into an instance map (polygon `i` gets id `i + 1`) and
/// a training mask that is zero inside unreadable words.
///
/// Polygons are drawn in order, later ones overwrite earlier ones.
#[instrument(level = "trace", skip(polygons, labels))]
pub fn draw_instances(
    polygons: &[Vec<Point<i32>>],
    labels: &[WordLabel],
    (width, height): (u32, u32),
) -> (GrayImage, GrayImage) {
    let mut instance = GrayImage::new(width, height);
    let mut training_mask = GrayImage::from_pixel(width, height, Luma([1]));
    for (i, polygon) in polygons.iter().enumerate() {
        let id = u8::try_from(i + 1).unwrap_or(u8::MAX);
        fill_polygon(&mut instance, polygon, id);
        if matches!(labels.get(i), Some(WordLabel::Unreadable)) {
            fill_polygon(&mut training_mask, polygon, 0);
        }
    }
    (instance, training_mask)
}

/// Union of all polygons as a 0/1 mask.
pub fn draw_kernel(polygons: &[Vec<Point<i32>>], (width, height): (u32, u32)) -> GrayImage {
    let mut kernel = GrayImage::new(width, height);
    for polygon in polygons {
        fill_polygon(&mut kernel, polygon, 1);
    }
    kernel
}

/// Inclusive `(min_x, min_y, max_x, max_y)` of the nonzero pixels.
pub fn foreground_bounds(mask: &GrayImage) -> Option<(u32, u32, u32, u32)> {
    mask.enumerate_pixels()
        .filter(|(_, _, p)| p[0] > 0)
        .fold(None, |bounds, (x, y, _)| match bounds {
            None => Some((x, y, x, y)),
            Some((x0, y0, x1, y1)) => Some((x0.min(x), y0.min(y), x1.max(x), y1.max(y))),
        })
}

/// Euclidean distance from every nonzero pixel to the nearest zero pixel;
/// zero pixels stay 0.
///
/// Work is restricted to the foreground's bounding box grown by one pixel,
/// whose border is background wherever it lies inside the canvas. If the
/// mask has no zero pixel at all, the area outside the canvas counts as
/// background.
pub fn distance_field(mask: &GrayImage) -> DistanceImage {
    let (width, height) = mask.dimensions();
    let mut field = DistanceImage::new(width, height);
    let Some((x0, y0, x1, y1)) = foreground_bounds(mask) else {
        return field;
    };

    let left = x0.saturating_sub(1);
    let top = y0.saturating_sub(1);
    let right = (x1 + 1).min(width - 1);
    let bottom = (y1 + 1).min(height - 1);
    let window = imageops::crop_imm(mask, left, top, right - left + 1, bottom - top + 1).to_image();

    let pad = if window.pixels().any(|p| p[0] == 0) { 0 } else { 1 };
    let background = GrayImage::from_fn(
        window.width() + 2 * pad,
        window.height() + 2 * pad,
        |x, y| {
            let inside = x >= pad
                && y >= pad
                && x - pad < window.width()
                && y - pad < window.height()
                && window.get_pixel(x - pad, y - pad)[0] > 0;
            if inside {
                Luma([0])
            } else {
                Luma([255])
            }
        },
    );
    let squared = euclidean_squared_distance_transform(&background);

    for (x, y, pixel) in window.enumerate_pixels() {
        if pixel[0] > 0 {
            let distance = squared.get_pixel(x + pad, y + pad)[0].sqrt() as f32;
            field.put_pixel(left + x, top + y, Luma([distance]));
        }
    }
    field
}

/// Copies every nonzero value of `field` into `into`, leaving the rest of
/// `into` untouched. The last polygon to reach a pixel owns it, regardless of
/// which distance is larger.
pub fn merge_distance(into: &mut DistanceImage, field: &DistanceImage) {
    for (dst, src) in into.pixels_mut().zip(field.pixels()) {
        if src[0] > 0.0 {
            *dst = *src;
        }
    }
}

/// Per-polygon distance fields merged in drawing order.
#[instrument(level = "trace", skip(polygons))]
pub fn polygon_distance_map(polygons: &[Vec<Point<i32>>], (width, height): (u32, u32)) -> DistanceImage {
    let mut merged = DistanceImage::new(width, height);
    for polygon in polygons {
        let mut mask = GrayImage::new(width, height);
        fill_polygon(&mut mask, polygon, 255);
        merge_distance(&mut merged, &distance_field(&mask));
    }
    merged
}

/// Bounding box `(top, left, bottom, right)` of every instance id, bottom and
/// right exclusive. Row `id` of the returned table belongs to instance `id`;
/// rows of absent instances are zero.
pub fn instance_bounding_boxes(instance: &GrayImage, capacity: usize) -> Array2<i32> {
    let mut boxes = Array2::<i32>::zeros((capacity, 4));
    let mut bounds: [Option<(u32, u32, u32, u32)>; 256] = [None; 256];
    for (x, y, pixel) in instance.enumerate_pixels() {
        let id = pixel[0] as usize;
        if id == 0 {
            continue;
        }
        bounds[id] = Some(match bounds[id] {
            None => (y, x, y, x),
            Some((top, left, bottom, right)) => {
                (top.min(y), left.min(x), bottom.max(y), right.max(x))
            }
        });
    }
    for (id, bound) in bounds.iter().enumerate().skip(1) {
        if let Some((top, left, bottom, right)) = bound {
            if id < capacity {
                boxes[[id, 0]] = *top as i32;
                boxes[[id, 1]] = *left as i32;
                boxes[[id, 2]] = *bottom as i32 + 1;
                boxes[[id, 3]] = *right as i32 + 1;
            }
        }
    }
    boxes
}
