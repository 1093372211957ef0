use geo::{Area, Coord, EuclideanLength, LineString, Polygon};
use geo_clipper::{Clipper, EndType, JoinType};
use imageproc::point::Point;
use thiserror::Error;
use tracing::instrument;

/// Upper bound, in pixels, on how far a kernel polygon is pulled inwards.
pub const DEFAULT_MAX_SHRINK: i64 = 20;

const PERIMETER_EPSILON: f64 = 1e-3;
const ARC_TOLERANCE: f64 = 0.25;

#[derive(Debug, Error)]
pub(crate) enum GeometryError {
    #[error("polygon has {0} points, at least 3 are required")]
    TooFewPoints(usize),
    #[error("polygon metrics are not finite (area: {area}, perimeter: {perimeter})")]
    NonFinite { area: f64, perimeter: f64 },
}

pub(crate) fn to_geo_poly(points: &[Point<i32>]) -> Polygon<f64> {
    let points = points
        .iter()
        .map(|point| Coord {
            x: point.x as f64,
            y: point.y as f64,
        })
        .collect();
    Polygon::new(LineString::new(points), vec![])
}

/// Length of the closed ring through `points`, including the edge from the
/// last point back to the first.
pub fn perimeter(points: &[Point<i32>]) -> f64 {
    to_geo_poly(points).exterior().euclidean_length()
}

pub fn polygon_area(points: &[Point<i32>]) -> f64 {
    to_geo_poly(points).unsigned_area()
}

/// Inward offset for a polygon so that its kernel keeps roughly `rate²` of the
/// original area, capped at `max_shrink` pixels.
pub fn shrink_offset(points: &[Point<i32>], rate: f32, max_shrink: i64) -> i64 {
    let area = polygon_area(points);
    let peri = perimeter(points);
    let rate = (rate as f64) * (rate as f64);
    let offset = (area * (1.0 - rate) / (peri + PERIMETER_EPSILON) + 0.5).floor() as i64;
    offset.min(max_shrink)
}

/// Shrinks every polygon towards its interior with round joins.
///
/// A polygon that cannot be shrunk (the offset swallows it, or it is
/// degenerate to begin with) is returned unchanged, so the output always has
/// one entry per input polygon.
#[instrument(level = "trace", skip(polygons))]
pub fn shrink(polygons: &[Vec<Point<i32>>], rate: f32, max_shrink: i64) -> Vec<Vec<Point<i32>>> {
    polygons
        .iter()
        .map(|polygon| match try_shrink(polygon, rate, max_shrink) {
            Ok(Some(shrunk)) => shrunk,
            Ok(None) => polygon.clone(),
            Err(err) => {
                log::warn!("Keeping polygon unshrunk: {err} ({polygon:?})");
                polygon.clone()
            }
        })
        .collect()
}

fn try_shrink(
    polygon: &[Point<i32>],
    rate: f32,
    max_shrink: i64,
) -> Result<Option<Vec<Point<i32>>>, GeometryError> {
    if polygon.len() < 3 {
        return Err(GeometryError::TooFewPoints(polygon.len()));
    }
    let geo_poly = to_geo_poly(polygon);
    let area = geo_poly.unsigned_area();
    let perimeter = geo_poly.exterior().euclidean_length();
    if !area.is_finite() || !perimeter.is_finite() {
        return Err(GeometryError::NonFinite { area, perimeter });
    }

    let offset = shrink_offset(polygon, rate, max_shrink);
    let shrunk = geo_poly.offset(
        -(offset as f64),
        JoinType::Round(ARC_TOLERANCE),
        EndType::ClosedPolygon,
        1.0,
    );

    let Some(first) = shrunk.0.first() else {
        log::trace!("Offset of {offset}px consumed the polygon entirely");
        return Ok(None);
    };

    let mut ring = first
        .exterior()
        .coords()
        .map(|c| Point::new(c.x.round() as i32, c.y.round() as i32))
        .collect::<Vec<_>>();
    if ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }
    if ring.len() <= 2 {
        return Ok(None);
    }
    Ok(Some(ring))
}
