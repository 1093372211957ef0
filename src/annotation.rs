use std::path::{Path, PathBuf};

use geo::Coord;
use imageproc::point::Point;
use serde::Deserialize;

use crate::error::{DatasetError, Result};

/// Transcription attached to a text polygon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WordLabel {
    Readable(String),
    /// Text that can't be read. Excluded from the loss everywhere.
    Unreadable,
    /// Readable text without a transcription. Still supervises detection.
    Unknown,
}

impl WordLabel {
    /// Maps raw dataset transcriptions onto labels. `#` and `###` mark
    /// unreadable text; a missing or empty transcription, or `???`, is unknown.
    pub fn from_transcription(text: Option<&str>) -> Self {
        match text.map(str::trim) {
            None | Some("") | Some("???") => WordLabel::Unknown,
            Some("#") | Some("###") => WordLabel::Unreadable,
            Some(text) => WordLabel::Readable(text.to_string()),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            WordLabel::Readable(text) => Some(text),
            _ => None,
        }
    }
}

/// A word polygon with coordinates normalized to the image size.
#[derive(Debug, Clone, PartialEq)]
pub struct TextPolygon {
    pub points: Vec<Coord<f64>>,
    pub label: WordLabel,
}

impl TextPolygon {
    /// Builds a polygon from pixel coordinates of an image of the given size.
    pub fn from_pixels(points: &[[f64; 2]], width: u32, height: u32, label: WordLabel) -> Self {
        let points = points
            .iter()
            .map(|[x, y]| Coord {
                x: x / width as f64,
                y: y / height as f64,
            })
            .collect();
        Self { points, label }
    }

    /// Integer pixel contour in an image of the given size. Coordinates are
    /// truncated toward zero; values within normalization round-off of an
    /// integer snap to it.
    pub fn to_pixels(&self, width: u32, height: u32) -> Vec<Point<i32>> {
        let to_pixel = |v: f64| {
            let nearest = v.round();
            if (v - nearest).abs() < 1e-6 {
                nearest as i32
            } else {
                v.trunc() as i32
            }
        };
        self.points
            .iter()
            .map(|c| Point::new(to_pixel(c.x * width as f64), to_pixel(c.y * height as f64)))
            .collect()
    }
}

/// Reads the polygons of one image. Implementations receive the size of the
/// decoded image so they can normalize pixel coordinates.
pub trait AnnotationReader {
    fn read(&self, path: &Path, width: u32, height: u32) -> Result<Vec<TextPolygon>>;
}

#[derive(Debug, Deserialize)]
struct AnnotationFile {
    #[serde(default)]
    polygons: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawPolygon {
    points: Vec<[f64; 2]>,
    #[serde(default)]
    text: Option<String>,
}

/// Reads annotations of the form
/// `{"polygons": [{"points": [[x, y], ...], "text": "word"}]}` with pixel
/// coordinates.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonAnnotationReader;

impl AnnotationReader for JsonAnnotationReader {
    fn read(&self, path: &Path, width: u32, height: u32) -> Result<Vec<TextPolygon>> {
        let contents = std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: AnnotationFile =
            serde_json::from_str(&contents).map_err(|source| DatasetError::Annotation {
                path: PathBuf::from(path),
                source,
            })?;

        let polygons = file
            .polygons
            .into_iter()
            .enumerate()
            .filter_map(|(i, value)| match serde_json::from_value::<RawPolygon>(value) {
                Ok(raw) if raw.points.len() < 3 => {
                    log::warn!("Skipping polygon {i} in {path:?}: only {} points", raw.points.len());
                    None
                }
                Ok(raw) if raw.points.iter().flatten().any(|v| !v.is_finite()) => {
                    log::warn!("Skipping polygon {i} in {path:?}: non-finite coordinates");
                    None
                }
                Ok(raw) => Some(TextPolygon::from_pixels(
                    &raw.points,
                    width,
                    height,
                    WordLabel::from_transcription(raw.text.as_deref()),
                )),
                Err(err) => {
                    log::warn!("Skipping malformed polygon {i} in {path:?}: {err}");
                    None
                }
            })
            .collect();
        Ok(polygons)
    }
}
