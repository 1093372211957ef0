use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = DatasetError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read image {path:?}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed annotation file {path:?}: {source}")]
    Annotation {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("sample {0} has no annotation file")]
    MissingAnnotation(usize),

    #[error("sample index {index} out of range for dataset of {len} samples")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("voc_type must be one of \"LOWERCASE\", \"ALLCASES\", \"ALLCASES_SYMBOLS\", got {0:?}")]
    UnknownVocabulary(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("raster shape mismatch: {0}")]
    Shape(#[from] ndarray::ShapeError),
}
