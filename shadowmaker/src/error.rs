use std::path::PathBuf;

use thiserror::Error;

use crate::scad::TemplateError;

/// Failures a pipeline stage can report to the front end.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PipelineError {
    #[error("failed to load image {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("image is empty")]
    EmptyImage,

    #[error("no contour looks like the reference token (no positive circularity score)")]
    NoReferenceShape,

    #[error("no contours left after removing the reference token and specks under {min_area} px²")]
    NoContoursAfterFilter { min_area: f64 },

    #[error("no outlines to lay out")]
    NoOutlines,

    #[error("project name must not be empty")]
    EmptyProjectName,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write DXF {path}: {source}")]
    Dxf {
        path: PathBuf,
        #[source]
        source: dxf::DxfError,
    },

    #[error("failed to encode {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to save image {path}: {source}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("OpenSCAD executable not found (searched: {searched})")]
    CadNotFound { searched: String },

    #[error("invalid camera calibration: {0}")]
    Calibration(String),

    #[error("chessboard found in {found} photo(s); calibration needs at least {needed}")]
    TooFewViews { found: usize, needed: usize },

    #[error("{path} is {width}x{height}, other photos are {expected_width}x{expected_height}")]
    ImageSizeMismatch {
        path: PathBuf,
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
