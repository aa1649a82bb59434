use std::{fmt, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::BoxCoords;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid detection {coords:?}: {reason}")]
    InvalidDetection {
        coords: BoxCoords,
        reason: Rejection,
    },
    #[error("I/O failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Recognition(#[from] RecognitionError),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("model inference failed: {0}")]
    Model(#[from] ort::Error),
    #[error("unexpected model output: {0}")]
    ModelOutput(String),
    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("spreadsheet generation failed: {0}")]
    Spreadsheet(#[from] rust_xlsxwriter::XlsxError),
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// Why a detection failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Inverted,
    OutOfBounds,
    TooSmall,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Rejection::Inverted => "inverted coordinates",
            Rejection::OutOfBounds => "outside image bounds",
            Rejection::TooSmall => "below minimum size",
        })
    }
}

/// Failure of a single recognition call. The crop is recorded with empty text.
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("service returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("service error {code}: {message}")]
    Api { code: i32, message: String },
    #[error("recognition timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
    #[error("could not read crop: {0}")]
    Input(String),
}
