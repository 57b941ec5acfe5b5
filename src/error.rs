use std::io;
use std::num::{ParseFloatError, ParseIntError};

use thiserror::Error;

/// Main library error type.
#[derive(Error, Debug)]
pub enum FaceEmbedError {
    /// Invalid file format.
    #[error("invalid file format: {0}")]
    FileFormat(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Integer parse error.
    #[error(transparent)]
    ParseInt(#[from] ParseIntError),

    /// Float parse error.
    #[error(transparent)]
    ParseFloat(#[from] ParseFloatError),

    /// Configuration file error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid shape.
    #[error("invalid shape: {0}")]
    Shape(String),

    /// Label outside of the known label space.
    #[error("invalid label: {0}")]
    Label(String),

    /// Unknown optimization algorithm.
    #[error("invalid optimization algorithm: {0}")]
    Optimizer(String),

    /// A shared variable was requested but never created.
    #[error("variable {0} does not exist, it cannot be reused")]
    MissingVariable(String),

    /// A variable was created twice in the same scope.
    #[error("variable {0} already exists, use Reuse::Share to share it")]
    DuplicateVariable(String),

    /// Errors returned by the Torch C++ API.
    #[error(transparent)]
    Torch(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, FaceEmbedError>;

impl FaceEmbedError {
    /// Prefixes file format errors with the file and line they come from.
    pub fn line_context(self, path_name: &str, line: usize) -> Self {
        match self {
            FaceEmbedError::FileFormat(error) => {
                FaceEmbedError::FileFormat(format!("{path_name}:{line}: {error}"))
            }
            other => other,
        }
    }
}
