use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Format error: {0}")]
    Format(String),

    #[error("Shape mismatch in {context}: expected {expected}, got {got}")]
    Shape {
        context: String,
        expected: usize,
        got: usize,
    },

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error on {}: {source}", path.display())]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Analysis cancelled after {completed} of {total} tasks")]
    Cancelled { completed: usize, total: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

impl AnalysisError {
    pub fn shape(context: impl Into<String>, expected: usize, got: usize) -> Self {
        Self::Shape {
            context: context.into(),
            expected,
            got,
        }
    }

    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileIo {
            path: path.into(),
            source,
        }
    }

    /// Converts an I/O error raised while decoding a container into the
    /// appropriate variant: running out of bytes means the file is
    /// malformed, anything else is a genuine I/O failure.
    pub(crate) fn from_decode(err: std::io::Error, what: &str) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Format(format!("truncated {}", what))
        } else {
            Self::Io(err)
        }
    }
}
