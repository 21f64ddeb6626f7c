//! Engine-wide error taxonomy.
//!
//! One variant per category from the error handling design: validation, storage,
//! corruption, cancellation and fatal errors. Probe-level failures never surface
//! here -- they are encoded directly into a `ResultRecord` (see `model::ResultRecord`).

use std::path::PathBuf;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("daily file {path} is corrupt: {reason}")]
    Corruption { path: PathBuf, reason: String },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Storage {
            path: path.into(),
            source,
        }
    }

    pub fn corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        EngineError::Corruption {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        EngineError::Cancelled(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        EngineError::Fatal(msg.into())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Corruption {
            path: PathBuf::new(),
            reason: error.to_string(),
        }
    }
}

impl From<csv::Error> for EngineError {
    fn from(error: csv::Error) -> Self {
        EngineError::Validation(format!("csv error: {error}"))
    }
}

impl From<zip::result::ZipError> for EngineError {
    fn from(error: zip::result::ZipError) -> Self {
        EngineError::Validation(format!("zip error: {error}"))
    }
}
