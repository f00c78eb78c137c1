//! Error taxonomy for the source-reconstruction pipeline.
//!
//! Every stage returns [`Result`]. A stage failure aborts the whole subject
//! run; nothing is persisted for that subject.
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Pipeline error.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or mismatched inputs: coordinate systems, channel orderings,
    /// array shapes, invalid configuration values.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Non-invertible or ill-conditioned matrices, empty kappa selection,
    /// degenerate leadfields.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// A job exceeded its time or memory budget.
    #[error("resource exhausted during {stage}: {detail}")]
    ResourceExhaustion {
        /// Stage that was running (or about to run) when the budget ran out.
        stage: &'static str,
        /// Human-readable description of the exceeded limit.
        detail: String,
    },

    /// Artifact read/write failure.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub(crate) fn numerical(msg: impl Into<String>) -> Self {
        Error::Numerical(msg.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }

    pub(crate) fn timeout(stage: &'static str, elapsed: Duration, limit: Duration) -> Self {
        Error::ResourceExhaustion {
            stage,
            detail: format!(
                "wall clock {:.1} s exceeds budget {:.1} s",
                elapsed.as_secs_f64(),
                limit.as_secs_f64()
            ),
        }
    }

    pub(crate) fn memory(stage: &'static str, needed: usize, limit: usize) -> Self {
        Error::ResourceExhaustion {
            stage,
            detail: format!("needs ~{needed} bytes, budget is {limit} bytes"),
        }
    }

    /// `true` for errors the scheduling layer may retry with a larger budget.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Error::ResourceExhaustion { .. })
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(e: ndarray::ShapeError) -> Self {
        Error::Configuration(format!("array shape mismatch: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Configuration(format!("malformed JSON: {e}"))
    }
}
