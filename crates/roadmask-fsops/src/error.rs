//! # Design
//!
//! - Provide structured, constant-message errors for filesystem operations.
//! - Capture operation context (paths, attempts, elapsed time) for task failure reports.
//! - Preserve source errors without interpolating context into error messages.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for filesystem operations.
pub type FsOpsResult<T> = Result<T, FsOpsError>;

/// Errors produced by discovery, retrying IO, and archiving.
#[derive(Debug, Error)]
pub enum FsOpsError {
    /// Terminal IO failure (not retried).
    #[error("fsops io failure")]
    Io {
        /// Operation that triggered the IO failure.
        operation: &'static str,
        /// Path involved in the IO failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Transient IO failure that outlasted the retry budget.
    #[error("fsops file access timed out")]
    FileAccess {
        /// Operation that was retried.
        operation: &'static str,
        /// Path involved in the operation.
        path: PathBuf,
        /// Time spent retrying.
        elapsed: Duration,
        /// Attempts made.
        attempts: u32,
        /// Last error observed.
        source: io::Error,
    },
    /// JSON serialization failures for metadata records.
    #[error("fsops json failure")]
    Json {
        /// Operation that triggered the JSON failure.
        operation: &'static str,
        /// Path involved in the JSON failure.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
    /// Image encoding failures.
    #[error("fsops image encode failure")]
    Encode {
        /// Path the image was destined for.
        path: PathBuf,
        /// Underlying image error.
        source: image::ImageError,
    },
    /// Globset compilation failures.
    #[error("fsops glob failure")]
    Glob {
        /// Operation that triggered the glob failure.
        operation: &'static str,
        /// Glob pattern that failed to compile.
        pattern: String,
        /// Underlying globset error.
        source: globset::Error,
    },
    /// Input validation failures.
    #[error("fsops invalid input")]
    InvalidInput {
        /// Field that failed validation.
        field: &'static str,
        /// Static reason for the failure.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// The input root is missing or not a directory.
    #[error("fsops input root unavailable")]
    MissingRoot {
        /// Configured input root.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
}

impl FsOpsError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: serde_json::Error,
    ) -> Self {
        Self::Json {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) const fn glob(
        operation: &'static str,
        pattern: String,
        source: globset::Error,
    ) -> Self {
        Self::Glob {
            operation,
            pattern,
            source,
        }
    }

    /// Whether the failure came from retry exhaustion.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::FileAccess { .. })
    }
}
