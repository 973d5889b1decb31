//! Errors raised by external collaborators.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure reported by an [`InferenceClient`](crate::InferenceClient).
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The model rejected this particular image. Only the owning task fails.
    #[error("inference rejected image")]
    Image {
        /// Collaborator supplied detail.
        detail: String,
    },
    /// The shared inference resource is unusable (e.g. accelerator memory
    /// exhausted). The run aborts.
    #[error("inference resource exhausted")]
    Resource {
        /// Collaborator supplied detail.
        detail: String,
    },
}

impl InferenceError {
    /// Whether this error must abort the whole run.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Resource { .. })
    }

    /// Collaborator supplied detail.
    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            Self::Image { detail } | Self::Resource { detail } => detail,
        }
    }
}

/// Failure reported by a [`MetadataExtractor`](crate::MetadataExtractor).
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Reading the file failed; may be transient.
    #[error("metadata io failure")]
    Io {
        /// File being read.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// The embedded metadata is corrupt.
    #[error("malformed metadata")]
    Malformed {
        /// File being read.
        path: PathBuf,
        /// Parser detail.
        detail: String,
    },
}
