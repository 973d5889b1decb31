//! Filesystem side of the anonymisation pipeline.
//!
//! - [`layout`] derives output and archive paths from an input path.
//! - [`index`] walks the input tree and applies the done-check.
//! - [`retry`] retries transient IO failures within a time budget.
//! - [`archive`] writes outputs atomically and mirrors originals into archives.
#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

pub mod archive;
pub mod error;
pub mod index;
pub mod layout;
pub mod retry;

pub use archive::{ArchiveReport, Archiver, sha256_hex};
pub use error::{FsOpsError, FsOpsResult};
pub use index::{Candidate, CandidateStatus, Discovery, DiscoveryOptions, PathIndex};
pub use layout::{ArchiveKind, ArchivePaths, ErrorPaths, FileTask, MirrorLayout, OutputPaths};
pub use retry::{
    ErrorClass, RetryAttempt, RetryError, RetryPolicy, RetryingFileIo, classify_io_error,
    with_retry,
};
