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
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Roadmask pipeline controller.
//!
//! Layout: `bootstrap.rs` (config, logging, and signal wiring), `orchestrator.rs`
//! (discovery, single-flight inference, and the post-processing pool),
//! `summary.rs` (per-run statistics), `metadata.rs` (filesystem metadata fallback).

/// Configuration loading, logging setup, and run entry points.
pub mod bootstrap;
/// Application error type.
pub mod error;
/// Metadata extractor backed by filesystem attributes.
pub mod metadata;
/// Per-file state machine and worker pool.
pub mod orchestrator;
/// Run statistics and progress estimation.
pub mod summary;

pub use bootstrap::{run_pipeline, run_with_config, shutdown_on_ctrl_c, spawn_event_logger};
pub use error::{AppError, AppResult};
pub use metadata::FileSystemMetadata;
pub use orchestrator::Orchestrator;
pub use summary::{FailureEntry, RunSummary};
