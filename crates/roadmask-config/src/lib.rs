//! Configuration model for the roadmask pipeline.
//!
//! Settings come from a single YAML document. Every section has defaults, so
//! a minimal file only names the input and output roots. Loading normalises
//! the document and validates cross-field rules before anything touches the
//! filesystem.
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

pub mod defaults;
pub mod error;
pub mod loader;
pub mod model;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::{from_yaml_str, load_from_path};
pub use model::{
    ArchiveConfig, BlurConfig, BlurStyle, DiscoveryConfig, IoConfig, MaskMode, MaskingConfig,
    PathsConfig, PipelineConfig, RoadmaskConfig, TelemetryConfig,
};
pub use validate::validate;
