//! Mask composition for detected privacy-sensitive regions.
//!
//! [`MaskApplier`] grows each detection mask by a fixed radius, composites
//! the union onto the image with the configured [`MaskStrategy`], and returns
//! a binary preview of what was hidden. It holds no mutable state and is
//! safe to share across worker threads.
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

pub mod applier;
pub mod dilate;
pub mod error;
pub mod strategy;

pub use applier::{MaskApplier, MaskArtifacts};
pub use dilate::dilate;
pub use error::{MaskError, MaskResult};
pub use strategy::{BlurStrategy, FillStrategy, MaskRegion, MaskStrategy, label_color};
