//! Domain model and collaborator contracts for the anonymisation pipeline.
//!
//! The detection model and the EXIF reader live outside this workspace. This
//! crate pins down what the pipeline expects from them ([`InferenceClient`],
//! [`MetadataExtractor`]) and the values that flow between stages.
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

pub mod error;
pub mod model;
pub mod service;

pub use error::{InferenceError, MetadataError};
pub use model::{
    BoundingBox, Detection, DetectionSet, FailureKind, GeoPoint, InstanceRecord, Metadata,
    MetadataRecord, PIPELINE_VERSION, ProcessingResult, StageTimestamps, TaskFailure, TaskStage,
};
pub use service::{InferenceClient, MetadataExtractor};
