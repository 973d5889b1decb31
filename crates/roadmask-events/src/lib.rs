//! Run events for the roadmask pipeline.
//!
//! The orchestrator reports milestones, retries, task failures, and aborts as
//! typed [`Event`] values. The [`EventBus`] assigns sequential identifiers and
//! keeps a bounded replay ring so late subscribers (log forwarders, alerting
//! hooks) can catch up on what happened before they attached.
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

pub mod payloads;
pub mod routing;

pub use payloads::{DEFAULT_REPLAY_CAPACITY, Event, EventEnvelope, EventId, FailureStage};
pub use routing::{EventBus, EventStream};
