//! Courier core: stage graph, run records and idempotency fingerprints.
//!
//! This crate is pure domain logic with no IO. The engine crate layers the
//! HTTP transport, manifest persistence and stage execution on top of it.
mod error;
mod fingerprint;
mod manifest;
mod stage;
mod status;

pub use error::ConfigError;
pub use fingerprint::{fingerprint_stage, hash_bytes, hash_file, Fingerprint};
pub use manifest::{ArtifactRecord, StageRunRecord};
pub use stage::{default_stage_graph, StageDefinition, StageGraph};
pub use status::StageStatus;
