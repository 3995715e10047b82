//! `jobflow-core` — domain foundation for the job processor.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! strongly-typed identifiers, the [`Job`] entity, and the status/retry
//! state machine that governs its lifecycle.

pub mod error;
pub mod id;
pub mod job;

pub use error::{DomainError, DomainResult};
pub use id::{ClientId, JobId};
pub use job::{Job, JobKind, JobStatus, DEFAULT_MAX_RETRIES};
