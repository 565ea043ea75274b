//! `folio-core`: shared building blocks for the scheduling, cache and session layers.
//!
//! This crate contains **pure** primitives (no IO, no storage concerns).

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{InstanceId, JobRunId, TokenId, UserId};
