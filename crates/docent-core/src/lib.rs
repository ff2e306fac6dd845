//! Shared domain types for the exhibition assistant orchestrator.
//!
//! This crate has no business logic of its own; it defines the data model
//! (`Request`, `Event`, `CleanedChunk`, `AudioSegment`, `TourState`,
//! `PrefetchSlot`), the error taxonomy surfaced over HTTP, and the
//! configuration knobs the other `docent-*` crates read.

pub mod config;
pub mod error;
pub mod ids;
pub mod model;

pub use config::Config;
pub use error::ApiError;
pub use ids::{ClientId, RequestId};
pub use model::*;
