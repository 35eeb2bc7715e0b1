//! Workflow configuration types.
//!
//! Loading from disk lives in `tessera-ci`; this module only describes the
//! shape of a workflow and validates it.

pub mod types;

pub use types::*;
