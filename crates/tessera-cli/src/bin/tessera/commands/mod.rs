//! Command implementations.

pub mod cache;
pub mod run;
pub mod runs;
pub mod workflow;
