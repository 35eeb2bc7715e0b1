//! Pure functions for workflow logic.
//!
//! These functions encapsulate deterministic decisions that can be tested
//! independently of the async orchestration code. Time-dependent
//! calculations accept explicit time parameters.
//!
//! # Tiger Style
//!
//! - Pure functions with no side effects
//! - Deterministic: same inputs always produce same outputs
//! - Saturating arithmetic for overflow safety

mod step;
mod template;
mod trigger;

pub use step::*;
pub use template::*;
pub use trigger::*;
