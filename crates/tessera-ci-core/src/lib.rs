//! Core workflow types for Tessera.
//!
//! This crate holds everything about a workflow that does not touch the
//! filesystem or spawn processes:
//!
//! - **Configuration**: the TOML-facing workflow, matrix and step types
//! - **Matrix expansion**: OS × version products with exclusions
//! - **Verified functions**: pure step sequencing, timeout and template logic
//!
//! # Example
//!
//! ```
//! use tessera_ci_core::config::MatrixConfig;
//!
//! let matrix = MatrixConfig {
//!     os: vec!["ubuntu-22.04".into(), "macos-13".into()],
//!     version: vec!["3.10".into(), "3.11".into()],
//!     exclude: vec![],
//!     fail_fast: false,
//!     max_parallel: None,
//! };
//! assert_eq!(matrix.expand().unwrap().len(), 4);
//! ```

#![warn(missing_docs)]
#![allow(clippy::collapsible_if)]

pub mod config;
pub mod error;
pub mod matrix;
pub mod verified;

pub use config::FailureKind;
pub use config::StepAction;
pub use config::StepConfig;
pub use config::WorkflowConfig;
pub use error::CiCoreError;
pub use matrix::MatrixCell;
pub use matrix::MatrixSelection;
