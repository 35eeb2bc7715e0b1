//! Core error types for workflow configuration.

use snafu::Snafu;

/// Result type for core CI operations.
pub type Result<T, E = CiCoreError> = std::result::Result<T, E>;

/// Errors raised while validating or expanding a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum CiCoreError {
    /// Invalid workflow configuration.
    #[snafu(display("Invalid workflow config: {reason}"))]
    InvalidConfig {
        /// Reason for invalidity.
        reason: String,
    },

    /// A matrix axis lists no values.
    #[snafu(display("Matrix axis '{axis}' has no values"))]
    EmptyAxis {
        /// Axis name.
        axis: String,
    },

    /// A matrix axis lists the same value twice.
    #[snafu(display("Matrix axis '{axis}' lists '{value}' more than once"))]
    DuplicateAxisValue {
        /// Axis name.
        axis: String,
        /// Repeated value.
        value: String,
    },

    /// Every cell was excluded or filtered away.
    #[snafu(display("Matrix expands to zero cells"))]
    EmptyMatrix,

    /// Matrix expansion exceeds the cell limit.
    #[snafu(display("Matrix expands to {count} cells (max: {max})"))]
    TooManyCells {
        /// Number of cells produced.
        count: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// A `${{ ... }}` placeholder could not be resolved.
    #[snafu(display("Unknown placeholder '{name}' in '{template}'"))]
    UnknownPlaceholder {
        /// Placeholder name.
        name: String,
        /// The template containing it.
        template: String,
    },

    /// A `${{` without its closing `}}`.
    #[snafu(display("Unterminated placeholder in '{template}'"))]
    UnterminatedPlaceholder {
        /// The offending template.
        template: String,
    },
}
