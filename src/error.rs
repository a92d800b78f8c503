//! Error types for nlrelax.

use thiserror::Error;

/// Error type for nlrelax operations.
///
/// Evaluation errors (division by zero, logarithm of a negative number, ...) are
/// not errors in this sense: they surface as `None` values. Likewise, failing to
/// detect structure or to produce a cut is a normal outcome.
#[derive(Debug, Error)]
pub enum NlError {
    /// Expression is malformed or a handle is stale.
    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    /// Variable handle does not refer to an active variable.
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    /// Parameter name is not registered.
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    /// Parameter value has the wrong type or is out of range.
    #[error("Invalid value for parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// Numerical error.
    #[error("Numerical error: {0}")]
    NumericalError(String),

    /// Operation called in the wrong stage (e.g. enforcing before detection).
    #[error("Invalid stage: {0}")]
    InvalidStage(String),
}

/// Result type for nlrelax operations.
pub type Result<T> = std::result::Result<T, NlError>;
