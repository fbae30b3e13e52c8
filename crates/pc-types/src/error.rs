use thiserror::Error;

/// Validation/domain errors raised while constructing or transitioning entities.
/// Crates above this one fold these into their own error enum via `#[from]`.
#[derive(Debug, Error)]
pub enum TypeError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },
}
