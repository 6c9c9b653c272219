//! Error types for the coordinator.

use thiserror::Error;

/// Errors that can occur constructing a coordinator.
///
/// Everything past construction is deliberately error-free at the API
/// surface: upstream failures flow through
/// [`Coordinator::set_error`](crate::Coordinator::set_error) as data, and
/// rejected submissions return absent tokens.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Invalid coordinator configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
