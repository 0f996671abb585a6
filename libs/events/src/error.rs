//! Error types for metrics export.

use thiserror::Error;

/// Errors that can occur when exporting metrics.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MetricsError {
    /// The registry could not be rendered as text.
    #[error("metrics encoding failed")]
    Encode(#[from] std::fmt::Error),
}
