//! Error types for batchq.
//!
//! Defines the main error enum used throughout the engine. Validation variants
//! reject a whole submission; the remaining variants describe per-unit or
//! infrastructure failures.

use thiserror::Error;

/// Main error type for batchq operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// The submission is not a well-formed payload document.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Payload arrays of inconsistent length.
    #[error("Shape mismatch: {}", format_lengths(.lengths))]
    ShapeMismatch {
        /// Each present array with its length.
        lengths: Vec<(&'static str, usize)>,
    },

    /// A unit names a query type the registry does not know.
    #[error("Unknown query type '{type_id}' at index {index}")]
    UnknownQueryType { index: usize, type_id: String },

    /// A unit carries a negative quantity.
    #[error("Invalid quantity {quantity} at index {index}: must be non-negative")]
    InvalidQuantity { index: usize, quantity: i64 },

    /// A unit carries an empty target identifier.
    #[error("Invalid target id at index {index}: must not be empty")]
    InvalidTargetId { index: usize },

    /// The target handle could not be resolved.
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    /// The external target failed, returned a malformed response, or panicked.
    #[error("Target error: {0}")]
    Target(String),

    /// Query record store errors (open, migrate, read, write).
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Merged results could not be written out.
    #[error("Output error: {0}")]
    Output(String),

    /// Configuration errors (invalid config file, bad values, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_lengths(lengths: &[(&'static str, usize)]) -> String {
    lengths
        .iter()
        .map(|(name, len)| format!("{name} has {len}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl BatchError {
    /// Creates a target-not-found error for the given target id.
    pub fn target_not_found(target_id: impl Into<String>) -> Self {
        Self::TargetNotFound(target_id.into())
    }

    /// Creates a target error with the given message.
    pub fn target(msg: impl Into<String>) -> Self {
        Self::Target(msg.into())
    }

    /// Creates a persistence error with the given message.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Creates an invalid-payload error with the given message.
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    /// Creates an output error with the given message.
    pub fn output(msg: impl Into<String>) -> Self {
        Self::Output(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true for errors that reject a whole submission before dispatch.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidPayload(_)
                | Self::ShapeMismatch { .. }
                | Self::UnknownQueryType { .. }
                | Self::InvalidQuantity { .. }
                | Self::InvalidTargetId { .. }
        )
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => "Invalid Payload",
            Self::ShapeMismatch { .. } => "Shape Mismatch",
            Self::UnknownQueryType { .. } => "Unknown Query Type",
            Self::InvalidQuantity { .. } => "Invalid Quantity",
            Self::InvalidTargetId { .. } => "Invalid Target Id",
            Self::TargetNotFound(_) => "Target Not Found",
            Self::Target(_) => "Target Error",
            Self::Persistence(_) => "Persistence Error",
            Self::Output(_) => "Output Error",
            Self::Config(_) => "Configuration Error",
            Self::Internal(_) => "Internal Error",
        }
    }
}

/// Result type alias using BatchError.
pub type Result<T> = std::result::Result<T, BatchError>;
