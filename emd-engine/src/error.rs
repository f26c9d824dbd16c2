//! Error types for the EMD engine.

use crate::solver::EmdStatus;
use thiserror::Error;

/// Main error type for EMD operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmdError {
    /// A parameter or parameter combination is invalid
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Particle and weight counts of an event disagree
    #[error("Event has {weights} weights but {particles} particles")]
    MismatchedParticles { weights: usize, particles: usize },

    /// Two events whose particles live in different dimensions
    #[error("Particle dimension mismatch: {dim0} vs {dim1}")]
    MismatchedDimensions { dim0: usize, dim1: usize },

    /// Non-empty event weights whose length differs from the number of events
    #[error("Length of event weights ({weights}) does not match number of events ({events})")]
    MismatchedEventWeights { events: usize, weights: usize },

    /// Index outside of the allowed range after negative-index resolution
    #[error("{what} - index ({i}, {j}) out of range for shape ({rows}, {cols})")]
    IndexOutOfRange {
        what: &'static str,
        i: isize,
        j: isize,
        rows: usize,
        cols: usize,
    },

    /// Transport solver did not succeed for a single pair
    #[error("EMD computation failed: {0}")]
    Computation(EmdStatus),

    /// First recorded failure of a pairwise batch
    #[error("{0}")]
    PairFailure(String),

    /// Operation not permitted in the current request-mode state
    #[error("Request mode: {0}")]
    RequestMode(&'static str),

    /// No distances are stored (external handler or nothing computed)
    #[error("No EMDs stored: {0}")]
    NoStoredDistances(&'static str),

    /// Pairwise computation was cancelled between chunks
    #[error("Pairwise EMD computation cancelled")]
    Cancelled,

    /// Worker pool could not be built
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for EMD operations.
pub type Result<T> = std::result::Result<T, EmdError>;

impl EmdError {
    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EmdError::Computation(_) | EmdError::PairFailure(_))
    }
}

impl From<serde_json::Error> for EmdError {
    fn from(err: serde_json::Error) -> Self {
        EmdError::Serialization(err.to_string())
    }
}
