//! Error types for ferrocoll

use crate::datatype::{ElementType, ReduceOp};
use thiserror::Error;

/// Result type for process-group operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for process-group operations.
///
/// Validation and unsupported-operation errors are raised synchronously, before
/// anything reaches the substrate. Substrate errors are raised either at issue
/// time or later from [`Work::wait`](crate::Work::wait) /
/// [`Work::is_completed`](crate::Work::is_completed).
#[derive(Error, Debug)]
pub enum Error {
    /// The process-wide environment has already been installed
    #[error("substrate environment has already been initialized")]
    AlreadyInitialized,

    /// The environment was finalized (or never initialized) before use
    #[error("substrate environment is not initialized")]
    NotInitialized,

    /// Root or peer rank outside `0..size`
    #[error("unexpected rank {rank} for group of size {size}")]
    InvalidRank {
        /// Offending rank
        rank: usize,
        /// Group size it was checked against
        size: usize,
    },

    /// Bad buffer shape, count, element type or layout
    #[error("validation failed: {0}")]
    Validation(String),

    /// Element type with no substrate equivalent
    #[error("element type {0:?} is not supported by the substrate")]
    UnsupportedType(ElementType),

    /// Reduction operator with no substrate equivalent
    #[error("reduction {0:?} is not supported by the substrate")]
    UnsupportedReduction(ReduceOp),

    /// Operation not implemented by this engine
    #[error("process group does not support {0}")]
    Unsupported(String),

    /// Error reported by the communication substrate, with call-site context
    #[error("substrate error in {site}: {message}")]
    Substrate {
        /// `file:line` of the dispatching call
        site: String,
        /// Message reported by the substrate
        message: String,
    },

    /// Query made in a state where it has no answer yet
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// API present for interface compatibility but without an implementation
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Malformed configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a [`Error::Validation`] with a formatted message.
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// True for errors detected before any substrate call.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::InvalidRank { .. }
                | Error::UnsupportedType(_)
                | Error::UnsupportedReduction(_)
        )
    }

    /// True when re-issuing the call with corrected input can succeed.
    pub fn is_retryable(&self) -> bool {
        self.is_validation()
    }

    /// Check a condition, producing a validation error when it does not hold.
    pub(crate) fn check(cond: bool, msg: impl FnOnce() -> String) -> Result<()> {
        if cond {
            Ok(())
        } else {
            Err(Error::Validation(msg()))
        }
    }
}
