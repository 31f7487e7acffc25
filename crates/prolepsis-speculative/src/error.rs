//! Error types for the speculative engine

use prolepsis_core::{ActionError, BuildError, ExternalRef, QuantizationError, UndoError};
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, SpeculativeError>;

/// Errors surfaced by the speculative engine
#[derive(Error, Debug)]
pub enum SpeculativeError {
    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A required component was not supplied to the engine builder
    #[error("Missing engine component: {0}")]
    MissingComponent(&'static str),

    /// Synchronous artifact build failed
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Commit was refused or failed
    #[error(transparent)]
    Commit(#[from] CommitError),

    /// Rollback could not be completed
    #[error(transparent)]
    Rollback(#[from] RollbackError),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML for this schema
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// Quantization spec is invalid
    #[error(transparent)]
    Quantization(#[from] QuantizationError),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Reasons a staged action was not committed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommitError {
    /// The bundle carries no staged action
    #[error("Bundle has no staged action")]
    NoStagedAction,

    /// The staged action was already performed
    #[error("Staged action already committed")]
    AlreadyCommitted,

    /// Confidence or deviation failed the commit gate
    #[error("Commit gate rejected action (confidence {confidence:.3}, deviation {deviation:.3})")]
    GateRejected {
        /// Confidence the action was staged with
        confidence: f64,
        /// Deviation between predicted and real state
        deviation: f64,
    },

    /// The external system failed to perform the action
    #[error("Commit failed: {0}")]
    Execute(#[from] ActionError),
}

/// Rollback failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RollbackError {
    /// Undo kept failing; the side effect is still live and needs an operator
    #[error("Rollback of {external_ref} escalated after {attempts} attempts: {last_error}")]
    Escalated {
        /// Side effect that could not be reversed
        external_ref: ExternalRef,
        /// Undo attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: UndoError,
    },
}
