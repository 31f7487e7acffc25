//! Error types for the pluggable contracts

use thiserror::Error;

/// Errors raised by an [`ArtifactBuilder`](crate::ArtifactBuilder)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// Builder ran and failed
    #[error("Artifact build failed: {0}")]
    Failed(String),

    /// Builder cannot produce an artifact for this state
    #[error("Unsupported state: {0}")]
    Unsupported(String),

    /// Builder did not finish in time
    #[error("Artifact build timed out after {0}ms")]
    Timeout(u64),
}

/// The predictor could not produce candidates this round
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Trajectory predictor unavailable: {reason}")]
pub struct PredictorUnavailable {
    /// Why no prediction was produced
    pub reason: String,
}

impl PredictorUnavailable {
    /// Create a new unavailability error
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors raised while executing a staged action against the external system
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// External system refused the action
    #[error("Action rejected: {0}")]
    Rejected(String),

    /// External system failed while performing the action
    #[error("Action failed: {0}")]
    Failed(String),
}

/// Errors raised by the inverse of an external action
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UndoError {
    /// Inverse operation failed
    #[error("Undo failed: {0}")]
    Failed(String),

    /// External system temporarily unreachable
    #[error("External system unavailable: {0}")]
    Unavailable(String),
}

/// Invalid entry in a quantization spec
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid quantization step {step} for field '{field}'")]
pub struct QuantizationError {
    /// Offending field
    pub field: String,
    /// Offending step
    pub step: f64,
}
