//! Contracts implemented by integrators
//!
//! The engine treats prediction, artifact construction and external side
//! effects as black boxes. All contracts must be safe to call concurrently.

use crate::{
    ActionError, ArtifactBundle, BuildError, ExternalRef, PredictorUnavailable, StagedAction,
    StateSnapshot, UndoError,
};
use async_trait::async_trait;
use std::time::Duration;

/// A likely future state
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryCandidate {
    /// Predicted state
    pub state: StateSnapshot,
    /// Confidence (0.0 - 1.0)
    pub confidence: f64,
    /// How far ahead the state is expected
    pub horizon: Duration,
}

impl TrajectoryCandidate {
    /// Create a candidate; confidence is clamped to `[0, 1]` (NaN becomes 0)
    pub fn new(state: StateSnapshot, confidence: f64, horizon: Duration) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            state,
            confidence,
            horizon,
        }
    }
}

/// Produces the artifacts a state requires
#[async_trait]
pub trait ArtifactBuilder<P>: Send + Sync {
    /// Build artifacts for `state`. May be slow; equal inputs must give
    /// equivalent outputs.
    async fn build(&self, state: &StateSnapshot) -> Result<ArtifactBundle<P>, BuildError>;
}

/// Predicts likely next states from the current one
#[async_trait]
pub trait TrajectoryPredictor: Send + Sync {
    /// Ranked candidates (may be empty). Must not block indefinitely.
    async fn predict(
        &self,
        current: &StateSnapshot,
    ) -> Result<Vec<TrajectoryCandidate>, PredictorUnavailable>;
}

/// The external system staged actions are performed against
#[async_trait]
pub trait ExternalAction: Send + Sync {
    /// Perform the side effect, returning a handle for later undo
    async fn execute(&self, action: &StagedAction) -> Result<ExternalRef, ActionError>;

    /// Reverse a performed side effect. Must be idempotent.
    async fn undo(&self, external_ref: &ExternalRef) -> Result<(), UndoError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ArtifactBuilder<String> for Echo {
        async fn build(&self, state: &StateSnapshot) -> Result<ArtifactBundle<String>, BuildError> {
            match state.label("phase") {
                Some(phase) => Ok(ArtifactBundle::new(format!("render:{}", phase))),
                None => Err(BuildError::Unsupported("no phase".into())),
            }
        }
    }

    #[test]
    fn test_candidate_confidence_clamped() {
        let s = StateSnapshot::empty();
        assert_eq!(TrajectoryCandidate::new(s.clone(), 1.5, Duration::ZERO).confidence, 1.0);
        assert_eq!(TrajectoryCandidate::new(s.clone(), -0.2, Duration::ZERO).confidence, 0.0);
        assert_eq!(TrajectoryCandidate::new(s, f64::NAN, Duration::ZERO).confidence, 0.0);
    }

    #[tokio::test]
    async fn test_builder_contract_object_safe() {
        let builder: Box<dyn ArtifactBuilder<String>> = Box::new(Echo);

        let ok = builder
            .build(&StateSnapshot::builder().label("phase", "deploy").build())
            .await
            .unwrap();
        assert_eq!(ok.payload, "render:deploy");

        let err = builder.build(&StateSnapshot::empty()).await.unwrap_err();
        assert!(matches!(err, BuildError::Unsupported(_)));
    }
}
