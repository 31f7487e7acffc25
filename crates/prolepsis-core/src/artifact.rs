//! Precomputed artifacts and staged external actions

use crate::StateSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a staged action, assigned by the artifact builder
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    /// Create an action ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ActionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Handle of a side effect performed in the external system
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalRef(String);

impl ExternalRef {
    /// Create an external reference
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExternalRef {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// An external side effect prepared ahead of time but not yet performed.
///
/// `confidence` and `predicted_state` describe the prediction the action was
/// staged for; the engine stamps them when the artifact enters the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedAction {
    /// Builder-assigned identifier
    pub action_id: ActionId,
    /// What kind of action this is (e.g. "create_issue")
    pub kind: String,
    /// Action parameters understood by the external system
    pub params: serde_json::Value,
    /// Whether the side effect has been performed
    pub committed: bool,
    /// Handle returned by the external system on commit
    pub external_ref: Option<ExternalRef>,
    /// Confidence of the prediction this action was staged for
    pub confidence: f64,
    /// State the action was staged for
    pub predicted_state: StateSnapshot,
}

impl StagedAction {
    /// Stage a new, uncommitted action
    pub fn new(
        action_id: impl Into<ActionId>,
        kind: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            action_id: action_id.into(),
            kind: kind.into(),
            params,
            committed: false,
            external_ref: None,
            confidence: 0.0,
            predicted_state: StateSnapshot::empty(),
        }
    }

    /// Record the prediction this action was staged for
    pub fn stamped(mut self, confidence: f64, predicted_state: StateSnapshot) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self.predicted_state = predicted_state;
        self
    }

    /// Mark the side effect as performed
    pub fn committed_as(mut self, external_ref: ExternalRef) -> Self {
        self.committed = true;
        self.external_ref = Some(external_ref);
        self
    }
}

/// Everything precomputed for one state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactBundle<P> {
    /// Caller-defined artifact (render output, audio buffer, ...)
    pub payload: P,
    /// External side effect staged alongside the payload
    pub staged_action: Option<StagedAction>,
}

impl<P> ArtifactBundle<P> {
    /// Bundle with only a payload
    pub fn new(payload: P) -> Self {
        Self {
            payload,
            staged_action: None,
        }
    }

    /// Attach a staged action
    pub fn with_staged_action(mut self, action: StagedAction) -> Self {
        self.staged_action = Some(action);
        self
    }

    /// Whether the bundle carries an action that has not been performed
    pub fn has_uncommitted_action(&self) -> bool {
        self.staged_action.as_ref().is_some_and(|a| !a.committed)
    }

    /// Stamp the staged action (if any) with the prediction it serves
    pub fn stamp_prediction(mut self, confidence: f64, predicted_state: &StateSnapshot) -> Self {
        self.staged_action = self
            .staged_action
            .map(|a| a.stamped(confidence, predicted_state.clone()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_staged_action_lifecycle() {
        let predicted = StateSnapshot::builder().number("progress", 90.0).build();
        let action = StagedAction::new("a-1", "create_issue", json!({"title": "done"}))
            .stamped(1.7, predicted.clone());

        assert!(!action.committed);
        assert_eq!(action.confidence, 1.0);
        assert_eq!(action.predicted_state, predicted);

        let committed = action.committed_as(ExternalRef::new("issue-42"));
        assert!(committed.committed);
        assert_eq!(committed.external_ref, Some(ExternalRef::new("issue-42")));
    }

    #[test]
    fn test_bundle_uncommitted_detection() {
        let bundle = ArtifactBundle::new("frame".to_string());
        assert!(!bundle.has_uncommitted_action());

        let staged = bundle.with_staged_action(StagedAction::new("a", "noop", json!(null)));
        assert!(staged.has_uncommitted_action());

        let stamped = staged.stamp_prediction(0.9, &StateSnapshot::empty());
        assert_eq!(stamped.staged_action.as_ref().map(|a| a.confidence), Some(0.9));
    }
}
