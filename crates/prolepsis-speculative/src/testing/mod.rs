//! Scripted collaborators for engine tests.
//!
//! - [`ScriptedBuilder`]: counts calls, fails on chosen states, optionally
//!   stages an action and sleeps
//! - [`FixedPredictor`]: returns whatever candidates it was last given
//! - [`RecordingAction`]: records executes and undos, with injectable
//!   undo failures

use async_trait::async_trait;
use parking_lot::Mutex;
use prolepsis_core::{
    ActionError, ActionId, ArtifactBuilder, ArtifactBundle, BuildError, ExternalAction,
    ExternalRef, PredictorUnavailable, StagedAction, StateSnapshot, TrajectoryCandidate,
    TrajectoryPredictor, UndoError,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// Snapshot with a numeric `progress` and a fixed `phase`
pub fn progress_state(progress: f64) -> StateSnapshot {
    StateSnapshot::builder()
        .number("progress", progress)
        .label("phase", "running")
        .build()
}

/// Payload the scripted builder produces for `state`
pub fn expected_payload(state: &StateSnapshot) -> String {
    format!("render@{:?}", state.number("progress"))
}

/// Builder with call counting and failure injection
#[derive(Default)]
pub struct ScriptedBuilder {
    calls: AtomicUsize,
    failing: Mutex<Vec<StateSnapshot>>,
    staged_kind: Option<String>,
    stable_ids: bool,
    delay: Option<Duration>,
}

impl ScriptedBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a staged action of `kind` to every bundle
    pub fn with_staged_action(mut self, kind: &str) -> Self {
        self.staged_kind = Some(kind.to_string());
        self
    }

    /// Derive action IDs from the built state, so rebuilds stage the same ID
    pub fn with_stable_action_ids(mut self) -> Self {
        self.stable_ids = true;
        self
    }

    /// Sleep before returning from every build
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail builds of exactly this state
    pub fn fail_on(&self, state: StateSnapshot) {
        self.failing.lock().push(state);
    }

    /// Builds started so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactBuilder<String> for ScriptedBuilder {
    async fn build(&self, state: &StateSnapshot) -> Result<ArtifactBundle<String>, BuildError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(state) {
            return Err(BuildError::Failed("scripted failure".to_string()));
        }

        let bundle = ArtifactBundle::new(expected_payload(state));
        let action_id = if self.stable_ids {
            format!("action@{:?}", state.number("progress"))
        } else {
            format!("action-{}", n)
        };
        Ok(match &self.staged_kind {
            Some(kind) => bundle.with_staged_action(StagedAction::new(
                action_id,
                kind.as_str(),
                serde_json::json!({ "progress": state.number("progress") }),
            )),
            None => bundle,
        })
    }
}

/// Predictor returning a settable candidate list
pub struct FixedPredictor {
    response: Mutex<Result<Vec<TrajectoryCandidate>, PredictorUnavailable>>,
    calls: AtomicUsize,
}

impl FixedPredictor {
    pub fn new(candidates: Vec<TrajectoryCandidate>) -> Self {
        Self {
            response: Mutex::new(Ok(candidates)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, candidates: Vec<TrajectoryCandidate>) {
        *self.response.lock() = Ok(candidates);
    }

    pub fn set_unavailable(&self, reason: &str) {
        *self.response.lock() = Err(PredictorUnavailable::new(reason));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrajectoryPredictor for FixedPredictor {
    async fn predict(
        &self,
        _current: &StateSnapshot,
    ) -> Result<Vec<TrajectoryCandidate>, PredictorUnavailable> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response.lock().clone()
    }
}

/// External system that records every call
#[derive(Default)]
pub struct RecordingAction {
    executed: Mutex<Vec<ActionId>>,
    undone: Mutex<Vec<ExternalRef>>,
    undo_failures_left: AtomicU32,
    undo_always_fails: AtomicBool,
    reject_executes: AtomicBool,
    undo_delay: Option<Duration>,
}

impl RecordingAction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep inside every undo
    pub fn with_undo_delay(mut self, delay: Duration) -> Self {
        self.undo_delay = Some(delay);
        self
    }

    /// Fail the next `n` undo calls
    pub fn fail_next_undos(&self, n: u32) {
        self.undo_failures_left.store(n, Ordering::SeqCst);
    }

    /// Fail every undo call
    pub fn fail_all_undos(&self) {
        self.undo_always_fails.store(true, Ordering::SeqCst);
    }

    /// Refuse every execute call
    pub fn reject_executes(&self) {
        self.reject_executes.store(true, Ordering::SeqCst);
    }

    /// Action IDs executed so far
    pub fn executed(&self) -> Vec<ActionId> {
        self.executed.lock().clone()
    }

    /// Undo calls so far, including failed ones
    pub fn undo_calls(&self) -> Vec<ExternalRef> {
        self.undone.lock().clone()
    }
}

#[async_trait]
impl ExternalAction for RecordingAction {
    async fn execute(&self, action: &StagedAction) -> Result<ExternalRef, ActionError> {
        if self.reject_executes.load(Ordering::SeqCst) {
            return Err(ActionError::Rejected("scripted rejection".to_string()));
        }
        let mut executed = self.executed.lock();
        executed.push(action.action_id.clone());
        Ok(ExternalRef::new(format!("ext-{}", executed.len())))
    }

    async fn undo(&self, external_ref: &ExternalRef) -> Result<(), UndoError> {
        if let Some(delay) = self.undo_delay {
            tokio::time::sleep(delay).await;
        }
        self.undone.lock().push(external_ref.clone());

        if self.undo_always_fails.load(Ordering::SeqCst) {
            return Err(UndoError::Failed("scripted failure".to_string()));
        }
        let left = self.undo_failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.undo_failures_left.store(left - 1, Ordering::SeqCst);
            return Err(UndoError::Unavailable("scripted outage".to_string()));
        }
        Ok(())
    }
}
