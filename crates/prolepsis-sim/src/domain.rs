//! Synthetic domain: a rollout whose progress drifts towards 100%
//!
//! - [`DriftingRollout`] produces the real transitions
//! - [`LinearPredictor`] extrapolates the last observed velocity
//! - [`StatusRenderer`] is the expensive artifact builder; milestone states
//!   also stage a status post
//! - [`StatusBoard`] is the external system status posts land on

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use prolepsis_core::{
    ActionError, ArtifactBuilder, ArtifactBundle, BuildError, ExternalAction, ExternalRef,
    PredictorUnavailable, StagedAction, StateSnapshot, TrajectoryCandidate, TrajectoryPredictor,
    UndoError,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Phase label for a progress value
pub fn phase_for(progress: f64) -> &'static str {
    match progress {
        p if p < 25.0 => "build",
        p if p < 60.0 => "test",
        p if p < 100.0 => "deploy",
        _ => "done",
    }
}

/// Snapshot for a progress value
pub fn rollout_state(progress: f64) -> StateSnapshot {
    let progress = progress.clamp(0.0, 100.0);
    StateSnapshot::builder()
        .number("progress", progress)
        .label("phase", phase_for(progress))
        .build()
}

/// Deterministic progress generator with a periodic wobble and an
/// occasional setback
pub struct DriftingRollout {
    progress: f64,
    step: u64,
    rate: f64,
    setback_every: u64,
}

impl DriftingRollout {
    /// Start at 0% advancing roughly `rate` points per step, falling back
    /// 15 points every `setback_every` steps (0 = never)
    pub fn new(rate: f64, setback_every: u64) -> Self {
        Self {
            progress: 0.0,
            step: 0,
            rate,
            setback_every,
        }
    }

    /// Advance one step and return the new real state
    pub fn next_state(&mut self) -> StateSnapshot {
        self.step += 1;
        let wobble = 1.0 + 0.5 * (self.step as f64 * 0.7).sin();
        self.progress = (self.progress + self.rate * wobble).min(100.0);

        if self.setback_every > 0 && self.step % self.setback_every == 0 {
            self.progress = (self.progress - 15.0).max(0.0);
        }
        rollout_state(self.progress)
    }
}

/// Predicts the next few states by extrapolating observed velocity
pub struct LinearPredictor {
    previous: Mutex<Option<f64>>,
    horizons: usize,
    step: Duration,
}

impl LinearPredictor {
    /// Predict `horizons` steps of length `step` ahead
    pub fn new(horizons: usize, step: Duration) -> Self {
        Self {
            previous: Mutex::new(None),
            horizons,
            step,
        }
    }
}

#[async_trait]
impl TrajectoryPredictor for LinearPredictor {
    async fn predict(
        &self,
        current: &StateSnapshot,
    ) -> Result<Vec<TrajectoryCandidate>, PredictorUnavailable> {
        let progress = current
            .number("progress")
            .ok_or_else(|| PredictorUnavailable::new("state has no progress field"))?;

        let velocity = {
            let mut previous = self.previous.lock();
            let velocity = previous.map(|p| progress - p);
            *previous = Some(progress);
            velocity
        };
        let velocity = match velocity {
            Some(v) if v > 0.0 => v,
            Some(_) => return Ok(Vec::new()),
            None => return Err(PredictorUnavailable::new("need two observations")),
        };

        Ok((1..=self.horizons)
            .map(|h| {
                let ahead = h as f64;
                TrajectoryCandidate::new(
                    rollout_state(progress + velocity * ahead),
                    0.97 - 0.12 * (ahead - 1.0),
                    self.step * h as u32,
                )
            })
            .collect())
    }
}

/// Renders a status frame for a state, slowly
pub struct StatusRenderer {
    latency: Duration,
    milestone_every: f64,
    renders: AtomicU64,
}

impl StatusRenderer {
    /// Each render takes `latency`; every `milestone_every` points of
    /// progress stages a status post
    pub fn new(latency: Duration, milestone_every: f64) -> Self {
        Self {
            latency,
            milestone_every,
            renders: AtomicU64::new(0),
        }
    }

    /// Renders performed so far
    pub fn renders(&self) -> u64 {
        self.renders.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ArtifactBuilder<String> for StatusRenderer {
    async fn build(&self, state: &StateSnapshot) -> Result<ArtifactBundle<String>, BuildError> {
        let progress = state
            .number("progress")
            .ok_or_else(|| BuildError::Unsupported("state has no progress field".into()))?;
        let phase = state.label("phase").unwrap_or("unknown");

        tokio::time::sleep(self.latency).await;
        self.renders.fetch_add(1, Ordering::Relaxed);

        let frame = format!("[{:<6}] {:>5.1}% {}", phase, progress, bar(progress));
        let bundle = ArtifactBundle::new(frame);

        let milestone = (progress / self.milestone_every).round() as i64;
        if self.milestone_every > 0.0 && milestone > 0 {
            let at = milestone as f64 * self.milestone_every;
            if (progress - at).abs() < 0.5 {
                return Ok(bundle.with_staged_action(StagedAction::new(
                    format!("milestone-{}", milestone),
                    "post_status",
                    serde_json::json!({ "milestone": at, "phase": phase }),
                )));
            }
        }
        Ok(bundle)
    }
}

fn bar(progress: f64) -> String {
    let filled = (progress / 5.0).round().clamp(0.0, 20.0) as usize;
    format!("{}{}", "#".repeat(filled), ".".repeat(20 - filled))
}

/// In-memory board of published status posts
#[derive(Default)]
pub struct StatusBoard {
    posts: DashMap<ExternalRef, serde_json::Value>,
    next_id: AtomicU64,
    retracted: AtomicU64,
}

impl StatusBoard {
    /// Create an empty board
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts currently live
    pub fn live(&self) -> usize {
        self.posts.len()
    }

    /// Posts retracted by rollback
    pub fn retracted(&self) -> u64 {
        self.retracted.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ExternalAction for StatusBoard {
    async fn execute(&self, action: &StagedAction) -> Result<ExternalRef, ActionError> {
        if action.kind != "post_status" {
            return Err(ActionError::Rejected(format!("unknown action '{}'", action.kind)));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let external_ref = ExternalRef::new(format!("post-{}", id));
        self.posts.insert(external_ref.clone(), action.params.clone());
        Ok(external_ref)
    }

    async fn undo(&self, external_ref: &ExternalRef) -> Result<(), UndoError> {
        if self.posts.remove(external_ref).is_some() {
            self.retracted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollout_is_deterministic_and_bounded() {
        let mut a = DriftingRollout::new(3.0, 10);
        let mut b = DriftingRollout::new(3.0, 10);
        for _ in 0..200 {
            let (x, y) = (a.next_state(), b.next_state());
            assert_eq!(x, y);
            let p = x.number("progress").unwrap();
            assert!((0.0..=100.0).contains(&p));
            assert_eq!(x.label("phase"), Some(phase_for(p)));
        }
    }

    #[tokio::test]
    async fn test_predictor_extrapolates_velocity() {
        let predictor = LinearPredictor::new(3, Duration::from_millis(100));
        assert!(predictor.predict(&rollout_state(10.0)).await.is_err());

        let candidates = predictor.predict(&rollout_state(12.0)).await.unwrap();
        let progress: Vec<f64> = candidates
            .iter()
            .map(|c| c.state.number("progress").unwrap())
            .collect();
        assert_eq!(progress, vec![14.0, 16.0, 18.0]);
        assert!(candidates[0].confidence > candidates[2].confidence);
        assert_eq!(candidates[1].horizon, Duration::from_millis(200));

        // going backwards yields no candidates
        assert!(predictor
            .predict(&rollout_state(5.0))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renderer_stages_milestones() {
        let renderer = StatusRenderer::new(Duration::from_millis(20), 10.0);

        let plain = renderer.build(&rollout_state(33.0)).await.unwrap();
        assert!(plain.staged_action.is_none());
        assert!(plain.payload.contains("test"));

        let milestone = renderer.build(&rollout_state(40.2)).await.unwrap();
        let action = milestone.staged_action.unwrap();
        assert_eq!(action.kind, "post_status");
        assert_eq!(action.action_id.as_str(), "milestone-4");
        assert_eq!(renderer.renders(), 2);
    }

    #[tokio::test]
    async fn test_board_undo_is_idempotent() {
        let board = StatusBoard::new();
        let action = StagedAction::new("m-1", "post_status", serde_json::json!({}));
        let posted = board.execute(&action).await.unwrap();
        assert_eq!(board.live(), 1);

        board.undo(&posted).await.unwrap();
        board.undo(&posted).await.unwrap();
        assert_eq!(board.live(), 0);
        assert_eq!(board.retracted(), 1);

        let bogus = StagedAction::new("x", "delete_everything", serde_json::json!({}));
        assert!(board.execute(&bogus).await.is_err());
    }
}
