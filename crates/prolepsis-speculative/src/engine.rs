//! Foreground lookup/commit path and engine wiring

use crate::audit::{AuditEvent, AuditEventKind, AuditSink, TracingAuditSink};
use crate::cache::{CacheEntry, CacheStats, PutOutcome, SpeculativeCache};
use crate::config::SpeculationConfig;
use crate::error::{CommitError, Result, RollbackError, SpeculativeError};
use crate::history::StateHistory;
use crate::metrics;
use crate::scheduler::{PrecomputeScheduler, TickReport};
use crate::verification::{
    PendingCommitment, RollbackOutcome, SweepReport, VerificationManager, VerificationStats,
};
use async_trait::async_trait;
use dashmap::DashSet;
use prolepsis_core::{
    ActionError, ActionId, ArtifactBuilder, ArtifactBundle, BuildError, Canonicalizer,
    DeviationMetric, ExternalAction, ExternalRef, NormalizedL1, StagedAction, StateKey,
    StateSnapshot, TrajectoryPredictor, UndoError,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// External system for engines whose artifacts never stage actions.
///
/// Refuses every commit; undo is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExternalAction;

#[async_trait]
impl ExternalAction for NoExternalAction {
    async fn execute(&self, action: &StagedAction) -> std::result::Result<ExternalRef, ActionError> {
        Err(ActionError::Rejected(format!(
            "no external system configured for '{}'",
            action.kind
        )))
    }

    async fn undo(&self, _external_ref: &ExternalRef) -> std::result::Result<(), UndoError> {
        Ok(())
    }
}

/// Proof of a performed commitment
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReceipt {
    /// Committed staged action
    pub action_id: ActionId,
    /// Handle of the side effect
    pub external_ref: ExternalRef,
    /// Cache entry the action belongs to
    pub key: StateKey,
    /// Deviation measured by the commit gate
    pub deviation: f64,
    /// Deadline for confirmation
    pub deadline: Instant,
}

/// Engine statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    /// Lookups served from cache
    pub hits: u64,
    /// Lookups built synchronously (including gate rejections)
    pub misses: u64,
    /// Staged actions refused by the commit gate
    pub gate_rejections: u64,
    /// Synchronous builds that failed
    pub build_errors: u64,
    /// Staged actions committed
    pub commits: u64,
    /// Cache statistics
    pub cache: CacheStats,
    /// Verification statistics
    pub verification: VerificationStats,
}

impl EngineStats {
    /// Fraction of lookups served from cache
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct EngineCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    gate_rejections: AtomicU64,
    build_errors: AtomicU64,
    commits: AtomicU64,
}

/// Handle to the scheduler and verification tasks.
///
/// Dropping it without calling [`shutdown`](Self::shutdown) also stops both
/// loops, but does not wait for them.
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Signal both loops and wait for them to exit
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Speculative engine background tasks stopped");
    }
}

/// Builder for [`SpeculativeEngine`]
pub struct EngineBuilder<P> {
    config: SpeculationConfig,
    builder: Option<Arc<dyn ArtifactBuilder<P>>>,
    predictor: Option<Arc<dyn TrajectoryPredictor>>,
    action: Option<Arc<dyn ExternalAction>>,
    metric: Option<Arc<dyn DeviationMetric>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl<P: Clone + Send + Sync + 'static> EngineBuilder<P> {
    /// Start from a configuration
    pub fn new(config: SpeculationConfig) -> Self {
        Self {
            config,
            builder: None,
            predictor: None,
            action: None,
            metric: None,
            audit: None,
        }
    }

    /// Set the artifact builder (required)
    pub fn artifact_builder(mut self, builder: Arc<dyn ArtifactBuilder<P>>) -> Self {
        self.builder = Some(builder);
        self
    }

    /// Set the trajectory predictor (required)
    pub fn predictor(mut self, predictor: Arc<dyn TrajectoryPredictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    /// Set the external system staged actions run against
    pub fn external_action(mut self, action: Arc<dyn ExternalAction>) -> Self {
        self.action = Some(action);
        self
    }

    /// Set the predicted-vs-real deviation metric
    pub fn deviation_metric(mut self, metric: Arc<dyn DeviationMetric>) -> Self {
        self.metric = Some(metric);
        self
    }

    /// Set the audit sink
    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Validate the configuration and assemble the engine
    pub fn build(self) -> Result<SpeculativeEngine<P>> {
        self.config.validate()?;

        let builder = self
            .builder
            .ok_or(SpeculativeError::MissingComponent("artifact builder"))?;
        let predictor = self
            .predictor
            .ok_or(SpeculativeError::MissingComponent("trajectory predictor"))?;
        let action: Arc<dyn ExternalAction> = match self.action {
            Some(action) => action,
            None => {
                debug!("No external action configured, staged actions cannot be committed");
                Arc::new(NoExternalAction)
            }
        };
        let metric: Arc<dyn DeviationMetric> = match self.metric {
            Some(metric) => metric,
            None => {
                info!("No deviation metric configured, using NormalizedL1 with unit scales");
                Arc::new(NormalizedL1::default())
            }
        };
        let audit: Arc<dyn AuditSink> = match self.audit {
            Some(audit) => audit,
            None => Arc::new(TracingAuditSink),
        };

        let config = self.config;
        let canonicalizer = Arc::new(Canonicalizer::new(config.quantization.clone()));
        let cache = Arc::new(SpeculativeCache::new(config.capacity));
        let history = Arc::new(StateHistory::new(config.history_capacity));

        let scheduler = Arc::new(PrecomputeScheduler::new(
            config.scheduler.clone(),
            Arc::clone(&canonicalizer),
            Arc::clone(&cache),
            Arc::clone(&builder),
            predictor,
            Arc::clone(&audit),
        ));
        let verification = Arc::new(VerificationManager::new(
            config.verification.clone(),
            config.max_deviation,
            Arc::clone(&metric),
            Arc::clone(&history),
            Arc::clone(&cache),
            Arc::clone(&action),
            Arc::clone(&audit),
        ));
        let (latest, _) = watch::channel(None);

        info!(
            "Speculative engine ready (capacity {}, commit threshold {:.2}, max deviation {:.2}, quantization v{})",
            config.capacity,
            config.min_confidence_threshold,
            config.max_deviation,
            config.quantization.version
        );

        Ok(SpeculativeEngine {
            config,
            canonicalizer,
            cache,
            builder,
            action,
            metric,
            audit,
            history,
            scheduler,
            verification,
            latest,
            in_flight: DashSet::new(),
            counters: EngineCounters::default(),
        })
    }
}

/// Speculative precomputation engine.
///
/// Owns the cache and wires the background scheduler and verification
/// sweep to the foreground [`lookup`](Self::lookup) and
/// [`commit`](Self::commit) path.
pub struct SpeculativeEngine<P> {
    config: SpeculationConfig,
    canonicalizer: Arc<Canonicalizer>,
    cache: Arc<SpeculativeCache<P>>,
    builder: Arc<dyn ArtifactBuilder<P>>,
    action: Arc<dyn ExternalAction>,
    metric: Arc<dyn DeviationMetric>,
    audit: Arc<dyn AuditSink>,
    history: Arc<StateHistory>,
    scheduler: Arc<PrecomputeScheduler<P>>,
    verification: Arc<VerificationManager<P>>,
    latest: watch::Sender<Option<StateSnapshot>>,
    in_flight: DashSet<ActionId>,
    counters: EngineCounters,
}

impl<P: Clone + Send + Sync + 'static> SpeculativeEngine<P> {
    /// Start building an engine
    pub fn builder(config: SpeculationConfig) -> EngineBuilder<P> {
        EngineBuilder::new(config)
    }

    /// Get the configuration
    pub fn config(&self) -> &SpeculationConfig {
        &self.config
    }

    /// Get the cache
    pub fn cache(&self) -> &SpeculativeCache<P> {
        &self.cache
    }

    /// Get the real-state history
    pub fn history(&self) -> &StateHistory {
        &self.history
    }

    /// Get the verification manager
    pub fn verification(&self) -> &VerificationManager<P> {
        &self.verification
    }

    /// Key a state the way the cache does
    pub fn key_of(&self, state: &StateSnapshot) -> StateKey {
        self.canonicalizer.key_of(state)
    }

    /// Record a real state and publish it to the scheduler.
    ///
    /// [`lookup`](Self::lookup) does this itself; call it directly for
    /// transitions that need no artifact.
    pub fn observe(&self, state: StateSnapshot) -> u64 {
        let seq = self.history.record(state.clone());
        self.latest.send_replace(Some(state));
        seq
    }

    /// Artifacts for a real state transition.
    ///
    /// Served from cache when a matching entry exists; otherwise built
    /// synchronously and cached. A hit whose uncommitted staged action fails
    /// the commit gate is discarded and rebuilt. Either way the caller gets
    /// what a direct build would have produced.
    pub async fn lookup(
        &self,
        real_state: &StateSnapshot,
    ) -> std::result::Result<Arc<ArtifactBundle<P>>, BuildError> {
        let started = Instant::now();
        let key = self.canonicalizer.key_of(real_state);
        self.observe(real_state.clone());

        if let Some(entry) = self.cache.get(&key) {
            let gate = match entry.artifacts.staged_action.as_ref() {
                Some(action) if !action.committed => self.check_gate(action, real_state).err(),
                _ => None,
            };

            match gate {
                None => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    metrics::record_hit(started.elapsed());

                    let mut event = AuditEvent::new(AuditEventKind::CacheHit).with_key(key);
                    if let Some(action) = entry.artifacts.staged_action.as_ref() {
                        event = event.with_confidence(action.confidence);
                    }
                    self.audit.emit(event);
                    return Ok(Arc::clone(&entry.artifacts));
                }
                Some(rejection) => {
                    self.record_gate_rejection(key, &rejection, "lookup");
                    self.cache.invalidate(&key);
                }
            }
        }

        let bundle = match self.builder.build(real_state).await {
            Ok(bundle) => bundle,
            Err(e) => {
                self.counters.build_errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_build_failure("lookup");
                warn!("Synchronous build for {} failed: {}", key, e);
                return Err(e);
            }
        };

        // Built from the real state: full confidence, zero deviation
        let bundle = bundle.stamp_prediction(1.0, real_state);
        let entry = CacheEntry::new(key, bundle, real_state.clone());
        let artifacts = Arc::clone(&entry.artifacts);
        if let PutOutcome::Present = self.cache.put_if_unpinned(entry) {
            debug!("Keeping committed entry for {}", key);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_miss(started.elapsed());
        self.audit
            .emit(AuditEvent::new(AuditEventKind::CacheMiss).with_key(key));

        Ok(artifacts)
    }

    fn check_gate(
        &self,
        action: &StagedAction,
        real_state: &StateSnapshot,
    ) -> std::result::Result<f64, CommitError> {
        let deviation = self.metric.deviation(&action.predicted_state, real_state);
        let confident = action.confidence >= self.config.min_confidence_threshold;
        // NaN deviation never passes
        let close = deviation <= self.config.max_deviation;

        if confident && close {
            Ok(deviation)
        } else {
            Err(CommitError::GateRejected {
                confidence: action.confidence,
                deviation,
            })
        }
    }

    fn record_gate_rejection(&self, key: StateKey, rejection: &CommitError, path: &str) {
        self.counters.gate_rejections.fetch_add(1, Ordering::Relaxed);
        metrics::record_gate_rejection();
        warn!("Commit gate rejected staged action for {} on {}: {}", key, path, rejection);

        let mut event = AuditEvent::new(AuditEventKind::CommitRejected)
            .with_key(key)
            .with_detail(path);
        if let CommitError::GateRejected {
            confidence,
            deviation,
        } = rejection
        {
            event = event.with_confidence(*confidence).with_deviation(*deviation);
        }
        self.audit.emit(event);
    }

    /// Perform the staged action in `bundle` for `real_state`.
    ///
    /// The commit gate is re-checked here, so skipping
    /// [`lookup`](Self::lookup) cannot bypass it. On success the originating
    /// cache entry is pinned and replaced by a copy marked committed, and the
    /// commitment is handed to verification.
    pub async fn commit(
        &self,
        real_state: &StateSnapshot,
        bundle: &ArtifactBundle<P>,
    ) -> std::result::Result<CommitReceipt, CommitError> {
        let action = bundle
            .staged_action
            .as_ref()
            .ok_or(CommitError::NoStagedAction)?;
        if action.committed {
            return Err(CommitError::AlreadyCommitted);
        }

        let key = self.canonicalizer.key_of(real_state);
        let deviation = match self.check_gate(action, real_state) {
            Ok(deviation) => deviation,
            Err(rejection) => {
                self.record_gate_rejection(key, &rejection, "commit");
                return Err(rejection);
            }
        };

        // Claim the action before checking the registry so two racing
        // commits of the same bundle cannot both execute
        if !self.in_flight.insert(action.action_id.clone()) {
            return Err(CommitError::AlreadyCommitted);
        }
        if self.verification.tracks_action(&action.action_id) {
            self.in_flight.remove(&action.action_id);
            return Err(CommitError::AlreadyCommitted);
        }

        let external_ref = match self.action.execute(action).await {
            Ok(external_ref) => external_ref,
            Err(e) => {
                self.in_flight.remove(&action.action_id);
                warn!("Commit of {} for {} failed: {}", action.action_id, key, e);
                return Err(e.into());
            }
        };

        let committed = ArtifactBundle {
            payload: bundle.payload.clone(),
            staged_action: Some(action.clone().committed_as(external_ref.clone())),
        };
        let entry = CacheEntry::new(key, committed, action.predicted_state.clone());
        if let PutOutcome::Rejected = self.cache.put_pinned(entry) {
            warn!("Could not pin committed entry {}, cache is full of pinned entries", key);
        }

        let now = Instant::now();
        let deadline = now + self.config.commitment_deadline();
        self.verification.track(PendingCommitment {
            artifact_id: action.action_id.clone(),
            key,
            predicted_state: action.predicted_state.clone(),
            external_ref: external_ref.clone(),
            confidence: action.confidence,
            committed_at: now,
            deadline,
            observed_seq: self.history.last_seq(),
        });
        self.in_flight.remove(&action.action_id);

        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        metrics::record_commit();
        info!(
            "Committed {} as {} (confidence {:.3}, deviation {:.3})",
            action.action_id, external_ref, action.confidence, deviation
        );
        self.audit.emit(
            AuditEvent::new(AuditEventKind::SpeculativeCommit)
                .with_key(key)
                .with_confidence(action.confidence)
                .with_deviation(deviation)
                .with_external_ref(external_ref.clone()),
        );

        Ok(CommitReceipt {
            action_id: action.action_id.clone(),
            external_ref,
            key,
            deviation,
            deadline,
        })
    }

    /// Confirm a commitment from external evidence
    pub fn confirm(&self, external_ref: &ExternalRef) -> bool {
        self.verification.confirm(external_ref)
    }

    /// Roll back a commitment. Repeated calls are no-ops.
    pub async fn rollback(
        &self,
        external_ref: &ExternalRef,
    ) -> std::result::Result<RollbackOutcome, RollbackError> {
        self.verification.rollback(external_ref).await
    }

    /// Run one verification sweep now
    pub async fn sweep(&self) -> SweepReport {
        self.verification.sweep().await
    }

    /// Run one precompute tick from `current` now
    pub async fn precompute(&self, current: &StateSnapshot) -> TickReport {
        self.scheduler.tick(current).await
    }

    /// Spawn the scheduler and verification loops
    pub fn start_background(&self) -> BackgroundTasks {
        let (shutdown, stop) = watch::channel(false);
        let scheduler = Arc::clone(&self.scheduler).spawn(self.latest.subscribe(), stop.clone());
        let verification = Arc::clone(&self.verification).spawn(stop);

        BackgroundTasks {
            shutdown,
            handles: vec![scheduler, verification],
        }
    }

    /// Engine statistics
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            gate_rejections: self.counters.gate_rejections.load(Ordering::Relaxed),
            build_errors: self.counters.build_errors.load(Ordering::Relaxed),
            commits: self.counters.commits.load(Ordering::Relaxed),
            cache: self.cache.stats(),
            verification: self.verification.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::testing::{
        expected_payload, progress_state, FixedPredictor, RecordingAction, ScriptedBuilder,
    };
    use crate::verification::CommitmentState;
    use prolepsis_core::{QuantizationSpec, TrajectoryCandidate};
    use std::time::Duration;

    struct Fixture {
        engine: SpeculativeEngine<String>,
        builder: Arc<ScriptedBuilder>,
        predictor: Arc<FixedPredictor>,
        action: Arc<RecordingAction>,
        audit: Arc<MemoryAuditSink>,
    }

    fn config() -> SpeculationConfig {
        SpeculationConfig::default()
            .with_capacity(16)
            .with_quantization(QuantizationSpec::default().with_field("progress", 1.0))
    }

    fn fixture_with(config: SpeculationConfig, builder: ScriptedBuilder) -> Fixture {
        let builder = Arc::new(builder);
        let predictor = Arc::new(FixedPredictor::new(Vec::new()));
        let action = Arc::new(RecordingAction::new());
        let audit = Arc::new(MemoryAuditSink::new());

        let engine = SpeculativeEngine::builder(config)
            .artifact_builder(builder.clone())
            .predictor(predictor.clone())
            .external_action(action.clone())
            .deviation_metric(Arc::new(NormalizedL1::new().with_scale("progress", 100.0)))
            .audit_sink(audit.clone())
            .build()
            .unwrap();

        Fixture {
            engine,
            builder,
            predictor,
            action,
            audit,
        }
    }

    fn fixture(builder: ScriptedBuilder) -> Fixture {
        fixture_with(config(), builder)
    }

    fn predict(f: &Fixture, progress: f64, confidence: f64) {
        f.predictor.set(vec![TrajectoryCandidate::new(
            progress_state(progress),
            confidence,
            Duration::from_secs(2),
        )]);
    }

    #[tokio::test]
    async fn test_predicted_state_is_served_without_rebuild() {
        let f = fixture(ScriptedBuilder::new());
        predict(&f, 42.0, 0.9);
        assert_eq!(f.engine.precompute(&progress_state(40.0)).await.built, 1);

        let artifacts = f.engine.lookup(&progress_state(42.0)).await.unwrap();
        assert_eq!(artifacts.payload, expected_payload(&progress_state(42.0)));
        assert_eq!(f.builder.calls(), 1);

        // near miss within the quantization step is still a hit
        f.engine.lookup(&progress_state(42.3)).await.unwrap();
        assert_eq!(f.builder.calls(), 1);

        let stats = f.engine.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.hit_rate(), 1.0);
        assert_eq!(f.audit.count(AuditEventKind::CacheHit), 2);
    }

    #[tokio::test]
    async fn test_miss_builds_what_a_direct_build_would() {
        let f = fixture(ScriptedBuilder::new());
        let state = progress_state(7.0);

        let artifacts = f.engine.lookup(&state).await.unwrap();
        let direct = f.builder.build(&state).await.unwrap();
        assert_eq!(artifacts.payload, direct.payload);

        assert!(f.engine.cache().contains(&f.engine.key_of(&state)));
        assert_eq!(f.engine.stats().misses, 1);
        assert_eq!(f.audit.count(AuditEventKind::CacheMiss), 1);

        f.engine.lookup(&state).await.unwrap();
        assert_eq!(f.engine.stats().hits, 1);
        assert_eq!(f.engine.stats().hit_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_miss_propagates_build_error() {
        let builder = ScriptedBuilder::new();
        builder.fail_on(progress_state(3.0));
        let f = fixture(builder);

        let err = f.engine.lookup(&progress_state(3.0)).await.unwrap_err();
        assert_eq!(err, BuildError::Failed("scripted failure".to_string()));
        assert!(f.engine.cache().is_empty());
        assert_eq!(f.engine.stats().build_errors, 1);
    }

    #[tokio::test]
    async fn test_low_confidence_hit_is_rebuilt_before_commit() {
        let f = fixture(ScriptedBuilder::new().with_staged_action("notify"));
        predict(&f, 42.0, 0.6);
        f.engine.precompute(&progress_state(40.0)).await;
        let key = f.engine.key_of(&progress_state(42.0));
        let speculative = f.engine.cache().peek(&key).unwrap();

        let artifacts = f.engine.lookup(&progress_state(42.0)).await.unwrap();
        assert_eq!(f.builder.calls(), 2);
        assert!(f.action.executed().is_empty());

        let stats = f.engine.stats();
        assert_eq!(stats.gate_rejections, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
        let rejected = &f.audit.of_kind(AuditEventKind::CommitRejected)[0];
        assert_eq!(rejected.confidence, Some(0.6));

        // the rebuilt action was staged for reality and may be committed
        let action = artifacts.staged_action.as_ref().unwrap();
        assert_eq!(action.confidence, 1.0);
        assert_eq!(action.predicted_state, progress_state(42.0));
        f.engine
            .commit(&progress_state(42.0), &artifacts)
            .await
            .unwrap();
        assert_eq!(f.action.executed().len(), 1);

        // the discarded speculative bundle can never be committed
        let err = f
            .engine
            .commit(&progress_state(42.0), &speculative.artifacts)
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::GateRejected { .. }));
        assert_eq!(f.action.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_gate_checks_deviation() {
        let f = fixture(ScriptedBuilder::new().with_staged_action("notify"));
        predict(&f, 42.0, 0.95);
        f.engine.precompute(&progress_state(40.0)).await;
        let bundle = f
            .engine
            .cache()
            .peek(&f.engine.key_of(&progress_state(42.0)))
            .unwrap();

        // 58 points off on a 100 scale, averaged with the matching phase: 0.29
        let err = f
            .engine
            .commit(&progress_state(100.0), &bundle.artifacts)
            .await
            .unwrap_err();
        match err {
            CommitError::GateRejected {
                confidence,
                deviation,
            } => {
                assert_eq!(confidence, 0.95);
                assert!(deviation > 0.15);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(f.action.executed().is_empty());
    }

    #[tokio::test]
    async fn test_commit_pins_and_marks_entry() {
        let f = fixture(ScriptedBuilder::new().with_staged_action("notify"));
        predict(&f, 42.0, 0.9);
        f.engine.precompute(&progress_state(40.0)).await;

        let real = progress_state(42.0);
        let artifacts = f.engine.lookup(&real).await.unwrap();
        let receipt = f.engine.commit(&real, &artifacts).await.unwrap();

        assert_eq!(receipt.key, f.engine.key_of(&real));
        assert_eq!(receipt.external_ref, ExternalRef::new("ext-1"));
        assert!(f.engine.cache().is_pinned(&receipt.key));
        assert_eq!(f.engine.stats().commits, 1);
        assert_eq!(f.engine.stats().verification.open, 1);
        assert_eq!(f.audit.count(AuditEventKind::SpeculativeCommit), 1);

        // the stale handle and the refreshed entry both refuse a second commit
        assert_eq!(
            f.engine.commit(&real, &artifacts).await.unwrap_err(),
            CommitError::AlreadyCommitted
        );
        let refreshed = f.engine.lookup(&real).await.unwrap();
        let action = refreshed.staged_action.as_ref().unwrap();
        assert!(action.committed);
        assert_eq!(action.external_ref, Some(receipt.external_ref.clone()));
        assert_eq!(
            f.engine.commit(&real, &refreshed).await.unwrap_err(),
            CommitError::AlreadyCommitted
        );
        assert_eq!(f.action.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_without_action_or_with_failing_system() {
        let f = fixture(ScriptedBuilder::new());
        let plain = f.engine.lookup(&progress_state(1.0)).await.unwrap();
        assert_eq!(
            f.engine
                .commit(&progress_state(1.0), &plain)
                .await
                .unwrap_err(),
            CommitError::NoStagedAction
        );

        let f = fixture(ScriptedBuilder::new().with_staged_action("notify"));
        f.action.reject_executes();
        let staged = f.engine.lookup(&progress_state(1.0)).await.unwrap();
        let err = f
            .engine
            .commit(&progress_state(1.0), &staged)
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::Execute(ActionError::Rejected(_))));
        assert_eq!(f.engine.stats().commits, 0);
        assert_eq!(f.engine.stats().verification.open, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_divergence_after_commit_rolls_back() {
        let f = fixture(ScriptedBuilder::new().with_staged_action("notify"));
        predict(&f, 42.0, 0.9);
        f.engine.precompute(&progress_state(40.0)).await;

        let real = progress_state(42.0);
        let artifacts = f.engine.lookup(&real).await.unwrap();
        let receipt = f.engine.commit(&real, &artifacts).await.unwrap();

        f.engine.observe(progress_state(80.0));
        let report = f.engine.sweep().await;

        assert_eq!(report.rolled_back, 1);
        assert_eq!(f.action.undo_calls(), vec![receipt.external_ref.clone()]);
        assert!(!f.engine.cache().contains(&receipt.key));
        assert_eq!(
            f.engine
                .verification()
                .record(&receipt.external_ref)
                .unwrap()
                .state,
            CommitmentState::RolledBack
        );
        assert_eq!(f.audit.count(AuditEventKind::Rollback), 1);

        assert_eq!(
            f.engine.rollback(&receipt.external_ref).await.unwrap(),
            RollbackOutcome::AlreadyClosed(CommitmentState::RolledBack)
        );
        assert_eq!(f.action.undo_calls().len(), 1);

        // the next lookup rebuilds instead of serving the rolled back artifact
        f.engine.lookup(&real).await.unwrap();
        assert_eq!(f.builder.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commitment_confirmed_by_matching_states() {
        let f = fixture(ScriptedBuilder::new().with_staged_action("notify"));
        let real = progress_state(42.0);
        let artifacts = f.engine.lookup(&real).await.unwrap();
        let receipt = f.engine.commit(&real, &artifacts).await.unwrap();

        for p in [42.0, 42.5, 43.0] {
            f.engine.observe(progress_state(p));
        }
        assert_eq!(f.engine.sweep().await.confirmed, 1);
        assert!(!f.engine.cache().is_pinned(&receipt.key));
        assert_eq!(f.engine.stats().verification.confirmed, 1);
    }

    #[tokio::test]
    async fn test_rebuilt_action_can_be_committed_after_rollback() {
        let f = fixture(
            ScriptedBuilder::new()
                .with_staged_action("notify")
                .with_stable_action_ids(),
        );
        let real = progress_state(40.0);
        let artifacts = f.engine.lookup(&real).await.unwrap();
        let first = f.engine.commit(&real, &artifacts).await.unwrap();

        f.engine.observe(progress_state(90.0));
        assert_eq!(f.engine.sweep().await.rolled_back, 1);

        // reality later reaches the state for real
        let rebuilt = f.engine.lookup(&real).await.unwrap();
        assert!(rebuilt.has_uncommitted_action());
        let second = f.engine.commit(&real, &rebuilt).await.unwrap();
        assert_eq!(second.action_id, first.action_id);
        assert_ne!(second.external_ref, first.external_ref);
        assert_eq!(f.action.executed().len(), 2);

        // a confirmed commitment still blocks a rebuild of the same action
        assert!(f.engine.confirm(&second.external_ref));
        f.engine.cache().invalidate(&second.key);
        let again = f.engine.lookup(&real).await.unwrap();
        let err = f.engine.commit(&real, &again).await.unwrap_err();
        assert!(matches!(err, CommitError::AlreadyCommitted));
        assert_eq!(f.action.executed().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_tasks_precompute_and_stop() {
        let f = fixture(ScriptedBuilder::new());
        predict(&f, 11.0, 0.9);
        let background = f.engine.start_background();

        f.engine.observe(progress_state(10.0));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(f.predictor.calls() > 0);

        f.engine.lookup(&progress_state(11.0)).await.unwrap();
        assert_eq!(f.engine.stats().hits, 1);

        background.shutdown().await;
        let calls = f.predictor.calls();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.predictor.calls(), calls);
    }

    #[test]
    fn test_builder_requires_components() {
        let missing = SpeculativeEngine::<String>::builder(config())
            .predictor(Arc::new(FixedPredictor::new(Vec::new())))
            .build();
        assert!(matches!(
            missing,
            Err(SpeculativeError::MissingComponent("artifact builder"))
        ));

        let invalid = SpeculativeEngine::<String>::builder(config().with_capacity(0))
            .artifact_builder(Arc::new(ScriptedBuilder::new()))
            .predictor(Arc::new(FixedPredictor::new(Vec::new())))
            .build();
        assert!(matches!(invalid, Err(SpeculativeError::Config(_))));
    }

    #[tokio::test]
    async fn test_default_external_action_refuses_commits() {
        let engine = SpeculativeEngine::<String>::builder(config())
            .artifact_builder(Arc::new(ScriptedBuilder::new().with_staged_action("notify")))
            .predictor(Arc::new(FixedPredictor::new(Vec::new())))
            .build()
            .unwrap();

        let state = progress_state(5.0);
        let artifacts = engine.lookup(&state).await.unwrap();
        let err = engine.commit(&state, &artifacts).await.unwrap_err();
        assert!(matches!(err, CommitError::Execute(ActionError::Rejected(_))));
    }
}
