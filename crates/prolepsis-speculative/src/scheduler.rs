//! Background precomputation of predicted states

use crate::audit::{AuditEvent, AuditEventKind, AuditSink};
use crate::cache::{CacheEntry, PutOutcome, SpeculativeCache};
use crate::metrics;
use crate::DEFAULT_SPECULATION_THRESHOLD;
use prolepsis_core::{
    ArtifactBuilder, ArtifactBundle, BuildError, Canonicalizer, StateKey, StateSnapshot,
    TrajectoryCandidate, TrajectoryPredictor,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Time between ticks (ms)
    pub tick_interval_ms: u64,
    /// Candidates below this confidence are never built
    pub speculation_threshold: f64,
    /// Maximum builds started per tick
    pub max_candidates_per_tick: usize,
    /// Maximum builds running at once
    pub max_concurrent_builds: usize,
    /// Predictor deadline (ms)
    pub predict_timeout_ms: u64,
    /// Per-build deadline (ms)
    pub build_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 250,
            speculation_threshold: DEFAULT_SPECULATION_THRESHOLD,
            max_candidates_per_tick: 8,
            max_concurrent_builds: 4,
            predict_timeout_ms: 1000,
            build_timeout_ms: 5000,
        }
    }
}

impl SchedulerConfig {
    /// Tick interval as a duration
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Predictor deadline as a duration
    pub fn predict_timeout(&self) -> Duration {
        Duration::from_millis(self.predict_timeout_ms)
    }

    /// Build deadline as a duration
    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Predictor produced nothing usable this tick
    pub predictor_unavailable: bool,
    /// Candidates returned by the predictor
    pub candidates: usize,
    /// Candidates mapping to a key already seen this tick
    pub duplicates: usize,
    /// Candidates below the speculation threshold
    pub skipped_low_confidence: usize,
    /// Candidates already cached (before or during the build)
    pub skipped_cached: usize,
    /// Candidates over the per-tick build limit
    pub deferred: usize,
    /// Bundles built and stored
    pub built: usize,
    /// Builds that failed or timed out
    pub failed: usize,
    /// Bundles the cache refused (full of pinned entries)
    pub rejected: usize,
}

type BuildOutcome<P> = (
    StateKey,
    TrajectoryCandidate,
    Result<ArtifactBundle<P>, BuildError>,
);

/// Keeps the cache populated with artifacts for likely next states
pub struct PrecomputeScheduler<P> {
    config: SchedulerConfig,
    canonicalizer: Arc<Canonicalizer>,
    cache: Arc<SpeculativeCache<P>>,
    builder: Arc<dyn ArtifactBuilder<P>>,
    predictor: Arc<dyn TrajectoryPredictor>,
    audit: Arc<dyn AuditSink>,
    semaphore: Arc<Semaphore>,
    ticks: AtomicU64,
}

impl<P: Send + Sync + 'static> PrecomputeScheduler<P> {
    /// Create a new scheduler
    pub fn new(
        config: SchedulerConfig,
        canonicalizer: Arc<Canonicalizer>,
        cache: Arc<SpeculativeCache<P>>,
        builder: Arc<dyn ArtifactBuilder<P>>,
        predictor: Arc<dyn TrajectoryPredictor>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_builds.max(1))),
            config,
            canonicalizer,
            cache,
            builder,
            predictor,
            audit,
            ticks: AtomicU64::new(0),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Ticks completed so far
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Predict from `current` and build whatever is worth building.
    ///
    /// Dropping the returned future abandons in-flight builds; nothing is
    /// inserted for a build that did not finish.
    pub async fn tick(&self, current: &StateSnapshot) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport::default();

        let predicted = tokio::time::timeout(
            self.config.predict_timeout(),
            self.predictor.predict(current),
        )
        .await;

        let mut candidates = match predicted {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(e)) => {
                debug!("{}, idling this tick", e);
                report.predictor_unavailable = true;
                return self.finish(report, started);
            }
            Err(_) => {
                debug!(
                    "Predictor timed out after {}ms, idling this tick",
                    self.config.predict_timeout_ms
                );
                report.predictor_unavailable = true;
                return self.finish(report, started);
            }
        };
        report.candidates = candidates.len();

        // Stable, so equal-confidence candidates keep the predictor's order
        candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut seen = HashSet::with_capacity(candidates.len());
        let mut selected = Vec::new();
        for candidate in candidates {
            let key = self.canonicalizer.key_of(&candidate.state);
            if !seen.insert(key) {
                report.duplicates += 1;
                continue;
            }
            if candidate.confidence < self.config.speculation_threshold {
                debug!(
                    "Skipping {} (confidence {:.3} below {:.3})",
                    key, candidate.confidence, self.config.speculation_threshold
                );
                report.skipped_low_confidence += 1;
                continue;
            }
            if self.cache.contains(&key) {
                report.skipped_cached += 1;
                continue;
            }
            if selected.len() >= self.config.max_candidates_per_tick {
                report.deferred += 1;
                continue;
            }
            selected.push((key, candidate));
        }

        let mut builds: JoinSet<BuildOutcome<P>> = JoinSet::new();
        for (key, candidate) in selected {
            let builder = Arc::clone(&self.builder);
            let semaphore = Arc::clone(&self.semaphore);
            let timeout = self.config.build_timeout();
            let timeout_ms = self.config.build_timeout_ms;

            debug!("Precomputing {} (confidence {:.3})", key, candidate.confidence);
            builds.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => tokio::time::timeout(timeout, builder.build(&candidate.state))
                        .await
                        .unwrap_or(Err(BuildError::Timeout(timeout_ms))),
                    Err(_) => Err(BuildError::Failed("build slots closed".to_string())),
                };
                (key, candidate, result)
            });
        }

        while let Some(joined) = builds.join_next().await {
            match joined {
                Ok((key, candidate, Ok(bundle))) => {
                    let bundle = bundle.stamp_prediction(candidate.confidence, &candidate.state);
                    let entry = CacheEntry::new(key, bundle, candidate.state);
                    match self.cache.put_if_absent(entry) {
                        PutOutcome::Inserted { .. } | PutOutcome::Replaced => report.built += 1,
                        PutOutcome::Present => report.skipped_cached += 1,
                        PutOutcome::Rejected => report.rejected += 1,
                    }
                }
                Ok((key, candidate, Err(e))) => {
                    warn!("Precompute of {} failed: {}", key, e);
                    report.failed += 1;
                    metrics::record_build_failure("background");
                    self.audit.emit(
                        AuditEvent::new(AuditEventKind::BuildFailed)
                            .with_key(key)
                            .with_confidence(candidate.confidence)
                            .with_detail(e.to_string()),
                    );
                }
                Err(e) => {
                    warn!("Precompute task aborted: {}", e);
                    report.failed += 1;
                    metrics::record_build_failure("background");
                }
            }
        }

        self.finish(report, started)
    }

    fn finish(&self, report: TickReport, started: Instant) -> TickReport {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        metrics::record_tick(report.built, started.elapsed());
        if report.built > 0 || report.failed > 0 {
            debug!(
                "Tick built {} failed {} of {} candidates",
                report.built, report.failed, report.candidates
            );
        }
        report
    }

    /// Run the tick loop on a background task until `shutdown` turns true.
    ///
    /// Ticks idle until the first state is published on `latest`.
    pub fn spawn(
        self: Arc<Self>,
        mut latest: watch::Receiver<Option<StateSnapshot>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.tick_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "Precompute scheduler started (every {}ms, threshold {:.2})",
                self.config.tick_interval_ms, self.config.speculation_threshold
            );

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|stop| *stop) => break,
                    _ = interval.tick() => {}
                }

                let current = latest.borrow_and_update().clone();
                let Some(current) = current else {
                    continue;
                };

                tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|stop| *stop) => {
                        debug!("Abandoning in-flight precompute tick");
                        break;
                    }
                    _ = self.tick(&current) => {}
                }
            }

            info!("Precompute scheduler stopped after {} ticks", self.ticks());
        })
    }
}
