//! Verification and rollback of committed speculative actions
//!
//! Every committed staged action is tracked as a [`CommitmentRecord`]:
//!
//! ```text
//! Committed ──> Confirmed
//!     │
//!     └──> RollingBack ──> RolledBack
//!                     └──> Escalated   (undo retries exhausted)
//! ```
//!
//! The sweep compares each open commitment's predicted state against real
//! observations made after the commit. Rollback is idempotent: a commitment
//! is only ever moved out of `Committed` once, under the registry entry lock.

use crate::audit::{AuditEvent, AuditEventKind, AuditSink};
use crate::cache::SpeculativeCache;
use crate::error::RollbackError;
use crate::history::StateHistory;
use crate::metrics;
use dashmap::DashMap;
use prolepsis_core::{
    ActionId, DeviationMetric, ExternalAction, ExternalRef, StateKey, StateSnapshot, UndoError,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Undo retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Undo attempts before escalating
    pub max_attempts: u32,
    /// Delay before the first retry (ms)
    pub initial_backoff_ms: u64,
    /// Upper bound on any delay (ms)
    pub max_backoff_ms: u64,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based)
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1).min(i32::MAX as u32) as i32);
        let max = self.max_backoff_ms as f64 / 1000.0;
        // f64::min drops NaN (0 * inf), falling back to the cap
        let secs = (self.initial_backoff_ms as f64 / 1000.0 * factor).min(max);
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Verification configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Time between sweeps (ms)
    pub sweep_interval_ms: u64,
    /// In-tolerance observations needed to confirm a commitment
    pub corroborations_required: usize,
    /// How long closed records are kept for idempotent replies (ms)
    pub closed_retention_ms: u64,
    /// Undo retry policy
    pub retry: RetryConfig,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 1000,
            corroborations_required: 3,
            closed_retention_ms: 60 * 60 * 1000,
            retry: RetryConfig::default(),
        }
    }
}

impl VerificationConfig {
    /// Sweep interval as a duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Closed-record retention as a duration
    pub fn closed_retention(&self) -> Duration {
        Duration::from_millis(self.closed_retention_ms)
    }
}

/// A committed side effect awaiting verification
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommitment {
    /// Staged action that was committed
    pub artifact_id: ActionId,
    /// Cache entry the action came from
    pub key: StateKey,
    /// State the action was staged for
    pub predicted_state: StateSnapshot,
    /// Handle of the performed side effect
    pub external_ref: ExternalRef,
    /// Confidence the action was staged with
    pub confidence: f64,
    /// When the action was performed
    pub committed_at: Instant,
    /// Latest time by which it must be confirmed
    pub deadline: Instant,
    /// Last history sequence number seen at commit time
    pub observed_seq: u64,
}

/// Lifecycle state of a commitment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentState {
    /// Performed, awaiting verification
    Committed,
    /// Undo in progress
    RollingBack,
    /// Corroborated by real observations
    Confirmed,
    /// Side effect reversed
    RolledBack,
    /// Undo retries exhausted; side effect still live
    Escalated,
}

impl CommitmentState {
    /// Whether no further transition is possible
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            CommitmentState::Confirmed | CommitmentState::RolledBack | CommitmentState::Escalated
        )
    }
}

/// Registry entry for one commitment
#[derive(Debug, Clone)]
pub struct CommitmentRecord {
    /// The commitment
    pub commitment: PendingCommitment,
    /// Current state
    pub state: CommitmentState,
    /// When the record reached a closed state
    pub closed_at: Option<Instant>,
}

/// Why a commitment is being rolled back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackReason {
    /// Real state deviated beyond tolerance
    Diverged,
    /// Deadline passed without corroboration
    Expired,
    /// Requested by the host
    Manual,
}

impl RollbackReason {
    /// Reason as written to logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackReason::Diverged => "diverged",
            RollbackReason::Expired => "expired",
            RollbackReason::Manual => "manual",
        }
    }
}

/// Result of a rollback request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Side effect reversed by this call
    RolledBack {
        /// Undo attempts it took
        attempts: u32,
    },
    /// Another caller is already rolling this commitment back
    InProgress,
    /// Commitment was already closed; nothing done
    AlreadyClosed(CommitmentState),
    /// No such commitment (never tracked, or pruned)
    Unknown,
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Open commitments examined
    pub examined: usize,
    /// Commitments confirmed
    pub confirmed: usize,
    /// Commitments rolled back
    pub rolled_back: usize,
    /// Rollbacks escalated
    pub escalated: usize,
    /// Closed records dropped
    pub pruned: usize,
}

/// Verification statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationStats {
    /// Commitments not yet closed
    pub open: usize,
    /// Total confirmed
    pub confirmed: u64,
    /// Total rolled back
    pub rolled_back: u64,
    /// Total escalated
    pub escalated: u64,
}

enum Verdict {
    Hold,
    Confirm,
    Rollback(RollbackReason, Option<f64>),
}

/// Tracks committed actions and reverses the ones that proved wrong
pub struct VerificationManager<P> {
    config: VerificationConfig,
    max_deviation: f64,
    metric: Arc<dyn DeviationMetric>,
    history: Arc<StateHistory>,
    cache: Arc<SpeculativeCache<P>>,
    action: Arc<dyn ExternalAction>,
    audit: Arc<dyn AuditSink>,
    records: DashMap<ExternalRef, CommitmentRecord>,
    confirmed: AtomicU64,
    rolled_back: AtomicU64,
    escalated: AtomicU64,
}

impl<P: Send + Sync + 'static> VerificationManager<P> {
    /// Create a new verification manager
    pub fn new(
        config: VerificationConfig,
        max_deviation: f64,
        metric: Arc<dyn DeviationMetric>,
        history: Arc<StateHistory>,
        cache: Arc<SpeculativeCache<P>>,
        action: Arc<dyn ExternalAction>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            max_deviation,
            metric,
            history,
            cache,
            action,
            audit,
            records: DashMap::new(),
            confirmed: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
            escalated: AtomicU64::new(0),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    /// Start tracking a commitment
    pub fn track(&self, commitment: PendingCommitment) {
        debug!(
            "Tracking commitment {} for {} (confidence {:.3})",
            commitment.external_ref, commitment.key, commitment.confidence
        );
        self.records.insert(
            commitment.external_ref.clone(),
            CommitmentRecord {
                commitment,
                state: CommitmentState::Committed,
                closed_at: None,
            },
        );
    }

    /// Snapshot of one record
    pub fn record(&self, external_ref: &ExternalRef) -> Option<CommitmentRecord> {
        self.records.get(external_ref).map(|r| r.value().clone())
    }

    /// Whether a staged action has a live, confirmed or escalated commitment.
    ///
    /// Rolled-back commitments do not count, so a rebuild of the same action
    /// may be committed again.
    pub fn tracks_action(&self, action_id: &ActionId) -> bool {
        self.records.iter().any(|r| {
            &r.commitment.artifact_id == action_id && r.state != CommitmentState::RolledBack
        })
    }

    /// Commitments still awaiting verification
    pub fn open_commitments(&self) -> Vec<PendingCommitment> {
        self.records
            .iter()
            .filter(|r| r.state == CommitmentState::Committed)
            .map(|r| r.commitment.clone())
            .collect()
    }

    /// Confirm a commitment from external evidence. Returns false if it was
    /// not open.
    pub fn confirm(&self, external_ref: &ExternalRef) -> bool {
        let commitment = {
            let Some(mut record) = self.records.get_mut(external_ref) else {
                return false;
            };
            if record.state != CommitmentState::Committed {
                return false;
            }
            record.state = CommitmentState::Confirmed;
            record.closed_at = Some(Instant::now());
            record.commitment.clone()
        };

        self.cache.unpin(&commitment.key);
        self.confirmed.fetch_add(1, Ordering::Relaxed);
        metrics::record_confirmation();
        info!("Commitment {} confirmed", commitment.external_ref);
        self.audit.emit(
            AuditEvent::new(AuditEventKind::CommitmentConfirmed)
                .with_key(commitment.key)
                .with_confidence(commitment.confidence)
                .with_external_ref(commitment.external_ref),
        );
        true
    }

    /// Reverse a commitment on request. Safe to call any number of times.
    pub async fn rollback(
        &self,
        external_ref: &ExternalRef,
    ) -> Result<RollbackOutcome, RollbackError> {
        self.rollback_with_reason(external_ref, RollbackReason::Manual, None)
            .await
    }

    async fn rollback_with_reason(
        &self,
        external_ref: &ExternalRef,
        reason: RollbackReason,
        deviation: Option<f64>,
    ) -> Result<RollbackOutcome, RollbackError> {
        let commitment = {
            let Some(mut record) = self.records.get_mut(external_ref) else {
                return Ok(RollbackOutcome::Unknown);
            };
            let state = record.state;
            match state {
                CommitmentState::Committed => {
                    record.state = CommitmentState::RollingBack;
                    record.commitment.clone()
                }
                CommitmentState::RollingBack => return Ok(RollbackOutcome::InProgress),
                closed => return Ok(RollbackOutcome::AlreadyClosed(closed)),
            }
        };

        let undo = self.undo_with_retry(&commitment.external_ref).await;

        // Whatever the undo result, the artifact must not be served again
        self.cache.unpin(&commitment.key);
        self.cache.invalidate(&commitment.key);

        let mut event = AuditEvent::new(AuditEventKind::Rollback)
            .with_key(commitment.key)
            .with_confidence(commitment.confidence)
            .with_external_ref(commitment.external_ref.clone())
            .with_detail(reason.as_str());
        if let Some(d) = deviation {
            event = event.with_deviation(d);
        }

        match undo {
            Ok(attempts) => {
                self.close(external_ref, CommitmentState::RolledBack);
                self.rolled_back.fetch_add(1, Ordering::Relaxed);
                metrics::record_rollback(reason.as_str());
                info!(
                    "Rolled back {} ({}, {} attempt(s))",
                    commitment.external_ref,
                    reason.as_str(),
                    attempts
                );
                self.audit.emit(event);
                Ok(RollbackOutcome::RolledBack { attempts })
            }
            Err(last_error) => {
                self.close(external_ref, CommitmentState::Escalated);
                self.escalated.fetch_add(1, Ordering::Relaxed);
                metrics::record_escalation();

                let attempts = self.config.retry.max_attempts;
                error!(
                    "Rollback of {} escalated after {} attempts, side effect still live: {}",
                    commitment.external_ref, attempts, last_error
                );
                event.kind = AuditEventKind::RollbackEscalated;
                event.detail = Some(format!("{}: {}", reason.as_str(), last_error));
                self.audit.emit(event);

                Err(RollbackError::Escalated {
                    external_ref: commitment.external_ref,
                    attempts,
                    last_error,
                })
            }
        }
    }

    fn close(&self, external_ref: &ExternalRef, state: CommitmentState) {
        if let Some(mut record) = self.records.get_mut(external_ref) {
            record.state = state;
            record.closed_at = Some(Instant::now());
        }
    }

    /// Run the external inverse with exponential backoff, returning the
    /// attempt that succeeded or the last error
    async fn undo_with_retry(&self, external_ref: &ExternalRef) -> Result<u32, UndoError> {
        let retry = &self.config.retry;
        let mut last_error = UndoError::Failed("No attempts made".into());

        for attempt in 1..=retry.max_attempts.max(1) {
            if attempt > 1 {
                let backoff = retry.backoff_for(attempt - 1);
                debug!("Undo retry {} for {} after {:?}", attempt, external_ref, backoff);
                tokio::time::sleep(backoff).await;
            }

            match self.action.undo(external_ref).await {
                Ok(()) => return Ok(attempt),
                Err(e) => {
                    warn!(
                        "Undo of {} failed (attempt {}/{}): {}",
                        external_ref, attempt, retry.max_attempts, e
                    );
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    fn evaluate(&self, commitment: &PendingCommitment, now: Instant) -> Verdict {
        let observations = self.history.since_seq(commitment.observed_seq);

        if let Some(latest) = observations.last() {
            let deviation = self
                .metric
                .deviation(&commitment.predicted_state, &latest.state);
            if deviation.is_nan() || deviation > self.max_deviation {
                return Verdict::Rollback(RollbackReason::Diverged, Some(deviation));
            }

            let corroborating = observations
                .iter()
                .filter(|o| {
                    self.metric.deviation(&commitment.predicted_state, &o.state)
                        <= self.max_deviation
                })
                .count();
            if corroborating >= self.config.corroborations_required {
                return Verdict::Confirm;
            }
        }

        if now >= commitment.deadline {
            Verdict::Rollback(RollbackReason::Expired, None)
        } else {
            Verdict::Hold
        }
    }

    /// Check every open commitment once.
    ///
    /// Rollbacks run concurrently, so one undo stuck in backoff does not hold
    /// up the others.
    pub async fn sweep(self: &Arc<Self>) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();
        let mut rollbacks = JoinSet::new();

        for commitment in self.open_commitments() {
            report.examined += 1;
            match self.evaluate(&commitment, now) {
                Verdict::Hold => {}
                Verdict::Confirm => {
                    if self.confirm(&commitment.external_ref) {
                        report.confirmed += 1;
                    }
                }
                Verdict::Rollback(reason, deviation) => {
                    let manager = Arc::clone(self);
                    rollbacks.spawn(async move {
                        manager
                            .rollback_with_reason(&commitment.external_ref, reason, deviation)
                            .await
                    });
                }
            }
        }

        while let Some(joined) = rollbacks.join_next().await {
            match joined {
                Ok(Ok(RollbackOutcome::RolledBack { .. })) => report.rolled_back += 1,
                Ok(Ok(_)) => {}
                Ok(Err(_)) => report.escalated += 1,
                Err(e) => warn!("Rollback task ended abnormally: {}", e),
            }
        }

        let retention = self.config.closed_retention();
        let before = self.records.len();
        self.records.retain(|_, record| match record.closed_at {
            Some(closed_at) => now.saturating_duration_since(closed_at) < retention,
            None => true,
        });
        report.pruned = before.saturating_sub(self.records.len());

        report
    }

    /// Verification statistics
    pub fn stats(&self) -> VerificationStats {
        let open = self
            .records
            .iter()
            .filter(|r| !r.state.is_closed())
            .count();

        VerificationStats {
            open,
            confirmed: self.confirmed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            escalated: self.escalated.load(Ordering::Relaxed),
        }
    }

    /// Run the sweep loop on a background task until `shutdown` turns true.
    ///
    /// A sweep already in progress is allowed to finish so no commitment is
    /// left half rolled back.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.sweep_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "Verification sweep started (every {}ms)",
                self.config.sweep_interval_ms
            );

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|stop| *stop) => break,
                    _ = interval.tick() => {}
                }

                let report = self.sweep().await;
                metrics::record_occupancy(self.cache.size(), self.stats().open);
                if report.confirmed + report.rolled_back + report.escalated > 0 {
                    debug!(
                        "Sweep confirmed {} rolled back {} escalated {}",
                        report.confirmed, report.rolled_back, report.escalated
                    );
                }
            }

            info!("Verification sweep stopped");
        })
    }
}
