//! Structured audit events for hits, misses, commits and rollbacks
//!
//! Sinks are fire-and-forget: `emit` cannot fail, and a slow or broken sink
//! never affects cache behavior.

use parking_lot::Mutex;
use prolepsis_core::{ExternalRef, StateKey};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::info;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// Lookup served from cache
    CacheHit,
    /// Lookup built synchronously
    CacheMiss,
    /// Commit gate refused a staged action
    CommitRejected,
    /// Staged action executed against the external system
    SpeculativeCommit,
    /// Committed action corroborated by real observations
    CommitmentConfirmed,
    /// Committed action reversed
    Rollback,
    /// Undo kept failing; operator attention required
    RollbackEscalated,
    /// Background build failed for a candidate
    BuildFailed,
}

impl AuditEventKind {
    /// Event name as written to logs
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::CacheHit => "cache_hit",
            AuditEventKind::CacheMiss => "cache_miss",
            AuditEventKind::CommitRejected => "commit_rejected",
            AuditEventKind::SpeculativeCommit => "speculative_commit",
            AuditEventKind::CommitmentConfirmed => "commitment_confirmed",
            AuditEventKind::Rollback => "rollback",
            AuditEventKind::RollbackEscalated => "rollback_escalated",
            AuditEventKind::BuildFailed => "build_failed",
        }
    }
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event kind
    pub kind: AuditEventKind,
    /// Wall-clock time in milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// State key involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<StateKey>,
    /// Confidence of the prediction involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Predicted-vs-real deviation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deviation: Option<f64>,
    /// External side effect involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<ExternalRef>,
    /// Free-form detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEvent {
    /// Create an event stamped with the current time
    pub fn new(kind: AuditEventKind) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            kind,
            timestamp_ms,
            key: None,
            confidence: None,
            deviation: None,
            external_ref: None,
            detail: None,
        }
    }

    /// Set the state key
    pub fn with_key(mut self, key: StateKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Set the confidence
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Set the deviation
    pub fn with_deviation(mut self, deviation: f64) -> Self {
        self.deviation = Some(deviation);
        self
    }

    /// Set the external reference
    pub fn with_external_ref(mut self, external_ref: ExternalRef) -> Self {
        self.external_ref = Some(external_ref);
        self
    }

    /// Set the detail text
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Destination for audit events
pub trait AuditSink: Send + Sync {
    /// Record an event. Must not block.
    fn emit(&self, event: AuditEvent);
}

/// Writes events to `tracing` under the `prolepsis::audit` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        info!(
            target: "prolepsis::audit",
            kind = event.kind.as_str(),
            key = ?event.key,
            confidence = ?event.confidence,
            deviation = ?event.deviation,
            external_ref = ?event.external_ref,
            detail = ?event.detail,
            "audit"
        );
    }
}

/// Forwards events into a bounded channel, dropping them when it is full
#[derive(Debug)]
pub struct ChannelAuditSink {
    sender: mpsc::Sender<AuditEvent>,
    dropped: AtomicU64,
}

impl ChannelAuditSink {
    /// Create a sink and the receiving end of its channel
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self::from_sender(sender), receiver)
    }

    /// Wrap an existing sender
    pub fn from_sender(sender: mpsc::Sender<AuditEvent>) -> Self {
        Self {
            sender,
            dropped: AtomicU64::new(0),
        }
    }

    /// Events lost because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for ChannelAuditSink {
    fn emit(&self, event: AuditEvent) {
        if self.sender.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all events so far
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Events of one kind
    pub fn of_kind(&self, kind: AuditEventKind) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of events of one kind
    pub fn count(&self, kind: AuditEventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn emit(&self, _event: AuditEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = AuditEvent::new(AuditEventKind::SpeculativeCommit)
            .with_key(StateKey::from_raw(0xab))
            .with_confidence(0.9)
            .with_external_ref(ExternalRef::new("issue-7"));

        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "speculative_commit");
        assert_eq!(json["key"], format!("{:032x}", 0xab));
        assert_eq!(json["confidence"], 0.9);
        assert_eq!(json["external_ref"], "issue-7");
        assert!(json.get("deviation").is_none());
        assert!(event.timestamp_ms > 0);

        let back: AuditEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_kind_names_match_serde() {
        for kind in [
            AuditEventKind::CacheHit,
            AuditEventKind::CommitRejected,
            AuditEventKind::RollbackEscalated,
            AuditEventKind::BuildFailed,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelAuditSink::new(1);
        sink.emit(AuditEvent::new(AuditEventKind::CacheHit));
        sink.emit(AuditEvent::new(AuditEventKind::CacheMiss));

        assert_eq!(sink.dropped(), 1);
        assert_eq!(rx.recv().await.unwrap().kind, AuditEventKind::CacheHit);

        drop(rx);
        sink.emit(AuditEvent::new(AuditEventKind::CacheHit));
        assert_eq!(sink.dropped(), 2);
    }

    #[test]
    fn test_memory_sink_filters() {
        let sink = MemoryAuditSink::new();
        sink.emit(AuditEvent::new(AuditEventKind::CacheHit));
        sink.emit(AuditEvent::new(AuditEventKind::Rollback).with_detail("diverged"));
        sink.emit(AuditEvent::new(AuditEventKind::CacheHit));

        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.count(AuditEventKind::CacheHit), 2);
        assert_eq!(
            sink.of_kind(AuditEventKind::Rollback)[0].detail.as_deref(),
            Some("diverged")
        );
        NullAuditSink.emit(AuditEvent::new(AuditEventKind::CacheHit));
    }
}
