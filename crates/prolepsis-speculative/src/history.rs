//! Bounded history of real state observations

use parking_lot::RwLock;
use prolepsis_core::StateSnapshot;
use std::collections::VecDeque;
use tokio::time::Instant;

/// One real state seen by the engine
#[derive(Debug, Clone)]
pub struct Observation {
    /// Monotonic sequence number, starting at 1
    pub seq: u64,
    /// The observed state
    pub state: StateSnapshot,
    /// When it was observed
    pub observed_at: Instant,
}

struct HistoryInner {
    observations: VecDeque<Observation>,
    next_seq: u64,
}

/// Ring buffer of recent real states, read by the verification sweep
pub struct StateHistory {
    inner: RwLock<HistoryInner>,
    max_size: usize,
}

impl StateHistory {
    /// Create a history holding at most `max_size` observations
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: RwLock::new(HistoryInner {
                observations: VecDeque::with_capacity(max_size.min(4096)),
                next_seq: 1,
            }),
            max_size: max_size.max(1),
        }
    }

    /// Record a real state and return its sequence number
    pub fn record(&self, state: StateSnapshot) -> u64 {
        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        if inner.observations.len() >= self.max_size {
            inner.observations.pop_front();
        }
        inner.observations.push_back(Observation {
            seq,
            state,
            observed_at: Instant::now(),
        });
        seq
    }

    /// Most recent observation
    pub fn latest(&self) -> Option<Observation> {
        self.inner.read().observations.back().cloned()
    }

    /// Observations with a sequence number greater than `seq`, oldest first
    pub fn since_seq(&self, seq: u64) -> Vec<Observation> {
        let inner = self.inner.read();
        let start = inner.observations.partition_point(|o| o.seq <= seq);
        inner.observations.range(start..).cloned().collect()
    }

    /// Sequence number of the latest observation (0 if none)
    pub fn last_seq(&self) -> u64 {
        self.inner.read().next_seq - 1
    }

    /// Observations currently retained
    pub fn len(&self) -> usize {
        self.inner.read().observations.len()
    }

    /// Whether nothing has been retained
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
