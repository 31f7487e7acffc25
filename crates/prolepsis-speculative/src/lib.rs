//! Speculative Precomputation
//!
//! Serves expensive artifacts with near-zero latency by building them for
//! predicted future states before those states occur:
//! - Background prediction and precomputation into a bounded LRU cache
//! - Synchronous fallback build on a miss, never a different result
//! - Confidence/deviation gate before any staged external side effect
//! - Verification sweep with rollback of side effects that proved wrong
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Speculative Engine                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  observe(state) ──> Predictor ──> Scheduler ──> Builder     │
//! │       │               (ranked)    (threshold,      │         │
//! │       │                            bounded)        ↓         │
//! │       │          ┌──────────────────────────────────────┐   │
//! │       │          │         Speculative Cache (LRU)       │   │
//! │       │          │   key(X) -> bundle  (conf 0.92)       │   │
//! │       │          │   key(Y) -> bundle  (conf 0.71)       │   │
//! │       │          │   key(Z) -> bundle  [pinned]          │   │
//! │       │          └──────────────────────────────────────┘   │
//! │       ↓                      │                               │
//! │  lookup(real) ── hit ────────┘        miss ──> build now     │
//! │       │                                                      │
//! │  commit(real, bundle) ── gate ──> execute ──> Verification   │
//! │                                       confirm | rollback     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use prolepsis_speculative::prelude::*;
//!
//! let engine = SpeculativeEngine::builder(config)
//!     .builder(Arc::new(MyRenderer))
//!     .predictor(Arc::new(MyPredictor))
//!     .build()?;
//!
//! let background = engine.start_background();
//! let artifacts = engine.lookup(&real_state).await?;
//! background.shutdown().await;
//! ```

mod audit;
mod cache;
mod config;
mod engine;
mod error;
mod history;
mod metrics;
mod scheduler;
mod verification;

#[cfg(test)]
pub(crate) mod testing;

pub use audit::{
    AuditEvent, AuditEventKind, AuditSink, ChannelAuditSink, MemoryAuditSink, NullAuditSink,
    TracingAuditSink,
};
pub use cache::{CacheEntry, CacheStats, PutOutcome, SpeculativeCache};
pub use config::SpeculationConfig;
pub use engine::{
    BackgroundTasks, CommitReceipt, EngineBuilder, EngineStats, NoExternalAction,
    SpeculativeEngine,
};
pub use error::{CommitError, ConfigError, Result, RollbackError, SpeculativeError};
pub use history::{Observation, StateHistory};
pub use scheduler::{PrecomputeScheduler, SchedulerConfig, TickReport};
pub use verification::{
    CommitmentRecord, CommitmentState, PendingCommitment, RetryConfig, RollbackOutcome,
    RollbackReason, SweepReport, VerificationConfig, VerificationManager, VerificationStats,
};

/// Default minimum confidence for building a predicted state
pub const DEFAULT_SPECULATION_THRESHOLD: f64 = 0.5;

/// Default minimum confidence for committing a staged action
pub const DEFAULT_COMMIT_THRESHOLD: f64 = 0.85;

/// Default maximum predicted-vs-real deviation
pub const DEFAULT_MAX_DEVIATION: f64 = 0.15;

/// Prelude for common imports
pub mod prelude {
    pub use super::{
        AuditSink, CommitError, EngineBuilder, Result, SpeculationConfig, SpeculativeEngine,
        SpeculativeError,
    };
    pub use prolepsis_core::prelude::*;
}
