//! # Prolepsis Core
//!
//! State canonicalization, artifact types and the pluggable contracts used by
//! the speculative precomputation engine in `prolepsis-speculative`.
//!
//! Prolepsis is the rhetorical device of answering an objection before it is
//! raised - the engine answers a state before it arrives.
//!
//! ## Core Pieces
//!
//! - [`StateSnapshot`] - immutable, caller-defined view of one point in the domain
//! - [`Canonicalizer`] - quantizes a snapshot and hashes it into a [`StateKey`]
//! - [`DeviationMetric`] - distance between a predicted and an observed state
//! - [`ArtifactBundle`] / [`StagedAction`] - what gets precomputed per state
//! - [`ArtifactBuilder`], [`TrajectoryPredictor`], [`ExternalAction`] - the
//!   contracts integrators implement
//!
//! ## Example
//!
//! ```ignore
//! use prolepsis_core::{Canonicalizer, QuantizationSpec, StateSnapshot};
//!
//! let spec = QuantizationSpec::default().with_field("progress", 1.0);
//! let canon = Canonicalizer::new(spec);
//!
//! let a = StateSnapshot::builder().number("progress", 41.6).build();
//! let b = StateSnapshot::builder().number("progress", 42.4).build();
//! assert_eq!(canon.key_of(&a), canon.key_of(&b));
//! ```

pub mod artifact;
pub mod contracts;
pub mod deviation;
pub mod error;
pub mod key;
pub mod snapshot;

pub use artifact::{ActionId, ArtifactBundle, ExternalRef, StagedAction};
pub use contracts::{ArtifactBuilder, ExternalAction, TrajectoryCandidate, TrajectoryPredictor};
pub use deviation::{DeviationMetric, NormalizedL1};
pub use error::{ActionError, BuildError, PredictorUnavailable, QuantizationError, UndoError};
pub use key::{Canonicalizer, QuantizationSpec, QuantizedTuple, QuantizedValue, StateKey};
pub use snapshot::{FieldValue, SnapshotBuilder, StateSnapshot};

/// Version stamped into keys when a quantization spec does not name one
pub const DEFAULT_QUANTIZATION_VERSION: u32 = 1;

/// Prelude for common imports
pub mod prelude {
    pub use super::{
        ArtifactBuilder, ArtifactBundle, Canonicalizer, DeviationMetric, ExternalAction,
        ExternalRef, QuantizationSpec, StagedAction, StateKey, StateSnapshot,
        TrajectoryCandidate, TrajectoryPredictor,
    };
}
