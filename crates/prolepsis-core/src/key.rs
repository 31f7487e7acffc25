//! Deterministic state keys
//!
//! A [`StateKey`] is derived from a [`StateSnapshot`] in two steps:
//!
//! 1. **Quantize** every field according to a versioned [`QuantizationSpec`].
//!    A numeric field with step `s` becomes `round(v / s)`; fields without a
//!    step are taken exactly. Labels and flags are always exact.
//! 2. **Hash** the canonical byte encoding of the quantized tuple with XXH3-128.
//!
//! The encoding walks fields in name order and length-prefixes every name, so
//! neither insertion order nor float formatting can change a key. The spec
//! version is part of the encoding: bumping it after changing any step keeps
//! old and new keys disjoint.
//!
//! # Choosing steps
//!
//! Coarser steps raise the hit rate but let a "hit" serve an artifact built
//! for a slightly different state. Document the step per field where the
//! spec is assembled; the core ships no default steps.

use crate::{QuantizationError, StateSnapshot, FieldValue, DEFAULT_QUANTIZATION_VERSION};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use xxhash_rust::xxh3::xxh3_128;

/// Domain separator prepended to every encoded tuple
const KEY_DOMAIN: &[u8] = b"prolepsis/state-key";

const TAG_INTEGER: u8 = 1;
const TAG_EXACT: u8 = 2;
const TAG_NAN: u8 = 3;
const TAG_LABEL: u8 = 4;
const TAG_FLAG: u8 = 5;

/// Fixed-width key for a quantized state
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey(u128);

impl StateKey {
    /// Wrap a raw 128-bit value
    pub const fn from_raw(raw: u128) -> Self {
        Self(raw)
    }

    /// Raw 128-bit value
    pub const fn as_u128(&self) -> u128 {
        self.0
    }

    /// Lowercase hex form (32 chars)
    pub fn to_hex(&self) -> String {
        format!("{:032x}", self.0)
    }

    /// Parse the hex form produced by [`StateKey::to_hex`]
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 32 {
            return None;
        }
        u128::from_str_radix(hex, 16).ok().map(Self)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateKey({})", &self.to_hex()[..12])
    }
}

impl Serialize for StateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        StateKey::from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid state key: {}", hex)))
    }
}

/// Versioned per-field precision map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationSpec {
    /// Scheme version, part of every key
    #[serde(default = "default_version")]
    pub version: u32,
    /// Quantization step per numeric field
    #[serde(default)]
    pub fields: BTreeMap<String, f64>,
}

fn default_version() -> u32 {
    DEFAULT_QUANTIZATION_VERSION
}

impl Default for QuantizationSpec {
    fn default() -> Self {
        Self {
            version: DEFAULT_QUANTIZATION_VERSION,
            fields: BTreeMap::new(),
        }
    }
}

impl QuantizationSpec {
    /// Set the scheme version
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Quantize `name` to multiples of `step`
    pub fn with_field(mut self, name: impl Into<String>, step: f64) -> Self {
        self.fields.insert(name.into(), step);
        self
    }

    /// Step configured for a field
    pub fn step_for(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }

    /// Check every step is finite and positive
    pub fn validate(&self) -> Result<(), QuantizationError> {
        for (field, step) in &self.fields {
            if !step.is_finite() || *step <= 0.0 {
                return Err(QuantizationError {
                    field: field.clone(),
                    step: *step,
                });
            }
        }
        Ok(())
    }
}

/// One quantized field value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QuantizedValue {
    /// Numeric field snapped to its step grid
    Integer(i64),
    /// Numeric field without a step, as normalized IEEE-754 bits
    Exact(u64),
    /// Any NaN
    NotANumber,
    /// Label, verbatim
    Label(String),
    /// Flag, verbatim
    Flag(bool),
}

/// Canonical quantized form of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuantizedTuple {
    /// Scheme version
    pub version: u32,
    /// Fields in name order
    pub values: Vec<(String, QuantizedValue)>,
}

/// Reduces snapshots to [`StateKey`]s
#[derive(Debug, Clone, Default)]
pub struct Canonicalizer {
    spec: QuantizationSpec,
}

impl Canonicalizer {
    /// Create a canonicalizer for a quantization spec
    pub fn new(spec: QuantizationSpec) -> Self {
        Self { spec }
    }

    /// The active quantization spec
    pub fn spec(&self) -> &QuantizationSpec {
        &self.spec
    }

    /// Quantize a snapshot
    pub fn quantize(&self, snapshot: &StateSnapshot) -> QuantizedTuple {
        let values = snapshot
            .fields()
            .map(|(name, value)| (name.to_string(), self.quantize_field(name, value)))
            .collect();

        QuantizedTuple {
            version: self.spec.version,
            values,
        }
    }

    /// Derive the key of a snapshot
    pub fn key_of(&self, snapshot: &StateSnapshot) -> StateKey {
        let mut buf = Vec::with_capacity(KEY_DOMAIN.len() + 4 + snapshot.len() * 24);
        buf.extend_from_slice(KEY_DOMAIN);
        buf.extend_from_slice(&self.spec.version.to_le_bytes());

        for (name, value) in snapshot.fields() {
            buf.extend_from_slice(&(name.len() as u64).to_le_bytes());
            buf.extend_from_slice(name.as_bytes());
            encode_value(&mut buf, &self.quantize_field(name, value));
        }

        StateKey(xxh3_128(&buf))
    }

    fn quantize_field(&self, name: &str, value: &FieldValue) -> QuantizedValue {
        match value {
            FieldValue::Number(v) if v.is_nan() => QuantizedValue::NotANumber,
            FieldValue::Number(v) => match self.spec.step_for(name) {
                // `as` saturates at the i64 bounds, so infinities stay distinct
                Some(step) => QuantizedValue::Integer((v / step).round() as i64),
                None => {
                    let normalized = if *v == 0.0 { 0.0 } else { *v };
                    QuantizedValue::Exact(normalized.to_bits())
                }
            },
            FieldValue::Label(l) => QuantizedValue::Label(l.clone()),
            FieldValue::Flag(b) => QuantizedValue::Flag(*b),
        }
    }
}

fn encode_value(buf: &mut Vec<u8>, value: &QuantizedValue) {
    match value {
        QuantizedValue::Integer(q) => {
            buf.push(TAG_INTEGER);
            buf.extend_from_slice(&q.to_le_bytes());
        }
        QuantizedValue::Exact(bits) => {
            buf.push(TAG_EXACT);
            buf.extend_from_slice(&bits.to_le_bytes());
        }
        QuantizedValue::NotANumber => buf.push(TAG_NAN),
        QuantizedValue::Label(l) => {
            buf.push(TAG_LABEL);
            buf.extend_from_slice(&(l.len() as u64).to_le_bytes());
            buf.extend_from_slice(l.as_bytes());
        }
        QuantizedValue::Flag(b) => {
            buf.push(TAG_FLAG);
            buf.push(u8::from(*b));
        }
    }
}
