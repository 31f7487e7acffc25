//! Immutable state snapshots

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A single field value inside a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Continuous or integral quantity (quantized by the canonicalizer)
    Number(f64),
    /// Boolean flag
    Flag(bool),
    /// Enum-like label
    Label(String),
}

impl FieldValue {
    /// Numeric value, if this is a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Label value, if this is a label
    pub fn as_label(&self) -> Option<&str> {
        match self {
            FieldValue::Label(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Flag value, if this is a flag
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            FieldValue::Flag(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Flag(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Label(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Label(v)
    }
}

/// One captured point in the monitored domain.
///
/// Fields are kept in name order, so the order in which a snapshot was built
/// never affects equality or the derived key. Cloning is cheap: the field map
/// is shared behind an `Arc` and never mutated after capture.
#[derive(Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateSnapshot {
    fields: Arc<BTreeMap<String, FieldValue>>,
}

impl StateSnapshot {
    /// Start building a snapshot
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::default()
    }

    /// Snapshot with no fields
    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up a field
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Numeric field value
    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FieldValue::as_number)
    }

    /// Label field value
    pub fn label(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_label)
    }

    /// Flag field value
    pub fn flag(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(FieldValue::as_flag)
    }

    /// Iterate fields in name order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the snapshot has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// New snapshot with one field replaced or added
    pub fn with(&self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        let mut fields = (*self.fields).clone();
        fields.insert(name.into(), value.into());
        Self {
            fields: Arc::new(fields),
        }
    }
}

impl fmt::Debug for StateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.fields.iter()).finish()
    }
}

impl FromIterator<(String, FieldValue)> for StateSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self {
            fields: Arc::new(iter.into_iter().collect()),
        }
    }
}

/// Builder for [`StateSnapshot`]
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    fields: BTreeMap<String, FieldValue>,
}

impl SnapshotBuilder {
    /// Add a numeric field
    pub fn number(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), FieldValue::Number(value));
        self
    }

    /// Add a label field
    pub fn label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), FieldValue::Label(value.into()));
        self
    }

    /// Add a flag field
    pub fn flag(mut self, name: impl Into<String>, value: bool) -> Self {
        self.fields.insert(name.into(), FieldValue::Flag(value));
        self
    }

    /// Add any field value
    pub fn field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Capture the snapshot
    pub fn build(self) -> StateSnapshot {
        StateSnapshot {
            fields: Arc::new(self.fields),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_order_independent() {
        let a = StateSnapshot::builder()
            .number("progress", 42.0)
            .label("phase", "build")
            .build();
        let b = StateSnapshot::builder()
            .label("phase", "build")
            .number("progress", 42.0)
            .build();

        assert_eq!(a, b);
        let names: Vec<&str> = a.fields().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["phase", "progress"]);
    }

    #[test]
    fn test_typed_accessors() {
        let snap = StateSnapshot::builder()
            .number("progress", 12.5)
            .label("phase", "deploy")
            .flag("green", true)
            .build();

        assert_eq!(snap.number("progress"), Some(12.5));
        assert_eq!(snap.label("phase"), Some("deploy"));
        assert_eq!(snap.flag("green"), Some(true));
        assert_eq!(snap.number("phase"), None);
        assert!(snap.get("missing").is_none());
        assert_eq!(snap.len(), 3);
    }

    #[test]
    fn test_with_leaves_original_untouched() {
        let original = StateSnapshot::builder().number("progress", 1.0).build();
        let next = original.with("progress", 2.0);

        assert_eq!(original.number("progress"), Some(1.0));
        assert_eq!(next.number("progress"), Some(2.0));
    }

    #[test]
    fn test_serde_roundtrip_shape() {
        let snap = StateSnapshot::builder()
            .number("progress", 3.0)
            .label("phase", "idle")
            .flag("ok", false)
            .build();

        let json = serde_json::to_string(&snap).unwrap();
        assert_eq!(json, r#"{"ok":false,"phase":"idle","progress":3.0}"#);

        let back: StateSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }
}
