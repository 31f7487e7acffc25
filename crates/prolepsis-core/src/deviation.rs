//! Distance between a predicted state and the state that actually occurred

use crate::{FieldValue, StateSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Distance function over snapshots.
///
/// The right metric is domain-specific, so the engine takes one from the
/// integrator. Any `Fn(&StateSnapshot, &StateSnapshot) -> f64` works.
pub trait DeviationMetric: Send + Sync {
    /// Distance between `predicted` and `actual` (0.0 = identical)
    fn deviation(&self, predicted: &StateSnapshot, actual: &StateSnapshot) -> f64;
}

impl<F> DeviationMetric for F
where
    F: Fn(&StateSnapshot, &StateSnapshot) -> f64 + Send + Sync,
{
    fn deviation(&self, predicted: &StateSnapshot, actual: &StateSnapshot) -> f64 {
        self(predicted, actual)
    }
}

/// Mean per-field distance, each field clamped to `[0, 1]`.
///
/// Numeric fields contribute `|a - b| / scale`; label and flag mismatches,
/// type mismatches and fields present on only one side contribute `1.0`.
/// Two empty snapshots are at distance `0.0`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizedL1 {
    /// Normalization scale per numeric field (default 1.0)
    #[serde(default)]
    pub scales: BTreeMap<String, f64>,
}

impl NormalizedL1 {
    /// Create a metric with unit scales
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize `name` by `scale` (e.g. 100.0 for a percentage)
    pub fn with_scale(mut self, name: impl Into<String>, scale: f64) -> Self {
        self.scales.insert(name.into(), scale);
        self
    }

    fn scale_for(&self, name: &str) -> f64 {
        match self.scales.get(name) {
            Some(s) if s.is_finite() && *s > 0.0 => *s,
            _ => 1.0,
        }
    }

    fn field_distance(&self, name: &str, a: &FieldValue, b: &FieldValue) -> f64 {
        match (a, b) {
            (FieldValue::Number(x), FieldValue::Number(y)) => {
                if x == y || (x.is_nan() && y.is_nan()) {
                    0.0
                } else {
                    // f64::min drops a NaN operand, so a lone NaN yields 1.0
                    ((x - y).abs() / self.scale_for(name)).min(1.0)
                }
            }
            (FieldValue::Label(x), FieldValue::Label(y)) if x == y => 0.0,
            (FieldValue::Flag(x), FieldValue::Flag(y)) if x == y => 0.0,
            _ => 1.0,
        }
    }
}

impl DeviationMetric for NormalizedL1 {
    fn deviation(&self, predicted: &StateSnapshot, actual: &StateSnapshot) -> f64 {
        let mut total = 0.0;
        let mut count = 0usize;

        for (name, value) in predicted.fields() {
            total += match actual.get(name) {
                Some(other) => self.field_distance(name, value, other),
                None => 1.0,
            };
            count += 1;
        }

        for (name, _) in actual.fields() {
            if predicted.get(name).is_none() {
                total += 1.0;
                count += 1;
            }
        }

        if count == 0 {
            0.0
        } else {
            total / count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(progress: f64, phase: &str) -> StateSnapshot {
        StateSnapshot::builder()
            .number("progress", progress)
            .label("phase", phase)
            .build()
    }

    #[test]
    fn test_identical_is_zero() {
        let metric = NormalizedL1::new().with_scale("progress", 100.0);
        assert_eq!(metric.deviation(&state(40.0, "a"), &state(40.0, "a")), 0.0);
        assert_eq!(
            metric.deviation(&StateSnapshot::empty(), &StateSnapshot::empty()),
            0.0
        );
    }

    #[test]
    fn test_scaled_numeric_distance() {
        let metric = NormalizedL1::new().with_scale("progress", 100.0);
        // progress differs by 0.2 normalized, phase matches: mean of (0.2, 0.0)
        let d = metric.deviation(&state(40.0, "a"), &state(60.0, "a"));
        assert!((d - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_label_mismatch_and_missing_fields() {
        let metric = NormalizedL1::new();
        assert_eq!(metric.deviation(&state(1.0, "a"), &state(1.0, "b")), 0.5);

        let sparse = StateSnapshot::builder().number("progress", 1.0).build();
        assert_eq!(metric.deviation(&sparse, &state(1.0, "a")), 0.5);
        assert_eq!(metric.deviation(&state(1.0, "a"), &sparse), 0.5);
    }

    #[test]
    fn test_numeric_distance_is_clamped() {
        let metric = NormalizedL1::new();
        let a = StateSnapshot::builder().number("x", 0.0).build();
        let b = StateSnapshot::builder().number("x", f64::INFINITY).build();
        assert_eq!(metric.deviation(&a, &b), 1.0);
        assert_eq!(metric.deviation(&b, &b), 0.0);

        let nan = StateSnapshot::builder().number("x", f64::NAN).build();
        assert_eq!(metric.deviation(&a, &nan), 1.0);
    }

    #[test]
    fn test_closure_metric() {
        let metric = |p: &StateSnapshot, a: &StateSnapshot| {
            (p.number("progress").unwrap_or(0.0) - a.number("progress").unwrap_or(0.0)).abs()
        };
        assert_eq!(metric.deviation(&state(1.0, "a"), &state(4.0, "a")), 3.0);
    }
}
