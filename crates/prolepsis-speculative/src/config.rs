//! Engine configuration

use crate::error::ConfigError;
use crate::scheduler::SchedulerConfig;
use crate::verification::VerificationConfig;
use crate::{DEFAULT_COMMIT_THRESHOLD, DEFAULT_MAX_DEVIATION};
use prolepsis_core::QuantizationSpec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for a [`SpeculativeEngine`](crate::SpeculativeEngine)
///
/// ```toml
/// capacity = 512
/// min_confidence_threshold = 0.85
/// max_deviation = 0.15
/// commitment_deadline_ms = 300000
///
/// [quantization]
/// version = 1
/// fields = { progress = 1.0 }
///
/// [scheduler]
/// tick_interval_ms = 250
/// speculation_threshold = 0.5
///
/// [verification]
/// sweep_interval_ms = 1000
/// corroborations_required = 3
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculationConfig {
    /// Maximum cache entries
    pub capacity: usize,
    /// Minimum staged confidence for a commit
    pub min_confidence_threshold: f64,
    /// Maximum predicted-vs-real deviation for a commit, and for a
    /// commitment to stay alive during verification
    pub max_deviation: f64,
    /// How long a commitment may stay unconfirmed (ms)
    pub commitment_deadline_ms: u64,
    /// Real-state observations kept for verification
    pub history_capacity: usize,
    /// Per-field quantization
    pub quantization: QuantizationSpec,
    /// Background precomputation
    pub scheduler: SchedulerConfig,
    /// Verification sweep and rollback
    pub verification: VerificationConfig,
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            min_confidence_threshold: DEFAULT_COMMIT_THRESHOLD,
            max_deviation: DEFAULT_MAX_DEVIATION,
            commitment_deadline_ms: 5 * 60 * 1000,
            history_capacity: 1024,
            quantization: QuantizationSpec::default(),
            scheduler: SchedulerConfig::default(),
            verification: VerificationConfig::default(),
        }
    }
}

impl SpeculationConfig {
    /// Parse from TOML and validate
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Commitment deadline as a duration
    pub fn commitment_deadline(&self) -> Duration {
        Duration::from_millis(self.commitment_deadline_ms)
    }

    /// Set capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the quantization spec
    pub fn with_quantization(mut self, quantization: QuantizationSpec) -> Self {
        self.quantization = quantization;
        self
    }

    /// Check every value is in range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid("capacity", "must be at least 1"));
        }
        check_unit("min_confidence_threshold", self.min_confidence_threshold)?;
        if !self.max_deviation.is_finite() || self.max_deviation < 0.0 {
            return Err(ConfigError::invalid(
                "max_deviation",
                format!("must be finite and non-negative, got {}", self.max_deviation),
            ));
        }
        if self.commitment_deadline_ms == 0 {
            return Err(ConfigError::invalid("commitment_deadline_ms", "must be non-zero"));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::invalid("history_capacity", "must be at least 1"));
        }
        self.quantization.validate()?;

        let s = &self.scheduler;
        if s.tick_interval_ms == 0 {
            return Err(ConfigError::invalid("scheduler.tick_interval_ms", "must be non-zero"));
        }
        check_unit("scheduler.speculation_threshold", s.speculation_threshold)?;
        if s.max_concurrent_builds == 0 {
            return Err(ConfigError::invalid(
                "scheduler.max_concurrent_builds",
                "must be at least 1",
            ));
        }
        if s.predict_timeout_ms == 0 || s.build_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "scheduler.*_timeout_ms",
                "timeouts must be non-zero",
            ));
        }

        let v = &self.verification;
        if v.sweep_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "verification.sweep_interval_ms",
                "must be non-zero",
            ));
        }
        if v.corroborations_required == 0 {
            return Err(ConfigError::invalid(
                "verification.corroborations_required",
                "must be at least 1",
            ));
        }
        if v.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "verification.retry.max_attempts",
                "must be at least 1",
            ));
        }
        if !v.retry.multiplier.is_finite() || v.retry.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "verification.retry.multiplier",
                format!("must be >= 1.0, got {}", v.retry.multiplier),
            ));
        }

        Ok(())
    }
}

fn check_unit(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be within [0, 1], got {}", value)))
    }
}
