//! Engine configuration.
//!
//! Defaults carry the documented constants of the memory engine; every
//! threshold the stores consult is tunable here and checked by
//! `validate()` before a store is built.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the SQLite database file. None means auto-discovery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,

    /// Tier 1 (conversation queue) configuration.
    pub conversation: ConversationConfig,

    /// Confidence engine configuration.
    pub confidence: ConfidenceConfig,

    /// Protection layer configuration.
    pub protection: ProtectionConfig,

    /// Routing safety gate configuration.
    pub routing: RoutingConfig,
}

/// Tier 1 configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Maximum number of active conversations before eviction (default: 20).
    pub max_active: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self { max_active: 20 }
    }
}

/// Confidence gating rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    /// Occurrences below this keep confidence capped (default: 3).
    pub occurrence_gate_min: u32,

    /// Ceiling applied while under the occurrence gate (default: 0.50).
    pub occurrence_gate_ceiling: f64,

    /// An increase larger than this triggers the jump limiter (default: 0.30).
    pub jump_threshold: f64,

    /// Maximum admitted increase when the jump limiter fires (default: 0.15).
    pub max_jump_increase: f64,

    /// Occurrences required before 1.0 confidence is permitted (default: 10).
    pub perfection_min_occurrences: u32,

    /// Ceiling applied when 1.0 is proposed too early (default: 0.85).
    pub perfection_ceiling: f64,

    /// Proposals above this on a single occurrence are spikes (default: 0.95).
    pub spike_threshold: f64,

    /// Ceiling applied to a single-evidence spike (default: 0.70).
    pub spike_ceiling: f64,

    /// Decay applied to unused patterns.
    pub decay: DecayConfig,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            occurrence_gate_min: 3,
            occurrence_gate_ceiling: 0.50,
            jump_threshold: 0.30,
            max_jump_increase: 0.15,
            perfection_min_occurrences: 10,
            perfection_ceiling: 0.85,
            spike_threshold: 0.95,
            spike_ceiling: 0.70,
            decay: DecayConfig::default(),
        }
    }
}

/// Decay curve for unused-pattern confidence.
///
/// The exact curve is a tunable parameter, not a fixed formula.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "curve", rename_all = "snake_case")]
pub enum DecayCurve {
    /// Subtract `per_day` for each day past the idle threshold.
    Linear { per_day: f64 },
    /// Halve confidence every `half_life_days` past the idle threshold.
    Exponential { half_life_days: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayConfig {
    pub curve: DecayCurve,
    /// Confidence never decays below this floor (default: 0.0).
    pub floor: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            curve: DecayCurve::Linear { per_day: 0.01 },
            floor: 0.0,
        }
    }
}

/// Protection layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    /// Rolling backup snapshots retained per store (default: 10).
    pub backup_retention: usize,

    /// Abort with BackupFailure when a snapshot exceeds this size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_snapshot_bytes: Option<usize>,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            backup_retention: 10,
            max_snapshot_bytes: None,
        }
    }
}

/// Routing safety gate thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Confidence at or above this auto-routes (default: 0.85).
    pub auto_route_confidence: f64,

    /// Confidence at or above this requires confirmation (default: 0.70).
    pub confirm_confidence: f64,

    /// Occurrences below this always fall back (default: 3).
    pub min_occurrences: u32,

    /// Confidence above this on a single occurrence is blocked (default: 0.95).
    pub overconfidence_threshold: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            auto_route_confidence: 0.85,
            confirm_confidence: 0.70,
            min_occurrences: 3,
            overconfidence_threshold: 0.95,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the database path.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Set the maximum number of active conversations.
    pub fn with_max_active(mut self, max_active: usize) -> Self {
        self.conversation.max_active = max_active;
        self
    }

    /// Set the backup retention count.
    pub fn with_backup_retention(mut self, retention: usize) -> Self {
        self.protection.backup_retention = retention;
        self
    }

    /// Set the decay configuration.
    pub fn with_decay(mut self, decay: DecayConfig) -> Self {
        self.confidence.decay = decay;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> std::result::Result<(), ConfigValidationError> {
        if self.conversation.max_active == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "conversation.max_active".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.protection.backup_retention == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "protection.backup_retention".into(),
                message: "must be at least 1".into(),
            });
        }

        let unit_fields = [
            (
                "confidence.occurrence_gate_ceiling",
                self.confidence.occurrence_gate_ceiling,
            ),
            ("confidence.jump_threshold", self.confidence.jump_threshold),
            (
                "confidence.max_jump_increase",
                self.confidence.max_jump_increase,
            ),
            (
                "confidence.perfection_ceiling",
                self.confidence.perfection_ceiling,
            ),
            ("confidence.spike_threshold", self.confidence.spike_threshold),
            ("confidence.spike_ceiling", self.confidence.spike_ceiling),
            ("confidence.decay.floor", self.confidence.decay.floor),
            (
                "routing.auto_route_confidence",
                self.routing.auto_route_confidence,
            ),
            ("routing.confirm_confidence", self.routing.confirm_confidence),
            (
                "routing.overconfidence_threshold",
                self.routing.overconfidence_threshold,
            ),
        ];
        for (field, value) in unit_fields {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigValidationError::InvalidValue {
                    field: field.into(),
                    message: "must be between 0 and 1".into(),
                });
            }
        }

        if self.routing.confirm_confidence > self.routing.auto_route_confidence {
            return Err(ConfigValidationError::InvalidValue {
                field: "routing.confirm_confidence".into(),
                message: "must not exceed routing.auto_route_confidence".into(),
            });
        }

        match self.confidence.decay.curve {
            DecayCurve::Linear { per_day } if per_day < 0.0 => {
                return Err(ConfigValidationError::InvalidValue {
                    field: "confidence.decay.per_day".into(),
                    message: "must be non-negative".into(),
                });
            }
            DecayCurve::Exponential { half_life_days } if half_life_days <= 0.0 => {
                return Err(ConfigValidationError::InvalidValue {
                    field: "confidence.decay.half_life_days".into(),
                    message: "must be positive".into(),
                });
            }
            _ => {}
        }

        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
