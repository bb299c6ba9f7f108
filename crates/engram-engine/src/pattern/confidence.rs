//! Confidence admission and decay.
//!
//! Pure arithmetic over (prior, proposal, occurrences). The gates exist
//! because a single noisy observation must never masquerade as
//! well-established knowledge; admission trades a little learning speed
//! for resistance to single-event false positives.

use serde_json::json;

use engram_core::config::{ConfidenceConfig, DecayConfig, DecayCurve};
use engram_core::types::{AnomalyKind, AnomalySeverity};

/// A suspicious combination flagged during admission.
///
/// Not an error: the observation still succeeds with a clamped value,
/// and the signal is routed to the anomaly queue.
#[derive(Debug, Clone)]
pub struct AnomalySignal {
    pub kind: AnomalyKind,
    pub severity: AnomalySeverity,
    pub description: String,
    pub context: serde_json::Value,
}

/// Result of admitting one observation.
#[derive(Debug, Clone)]
pub struct ConfidenceOutcome {
    /// The value to store, always within [0, 1].
    pub confidence: f64,
    pub signals: Vec<AnomalySignal>,
}

/// Admit a proposed confidence, applying the gates in order:
///
/// 1. occurrence gate: under-observed patterns are capped
/// 2. jump limiter: large increases over the prior are throttled
/// 3. perfection gate: 1.0 requires substantial evidence
/// 4. spike gate: near-certainty on a single observation is capped and flagged
pub fn admit(
    rules: &ConfidenceConfig,
    prior: Option<f64>,
    proposed: f64,
    occurrences: u32,
) -> ConfidenceOutcome {
    let raw = proposed;
    let mut value = proposed.clamp(0.0, 1.0);
    let mut signals = Vec::new();

    // 1. Occurrence gate
    if occurrences < rules.occurrence_gate_min {
        value = value.min(rules.occurrence_gate_ceiling);
    }

    // 2. Jump limiter
    if let Some(prior) = prior {
        if value - prior > rules.jump_threshold {
            value = value.min(prior + rules.max_jump_increase);
        }
    }

    // 3. Perfection gate
    if raw >= 1.0 && occurrences < rules.perfection_min_occurrences {
        value = value.min(rules.perfection_ceiling);
        signals.push(AnomalySignal {
            kind: AnomalyKind::PerfectConfidenceInsufficientEvidence,
            severity: AnomalySeverity::Medium,
            description: format!(
                "confidence 1.0 proposed with only {occurrences} observation(s)"
            ),
            context: json!({
                "proposed": raw,
                "occurrences": occurrences,
                "admitted": value,
            }),
        });
    }

    // 4. Single-evidence spike gate
    if raw > rules.spike_threshold && occurrences == 1 {
        value = value.min(rules.spike_ceiling);
        signals.push(AnomalySignal {
            kind: AnomalyKind::HighConfidenceLowOccurrences,
            severity: AnomalySeverity::High,
            description: format!(
                "confidence {raw:.2} proposed on a single observation"
            ),
            context: json!({
                "proposed": raw,
                "occurrences": occurrences,
                "admitted": value,
            }),
        });
    }

    ConfidenceOutcome {
        confidence: value.clamp(0.0, 1.0),
        signals,
    }
}

/// Decay a confidence value that has been idle past the threshold.
///
/// Never increases confidence; never drops below the configured floor.
pub fn decay(config: &DecayConfig, confidence: f64, days_past_threshold: f64) -> f64 {
    let days = days_past_threshold.max(0.0);
    let decayed = match config.curve {
        DecayCurve::Linear { per_day } => confidence - per_day * days,
        DecayCurve::Exponential { half_life_days } => {
            confidence * 0.5_f64.powf(days / half_life_days)
        }
    };
    decayed.max(config.floor).min(confidence).max(0.0)
}
