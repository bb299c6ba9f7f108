//! Routing safety gate.
//!
//! Classifies a proposed automated decision from its confidence and
//! occurrence evidence. Rules are checked top to bottom, first match
//! wins; the anomaly rule is checked first so an over-confident single
//! observation is never quietly treated as merely low confidence.

use serde::{Deserialize, Serialize};

use engram_core::config::RoutingConfig;

/// How much the evidence is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    High,
    Medium,
    Low,
    Anomaly,
}

impl SafetyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Anomaly => "anomaly",
        }
    }
}

impl std::fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the caller is allowed to do with the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingAction {
    /// Proceed without confirmation.
    AutoRoute,
    /// Ask before proceeding.
    Confirm,
    /// Use the non-automated path.
    Fallback,
    /// Do not execute; the decision goes to the anomaly queue.
    Blocked,
}

impl RoutingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoRoute => "auto_route",
            Self::Confirm => "confirm",
            Self::Fallback => "fallback",
            Self::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for RoutingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Gate output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub level: SafetyLevel,
    pub action: RoutingAction,
}

/// Evaluate the gate for one (confidence, occurrences) pair.
pub fn evaluate(config: &RoutingConfig, confidence: f64, occurrences: u32) -> RoutingDecision {
    if confidence > config.overconfidence_threshold && occurrences == 1 {
        return RoutingDecision {
            level: SafetyLevel::Anomaly,
            action: RoutingAction::Blocked,
        };
    }
    if occurrences < config.min_occurrences {
        return RoutingDecision {
            level: SafetyLevel::Low,
            action: RoutingAction::Fallback,
        };
    }
    if confidence >= config.auto_route_confidence {
        return RoutingDecision {
            level: SafetyLevel::High,
            action: RoutingAction::AutoRoute,
        };
    }
    if confidence >= config.confirm_confidence {
        return RoutingDecision {
            level: SafetyLevel::Medium,
            action: RoutingAction::Confirm,
        };
    }
    RoutingDecision {
        level: SafetyLevel::Low,
        action: RoutingAction::Fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(confidence: f64, occurrences: u32) -> RoutingDecision {
        evaluate(&RoutingConfig::default(), confidence, occurrences)
    }

    #[test]
    fn test_high_confidence_with_evidence_auto_routes() {
        let decision = gate(0.95, 12);
        assert_eq!(decision.level, SafetyLevel::High);
        assert_eq!(decision.action, RoutingAction::AutoRoute);
    }

    #[test]
    fn test_medium_confidence_confirms() {
        let decision = gate(0.75, 5);
        assert_eq!(decision.level, SafetyLevel::Medium);
        assert_eq!(decision.action, RoutingAction::Confirm);
    }

    #[test]
    fn test_low_occurrences_fall_back() {
        let decision = gate(0.95, 2);
        assert_eq!(decision.level, SafetyLevel::Low);
        assert_eq!(decision.action, RoutingAction::Fallback);
    }

    #[test]
    fn test_low_confidence_falls_back() {
        let decision = gate(0.4, 20);
        assert_eq!(decision.level, SafetyLevel::Low);
        assert_eq!(decision.action, RoutingAction::Fallback);
    }

    #[test]
    fn test_single_observation_overconfidence_is_blocked() {
        let decision = gate(0.98, 1);
        assert_eq!(decision.level, SafetyLevel::Anomaly);
        assert_eq!(decision.action, RoutingAction::Blocked);
    }

    #[test]
    fn test_anomaly_rule_takes_precedence_over_low_occurrences() {
        // Without the precedence rule this would read as plain Low/Fallback.
        let decision = gate(0.99, 1);
        assert_eq!(decision.level, SafetyLevel::Anomaly);

        // At exactly the threshold the spike rule does not fire.
        let decision = gate(0.95, 1);
        assert_eq!(decision.level, SafetyLevel::Low);
        assert_eq!(decision.action, RoutingAction::Fallback);
    }

    #[test]
    fn test_boundary_confidences() {
        assert_eq!(gate(0.85, 3).level, SafetyLevel::High);
        assert_eq!(gate(0.70, 3).level, SafetyLevel::Medium);
        assert_eq!(gate(0.6999, 3).level, SafetyLevel::Low);
    }
}
