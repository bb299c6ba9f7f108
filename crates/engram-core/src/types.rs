//! Entity types for the tiered memory engine.
//!
//! Every closed vocabulary is a real enum with `as_str`/`from_str`;
//! unrecognized strings are rejected where rows are loaded, never deep
//! inside store logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Tier 1: Conversations & Messages
// ─────────────────────────────────────────────────────────────────────────────

/// Conversation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Complete,
    Archived,
}

impl ConversationStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "complete" => Some(Self::Complete),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Complete => "complete",
            Self::Archived => "archived",
        }
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Message author role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A short-term conversation in the bounded FIFO queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub topic: String,
    pub intent: Option<String>,
    pub status: ConversationStatus,
    /// 1..count among active conversations, None otherwise.
    pub queue_position: Option<u32>,
    pub message_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A message owned by exactly one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    /// Contiguous from 1 within the owning conversation.
    pub sequence_number: u32,
    pub role: MessageRole,
    pub content: String,
    /// Optional reference to an earlier message in the same conversation.
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tier 2: Patterns & secondary entities
// ─────────────────────────────────────────────────────────────────────────────

/// Pattern category (closed enumeration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternCategory {
    Workflow,
    CodePattern,
    UiPattern,
    Architectural,
    Validation,
    Intent,
    FileRelationship,
}

impl PatternCategory {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "workflow" => Some(Self::Workflow),
            "code-pattern" => Some(Self::CodePattern),
            "ui-pattern" => Some(Self::UiPattern),
            "architectural" => Some(Self::Architectural),
            "validation" => Some(Self::Validation),
            "intent" => Some(Self::Intent),
            "file-relationship" => Some(Self::FileRelationship),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::CodePattern => "code-pattern",
            Self::UiPattern => "ui-pattern",
            Self::Architectural => "architectural",
            Self::Validation => "validation",
            Self::Intent => "intent",
            Self::FileRelationship => "file-relationship",
        }
    }

    /// All recognized categories, for boundary validation.
    pub fn all() -> &'static [PatternCategory] {
        &[
            Self::Workflow,
            Self::CodePattern,
            Self::UiPattern,
            Self::Architectural,
            Self::Validation,
            Self::Intent,
            Self::FileRelationship,
        ]
    }
}

impl std::fmt::Display for PatternCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A confidence-scored unit of reusable knowledge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub name: String,
    pub category: PatternCategory,
    /// Always within [0.0, 1.0], bounded by the confidence engine.
    pub confidence: f64,
    /// Occurrence counter consumed by the confidence gates.
    pub usage_count: u32,
    pub success_count: u32,
    pub failure_count: u32,
    pub tags: Vec<String>,
    /// Weak references to related pattern ids.
    pub related: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// Co-modification link between two files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRelationship {
    pub id: String,
    pub source_path: String,
    pub target_path: String,
    pub co_modification_count: u32,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// Learned mapping from a user phrase to a resolved intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentPattern {
    pub id: String,
    pub phrase: String,
    pub resolved_intent: String,
    pub usage_count: u32,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// A remembered correction (what was wrong, what replaced it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub id: String,
    pub original: String,
    pub corrected: String,
    pub usage_count: u32,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// Outcome of a pattern lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchOutcome {
    /// A sufficient match existed.
    Reuse,
    /// No match above the requested confidence; caller should create.
    Create,
}

impl SearchOutcome {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "reuse" => Some(Self::Reuse),
            "create" => Some(Self::Create),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reuse => "reuse",
            Self::Create => "create",
        }
    }
}

impl std::fmt::Display for SearchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only record of one pattern lookup. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSearch {
    pub id: String,
    pub query: String,
    pub matched_pattern_id: Option<String>,
    pub outcome: SearchOutcome,
    /// Confidence of the matched pattern at lookup time.
    pub confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Anomalies
// ─────────────────────────────────────────────────────────────────────────────

/// Anomaly classification (closed enumeration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnomalyKind {
    /// Confidence of 1.0 proposed without enough independent evidence.
    PerfectConfidenceInsufficientEvidence,
    /// Near-certain confidence proposed on a single observation.
    HighConfidenceLowOccurrences,
    /// Routing gate blocked an over-confident single-observation decision.
    RoutingOverconfidenceBlock,
}

impl AnomalyKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "perfect-confidence-insufficient-evidence" => {
                Some(Self::PerfectConfidenceInsufficientEvidence)
            }
            "high-confidence-low-occurrences" => Some(Self::HighConfidenceLowOccurrences),
            "routing-overconfidence-block" => Some(Self::RoutingOverconfidenceBlock),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerfectConfidenceInsufficientEvidence => {
                "perfect-confidence-insufficient-evidence"
            }
            Self::HighConfidenceLowOccurrences => "high-confidence-low-occurrences",
            Self::RoutingOverconfidenceBlock => "routing-overconfidence-block",
        }
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
}

impl AnomalySeverity {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for AnomalySeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyStatus {
    Pending,
    Resolved,
    Dismissed,
}

impl AnomalyStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "resolved" => Some(Self::Resolved),
            "dismissed" => Some(Self::Dismissed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Dismissed => "dismissed",
        }
    }
}

impl std::fmt::Display for AnomalyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A flagged confidence/occurrence combination awaiting manual review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: String,
    pub kind: AnomalyKind,
    pub severity: AnomalySeverity,
    pub description: String,
    pub context: Option<serde_json::Value>,
    pub status: AnomalyStatus,
    pub review_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        assert_eq!(
            ConversationStatus::from_str("active"),
            Some(ConversationStatus::Active)
        );
        assert_eq!(ConversationStatus::Archived.as_str(), "archived");
        assert_eq!(ConversationStatus::from_str("closed"), None);
    }

    #[test]
    fn test_category_round_trip() {
        for cat in PatternCategory::all() {
            assert_eq!(PatternCategory::from_str(cat.as_str()), Some(*cat));
        }
        assert_eq!(PatternCategory::from_str("misc"), None);
    }

    #[test]
    fn test_anomaly_kind_names() {
        assert_eq!(
            AnomalyKind::HighConfidenceLowOccurrences.as_str(),
            "high-confidence-low-occurrences"
        );
        assert_eq!(
            AnomalyKind::from_str("perfect-confidence-insufficient-evidence"),
            Some(AnomalyKind::PerfectConfidenceInsufficientEvidence)
        );
    }

    #[test]
    fn test_search_outcome() {
        assert_eq!(SearchOutcome::from_str("reuse"), Some(SearchOutcome::Reuse));
        assert_eq!(SearchOutcome::Create.to_string(), "create");
    }
}
