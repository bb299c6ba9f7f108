//! Main engine entry point.
//!
//! Ties the tier stores, the routing gate and the anomaly queue together
//! behind one struct. Each engine owns its database handle and its own
//! protection guards, so tests get a fresh, isolated engine per instance
//! and nothing is process-global.

use std::sync::Arc;

use tracing::info;

use engram_core::types::{
    Anomaly, AnomalyKind, AnomalySeverity, AnomalyStatus, Conversation, ConversationStatus,
    Message, MessageRole, Pattern, PatternCategory,
};
use engram_core::{Database, EngineConfig};

use crate::anomaly::{AnomalyQueue, AnomalyStats};
use crate::conversation::{
    AddOutcome, ConversationMatch, ConversationStore, EvictionHook,
};
use crate::error::{EngineError, EngineResult};
use crate::pattern::{DecayReport, PatternSearchOutcome, PatternStore};
use crate::routing::{self, RoutingAction, RoutingDecision};

/// The tiered memory and pattern-learning engine.
///
/// # Example
///
/// ```no_run
/// use engram_core::EngineConfig;
/// use engram_engine::MemoryEngine;
///
/// fn example() -> anyhow::Result<()> {
///     let engine = MemoryEngine::new(EngineConfig::default())?;
///
///     let outcome = engine.add_conversation("deploy pipeline", None)?;
///     engine.append_message(
///         &outcome.id,
///         engram_core::types::MessageRole::User,
///         "the staging deploy failed again",
///         None,
///     )?;
///
///     let matches = engine.search_conversations("deploy")?;
///     println!("{} match(es)", matches.len());
///     Ok(())
/// }
/// ```
pub struct MemoryEngine {
    config: EngineConfig,
    db: Arc<Database>,
    conversations: ConversationStore,
    patterns: PatternStore,
    anomalies: AnomalyQueue,
}

impl MemoryEngine {
    /// Create an engine backed by the configured database path, or the
    /// auto-discovered one if no path is set.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate().map_err(engram_core::Error::Config)?;
        let db = match &config.database_path {
            Some(path) => Database::open_path(path),
            None => Database::open(),
        }
        .map_err(EngineError::Core)?;
        Self::with_database(config, Arc::new(db))
    }

    /// Create an engine over an in-memory database.
    pub fn in_memory(config: EngineConfig) -> EngineResult<Self> {
        config.validate().map_err(engram_core::Error::Config)?;
        let db = Database::open_in_memory().map_err(EngineError::Core)?;
        Self::with_database(config, Arc::new(db))
    }

    fn with_database(config: EngineConfig, db: Arc<Database>) -> EngineResult<Self> {
        let anomalies = AnomalyQueue::new(db.clone());
        let conversations = ConversationStore::new(
            db.clone(),
            config.conversation.clone(),
            &config.protection,
        );
        let patterns = PatternStore::new(
            db.clone(),
            config.confidence.clone(),
            &config.protection,
            anomalies.clone(),
        );
        Ok(Self {
            config,
            db,
            conversations,
            patterns,
            anomalies,
        })
    }

    /// Inject the eviction callback that distills expiring conversations
    /// into Tier 2 patterns.
    pub fn with_eviction_hook(mut self, hook: Arc<dyn EvictionHook>) -> Self {
        self.conversations.set_eviction_hook(hook);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The Tier 1 store.
    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    /// The Tier 2 store.
    pub fn patterns(&self) -> &PatternStore {
        &self.patterns
    }

    /// The anomaly review queue.
    pub fn anomalies(&self) -> &AnomalyQueue {
        &self.anomalies
    }

    // ─────────────────────────────────────────────────────────────────────
    // Ingestion API
    // ─────────────────────────────────────────────────────────────────────

    /// Open a conversation. Anything evicted to make room is run through
    /// the eviction hook, and extracted patterns are observed into Tier 2.
    pub fn add_conversation(
        &self,
        topic: impl Into<String>,
        intent: Option<String>,
    ) -> EngineResult<AddOutcome> {
        let outcome = self.conversations.add_conversation(topic, intent)?;
        for evicted in &outcome.evicted {
            if let Some(extracted) = &evicted.extracted {
                let pattern = self.patterns.observe_pattern(
                    &extracted.name,
                    extracted.category,
                    extracted.confidence_hint,
                )?;
                info!(
                    conversation_id = %evicted.conversation.id,
                    pattern_id = %pattern.id,
                    "evicted conversation distilled into pattern"
                );
            }
        }
        Ok(outcome)
    }

    /// Append a message to a conversation.
    pub fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: impl Into<String>,
        reply_to: Option<String>,
    ) -> EngineResult<Message> {
        self.conversations
            .append_message(conversation_id, role, content, reply_to)
    }

    /// Record one observation of a pattern.
    pub fn observe_pattern(
        &self,
        name: &str,
        category: PatternCategory,
        raw_confidence_hint: f64,
    ) -> EngineResult<Pattern> {
        self.patterns
            .observe_pattern(name, category, raw_confidence_hint)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Query API
    // ─────────────────────────────────────────────────────────────────────

    /// The `n` most recently positioned active conversations.
    pub fn get_recent(&self, n: usize) -> EngineResult<Vec<Conversation>> {
        self.conversations.get_recent(n)
    }

    /// Token search over conversation topics and message content.
    pub fn search_conversations(&self, text: &str) -> EngineResult<Vec<ConversationMatch>> {
        self.conversations.search(text)
    }

    /// Token search over patterns; appends a search record.
    pub fn search_patterns(
        &self,
        query: &str,
        min_confidence: f64,
    ) -> EngineResult<PatternSearchOutcome> {
        self.patterns.search_patterns(query, min_confidence)
    }

    /// Anomaly counts by kind, severity and status.
    pub fn anomaly_stats(&self) -> EngineResult<AnomalyStats> {
        self.anomalies.stats()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Routing & maintenance
    // ─────────────────────────────────────────────────────────────────────

    /// Classify a proposed automated decision. Blocked decisions are
    /// routed to the anomaly queue, never executed.
    pub fn evaluate_routing(
        &self,
        confidence: f64,
        occurrences: u32,
    ) -> EngineResult<RoutingDecision> {
        let decision = routing::evaluate(&self.config.routing, confidence, occurrences);
        if decision.action == RoutingAction::Blocked {
            self.anomalies.log(
                AnomalyKind::RoutingOverconfidenceBlock,
                AnomalySeverity::High,
                format!(
                    "routing blocked: confidence {confidence:.2} with {occurrences} occurrence(s)"
                ),
                Some(serde_json::json!({
                    "confidence": confidence,
                    "occurrences": occurrences,
                })),
            )?;
        }
        Ok(decision)
    }

    /// Decay the confidence of Tier 2 entities idle past the threshold.
    pub fn decay_unused(&self, threshold_days: u32) -> EngineResult<DecayReport> {
        self.patterns.decay_unused(threshold_days)
    }

    /// Administratively delete a pattern. Never happens implicitly.
    pub fn delete_pattern(&self, pattern_id: &str) -> EngineResult<()> {
        self.patterns.delete_pattern(pattern_id)
    }

    /// Move a conversation forward in its lifecycle.
    pub fn set_conversation_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> EngineResult<Conversation> {
        self.conversations.set_status(conversation_id, status)
    }

    /// Close a pending anomaly after manual review.
    pub fn review_anomaly(
        &self,
        id: &str,
        new_status: AnomalyStatus,
        notes: Option<String>,
    ) -> EngineResult<Anomaly> {
        self.anomalies.review(id, new_status, notes)
    }

    /// Clear write halts left behind by rollback failures. Manual
    /// intervention only.
    pub fn clear_halts(&self) {
        self.conversations.guard().clear_halt();
        self.patterns.guard().clear_halt();
    }

    /// Check database connectivity.
    pub fn ping(&self) -> EngineResult<()> {
        self.db.ping().map_err(EngineError::Core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ExtractedPattern;
    use engram_core::config::ConversationConfig;

    fn engine() -> MemoryEngine {
        MemoryEngine::in_memory(EngineConfig::default()).unwrap()
    }

    struct DistillingHook;

    impl EvictionHook for DistillingHook {
        fn on_evict(
            &self,
            conversation: &Conversation,
            _messages: &[Message],
        ) -> Option<ExtractedPattern> {
            Some(ExtractedPattern {
                name: format!("habit: {}", conversation.topic),
                category: PatternCategory::Workflow,
                confidence_hint: 0.4,
            })
        }
    }

    #[test]
    fn test_eviction_feeds_tier2() {
        let config = EngineConfig {
            conversation: ConversationConfig { max_active: 1 },
            ..Default::default()
        };
        let engine = MemoryEngine::in_memory(config)
            .unwrap()
            .with_eviction_hook(Arc::new(DistillingHook));

        engine.add_conversation("nightly build triage", None).unwrap();
        let outcome = engine.add_conversation("weekly release", None).unwrap();
        assert_eq!(outcome.evicted.len(), 1);

        let pattern = engine
            .patterns()
            .get_pattern_by_name("habit: nightly build triage")
            .unwrap()
            .unwrap();
        assert_eq!(pattern.usage_count, 1);
        assert!(pattern.confidence <= 0.50);
    }

    #[test]
    fn test_observe_then_search_round_trip() {
        let engine = engine();
        engine
            .observe_pattern("foo", PatternCategory::Workflow, 0.4)
            .unwrap();

        let outcome = engine.search_patterns("foo", 0.0).unwrap();
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].pattern.name, "foo");
    }

    #[test]
    fn test_spike_observation_logs_exactly_one_anomaly() {
        let engine = engine();
        let pattern = engine
            .observe_pattern("overconfident", PatternCategory::Intent, 0.99)
            .unwrap();
        assert!(pattern.confidence <= 0.70);

        let pending = engine.anomalies().list(Some(AnomalyStatus::Pending)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, AnomalyKind::HighConfidenceLowOccurrences);
        assert_eq!(pending[0].severity, AnomalySeverity::High);
    }

    #[test]
    fn test_blocked_routing_reaches_the_queue() {
        let engine = engine();
        let decision = engine.evaluate_routing(0.98, 1).unwrap();
        assert_eq!(decision.action, RoutingAction::Blocked);

        let stats = engine.anomaly_stats().unwrap();
        assert_eq!(
            stats.by_kind.get("routing-overconfidence-block"),
            Some(&1)
        );
    }

    #[test]
    fn test_routing_spec_scenarios() {
        let engine = engine();
        use crate::routing::SafetyLevel;

        let d = engine.evaluate_routing(0.95, 12).unwrap();
        assert_eq!((d.level, d.action), (SafetyLevel::High, RoutingAction::AutoRoute));

        let d = engine.evaluate_routing(0.95, 2).unwrap();
        assert_eq!((d.level, d.action), (SafetyLevel::Low, RoutingAction::Fallback));

        let d = engine.evaluate_routing(0.98, 1).unwrap();
        assert_eq!((d.level, d.action), (SafetyLevel::Anomaly, RoutingAction::Blocked));
    }

    #[test]
    fn test_full_turn_flow() {
        let engine = engine();
        let outcome = engine.add_conversation("cache invalidation", None).unwrap();
        engine
            .append_message(&outcome.id, MessageRole::User, "the cache is stale", None)
            .unwrap();
        engine
            .append_message(&outcome.id, MessageRole::Assistant, "invalidate on write", None)
            .unwrap();

        let recent = engine.get_recent(5).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message_count, 2);

        let matches = engine.search_conversations("stale").unwrap();
        assert_eq!(matches.len(), 1);

        let archived = engine
            .set_conversation_status(&outcome.id, ConversationStatus::Archived)
            .unwrap();
        assert_eq!(archived.status, ConversationStatus::Archived);
        assert!(engine.get_recent(5).unwrap().is_empty());
    }

    #[test]
    fn test_state_survives_reopen() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engram.db");
        let config = EngineConfig::default().with_database_path(&path);

        let conversation_id = {
            let engine = MemoryEngine::new(config.clone()).unwrap();
            let outcome = engine.add_conversation("durable topic", None).unwrap();
            engine
                .append_message(&outcome.id, MessageRole::User, "remember this", None)
                .unwrap();
            engine
                .observe_pattern("durable pattern", PatternCategory::Workflow, 0.4)
                .unwrap();
            outcome.id
        };

        let engine = MemoryEngine::new(config).unwrap();
        let recent = engine.get_recent(5).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, conversation_id);

        // The commit-time index was persisted with the data.
        assert_eq!(engine.search_conversations("remember").unwrap().len(), 1);
        assert_eq!(engine.search_patterns("durable", 0.0).unwrap().matches.len(), 1);
    }

    #[test]
    fn test_engine_rejects_invalid_config() {
        let config = EngineConfig {
            conversation: ConversationConfig { max_active: 0 },
            ..Default::default()
        };
        assert!(MemoryEngine::in_memory(config).is_err());
    }
}
