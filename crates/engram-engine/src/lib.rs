//! Tiered memory and pattern-learning engine.
//!
//! Persistent, invariant-protected store backing an assistant's memory
//! across interactions:
//!
//! - **Tier 1** (`conversation`): bounded FIFO queue of active
//!   conversations with gap-free message history and token search
//! - **Tier 2** (`pattern`): durable confidence-scored patterns with
//!   occurrence-gated admission and tunable decay
//! - **protection**: backup-validate-commit-rollback wrapper around
//!   every tier mutation
//! - **routing**: safety gate classifying automated decisions
//! - **anomaly**: append-only review queue for suspicious scores
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        MemoryEngine                          │
//! │  ┌─────────────────┐   evict + extract   ┌────────────────┐  │
//! │  │     Tier 1      │────────────────────▶│     Tier 2     │  │
//! │  │ conversations   │                     │    patterns    │  │
//! │  └────────┬────────┘                     └───────┬────────┘  │
//! │           │ ProtectionGuard                      │ Guard     │
//! │           ▼                                      ▼           │
//! │  backup ▶ apply ▶ validate ▶ commit     confidence gates     │
//! │           │                                      │           │
//! │           └───────────────┬──────────────────────┘           │
//! │                           ▼                                  │
//! │              routing gate / anomaly queue                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All operations are synchronous and short-lived; mutations are
//! serialized per store and readers only ever observe committed state.

pub mod anomaly;
pub mod conversation;
pub mod error;
pub mod pattern;
pub mod protection;
pub mod routing;

mod engine;

// Re-export main engine types
pub use anomaly::{AnomalyQueue, AnomalyStats};
pub use conversation::{
    AddOutcome, ConversationMatch, ConversationStore, EvictedConversation, EvictionHook,
    ExtractedPattern,
};
pub use engine::MemoryEngine;
pub use error::{EngineError, EngineResult, InvariantViolation};
pub use pattern::{
    confidence::{AnomalySignal, ConfidenceOutcome},
    DecayReport, PatternMatch, PatternSearchOutcome, PatternStore,
};
pub use protection::{Phase, ProtectionGuard, SnapshotRing, TableSpec, TierOps, TierSnapshot};
pub use routing::{RoutingAction, RoutingDecision, SafetyLevel};

// Re-export the storage layer the engine is built on
pub use engram_core::{config, types, Database, EngineConfig};
