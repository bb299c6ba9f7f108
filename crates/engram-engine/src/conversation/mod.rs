//! Tier 1: bounded conversation queue with message history.
//!
//! Active conversations form a FIFO queue of at most `max_active`
//! entries; a new conversation enters at position 1 and pushes everything
//! else one position deeper. When the queue is full the deepest
//! conversation is handed to the eviction hook (so expiring short-term
//! memory can be distilled into a Tier 2 pattern) and then removed.
//!
//! Every mutation runs under the Tier 1 protection guard.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use engram_core::config::{ConversationConfig, ProtectionConfig};
use engram_core::text::{coverage, tokenize, unique_tokens};
use engram_core::types::{Conversation, ConversationStatus, Message, MessageRole, PatternCategory};
use engram_core::Database;

use crate::error::{EngineError, EngineResult, InvariantViolation};
use crate::protection::{ProtectionGuard, TableSpec, TierOps};

/// Tables owned by Tier 1, parents before children.
const TIER1_TABLES: &[TableSpec] = &[
    TableSpec {
        name: "conversations",
        order_by: "id",
    },
    TableSpec {
        name: "messages",
        order_by: "id",
    },
    TableSpec {
        name: "conversation_fts",
        order_by: "conversation_id, field, token",
    },
];

/// Pattern distilled from an expiring conversation.
#[derive(Debug, Clone)]
pub struct ExtractedPattern {
    pub name: String,
    pub category: PatternCategory,
    pub confidence_hint: f64,
}

/// Callback invoked before an evicted conversation is discarded.
///
/// Extraction logic lives outside the engine; the engine only forwards
/// the returned pattern to the Tier 2 store. The hook runs inside the
/// Tier 1 mutation and must not call back into the engine.
pub trait EvictionHook: Send + Sync {
    fn on_evict(&self, conversation: &Conversation, messages: &[Message])
        -> Option<ExtractedPattern>;
}

/// A conversation removed from the queue, with whatever the hook made of it.
#[derive(Debug, Clone)]
pub struct EvictedConversation {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
    pub extracted: Option<ExtractedPattern>,
}

/// Result of `add_conversation`.
#[derive(Debug, Clone)]
pub struct AddOutcome {
    pub id: String,
    pub evicted: Vec<EvictedConversation>,
}

/// One ranked hit from `search`.
#[derive(Debug, Clone)]
pub struct ConversationMatch {
    pub conversation: Conversation,
    /// Query token coverage in [0, 1].
    pub score: f64,
    /// Total index hits behind the match, used as a tie-breaker.
    pub hits: i64,
}

/// The Tier 1 store.
pub struct ConversationStore {
    db: Arc<Database>,
    guard: ProtectionGuard,
    config: ConversationConfig,
    hook: Option<Arc<dyn EvictionHook>>,
}

impl ConversationStore {
    pub fn new(
        db: Arc<Database>,
        config: ConversationConfig,
        protection: &ProtectionConfig,
    ) -> Self {
        Self {
            db,
            guard: ProtectionGuard::new("tier1", protection),
            config,
            hook: None,
        }
    }

    /// Inject the eviction hook.
    pub fn set_eviction_hook(&mut self, hook: Arc<dyn EvictionHook>) {
        self.hook = Some(hook);
    }

    /// The store's protection guard, for phase/halt inspection.
    pub fn guard(&self) -> &ProtectionGuard {
        &self.guard
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────

    /// Create a conversation at queue position 1, evicting from the deep
    /// end of the queue if the active count would exceed the maximum.
    pub fn add_conversation(
        &self,
        topic: impl Into<String>,
        intent: Option<String>,
    ) -> EngineResult<AddOutcome> {
        let id = Uuid::new_v4().to_string();
        let topic = topic.into();
        let now = Utc::now().timestamp_millis();
        let max_active = self.config.max_active as u32;
        let hook = self.hook.clone();

        let evicted = self.guard.mutate(&self.db, self, |txn| {
            let mut evicted = Vec::new();
            loop {
                let active: u32 = txn.query_row(
                    "SELECT COUNT(*) FROM conversations WHERE status = 'active'",
                    [],
                    |row| row.get(0),
                )?;
                if active < max_active {
                    break;
                }

                let victim = txn
                    .query_row(
                        "SELECT id, topic, intent, status, queue_position, message_count, created_at, updated_at
                         FROM conversations WHERE status = 'active'
                         ORDER BY queue_position DESC LIMIT 1",
                        [],
                        map_conversation,
                    )?;
                let messages = load_messages(txn, &victim.id)?;
                let extracted = hook
                    .as_ref()
                    .and_then(|h| h.on_evict(&victim, &messages));

                // Cascade removes the messages.
                txn.execute("DELETE FROM conversations WHERE id = ?1", params![victim.id])?;
                info!(
                    conversation_id = %victim.id,
                    extracted = extracted.is_some(),
                    "evicted conversation from the queue"
                );
                evicted.push(EvictedConversation {
                    conversation: victim,
                    messages,
                    extracted,
                });
            }

            txn.execute(
                "UPDATE conversations SET queue_position = queue_position + 1 WHERE status = 'active'",
                [],
            )?;
            txn.execute(
                "INSERT INTO conversations (id, topic, intent, status, queue_position, message_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'active', 1, 0, ?4, ?4)",
                params![id, topic, intent, now],
            )?;
            debug!(conversation_id = %id, "conversation added at position 1");
            Ok(evicted)
        })?;

        Ok(AddOutcome { id, evicted })
    }

    /// Append a message with the next contiguous sequence number.
    pub fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: impl Into<String>,
        reply_to: Option<String>,
    ) -> EngineResult<Message> {
        let message_id = Uuid::new_v4().to_string();
        let content = content.into();
        let now = Utc::now().timestamp_millis();
        let conversation_id = conversation_id.to_string();

        self.guard.mutate(&self.db, self, |txn| {
            let conversation = load_conversation(txn, &conversation_id)?
                .ok_or_else(|| EngineError::not_found("Conversation", &conversation_id))?;

            let expected = conversation.message_count + 1;
            let stored_max: u32 = txn.query_row(
                "SELECT COALESCE(MAX(sequence_number), 0) FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )?;
            if stored_max + 1 != expected {
                return Err(EngineError::SequenceGap {
                    conversation_id: conversation_id.clone(),
                    expected,
                    found: stored_max,
                });
            }

            if let Some(ref parent) = reply_to {
                let exists: bool = txn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1 AND conversation_id = ?2)",
                    params![parent, conversation_id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Err(InvariantViolation::DanglingReference {
                        entity: "message",
                        id: message_id.clone(),
                        referenced: parent.clone(),
                    }
                    .into());
                }
            }

            txn.execute(
                "INSERT INTO messages (id, conversation_id, sequence_number, role, content, reply_to, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    message_id,
                    conversation_id,
                    expected,
                    role.as_str(),
                    content,
                    reply_to,
                    now
                ],
            )?;
            txn.execute(
                "UPDATE conversations SET message_count = ?1, updated_at = ?2 WHERE id = ?3",
                params![expected, now, conversation_id],
            )?;

            Ok(Message {
                id: message_id.clone(),
                conversation_id: conversation_id.clone(),
                sequence_number: expected,
                role,
                content: content.clone(),
                reply_to: reply_to.clone(),
                created_at: millis_to_datetime(now),
            })
        })
    }

    /// Move a conversation forward in its lifecycle.
    ///
    /// Completing or archiving removes it from the active queue and
    /// compacts the remaining positions.
    pub fn set_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> EngineResult<Conversation> {
        let conversation_id = conversation_id.to_string();
        let now = Utc::now().timestamp_millis();

        self.guard.mutate(&self.db, self, |txn| {
            let conversation = load_conversation(txn, &conversation_id)?
                .ok_or_else(|| EngineError::not_found("Conversation", &conversation_id))?;

            if conversation.status == status {
                return Ok(conversation);
            }

            let allowed = matches!(
                (conversation.status, status),
                (ConversationStatus::Active, ConversationStatus::Complete)
                    | (ConversationStatus::Active, ConversationStatus::Archived)
                    | (ConversationStatus::Complete, ConversationStatus::Archived)
            );
            if !allowed {
                return Err(EngineError::InvalidTransition {
                    entity: "Conversation",
                    id: conversation_id.clone(),
                    from: conversation.status.to_string(),
                    to: status.to_string(),
                });
            }

            txn.execute(
                "UPDATE conversations SET status = ?1, queue_position = NULL, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, conversation_id],
            )?;
            if let Some(position) = conversation.queue_position {
                txn.execute(
                    "UPDATE conversations SET queue_position = queue_position - 1
                     WHERE status = 'active' AND queue_position > ?1",
                    params![position],
                )?;
            }

            load_conversation(txn, &conversation_id)?
                .ok_or_else(|| EngineError::not_found("Conversation", &conversation_id))
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────

    /// Get a conversation by id.
    pub fn get(&self, id: &str) -> EngineResult<Option<Conversation>> {
        let conn = self.db.lock().map_err(EngineError::Core)?;
        load_conversation(&conn, id)
    }

    /// Messages of a conversation in sequence order.
    pub fn messages(&self, conversation_id: &str) -> EngineResult<Vec<Message>> {
        let conn = self.db.lock().map_err(EngineError::Core)?;
        load_messages(&conn, conversation_id)
    }

    /// The `n` most recently positioned active conversations.
    pub fn get_recent(&self, n: usize) -> EngineResult<Vec<Conversation>> {
        let conn = self.db.lock().map_err(EngineError::Core)?;
        let mut stmt = conn.prepare(
            "SELECT id, topic, intent, status, queue_position, message_count, created_at, updated_at
             FROM conversations WHERE status = 'active'
             ORDER BY queue_position ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![n as i64], map_conversation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Token search across topics and message content.
    ///
    /// Served from the commit-time index, so results reflect exactly the
    /// committed state.
    pub fn search(&self, text: &str) -> EngineResult<Vec<ConversationMatch>> {
        let tokens = unique_tokens(text);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.db.lock().map_err(EngineError::Core)?;
        let placeholders = vec!["?"; tokens.len()].join(", ");
        let sql = format!(
            "SELECT conversation_id, COUNT(DISTINCT token), SUM(hits)
             FROM conversation_fts WHERE token IN ({placeholders})
             GROUP BY conversation_id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let grouped = stmt
            .query_map(rusqlite::params_from_iter(tokens.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, usize>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut matches = Vec::with_capacity(grouped.len());
        for (conversation_id, matched, hits) in grouped {
            if let Some(conversation) = load_conversation(&conn, &conversation_id)? {
                matches.push(ConversationMatch {
                    conversation,
                    score: coverage(&tokens, matched),
                    hits,
                });
            }
        }
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.hits.cmp(&a.hits))
        });
        Ok(matches)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Protection hooks
// ─────────────────────────────────────────────────────────────────────────────

impl TierOps for ConversationStore {
    fn tables(&self) -> &'static [TableSpec] {
        TIER1_TABLES
    }

    fn validate(&self, txn: &Transaction) -> EngineResult<()> {
        let max_active = self.config.max_active as u32;

        // Statuses recognized, positions only on active conversations.
        let mut stmt =
            txn.prepare("SELECT id, status, queue_position, message_count FROM conversations")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<u32>>(2)?,
                    row.get::<_, u32>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut active_positions = Vec::new();
        let mut recorded_counts: HashMap<String, u32> = HashMap::new();
        for (id, status, position, message_count) in rows {
            let parsed = ConversationStatus::from_str(&status).ok_or_else(|| {
                InvariantViolation::UnrecognizedValue {
                    entity: "conversation",
                    id: id.clone(),
                    field: "status",
                    value: status.clone(),
                }
            })?;
            match parsed {
                ConversationStatus::Active => active_positions.push(position.unwrap_or(0)),
                _ => {
                    if let Some(position) = position {
                        return Err(InvariantViolation::PositionOnInactive {
                            id,
                            status,
                            position,
                        }
                        .into());
                    }
                }
            }
            recorded_counts.insert(id, message_count);
        }

        let count = active_positions.len() as u32;
        if count > max_active {
            return Err(InvariantViolation::ActiveCountExceeded {
                count,
                max: max_active,
            }
            .into());
        }
        let mut sorted = active_positions.clone();
        sorted.sort_unstable();
        if sorted.iter().copied().ne(1..=count) {
            return Err(InvariantViolation::QueuePositionsNotPermutation {
                count,
                found: sorted,
            }
            .into());
        }

        // Roles recognized.
        let mut stmt = txn.prepare("SELECT id, role FROM messages")?;
        let roles = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (id, role) in roles {
            if MessageRole::from_str(&role).is_none() {
                return Err(InvariantViolation::UnrecognizedValue {
                    entity: "message",
                    id,
                    field: "role",
                    value: role,
                }
                .into());
            }
        }

        // Sequence numbers form a gap-free run from 1 matching message_count.
        let mut stmt = txn.prepare(
            "SELECT conversation_id, COUNT(*), MIN(sequence_number), MAX(sequence_number)
             FROM messages GROUP BY conversation_id",
        )?;
        let groups = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, u32>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut actual_counts: HashMap<String, u32> = HashMap::new();
        for (conversation_id, total, min_seq, max_seq) in groups {
            if min_seq != 1 || max_seq != total {
                return Err(InvariantViolation::SequenceNotContiguous {
                    conversation_id,
                    detail: format!("{total} messages spanning {min_seq}..={max_seq}"),
                }
                .into());
            }
            actual_counts.insert(conversation_id, total);
        }
        for (conversation_id, recorded) in &recorded_counts {
            let actual = actual_counts.get(conversation_id).copied().unwrap_or(0);
            if *recorded != actual {
                return Err(InvariantViolation::MessageCountMismatch {
                    conversation_id: conversation_id.clone(),
                    recorded: *recorded,
                    actual,
                }
                .into());
            }
        }

        // reply_to references resolve within the same conversation.
        let mut stmt = txn.prepare(
            "SELECT m.id, m.reply_to FROM messages m
             WHERE m.reply_to IS NOT NULL
               AND NOT EXISTS (
                   SELECT 1 FROM messages p
                   WHERE p.id = m.reply_to AND p.conversation_id = m.conversation_id
               )",
        )?;
        let dangling = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if let Some((id, referenced)) = dangling.into_iter().next() {
            return Err(InvariantViolation::DanglingReference {
                entity: "message",
                id,
                referenced,
            }
            .into());
        }

        Ok(())
    }

    fn reindex(&self, txn: &Transaction) -> EngineResult<()> {
        txn.execute("DELETE FROM conversation_fts", [])?;

        let mut counts: HashMap<(String, String, &'static str), i64> = HashMap::new();

        let mut stmt = txn.prepare("SELECT id, topic FROM conversations")?;
        let topics = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (id, topic) in topics {
            for token in tokenize(&topic) {
                *counts.entry((id.clone(), token, "topic")).or_insert(0) += 1;
            }
        }

        let mut stmt = txn.prepare("SELECT conversation_id, content FROM messages")?;
        let contents = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (conversation_id, content) in contents {
            for token in tokenize(&content) {
                *counts
                    .entry((conversation_id.clone(), token, "message"))
                    .or_insert(0) += 1;
            }
        }

        let mut stmt = txn.prepare(
            "INSERT INTO conversation_fts (conversation_id, token, field, hits) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for ((conversation_id, token, field), hits) in counts {
            stmt.execute(params![conversation_id, token, field, hits])?;
        }

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn parse_column<T>(
    index: usize,
    value: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            format!("unrecognized value '{value}'").into(),
        )
    })
}

fn map_conversation(row: &Row) -> rusqlite::Result<Conversation> {
    let status: String = row.get(3)?;
    Ok(Conversation {
        id: row.get(0)?,
        topic: row.get(1)?,
        intent: row.get(2)?,
        status: parse_column(3, &status, ConversationStatus::from_str)?,
        queue_position: row.get(4)?,
        message_count: row.get(5)?,
        created_at: millis_to_datetime(row.get(6)?),
        updated_at: millis_to_datetime(row.get(7)?),
    })
}

fn map_message(row: &Row) -> rusqlite::Result<Message> {
    let role: String = row.get(3)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sequence_number: row.get(2)?,
        role: parse_column(3, &role, MessageRole::from_str)?,
        content: row.get(4)?,
        reply_to: row.get(5)?,
        created_at: millis_to_datetime(row.get(6)?),
    })
}

fn load_conversation(conn: &Connection, id: &str) -> EngineResult<Option<Conversation>> {
    let conversation = conn
        .query_row(
            "SELECT id, topic, intent, status, queue_position, message_count, created_at, updated_at
             FROM conversations WHERE id = ?1",
            params![id],
            map_conversation,
        )
        .optional()?;
    Ok(conversation)
}

fn load_messages(conn: &Connection, conversation_id: &str) -> EngineResult<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, sequence_number, role, content, reply_to, created_at
         FROM messages WHERE conversation_id = ?1 ORDER BY sequence_number ASC",
    )?;
    let messages = stmt
        .query_map(params![conversation_id], map_message)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(messages)
}
