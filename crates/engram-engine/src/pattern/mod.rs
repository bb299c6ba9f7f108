//! Tier 2: durable pattern store.
//!
//! Patterns, file relationships, intent patterns and corrections all keep
//! an occurrence counter and a confidence score; every score flows
//! through the admission gates in [`confidence`]. Lookups are served from
//! the commit-time token index and every lookup appends an immutable
//! `pattern_searches` record.
//!
//! Mutations run under the Tier 2 protection guard. Anomaly signals
//! raised during admission are logged to the review queue after the
//! mutation commits.

pub mod confidence;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use engram_core::config::{ConfidenceConfig, ProtectionConfig};
use engram_core::text::{coverage, tokenize, unique_tokens};
use engram_core::types::{
    Correction, FileRelationship, IntentPattern, Pattern, PatternCategory, PatternSearch,
    SearchOutcome,
};
use engram_core::Database;

use crate::anomaly::AnomalyQueue;
use crate::error::{EngineError, EngineResult, InvariantViolation};
use crate::protection::{ProtectionGuard, TableSpec, TierOps};

use confidence::AnomalySignal;

/// Tables owned by Tier 2.
const TIER2_TABLES: &[TableSpec] = &[
    TableSpec {
        name: "patterns",
        order_by: "id",
    },
    TableSpec {
        name: "file_relationships",
        order_by: "id",
    },
    TableSpec {
        name: "intent_patterns",
        order_by: "id",
    },
    TableSpec {
        name: "corrections",
        order_by: "id",
    },
    TableSpec {
        name: "pattern_searches",
        order_by: "id",
    },
    TableSpec {
        name: "pattern_fts",
        order_by: "pattern_id, field, token",
    },
];

/// One ranked hit from `search_patterns`.
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub pattern: Pattern,
    /// Query token coverage in [0, 1].
    pub score: f64,
    pub hits: i64,
}

/// Result of one pattern lookup, including the appended log record.
#[derive(Debug, Clone)]
pub struct PatternSearchOutcome {
    pub matches: Vec<PatternMatch>,
    pub record: PatternSearch,
}

/// Result of a decay pass.
#[derive(Debug, Clone, Default)]
pub struct DecayReport {
    /// Entities idle past the threshold.
    pub examined: usize,
    /// Entities whose confidence actually dropped.
    pub decayed: usize,
}

/// Occurrence-derived confidence proposal for entities whose only
/// evidence is their counter (file relationships, corrections).
fn occurrence_proposal(count: u32) -> f64 {
    (0.15 * count as f64).min(0.9)
}

/// The Tier 2 store.
pub struct PatternStore {
    db: Arc<Database>,
    guard: ProtectionGuard,
    config: ConfidenceConfig,
    anomalies: AnomalyQueue,
}

impl PatternStore {
    pub fn new(
        db: Arc<Database>,
        config: ConfidenceConfig,
        protection: &ProtectionConfig,
        anomalies: AnomalyQueue,
    ) -> Self {
        Self {
            db,
            guard: ProtectionGuard::new("tier2", protection),
            config,
            anomalies,
        }
    }

    /// The store's protection guard, for phase/halt inspection.
    pub fn guard(&self) -> &ProtectionGuard {
        &self.guard
    }

    // ─────────────────────────────────────────────────────────────────────
    // Observations
    // ─────────────────────────────────────────────────────────────────────

    /// Record one observation of a named pattern.
    ///
    /// Creates the pattern on first observation; otherwise bumps the
    /// occurrence counter and re-admits the confidence. The caller's hint
    /// is taken as the proposal; observations never lower an established
    /// score (reductions come from decay).
    pub fn observe_pattern(
        &self,
        name: &str,
        category: PatternCategory,
        raw_confidence_hint: f64,
    ) -> EngineResult<Pattern> {
        let name = name.to_string();
        let rules = self.config.clone();
        let now = Utc::now().timestamp_millis();

        let (pattern, signals) = self.guard.mutate(&self.db, self, |txn| {
            let existing = load_pattern_by_name(txn, &name)?;
            match existing {
                None => {
                    let outcome = confidence::admit(&rules, None, raw_confidence_hint, 1);
                    let id = Uuid::new_v4().to_string();
                    txn.execute(
                        "INSERT INTO patterns (id, name, category, confidence, usage_count, success_count, failure_count, tags_json, related_json, created_at, last_used_at)
                         VALUES (?1, ?2, ?3, ?4, 1, 0, 0, '[]', '[]', ?5, ?5)",
                        params![id, name, category.as_str(), outcome.confidence, now],
                    )?;
                    debug!(pattern = %name, confidence = outcome.confidence, "pattern created");
                    let pattern = load_pattern(txn, &id)?
                        .ok_or_else(|| EngineError::not_found("Pattern", &id))?;
                    Ok((pattern, outcome.signals))
                }
                Some(previous) => {
                    let occurrences = previous.usage_count + 1;
                    let proposed = raw_confidence_hint.max(previous.confidence);
                    let outcome =
                        confidence::admit(&rules, Some(previous.confidence), proposed, occurrences);
                    txn.execute(
                        "UPDATE patterns SET usage_count = ?1, confidence = ?2, last_used_at = ?3 WHERE id = ?4",
                        params![occurrences, outcome.confidence, now, previous.id],
                    )?;
                    debug!(
                        pattern = %name,
                        occurrences,
                        confidence = outcome.confidence,
                        "pattern re-observed"
                    );
                    let pattern = load_pattern(txn, &previous.id)?
                        .ok_or_else(|| EngineError::not_found("Pattern", &previous.id))?;
                    Ok((pattern, outcome.signals))
                }
            }
        })?;

        self.log_signals(&signals)?;
        Ok(pattern)
    }

    /// Record whether applying a pattern worked out.
    pub fn record_outcome(&self, pattern_id: &str, success: bool) -> EngineResult<Pattern> {
        let pattern_id = pattern_id.to_string();
        let now = Utc::now().timestamp_millis();
        let column = if success {
            "success_count"
        } else {
            "failure_count"
        };

        self.guard.mutate(&self.db, self, |txn| {
            let updated = txn.execute(
                &format!(
                    "UPDATE patterns SET {column} = {column} + 1, last_used_at = ?1 WHERE id = ?2"
                ),
                params![now, pattern_id],
            )?;
            if updated == 0 {
                return Err(EngineError::not_found("Pattern", &pattern_id));
            }
            load_pattern(txn, &pattern_id)?
                .ok_or_else(|| EngineError::not_found("Pattern", &pattern_id))
        })
    }

    /// Merge tags into a pattern.
    pub fn tag_pattern(&self, pattern_id: &str, tags: &[String]) -> EngineResult<Pattern> {
        let pattern_id = pattern_id.to_string();
        let tags = tags.to_vec();
        let now = Utc::now().timestamp_millis();

        self.guard.mutate(&self.db, self, |txn| {
            let pattern = load_pattern(txn, &pattern_id)?
                .ok_or_else(|| EngineError::not_found("Pattern", &pattern_id))?;
            let mut merged = pattern.tags;
            for tag in &tags {
                if !merged.contains(tag) {
                    merged.push(tag.clone());
                }
            }
            txn.execute(
                "UPDATE patterns SET tags_json = ?1, last_used_at = ?2 WHERE id = ?3",
                params![serde_json::to_string(&merged)?, now, pattern_id],
            )?;
            load_pattern(txn, &pattern_id)?
                .ok_or_else(|| EngineError::not_found("Pattern", &pattern_id))
        })
    }

    /// Link two patterns with a weak, non-owning reference.
    pub fn relate_patterns(&self, pattern_id: &str, related_id: &str) -> EngineResult<Pattern> {
        let pattern_id = pattern_id.to_string();
        let related_id = related_id.to_string();
        let now = Utc::now().timestamp_millis();

        self.guard.mutate(&self.db, self, |txn| {
            let pattern = load_pattern(txn, &pattern_id)?
                .ok_or_else(|| EngineError::not_found("Pattern", &pattern_id))?;
            if load_pattern(txn, &related_id)?.is_none() {
                return Err(EngineError::not_found("Pattern", &related_id));
            }
            let mut related = pattern.related;
            if !related.contains(&related_id) {
                related.push(related_id.clone());
            }
            txn.execute(
                "UPDATE patterns SET related_json = ?1, last_used_at = ?2 WHERE id = ?3",
                params![serde_json::to_string(&related)?, now, pattern_id],
            )?;
            load_pattern(txn, &pattern_id)?
                .ok_or_else(|| EngineError::not_found("Pattern", &pattern_id))
        })
    }

    /// Record that two files changed together.
    ///
    /// Pairs are stored with the paths in lexical order.
    pub fn record_co_modification(
        &self,
        source_path: &str,
        target_path: &str,
    ) -> EngineResult<FileRelationship> {
        let (source, target) = if source_path <= target_path {
            (source_path.to_string(), target_path.to_string())
        } else {
            (target_path.to_string(), source_path.to_string())
        };
        let rules = self.config.clone();
        let now = Utc::now().timestamp_millis();

        let (relationship, signals) = self.guard.mutate(&self.db, self, |txn| {
            let existing = txn
                .query_row(
                    "SELECT id, source_path, target_path, co_modification_count, confidence, created_at, last_used_at
                     FROM file_relationships WHERE source_path = ?1 AND target_path = ?2",
                    params![source, target],
                    map_file_relationship,
                )
                .optional()?;

            match existing {
                None => {
                    let outcome = confidence::admit(&rules, None, occurrence_proposal(1), 1);
                    let id = Uuid::new_v4().to_string();
                    txn.execute(
                        "INSERT INTO file_relationships (id, source_path, target_path, co_modification_count, confidence, created_at, last_used_at)
                         VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5)",
                        params![id, source, target, outcome.confidence, now],
                    )?;
                    let relationship = load_file_relationship(txn, &id)?
                        .ok_or_else(|| EngineError::not_found("FileRelationship", &id))?;
                    Ok((relationship, outcome.signals))
                }
                Some(previous) => {
                    let count = previous.co_modification_count + 1;
                    let outcome = confidence::admit(
                        &rules,
                        Some(previous.confidence),
                        occurrence_proposal(count),
                        count,
                    );
                    txn.execute(
                        "UPDATE file_relationships SET co_modification_count = ?1, confidence = ?2, last_used_at = ?3 WHERE id = ?4",
                        params![count, outcome.confidence, now, previous.id],
                    )?;
                    let relationship = load_file_relationship(txn, &previous.id)?
                        .ok_or_else(|| EngineError::not_found("FileRelationship", &previous.id))?;
                    Ok((relationship, outcome.signals))
                }
            }
        })?;

        self.log_signals(&signals)?;
        Ok(relationship)
    }

    /// Record one resolution of a user phrase to an intent.
    pub fn observe_intent(
        &self,
        phrase: &str,
        resolved_intent: &str,
        raw_confidence_hint: f64,
    ) -> EngineResult<IntentPattern> {
        let phrase = phrase.to_string();
        let resolved_intent = resolved_intent.to_string();
        let rules = self.config.clone();
        let now = Utc::now().timestamp_millis();

        let (intent, signals) = self.guard.mutate(&self.db, self, |txn| {
            let existing = txn
                .query_row(
                    "SELECT id, phrase, resolved_intent, usage_count, confidence, created_at, last_used_at
                     FROM intent_patterns WHERE phrase = ?1",
                    params![phrase],
                    map_intent_pattern,
                )
                .optional()?;

            match existing {
                None => {
                    let outcome = confidence::admit(&rules, None, raw_confidence_hint, 1);
                    let id = Uuid::new_v4().to_string();
                    txn.execute(
                        "INSERT INTO intent_patterns (id, phrase, resolved_intent, usage_count, confidence, created_at, last_used_at)
                         VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5)",
                        params![id, phrase, resolved_intent, outcome.confidence, now],
                    )?;
                    let intent = load_intent_pattern(txn, &id)?
                        .ok_or_else(|| EngineError::not_found("IntentPattern", &id))?;
                    Ok((intent, outcome.signals))
                }
                Some(previous) => {
                    let occurrences = previous.usage_count + 1;
                    let proposed = raw_confidence_hint.max(previous.confidence);
                    let outcome =
                        confidence::admit(&rules, Some(previous.confidence), proposed, occurrences);
                    txn.execute(
                        "UPDATE intent_patterns SET usage_count = ?1, confidence = ?2, resolved_intent = ?3, last_used_at = ?4 WHERE id = ?5",
                        params![occurrences, outcome.confidence, resolved_intent, now, previous.id],
                    )?;
                    let intent = load_intent_pattern(txn, &previous.id)?
                        .ok_or_else(|| EngineError::not_found("IntentPattern", &previous.id))?;
                    Ok((intent, outcome.signals))
                }
            }
        })?;

        self.log_signals(&signals)?;
        Ok(intent)
    }

    /// Record a correction (what was wrong, what replaced it).
    pub fn record_correction(
        &self,
        original: &str,
        corrected: &str,
    ) -> EngineResult<Correction> {
        let original = original.to_string();
        let corrected = corrected.to_string();
        let rules = self.config.clone();
        let now = Utc::now().timestamp_millis();

        let (correction, signals) = self.guard.mutate(&self.db, self, |txn| {
            let existing = txn
                .query_row(
                    "SELECT id, original, corrected, usage_count, confidence, created_at, last_used_at
                     FROM corrections WHERE original = ?1 AND corrected = ?2",
                    params![original, corrected],
                    map_correction,
                )
                .optional()?;

            match existing {
                None => {
                    let outcome = confidence::admit(&rules, None, occurrence_proposal(1), 1);
                    let id = Uuid::new_v4().to_string();
                    txn.execute(
                        "INSERT INTO corrections (id, original, corrected, usage_count, confidence, created_at, last_used_at)
                         VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5)",
                        params![id, original, corrected, outcome.confidence, now],
                    )?;
                    let correction = load_correction(txn, &id)?
                        .ok_or_else(|| EngineError::not_found("Correction", &id))?;
                    Ok((correction, outcome.signals))
                }
                Some(previous) => {
                    let count = previous.usage_count + 1;
                    let outcome = confidence::admit(
                        &rules,
                        Some(previous.confidence),
                        occurrence_proposal(count),
                        count,
                    );
                    txn.execute(
                        "UPDATE corrections SET usage_count = ?1, confidence = ?2, last_used_at = ?3 WHERE id = ?4",
                        params![count, outcome.confidence, now, previous.id],
                    )?;
                    let correction = load_correction(txn, &previous.id)?
                        .ok_or_else(|| EngineError::not_found("Correction", &previous.id))?;
                    Ok((correction, outcome.signals))
                }
            }
        })?;

        self.log_signals(&signals)?;
        Ok(correction)
    }

    /// Administratively delete a pattern.
    ///
    /// The engine never deletes patterns on its own. Weak references in
    /// other patterns are scrubbed; the search log keeps its historical
    /// rows.
    pub fn delete_pattern(&self, pattern_id: &str) -> EngineResult<()> {
        let pattern_id = pattern_id.to_string();

        self.guard.mutate(&self.db, self, |txn| {
            let deleted = txn.execute("DELETE FROM patterns WHERE id = ?1", params![pattern_id])?;
            if deleted == 0 {
                return Err(EngineError::not_found("Pattern", &pattern_id));
            }

            let referencing: Vec<(String, String)> = {
                let mut stmt = txn.prepare(
                    "SELECT id, related_json FROM patterns WHERE related_json LIKE '%' || ?1 || '%'",
                )?;
                let rows = stmt
                    .query_map(params![pattern_id], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            for (id, related_json) in referencing {
                let mut related: Vec<String> =
                    serde_json::from_str(&related_json).unwrap_or_default();
                related.retain(|r| r != &pattern_id);
                txn.execute(
                    "UPDATE patterns SET related_json = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&related)?, id],
                )?;
            }

            debug!(pattern_id = %pattern_id, "pattern deleted administratively");
            Ok(())
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────

    /// Decay the confidence of every entity idle longer than the
    /// threshold, using the configured decay curve.
    pub fn decay_unused(&self, threshold_days: u32) -> EngineResult<DecayReport> {
        let decay_config = self.config.decay.clone();
        let now = Utc::now().timestamp_millis();
        let cutoff = now - i64::from(threshold_days) * 86_400_000;

        self.guard.mutate(&self.db, self, |txn| {
            let mut report = DecayReport::default();

            for table in [
                "patterns",
                "file_relationships",
                "intent_patterns",
                "corrections",
            ] {
                let stale: Vec<(String, f64, i64)> = {
                    let mut stmt = txn.prepare(&format!(
                        "SELECT id, confidence, last_used_at FROM {table} WHERE last_used_at < ?1"
                    ))?;
                    let rows = stmt
                        .query_map(params![cutoff], |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, f64>(1)?,
                                row.get::<_, i64>(2)?,
                            ))
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                };

                for (id, current, last_used_at) in stale {
                    report.examined += 1;
                    let idle_days = (now - last_used_at) as f64 / 86_400_000.0;
                    let days_past = idle_days - f64::from(threshold_days);
                    let decayed = confidence::decay(&decay_config, current, days_past);
                    if decayed < current {
                        txn.execute(
                            &format!("UPDATE {table} SET confidence = ?1 WHERE id = ?2"),
                            params![decayed, id],
                        )?;
                        report.decayed += 1;
                    }
                }
            }

            debug!(
                examined = report.examined,
                decayed = report.decayed,
                "decay pass complete"
            );
            Ok(report)
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lookups
    // ─────────────────────────────────────────────────────────────────────

    /// Get a pattern by id.
    pub fn get_pattern(&self, id: &str) -> EngineResult<Option<Pattern>> {
        let conn = self.db.lock().map_err(EngineError::Core)?;
        load_pattern(&conn, id)
    }

    /// Get a pattern by name.
    pub fn get_pattern_by_name(&self, name: &str) -> EngineResult<Option<Pattern>> {
        let conn = self.db.lock().map_err(EngineError::Core)?;
        load_pattern_by_name(&conn, name)
    }

    /// Ranked token lookup, appending an immutable search record.
    ///
    /// Outcome is `reuse` when a match at or above `min_confidence`
    /// exists, `create` otherwise.
    pub fn search_patterns(
        &self,
        query: &str,
        min_confidence: f64,
    ) -> EngineResult<PatternSearchOutcome> {
        let tokens = unique_tokens(query);

        let mut matches = Vec::new();
        if !tokens.is_empty() {
            let conn = self.db.lock().map_err(EngineError::Core)?;
            let placeholders = vec!["?"; tokens.len()].join(", ");
            let sql = format!(
                "SELECT pattern_id, COUNT(DISTINCT token), SUM(hits)
                 FROM pattern_fts WHERE token IN ({placeholders})
                 GROUP BY pattern_id"
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

            for (pattern_id, matched, hits) in grouped {
                if let Some(pattern) = load_pattern(&conn, &pattern_id)? {
                    if pattern.confidence >= min_confidence {
                        matches.push(PatternMatch {
                            pattern,
                            score: coverage(&tokens, matched),
                            hits,
                        });
                    }
                }
            }
            matches.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.hits.cmp(&a.hits))
            });
        }

        let (outcome, matched_id, matched_confidence) = match matches.first() {
            Some(best) => (
                SearchOutcome::Reuse,
                Some(best.pattern.id.clone()),
                Some(best.pattern.confidence),
            ),
            None => (SearchOutcome::Create, None, None),
        };

        let record_id = Uuid::new_v4().to_string();
        let query = query.to_string();
        let now = Utc::now().timestamp_millis();
        let record = self.guard.mutate(&self.db, self, |txn| {
            txn.execute(
                "INSERT INTO pattern_searches (id, query, matched_pattern_id, outcome, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record_id,
                    query,
                    matched_id,
                    outcome.as_str(),
                    matched_confidence,
                    now
                ],
            )?;
            load_pattern_search(txn, &record_id)?
                .ok_or_else(|| EngineError::not_found("PatternSearch", &record_id))
        })?;

        Ok(PatternSearchOutcome { matches, record })
    }

    /// The append-only search log, newest first.
    pub fn list_searches(&self) -> EngineResult<Vec<PatternSearch>> {
        let conn = self.db.lock().map_err(EngineError::Core)?;
        let mut stmt = conn.prepare(
            "SELECT id, query, matched_pattern_id, outcome, confidence, created_at
             FROM pattern_searches ORDER BY created_at DESC, id",
        )?;
        let records = stmt
            .query_map([], map_pattern_search)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn log_signals(&self, signals: &[AnomalySignal]) -> EngineResult<()> {
        for signal in signals {
            self.anomalies.log_signal(signal)?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Protection hooks
// ─────────────────────────────────────────────────────────────────────────────

impl TierOps for PatternStore {
    fn tables(&self) -> &'static [TableSpec] {
        TIER2_TABLES
    }

    fn validate(&self, txn: &Transaction) -> EngineResult<()> {
        let gate_min = self.config.occurrence_gate_min;
        let gate_ceiling = self.config.occurrence_gate_ceiling;

        // Patterns: category recognized, confidence bounded, occurrence
        // gate holds, related references resolve.
        let mut stmt =
            txn.prepare("SELECT id, category, confidence, usage_count, related_json FROM patterns")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let known_ids: HashSet<String> = rows.iter().map(|r| r.0.clone()).collect();
        for (id, category, conf, usage_count, related_json) in &rows {
            if PatternCategory::from_str(category).is_none() {
                return Err(InvariantViolation::UnrecognizedValue {
                    entity: "pattern",
                    id: id.clone(),
                    field: "category",
                    value: category.clone(),
                }
                .into());
            }
            check_confidence("pattern", id, *conf)?;
            if *usage_count < gate_min && *conf > gate_ceiling + 1e-9 {
                return Err(InvariantViolation::OccurrenceGateBreached {
                    id: id.clone(),
                    confidence: *conf,
                    usage_count: *usage_count,
                    ceiling: gate_ceiling,
                }
                .into());
            }
            let related: Vec<String> = serde_json::from_str(related_json).unwrap_or_default();
            for reference in related {
                if !known_ids.contains(&reference) {
                    return Err(InvariantViolation::DanglingReference {
                        entity: "pattern",
                        id: id.clone(),
                        referenced: reference,
                    }
                    .into());
                }
            }
        }

        // Secondary entities: confidence bounded.
        for (table, entity) in [
            ("file_relationships", "file_relationship"),
            ("intent_patterns", "intent_pattern"),
            ("corrections", "correction"),
        ] {
            let mut stmt = txn.prepare(&format!("SELECT id, confidence FROM {table}"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (id, conf) in rows {
                check_confidence(entity, &id, conf)?;
            }
        }

        // Search log: outcomes recognized. Matched ids are historical and
        // may outlive their pattern, so they are not checked for existence.
        let mut stmt = txn.prepare("SELECT id, outcome FROM pattern_searches")?;
        let searches = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (id, outcome) in searches {
            if SearchOutcome::from_str(&outcome).is_none() {
                return Err(InvariantViolation::UnrecognizedValue {
                    entity: "pattern_search",
                    id,
                    field: "outcome",
                    value: outcome,
                }
                .into());
            }
        }

        Ok(())
    }

    fn reindex(&self, txn: &Transaction) -> EngineResult<()> {
        txn.execute("DELETE FROM pattern_fts", [])?;

        let mut stmt = txn.prepare("SELECT id, name, category, tags_json FROM patterns")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts: HashMap<(String, String, &'static str), i64> = HashMap::new();
        for (id, name, category, tags_json) in rows {
            for token in tokenize(&name) {
                *counts.entry((id.clone(), token, "name")).or_insert(0) += 1;
            }
            for token in tokenize(&category) {
                *counts.entry((id.clone(), token, "category")).or_insert(0) += 1;
            }
            let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
            for tag in tags {
                for token in tokenize(&tag) {
                    *counts.entry((id.clone(), token, "tag")).or_insert(0) += 1;
                }
            }
        }

        let mut stmt = txn.prepare(
            "INSERT INTO pattern_fts (pattern_id, token, field, hits) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for ((pattern_id, token, field), hits) in counts {
            stmt.execute(params![pattern_id, token, field, hits])?;
        }

        Ok(())
    }
}

fn check_confidence(entity: &'static str, id: &str, value: f64) -> EngineResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(InvariantViolation::ConfidenceOutOfBounds {
            entity,
            id: id.to_string(),
            value,
        }
        .into());
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn map_pattern(row: &Row) -> rusqlite::Result<Pattern> {
    let category: String = row.get(2)?;
    let tags_json: String = row.get(7)?;
    let related_json: String = row.get(8)?;
    Ok(Pattern {
        id: row.get(0)?,
        name: row.get(1)?,
        category: PatternCategory::from_str(&category).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unrecognized category '{category}'").into(),
            )
        })?,
        confidence: row.get(3)?,
        usage_count: row.get(4)?,
        success_count: row.get(5)?,
        failure_count: row.get(6)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        related: serde_json::from_str(&related_json).unwrap_or_default(),
        created_at: millis_to_datetime(row.get(9)?),
        last_used_at: millis_to_datetime(row.get(10)?),
    })
}

const PATTERN_COLUMNS: &str = "id, name, category, confidence, usage_count, success_count, failure_count, tags_json, related_json, created_at, last_used_at";

fn load_pattern(conn: &Connection, id: &str) -> EngineResult<Option<Pattern>> {
    let pattern = conn
        .query_row(
            &format!("SELECT {PATTERN_COLUMNS} FROM patterns WHERE id = ?1"),
            params![id],
            map_pattern,
        )
        .optional()?;
    Ok(pattern)
}

fn load_pattern_by_name(conn: &Connection, name: &str) -> EngineResult<Option<Pattern>> {
    let pattern = conn
        .query_row(
            &format!("SELECT {PATTERN_COLUMNS} FROM patterns WHERE name = ?1"),
            params![name],
            map_pattern,
        )
        .optional()?;
    Ok(pattern)
}

fn map_file_relationship(row: &Row) -> rusqlite::Result<FileRelationship> {
    Ok(FileRelationship {
        id: row.get(0)?,
        source_path: row.get(1)?,
        target_path: row.get(2)?,
        co_modification_count: row.get(3)?,
        confidence: row.get(4)?,
        created_at: millis_to_datetime(row.get(5)?),
        last_used_at: millis_to_datetime(row.get(6)?),
    })
}

fn load_file_relationship(conn: &Connection, id: &str) -> EngineResult<Option<FileRelationship>> {
    let relationship = conn
        .query_row(
            "SELECT id, source_path, target_path, co_modification_count, confidence, created_at, last_used_at
             FROM file_relationships WHERE id = ?1",
            params![id],
            map_file_relationship,
        )
        .optional()?;
    Ok(relationship)
}

fn map_intent_pattern(row: &Row) -> rusqlite::Result<IntentPattern> {
    Ok(IntentPattern {
        id: row.get(0)?,
        phrase: row.get(1)?,
        resolved_intent: row.get(2)?,
        usage_count: row.get(3)?,
        confidence: row.get(4)?,
        created_at: millis_to_datetime(row.get(5)?),
        last_used_at: millis_to_datetime(row.get(6)?),
    })
}

fn load_intent_pattern(conn: &Connection, id: &str) -> EngineResult<Option<IntentPattern>> {
    let intent = conn
        .query_row(
            "SELECT id, phrase, resolved_intent, usage_count, confidence, created_at, last_used_at
             FROM intent_patterns WHERE id = ?1",
            params![id],
            map_intent_pattern,
        )
        .optional()?;
    Ok(intent)
}

fn map_correction(row: &Row) -> rusqlite::Result<Correction> {
    Ok(Correction {
        id: row.get(0)?,
        original: row.get(1)?,
        corrected: row.get(2)?,
        usage_count: row.get(3)?,
        confidence: row.get(4)?,
        created_at: millis_to_datetime(row.get(5)?),
        last_used_at: millis_to_datetime(row.get(6)?),
    })
}

fn load_correction(conn: &Connection, id: &str) -> EngineResult<Option<Correction>> {
    let correction = conn
        .query_row(
            "SELECT id, original, corrected, usage_count, confidence, created_at, last_used_at
             FROM corrections WHERE id = ?1",
            params![id],
            map_correction,
        )
        .optional()?;
    Ok(correction)
}

fn map_pattern_search(row: &Row) -> rusqlite::Result<PatternSearch> {
    let outcome: String = row.get(3)?;
    Ok(PatternSearch {
        id: row.get(0)?,
        query: row.get(1)?,
        matched_pattern_id: row.get(2)?,
        outcome: SearchOutcome::from_str(&outcome).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unrecognized outcome '{outcome}'").into(),
            )
        })?,
        confidence: row.get(4)?,
        created_at: millis_to_datetime(row.get(5)?),
    })
}

fn load_pattern_search(conn: &Connection, id: &str) -> EngineResult<Option<PatternSearch>> {
    let record = conn
        .query_row(
            "SELECT id, query, matched_pattern_id, outcome, confidence, created_at
             FROM pattern_searches WHERE id = ?1",
            params![id],
            map_pattern_search,
        )
        .optional()?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::types::AnomalyKind;

    fn store() -> PatternStore {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let anomalies = AnomalyQueue::new(db.clone());
        PatternStore::new(
            db,
            ConfidenceConfig::default(),
            &ProtectionConfig::default(),
            anomalies,
        )
    }

    #[test]
    fn test_first_observation_creates_with_capped_confidence() {
        let store = store();
        let pattern = store
            .observe_pattern("retry with backoff", PatternCategory::Workflow, 0.9)
            .unwrap();
        assert_eq!(pattern.usage_count, 1);
        assert_eq!(pattern.confidence, 0.50);
        assert_eq!(pattern.category, PatternCategory::Workflow);
    }

    #[test]
    fn test_repeat_observations_grow_confidence() {
        let store = store();
        store
            .observe_pattern("error boundary", PatternCategory::CodePattern, 0.6)
            .unwrap();
        store
            .observe_pattern("error boundary", PatternCategory::CodePattern, 0.6)
            .unwrap();
        let third = store
            .observe_pattern("error boundary", PatternCategory::CodePattern, 0.6)
            .unwrap();

        assert_eq!(third.usage_count, 3);
        // Gate released at the third observation.
        assert_eq!(third.confidence, 0.6);
    }

    #[test]
    fn test_occurrence_gate_holds_under_three() {
        let store = store();
        let first = store
            .observe_pattern("singleton config", PatternCategory::Architectural, 0.8)
            .unwrap();
        let second = store
            .observe_pattern("singleton config", PatternCategory::Architectural, 0.8)
            .unwrap();
        assert!(first.confidence <= 0.50);
        assert!(second.confidence <= 0.50);
    }

    #[test]
    fn test_spike_hint_capped_and_logged_once() {
        let store = store();
        let pattern = store
            .observe_pattern("suspicious certainty", PatternCategory::Intent, 0.99)
            .unwrap();
        assert!(pattern.confidence <= 0.70);

        let pending = store.anomalies.list(None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, AnomalyKind::HighConfidenceLowOccurrences);
    }

    #[test]
    fn test_observation_never_lowers_confidence() {
        let store = store();
        for _ in 0..3 {
            store
                .observe_pattern("stable habit", PatternCategory::Workflow, 0.6)
                .unwrap();
        }
        let after_low_hint = store
            .observe_pattern("stable habit", PatternCategory::Workflow, 0.1)
            .unwrap();
        assert_eq!(after_low_hint.confidence, 0.6);
    }

    #[test]
    fn test_record_outcome_counters() {
        let store = store();
        let pattern = store
            .observe_pattern("flaky test quarantine", PatternCategory::Validation, 0.5)
            .unwrap();

        store.record_outcome(&pattern.id, true).unwrap();
        store.record_outcome(&pattern.id, true).unwrap();
        let updated = store.record_outcome(&pattern.id, false).unwrap();

        assert_eq!(updated.success_count, 2);
        assert_eq!(updated.failure_count, 1);
    }

    #[test]
    fn test_tag_and_relate() {
        let store = store();
        let a = store
            .observe_pattern("a", PatternCategory::Workflow, 0.5)
            .unwrap();
        let b = store
            .observe_pattern("b", PatternCategory::Workflow, 0.5)
            .unwrap();

        let tagged = store
            .tag_pattern(&a.id, &["deploy".into(), "ci".into()])
            .unwrap();
        assert_eq!(tagged.tags, vec!["deploy".to_string(), "ci".to_string()]);

        let related = store.relate_patterns(&a.id, &b.id).unwrap();
        assert_eq!(related.related, vec![b.id.clone()]);

        // Relating to a missing pattern is rejected before commit.
        let err = store.relate_patterns(&a.id, "missing").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_search_round_trip_and_log() {
        let store = store();
        store
            .observe_pattern("foo pipeline", PatternCategory::Workflow, 0.4)
            .unwrap();

        let found = store.search_patterns("foo", 0.0).unwrap();
        assert_eq!(found.matches.len(), 1);
        assert_eq!(found.matches[0].pattern.name, "foo pipeline");
        assert_eq!(found.record.outcome, SearchOutcome::Reuse);
        assert!(found.record.matched_pattern_id.is_some());

        // Confidence floor filters the same pattern out.
        let missed = store.search_patterns("foo", 0.9).unwrap();
        assert!(missed.matches.is_empty());
        assert_eq!(missed.record.outcome, SearchOutcome::Create);
        assert_eq!(missed.record.matched_pattern_id, None);

        // Both lookups were logged, immutably, newest first.
        let log = store.list_searches().unwrap();
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_search_by_tag() {
        let store = store();
        let pattern = store
            .observe_pattern("modal dialog", PatternCategory::UiPattern, 0.4)
            .unwrap();
        store
            .tag_pattern(&pattern.id, &["accessibility".into()])
            .unwrap();

        let found = store.search_patterns("accessibility", 0.0).unwrap();
        assert_eq!(found.matches.len(), 1);
    }

    #[test]
    fn test_co_modification_counter_and_normalized_pair() {
        let store = store();
        let first = store
            .record_co_modification("src/api.rs", "src/types.rs")
            .unwrap();
        assert_eq!(first.co_modification_count, 1);

        // Reverse order hits the same row.
        let second = store
            .record_co_modification("src/types.rs", "src/api.rs")
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.co_modification_count, 2);
        assert!(second.confidence >= first.confidence);
    }

    #[test]
    fn test_intent_and_correction_follow_the_gates() {
        let store = store();
        let intent = store
            .observe_intent("make it faster", "optimize-performance", 0.95)
            .unwrap();
        assert!(intent.confidence <= 0.50);

        let correction = store
            .record_correction("colour", "color")
            .unwrap();
        assert_eq!(correction.usage_count, 1);
        assert!(correction.confidence <= 0.50);
    }

    #[test]
    fn test_decay_unused_linear() {
        let store = store();
        for _ in 0..3 {
            store
                .observe_pattern("old knowledge", PatternCategory::Workflow, 0.8)
                .unwrap();
        }

        // Backdate the pattern 40 days.
        let old = Utc::now().timestamp_millis() - 40 * 86_400_000;
        store
            .db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE patterns SET last_used_at = ?1",
                    params![old],
                )?;
                Ok(())
            })
            .unwrap();

        let report = store.decay_unused(30).unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.decayed, 1);

        let decayed = store.get_pattern_by_name("old knowledge").unwrap().unwrap();
        // 10 days past the threshold at 0.01/day.
        assert!(decayed.confidence < 0.8);
        assert!((decayed.confidence - 0.7).abs() < 0.01);
    }

    #[test]
    fn test_decay_skips_recent() {
        let store = store();
        for _ in 0..3 {
            store
                .observe_pattern("fresh knowledge", PatternCategory::Workflow, 0.8)
                .unwrap();
        }
        let report = store.decay_unused(30).unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(report.decayed, 0);
    }

    #[test]
    fn test_delete_pattern_scrubs_weak_references() {
        let store = store();
        let a = store
            .observe_pattern("keeper", PatternCategory::Workflow, 0.5)
            .unwrap();
        let b = store
            .observe_pattern("doomed", PatternCategory::Workflow, 0.5)
            .unwrap();
        store.relate_patterns(&a.id, &b.id).unwrap();

        // The search log records the match before deletion.
        let found = store.search_patterns("doomed", 0.0).unwrap();
        assert_eq!(found.record.matched_pattern_id, Some(b.id.clone()));

        store.delete_pattern(&b.id).unwrap();
        assert!(store.get_pattern(&b.id).unwrap().is_none());

        // The weak reference is gone, the historical log row is not.
        let keeper = store.get_pattern(&a.id).unwrap().unwrap();
        assert!(keeper.related.is_empty());
        assert_eq!(store.list_searches().unwrap().len(), 1);

        // Subsequent mutations still pass validation.
        store
            .observe_pattern("after the purge", PatternCategory::Workflow, 0.5)
            .unwrap();
    }

    #[test]
    fn test_delete_missing_pattern() {
        let store = store();
        let err = store.delete_pattern("missing").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_validation_catches_corrupted_confidence() {
        let store = store();
        let pattern = store
            .observe_pattern("target", PatternCategory::Workflow, 0.5)
            .unwrap();

        // Corrupt the committed state behind the store's back.
        store
            .db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE patterns SET confidence = 1.7 WHERE id = ?1",
                    params![pattern.id],
                )?;
                Ok(())
            })
            .unwrap();

        // The next protected mutation fails validation and rolls back to
        // the (corrupted) pre-mutation state without committing anything.
        let err = store
            .observe_pattern("another", PatternCategory::Workflow, 0.5)
            .unwrap_err();
        assert!(err.is_validation());
        assert!(store.get_pattern_by_name("another").unwrap().is_none());
    }
}
