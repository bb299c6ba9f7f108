//! Anomaly review queue.
//!
//! Append-only log of suspicious confidence/occurrence combinations.
//! Rows are created by the confidence engine and the routing gate, and
//! closed only by explicit review; the engine never auto-resolves them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::warn;
use uuid::Uuid;

use engram_core::types::{Anomaly, AnomalyKind, AnomalySeverity, AnomalyStatus};
use engram_core::Database;

use crate::error::{EngineError, EngineResult};
use crate::pattern::confidence::AnomalySignal;

/// Counts for periodic operational review.
#[derive(Debug, Clone, Default)]
pub struct AnomalyStats {
    pub total: i64,
    pub by_kind: HashMap<String, i64>,
    pub by_severity: HashMap<String, i64>,
    pub by_status: HashMap<String, i64>,
}

/// The review queue.
#[derive(Clone)]
pub struct AnomalyQueue {
    db: Arc<Database>,
}

impl AnomalyQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append a pending anomaly.
    pub fn log(
        &self,
        kind: AnomalyKind,
        severity: AnomalySeverity,
        description: impl Into<String>,
        context: Option<serde_json::Value>,
    ) -> EngineResult<Anomaly> {
        let id = Uuid::new_v4().to_string();
        let description = description.into();
        let now = Utc::now().timestamp_millis();
        let context_json = context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        warn!(
            anomaly_id = %id,
            kind = %kind,
            severity = %severity,
            "{description}"
        );

        let conn = self.db.lock().map_err(EngineError::Core)?;
        conn.execute(
            "INSERT INTO anomalies (id, kind, severity, description, context_json, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
            params![
                id,
                kind.as_str(),
                severity.as_str(),
                description,
                context_json,
                now
            ],
        )?;

        load_anomaly(&conn, &id)?.ok_or_else(|| EngineError::not_found("Anomaly", &id))
    }

    /// Append from a confidence engine signal.
    pub fn log_signal(&self, signal: &AnomalySignal) -> EngineResult<Anomaly> {
        self.log(
            signal.kind,
            signal.severity,
            signal.description.clone(),
            Some(signal.context.clone()),
        )
    }

    /// Get an anomaly by id.
    pub fn get(&self, id: &str) -> EngineResult<Option<Anomaly>> {
        let conn = self.db.lock().map_err(EngineError::Core)?;
        load_anomaly(&conn, id)
    }

    /// List anomalies, optionally filtered by status, newest first.
    pub fn list(&self, status: Option<AnomalyStatus>) -> EngineResult<Vec<Anomaly>> {
        let conn = self.db.lock().map_err(EngineError::Core)?;
        let sql_base = "SELECT id, kind, severity, description, context_json, status, review_notes, created_at, reviewed_at
             FROM anomalies";
        let rows = match status {
            Some(status) => {
                let mut stmt =
                    conn.prepare(&format!("{sql_base} WHERE status = ?1 ORDER BY created_at DESC"))?;
                let rows = stmt
                    .query_map(params![status.as_str()], map_anomaly)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!("{sql_base} ORDER BY created_at DESC"))?;
                let rows = stmt
                    .query_map([], map_anomaly)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(rows)
    }

    /// Close a pending anomaly.
    ///
    /// Transitions are one-way: `pending -> resolved | dismissed`.
    pub fn review(
        &self,
        id: &str,
        new_status: AnomalyStatus,
        notes: Option<String>,
    ) -> EngineResult<Anomaly> {
        let conn = self.db.lock().map_err(EngineError::Core)?;
        let anomaly =
            load_anomaly(&conn, id)?.ok_or_else(|| EngineError::not_found("Anomaly", id))?;

        if anomaly.status != AnomalyStatus::Pending || new_status == AnomalyStatus::Pending {
            return Err(EngineError::InvalidTransition {
                entity: "Anomaly",
                id: id.to_string(),
                from: anomaly.status.to_string(),
                to: new_status.to_string(),
            });
        }

        let now = Utc::now().timestamp_millis();
        conn.execute(
            "UPDATE anomalies SET status = ?1, review_notes = ?2, reviewed_at = ?3 WHERE id = ?4",
            params![new_status.as_str(), notes, now, id],
        )?;

        load_anomaly(&conn, id)?.ok_or_else(|| EngineError::not_found("Anomaly", id))
    }

    /// Counts by kind, severity and status.
    pub fn stats(&self) -> EngineResult<AnomalyStats> {
        let conn = self.db.lock().map_err(EngineError::Core)?;
        let mut stats = AnomalyStats::default();

        stats.total = conn.query_row("SELECT COUNT(*) FROM anomalies", [], |row| row.get(0))?;

        for (column, bucket) in [
            ("kind", &mut stats.by_kind),
            ("severity", &mut stats.by_severity),
            ("status", &mut stats.by_status),
        ] {
            let mut stmt =
                conn.prepare(&format!("SELECT {column}, COUNT(*) FROM anomalies GROUP BY {column}"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (key, count) in rows {
                bucket.insert(key, count);
            }
        }

        Ok(stats)
    }
}

fn map_anomaly(row: &Row) -> rusqlite::Result<Anomaly> {
    let kind: String = row.get(1)?;
    let severity: String = row.get(2)?;
    let status: String = row.get(5)?;
    let context_json: Option<String> = row.get(4)?;

    let parse_err = |index: usize, value: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            format!("unrecognized value '{value}'").into(),
        )
    };

    Ok(Anomaly {
        id: row.get(0)?,
        kind: AnomalyKind::from_str(&kind).ok_or_else(|| parse_err(1, &kind))?,
        severity: AnomalySeverity::from_str(&severity).ok_or_else(|| parse_err(2, &severity))?,
        description: row.get(3)?,
        context: context_json.and_then(|j| serde_json::from_str(&j).ok()),
        status: AnomalyStatus::from_str(&status).ok_or_else(|| parse_err(5, &status))?,
        review_notes: row.get(6)?,
        created_at: millis_to_datetime(row.get(7)?),
        reviewed_at: row
            .get::<_, Option<i64>>(8)?
            .map(millis_to_datetime),
    })
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn load_anomaly(conn: &rusqlite::Connection, id: &str) -> EngineResult<Option<Anomaly>> {
    let anomaly = conn
        .query_row(
            "SELECT id, kind, severity, description, context_json, status, review_notes, created_at, reviewed_at
             FROM anomalies WHERE id = ?1",
            params![id],
            map_anomaly,
        )
        .optional()?;
    Ok(anomaly)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> AnomalyQueue {
        AnomalyQueue::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn test_log_and_list() {
        let queue = queue();
        let logged = queue
            .log(
                AnomalyKind::HighConfidenceLowOccurrences,
                AnomalySeverity::High,
                "0.99 claimed on first observation",
                Some(serde_json::json!({"proposed": 0.99})),
            )
            .unwrap();
        assert_eq!(logged.status, AnomalyStatus::Pending);

        let pending = queue.list(Some(AnomalyStatus::Pending)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, logged.id);
        assert!(queue.list(Some(AnomalyStatus::Resolved)).unwrap().is_empty());
    }

    #[test]
    fn test_review_is_one_way() {
        let queue = queue();
        let logged = queue
            .log(
                AnomalyKind::PerfectConfidenceInsufficientEvidence,
                AnomalySeverity::Medium,
                "1.0 proposed with 2 observations",
                None,
            )
            .unwrap();

        let resolved = queue
            .review(&logged.id, AnomalyStatus::Resolved, Some("confirmed noise".into()))
            .unwrap();
        assert_eq!(resolved.status, AnomalyStatus::Resolved);
        assert!(resolved.reviewed_at.is_some());
        assert_eq!(resolved.review_notes.as_deref(), Some("confirmed noise"));

        // Closed anomalies cannot be re-opened or re-reviewed.
        let err = queue
            .review(&logged.id, AnomalyStatus::Dismissed, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        let err = queue
            .review(&logged.id, AnomalyStatus::Pending, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_review_missing() {
        let queue = queue();
        let err = queue
            .review("missing", AnomalyStatus::Resolved, None)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_stats_counts() {
        let queue = queue();
        for _ in 0..3 {
            queue
                .log(
                    AnomalyKind::HighConfidenceLowOccurrences,
                    AnomalySeverity::High,
                    "spike",
                    None,
                )
                .unwrap();
        }
        let logged = queue
            .log(
                AnomalyKind::RoutingOverconfidenceBlock,
                AnomalySeverity::High,
                "blocked",
                None,
            )
            .unwrap();
        queue
            .review(&logged.id, AnomalyStatus::Dismissed, None)
            .unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(
            stats.by_kind.get("high-confidence-low-occurrences"),
            Some(&3)
        );
        assert_eq!(stats.by_severity.get("high"), Some(&4));
        assert_eq!(stats.by_status.get("pending"), Some(&3));
        assert_eq!(stats.by_status.get("dismissed"), Some(&1));
    }
}
