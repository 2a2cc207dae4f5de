use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::SimStore;
use crate::{
    dead_letter::DeadLetterEntry,
    error::{ErrorCategory, SimResult},
    queue::QueueName,
    types::TimestampMs,
};

/// Which dead-letter rows to load.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub simulation_id:    String,
    /// Empty means every category.
    pub categories:       Vec<ErrorCategory>,
    pub include_replayed: bool,
}

/// One row of the replay audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayAuditRecord {
    pub audit_id:          String,
    pub batch_id:          String,
    pub actor:             String,
    pub simulation_id:     String,
    pub filters:           serde_json::Value,
    pub selected:          usize,
    pub replayed:          usize,
    pub skipped_duplicate: usize,
    pub skipped_recent:    usize,
    pub created_at:        TimestampMs,
}

const ENTRY_COLUMNS: &str = "entry_id, origin_queue, job_id, simulation_id, payload, category,
     retryable, message, failed_at, attempts, replayed_at, replay_batch_id";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<(DeadLetterEntry, String)> {
    let queue: String = row.get(1)?;
    let category: String = row.get(5)?;
    let payload: String = row.get(4)?;
    let entry = DeadLetterEntry {
        entry_id:        row.get(0)?,
        origin_queue:    QueueName::parse(&queue).unwrap_or(QueueName::Control),
        job_id:          row.get(2)?,
        simulation_id:   row.get(3)?,
        payload:         serde_json::Value::Null,
        category:        ErrorCategory::parse(&category).unwrap_or(ErrorCategory::Unknown),
        retryable:       row.get::<_, i64>(6)? != 0,
        message:         row.get(7)?,
        failed_at:       row.get(8)?,
        attempts:        row.get::<_, i64>(9)? as u32,
        replayed_at:     row.get(10)?,
        replay_batch_id: row.get(11)?,
    };
    Ok((entry, payload))
}

fn hydrate(rows: Vec<(DeadLetterEntry, String)>) -> SimResult<Vec<DeadLetterEntry>> {
    rows.into_iter()
        .map(|(mut entry, payload)| {
            entry.payload = serde_json::from_str(&payload)?;
            Ok(entry)
        })
        .collect()
}

impl SimStore {
    // ── Dead letters ───────────────────────────────────────────

    pub fn insert_dead_letter(&self, entry: &DeadLetterEntry) -> SimResult<()> {
        let payload = serde_json::to_string(&entry.payload)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO dead_letter (
                entry_id, origin_queue, job_id, simulation_id, payload, category,
                retryable, message, failed_at, attempts
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.entry_id,
                entry.origin_queue.as_str(),
                entry.job_id,
                entry.simulation_id,
                payload,
                entry.category.as_str(),
                entry.retryable as i64,
                entry.message,
                entry.failed_at,
                entry.attempts as i64,
            ],
        )?;
        Ok(())
    }

    /// Matching entries, oldest first.
    pub fn dead_letters(&self, filter: &DeadLetterFilter) -> SimResult<Vec<DeadLetterEntry>> {
        let rows = {
            let conn = self.conn.lock();
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM dead_letter
                 WHERE simulation_id = ?1 AND (?2 OR replayed_at IS NULL)
                 ORDER BY failed_at ASC, entry_id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![filter.simulation_id, filter.include_replayed], entry_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let entries = hydrate(rows)?;
        Ok(entries
            .into_iter()
            .filter(|e| filter.categories.is_empty() || filter.categories.contains(&e.category))
            .collect())
    }

    /// Look up by entry id or by the original job id.
    pub fn find_dead_letter(&self, simulation_id: &str, id: &str) -> SimResult<Option<DeadLetterEntry>> {
        let row = {
            let conn = self.conn.lock();
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM dead_letter
                 WHERE simulation_id = ?1 AND (entry_id = ?2 OR job_id = ?2)
                 ORDER BY failed_at DESC LIMIT 1"
            );
            conn.query_row(&sql, params![simulation_id, id], entry_from_row)
                .optional()?
        };
        Ok(hydrate(row.into_iter().collect())?.pop())
    }

    pub fn mark_dead_letter_replayed(&self, entry_id: &str, batch_id: &str, at: TimestampMs) -> SimResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE dead_letter SET replayed_at = ?2, replay_batch_id = ?3 WHERE entry_id = ?1",
            params![entry_id, at, batch_id],
        )?;
        Ok(())
    }

    pub fn dead_letter_count(&self, simulation_id: &str) -> SimResult<i64> {
        let conn = self.conn.lock();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM dead_letter WHERE simulation_id = ?1",
            [simulation_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    // ── Replay audit ───────────────────────────────────────────

    pub fn insert_replay_audit(&self, audit: &ReplayAuditRecord) -> SimResult<()> {
        let filters = serde_json::to_string(&audit.filters)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO replay_audit (
                audit_id, batch_id, actor, simulation_id, filters, selected, replayed,
                skipped_duplicate, skipped_recent, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                audit.audit_id,
                audit.batch_id,
                audit.actor,
                audit.simulation_id,
                filters,
                audit.selected as i64,
                audit.replayed as i64,
                audit.skipped_duplicate as i64,
                audit.skipped_recent as i64,
                audit.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn replay_audits(&self, simulation_id: &str) -> SimResult<Vec<ReplayAuditRecord>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT audit_id, batch_id, actor, simulation_id, filters, selected, replayed,
                        skipped_duplicate, skipped_recent, created_at
                 FROM replay_audit WHERE simulation_id = ?1 ORDER BY created_at ASC, audit_id ASC",
            )?;
            let rows = stmt
                .query_map([simulation_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, i64>(9)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        rows.into_iter()
            .map(|(audit_id, batch_id, actor, simulation_id, filters, sel, rep, dup, rec, at)| {
                Ok(ReplayAuditRecord {
                    audit_id,
                    batch_id,
                    actor,
                    simulation_id,
                    filters: serde_json::from_str(&filters)?,
                    selected: sel as usize,
                    replayed: rep as usize,
                    skipped_duplicate: dup as usize,
                    skipped_recent: rec as usize,
                    created_at: at,
                })
            })
            .collect()
    }
}
