use rusqlite::{params, OptionalExtension};

use super::SimStore;
use crate::{
    error::SimResult,
    types::{OverrideVersion, TimestampMs},
};

#[derive(Debug, Clone, PartialEq)]
pub struct OverrideRow {
    pub scenario_id:    String,
    pub version:        OverrideVersion,
    pub content_hash:   String,
    pub overrides_json: String,
    pub created_at:     TimestampMs,
}

impl SimStore {
    // ── Scenario overrides ─────────────────────────────────────

    /// Append the next version for a scenario. Returns the version written.
    pub fn insert_override(&self, scenario_id: &str, content_hash: &str, overrides_json: &str) -> SimResult<OverrideVersion> {
        let now = self.now();
        self.atomically(|tx| {
            let current: i64 = tx.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM scenario_override WHERE scenario_id = ?1",
                [scenario_id],
                |row| row.get(0),
            )?;
            let next = current + 1;
            tx.execute(
                "INSERT INTO scenario_override (scenario_id, version, content_hash, overrides_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![scenario_id, next, content_hash, overrides_json, now],
            )?;
            Ok(next as OverrideVersion)
        })
    }

    pub fn latest_override(&self, scenario_id: &str) -> SimResult<Option<OverrideRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT scenario_id, version, content_hash, overrides_json, created_at
                 FROM scenario_override WHERE scenario_id = ?1
                 ORDER BY version DESC LIMIT 1",
                [scenario_id],
                |row| {
                    Ok(OverrideRow {
                        scenario_id:    row.get(0)?,
                        version:        row.get::<_, i64>(1)? as u64,
                        content_hash:   row.get(2)?,
                        overrides_json: row.get(3)?,
                        created_at:     row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}
