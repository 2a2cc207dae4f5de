//! SQLite persistence layer.
//!
//! RULE: Only store/ talks to the database.
//! Everything else reaches storage through SimStore methods or the
//! KvStore / JobQueue traits SimStore implements, never raw SQL.
//!
//! Read-modify-write operations run in IMMEDIATE transactions, so they stay
//! atomic when several processes share one database file.

use crate::{
    clock::{Clock, SystemClock},
    error::SimResult,
    event::{EventLogEntry, SimEvent},
};
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::sync::Arc;
use std::time::Duration;

mod dead_letter;
mod kv;
mod overrides;
mod queue;
mod simulation;

pub use dead_letter::{DeadLetterFilter, ReplayAuditRecord};
pub use overrides::OverrideRow;

pub struct SimStore {
    conn:  Mutex<Connection>,
    path:  Option<String>, // None for :memory:, Some(path) for file
    clock: Arc<dyn Clock>,
}

impl SimStore {
    pub fn open(path: &str) -> SimResult<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: &str, clock: Arc<dyn Clock>) -> SimResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_string()),
            clock,
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> SimResult<Self> {
        Self::in_memory_with_clock(Arc::new(SystemClock))
    }

    pub fn in_memory_with_clock(clock: Arc<dyn Clock>) -> SimResult<Self> {
        let conn = Connection::open(":memory:")?;
        Ok(Self { conn: Mutex::new(conn), path: None, clock })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    /// For file-based databases, this opens the same file.
    pub fn reopen(&self) -> SimResult<Self> {
        match &self.path {
            Some(p) => Self::open_with_clock(p, self.clock.clone()),
            None => Self::in_memory_with_clock(self.clock.clone()),
        }
    }

    /// Apply all schema migrations in order. Safe to run repeatedly.
    pub fn migrate(&self) -> SimResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/002_kv.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/003_job_queue.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/004_dead_letter.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/005_scenario_overrides.sql"))?;
        Ok(())
    }

    /// Run a raw SQL script. Maintenance hook; tests also use it to install
    /// failing triggers.
    pub fn run_script(&self, sql: &str) -> SimResult<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Run `f` inside an IMMEDIATE transaction, committing on Ok.
    fn atomically<T>(&self, f: impl FnOnce(&Transaction<'_>) -> SimResult<T>) -> SimResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, event: &SimEvent) -> SimResult<()> {
        let payload = serde_json::to_string(event)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO event_log (simulation_id, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![event.subject(), event.type_name(), payload, self.now()],
        )?;
        Ok(())
    }

    pub fn events_for(&self, subject: &str) -> SimResult<Vec<EventLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, simulation_id, event_type, payload, created_at
             FROM event_log WHERE simulation_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map([subject], |row| {
                Ok(EventLogEntry {
                    id:            Some(row.get(0)?),
                    simulation_id: row.get(1)?,
                    event_type:    row.get(2)?,
                    payload:       row.get(3)?,
                    created_at:    row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn event_count(&self, subject: &str, event_type: &str) -> SimResult<i64> {
        let conn = self.conn.lock();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM event_log WHERE simulation_id = ?1 AND event_type = ?2",
            [subject, event_type],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}
