use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;

use super::SimStore;
use crate::{
    error::SimResult,
    queue::{JobQueue, NewJob, QueueName, QueuedJob},
    types::{JobId, TimestampMs},
};

fn queue_list(queues: &[QueueName]) -> String {
    // Queue names are a closed enum of plain identifiers, safe to inline.
    queues
        .iter()
        .map(|q| format!("'{}'", q.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_job(conn: &Connection, job: &NewJob, now: TimestampMs) -> SimResult<JobId> {
    let job_id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO job (job_id, queue, simulation_id, payload, policy, state, run_at, enqueued_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'waiting', ?6, ?7)",
        params![
            job_id,
            job.queue.as_str(),
            job.payload.simulation_id(),
            serde_json::to_string(&job.payload)?,
            serde_json::to_string(&job.policy)?,
            job.run_at,
            now,
        ],
    )?;
    Ok(job_id)
}

impl SimStore {
    /// Enqueue `jobs` and set `marker` in one transaction, so a reader that
    /// sees the marker also sees every job.
    pub fn enqueue_batch_marked(&self, jobs: &[NewJob], marker: &str, ttl_ms: i64) -> SimResult<usize> {
        let now = self.now();
        self.atomically(|tx| {
            for job in jobs {
                insert_job(tx, job, now)?;
            }
            tx.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, '1', ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![marker, now + ttl_ms.max(0)],
            )?;
            Ok(jobs.len())
        })
    }
}

impl JobQueue for SimStore {
    fn enqueue(&self, job: &NewJob) -> SimResult<JobId> {
        let conn = self.conn.lock();
        insert_job(&conn, job, self.now())
    }

    fn enqueue_batch(&self, jobs: &[NewJob]) -> SimResult<Vec<JobId>> {
        let now = self.now();
        self.atomically(|tx| jobs.iter().map(|job| insert_job(tx, job, now)).collect())
    }

    fn reserve(&self, queues: &[QueueName], now: TimestampMs, lease_ms: i64) -> SimResult<Option<QueuedJob>> {
        if queues.is_empty() {
            return Ok(None);
        }
        let list = queue_list(queues);
        let sql = format!(
            "UPDATE job
             SET attempts_made = attempts_made + (CASE state WHEN 'active' THEN 1 ELSE 0 END),
                 state = 'active', lease_until = ?2
             WHERE seq = (
                SELECT seq FROM job
                WHERE queue IN ({list})
                  AND ((state = 'waiting' AND run_at <= ?1)
                    OR (state = 'active' AND lease_until <= ?1))
                ORDER BY run_at ASC, seq ASC LIMIT 1
             )
             RETURNING job_id, queue, payload, policy, run_at, enqueued_at, attempts_made"
        );
        let row = self.atomically(|tx| {
            let row = tx
                .query_row(&sql, params![now, now + lease_ms.max(1)], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                })
                .optional()?;
            Ok(row)
        })?;

        let Some((id, queue, payload, policy, run_at, enqueued_at, attempts_made)) = row else {
            return Ok(None);
        };
        Ok(Some(QueuedJob {
            id,
            queue: QueueName::parse(&queue).unwrap_or(QueueName::Control),
            payload: serde_json::from_str(&payload)?,
            run_at,
            enqueued_at,
            attempts_made: attempts_made as u32,
            policy: serde_json::from_str(&policy)?,
        }))
    }

    fn complete(&self, job_id: &str) -> SimResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE job SET state = 'completed', lease_until = NULL, finished_at = ?2 WHERE job_id = ?1",
            params![job_id, self.now()],
        )?;
        Ok(())
    }

    fn retry(&self, job_id: &str, run_at: TimestampMs, error: &str) -> SimResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE job SET state = 'waiting', run_at = ?2, attempts_made = attempts_made + 1,
                            lease_until = NULL, last_error = ?3
             WHERE job_id = ?1",
            params![job_id, run_at, error],
        )?;
        Ok(())
    }

    fn fail(&self, job_id: &str, error: &str) -> SimResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE job SET state = 'failed', attempts_made = attempts_made + 1,
                            lease_until = NULL, last_error = ?2, finished_at = ?3
             WHERE job_id = ?1",
            params![job_id, error, self.now()],
        )?;
        Ok(())
    }

    fn waiting_count(&self, queues: &[QueueName]) -> SimResult<u64> {
        if queues.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "SELECT COUNT(*) FROM job WHERE state = 'waiting' AND queue IN ({})",
            queue_list(queues)
        );
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n as u64)
    }

    fn next_due_at(&self, queues: &[QueueName]) -> SimResult<Option<TimestampMs>> {
        if queues.is_empty() {
            return Ok(None);
        }
        let sql = format!(
            "SELECT MIN(CASE state WHEN 'waiting' THEN run_at ELSE lease_until END) FROM job
             WHERE state IN ('waiting', 'active') AND queue IN ({})",
            queue_list(queues)
        );
        let conn = self.conn.lock();
        let t: Option<i64> = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(t)
    }

    fn purge_simulation(&self, simulation_id: &str) -> SimResult<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM job WHERE simulation_id = ?1 AND state = 'waiting'",
            [simulation_id],
        )?;
        Ok(removed)
    }

    fn state_counts(&self, simulation_id: &str) -> SimResult<BTreeMap<String, u64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT state, COUNT(*) FROM job WHERE simulation_id = ?1 GROUP BY state",
        )?;
        let rows = stmt
            .query_map([simulation_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(rows)
    }
}
