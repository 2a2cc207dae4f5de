use rusqlite::{params, OptionalExtension};

use super::SimStore;
use crate::{error::SimResult, kv::KvStore, types::TimestampMs};

fn expiry(now: TimestampMs, ttl_ms: Option<i64>) -> Option<i64> {
    ttl_ms.map(|ttl| now + ttl.max(0))
}

impl KvStore for SimStore {
    fn get(&self, key: &str) -> SimResult<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM kv
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, self.now()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str, ttl_ms: Option<i64>) -> SimResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![key, value, expiry(self.now(), ttl_ms)],
        )?;
        Ok(())
    }

    fn set_nx(&self, key: &str, value: &str, ttl_ms: Option<i64>) -> SimResult<bool> {
        let now = self.now();
        self.atomically(|tx| {
            tx.execute(
                "DELETE FROM kv WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                params![key, now],
            )?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, expiry(now, ttl_ms)],
            )?;
            Ok(inserted == 1)
        })
    }

    fn del(&self, key: &str) -> SimResult<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(removed == 1)
    }

    fn incr_by(&self, key: &str, delta: i64, ttl_ms: Option<i64>) -> SimResult<i64> {
        let now = self.now();
        self.atomically(|tx| {
            tx.execute(
                "DELETE FROM kv WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                params![key, now],
            )?;
            let value: i64 = tx.query_row(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, CAST(?2 AS TEXT), ?3)
                 ON CONFLICT(key) DO UPDATE
                   SET value = CAST(CAST(kv.value AS INTEGER) + ?2 AS TEXT)
                 RETURNING CAST(value AS INTEGER)",
                params![key, delta, expiry(now, ttl_ms)],
                |row| row.get(0),
            )?;
            Ok(value)
        })
    }

    fn decr_if_positive(&self, key: &str) -> SimResult<Option<i64>> {
        let now = self.now();
        self.atomically(|tx| {
            let value = tx
                .query_row(
                    "UPDATE kv SET value = CAST(CAST(value AS INTEGER) - 1 AS TEXT)
                     WHERE key = ?1 AND CAST(value AS INTEGER) > 0
                       AND (expires_at IS NULL OR expires_at > ?2)
                     RETURNING CAST(value AS INTEGER)",
                    params![key, now],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
    }

    fn zadd(&self, key: &str, member: &str, score: i64, ttl_ms: Option<i64>) -> SimResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv_zset (key, member, score, expires_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key, member) DO UPDATE
               SET score = excluded.score, expires_at = excluded.expires_at",
            params![key, member, score, expiry(self.now(), ttl_ms)],
        )?;
        Ok(())
    }

    fn zrem_by_score(&self, key: &str, max_score: i64) -> SimResult<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM kv_zset WHERE key = ?1 AND score <= ?2",
            params![key, max_score],
        )?;
        Ok(removed)
    }

    fn zcard(&self, key: &str) -> SimResult<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kv_zset
             WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            params![key, self.now()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    fn zrange_desc(&self, key: &str, limit: usize) -> SimResult<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT member, score FROM kv_zset
             WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)
             ORDER BY score DESC, member DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![key, self.now(), limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn ztrim_newest(&self, key: &str, keep: usize) -> SimResult<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM kv_zset WHERE key = ?1 AND member NOT IN (
                SELECT member FROM kv_zset WHERE key = ?1
                ORDER BY score DESC, member DESC LIMIT ?2
             )",
            params![key, keep as i64],
        )?;
        Ok(removed)
    }

    fn scan_prefix(&self, prefix: &str) -> SimResult<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv
             WHERE substr(key, 1, length(?1)) = ?1
               AND (expires_at IS NULL OR expires_at > ?2)
             ORDER BY key ASC",
        )?;
        let rows = stmt
            .query_map(params![prefix, self.now()], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn purge_expired(&self, now: TimestampMs) -> SimResult<usize> {
        self.atomically(|tx| {
            let a = tx.execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                [now],
            )?;
            let b = tx.execute(
                "DELETE FROM kv_zset WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                [now],
            )?;
            Ok(a + b)
        })
    }
}
