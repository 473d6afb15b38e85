//! SQLite outbox: capture records and the context cache table

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use crate::cache::CacheEntry;
use crate::capture::{CaptureRecord, CaptureStatus, NewCapture, RetryOutcome};
use crate::config::Config;
use crate::error::{Error, Result};

const CAPTURE_COLUMNS: &str = "id, session_id, input_text, output_text, channel, created_at, \
                               updated_at, status, retry_count, last_error, sent_at";

/// Durable outbox backed by a single SQLite connection.
///
/// Every method takes the connection lock for its whole duration, so status
/// transitions are serialized even when several tasks share the store.
pub struct OutboxStore {
    conn: Arc<Mutex<Connection>>,
}

impl OutboxStore {
    /// Open the outbox in the configured data directory
    pub fn new(config: &Config) -> Result<Self> {
        config.ensure_dirs()?;
        Self::open(config.sqlite_path())
    }

    /// Open (or create) an outbox at an explicit path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| Error::storage(e.to_string()))
    }

    /// Durably store a new capture as `pending`
    pub fn append(&self, capture: &NewCapture, now: DateTime<Utc>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let conn = self.lock()?;

        conn.execute(
            r#"
            INSERT INTO captures (
                id, session_id, input_text, output_text, channel,
                created_at, updated_at, status, retry_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 'pending', 0)
            "#,
            params![
                id.to_string(),
                capture.session_id,
                capture.input_text,
                capture.output_text,
                capture.channel,
                ts(&now),
            ],
        )?;

        Ok(id)
    }

    /// Get a capture by ID
    pub fn get(&self, id: Uuid) -> Result<Option<CaptureRecord>> {
        let conn = self.lock()?;
        Self::get_with(&conn, id)
    }

    fn get_with(conn: &Connection, id: Uuid) -> Result<Option<CaptureRecord>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM captures WHERE id = ?1", CAPTURE_COLUMNS),
                params![id.to_string()],
                CaptureRow::from_row,
            )
            .optional()?;

        row.map(CaptureRow::into_record).transpose()
    }

    /// Move up to `limit` of the oldest pending captures to `sending`.
    ///
    /// Select and update run in one immediate transaction, so overlapping
    /// callers never receive the same capture.
    pub fn claim_next_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<CaptureRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let rows = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM captures WHERE status = 'pending' \
                 ORDER BY created_at ASC, seq ASC LIMIT ?1",
                CAPTURE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![limit as i64], CaptureRow::from_row)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let now_str = ts(&now);
        for row in &rows {
            tx.execute(
                "UPDATE captures SET status = 'sending', updated_at = ?2 \
                 WHERE id = ?1 AND status = 'pending'",
                params![row.id, now_str],
            )?;
        }
        tx.commit()?;

        rows.into_iter()
            .map(|row| {
                let mut record = row.into_record()?;
                record.status = CaptureStatus::Sending;
                record.updated_at = now;
                Ok(record)
            })
            .collect()
    }

    /// Claim one specific pending capture. `None` if someone else got it first.
    pub fn claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<CaptureRecord>> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE captures SET status = 'sending', updated_at = ?2 \
             WHERE id = ?1 AND status = 'pending'",
            params![id.to_string(), ts(&now)],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Self::get_with(&conn, id)
    }

    /// Record a successful delivery
    pub fn mark_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE captures SET status = 'sent', sent_at = ?2, updated_at = ?2, last_error = NULL \
             WHERE id = ?1 AND status = 'sending'",
            params![id.to_string(), ts(&at)],
        )?;
        if changed == 0 {
            return Err(Self::transition_error(&conn, id, CaptureStatus::Sent)?);
        }
        Ok(())
    }

    /// Record a genuine delivery failure. The capture goes back to `pending`
    /// unless this failure exhausts `max_retries`, in which case it is failed.
    pub fn mark_retry(
        &self,
        id: Uuid,
        error: &str,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<u32> = tx
            .query_row(
                "SELECT retry_count FROM captures WHERE id = ?1 AND status = 'sending'",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(current) = current else {
            drop(tx);
            return Err(Self::transition_error(&conn, id, CaptureStatus::Pending)?);
        };

        let retry_count = current + 1;
        let (status, outcome) = if retry_count >= max_retries {
            (CaptureStatus::Failed, RetryOutcome::Failed { retry_count })
        } else {
            (CaptureStatus::Pending, RetryOutcome::Requeued { retry_count })
        };

        tx.execute(
            "UPDATE captures SET status = ?2, retry_count = ?3, last_error = ?4, updated_at = ?5 \
             WHERE id = ?1",
            params![id.to_string(), status.as_str(), retry_count, error, ts(&now)],
        )?;
        tx.commit()?;

        Ok(outcome)
    }

    /// Give up on a claimed capture without touching its retry count
    pub fn mark_failed(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE captures SET status = 'failed', last_error = ?2, updated_at = ?3 \
             WHERE id = ?1 AND status = 'sending'",
            params![id.to_string(), error, ts(&now)],
        )?;
        if changed == 0 {
            return Err(Self::transition_error(&conn, id, CaptureStatus::Failed)?);
        }
        Ok(())
    }

    /// Return a claimed capture to `pending` without penalty
    pub fn requeue(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE captures SET status = 'pending', updated_at = ?2 \
             WHERE id = ?1 AND status = 'sending'",
            params![id.to_string(), ts(&now)],
        )?;
        if changed == 0 {
            return Err(Self::transition_error(&conn, id, CaptureStatus::Pending)?);
        }
        Ok(())
    }

    /// Delete terminal captures that finished before `older_than`
    pub fn purge(&self, older_than: DateTime<Utc>, statuses: &[CaptureStatus]) -> Result<usize> {
        let conn = self.lock()?;
        let cutoff = ts(&older_than);
        let mut deleted = 0;

        for status in statuses {
            let sql = match status {
                CaptureStatus::Sent => {
                    "DELETE FROM captures WHERE status = 'sent' AND sent_at < ?1"
                }
                CaptureStatus::Failed => {
                    "DELETE FROM captures WHERE status = 'failed' AND updated_at < ?1"
                }
                other => {
                    return Err(Error::invalid_input(format!(
                        "refusing to purge non-terminal status {}",
                        other
                    )))
                }
            };
            deleted += conn.execute(sql, params![cutoff])?;
        }

        Ok(deleted)
    }

    /// Reset captures left in `sending` by a process that died mid-send
    pub fn reconcile_stuck(&self, grace: chrono::Duration, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let reset = conn.execute(
            "UPDATE captures SET status = 'pending', updated_at = ?2 \
             WHERE status = 'sending' AND updated_at < ?1",
            params![ts(&(now - grace)), ts(&now)],
        )?;
        Ok(reset)
    }

    /// Pending plus sending captures
    pub fn queue_depth(&self) -> Result<u64> {
        let conn = self.lock()?;
        let depth: i64 = conn.query_row(
            "SELECT COUNT(*) FROM captures WHERE status IN ('pending', 'sending')",
            [],
            |row| row.get(0),
        )?;
        Ok(depth as u64)
    }

    /// Creation time of the oldest capture still waiting for delivery
    pub fn oldest_pending_created_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let oldest: Option<String> = conn.query_row(
            "SELECT MIN(created_at) FROM captures WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        oldest.as_deref().map(parse_ts).transpose()
    }

    /// Captures that reached `status` at or after `since`
    pub fn count_finished_since(&self, status: CaptureStatus, since: DateTime<Utc>) -> Result<u64> {
        let sql = match status {
            CaptureStatus::Sent => "SELECT COUNT(*) FROM captures WHERE status = 'sent' AND sent_at >= ?1",
            CaptureStatus::Failed => {
                "SELECT COUNT(*) FROM captures WHERE status = 'failed' AND updated_at >= ?1"
            }
            other => {
                return Err(Error::invalid_input(format!(
                    "{} is not a finished status",
                    other
                )))
            }
        };

        let conn = self.lock()?;
        let count: i64 = conn.query_row(sql, params![ts(&since)], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Capture counts grouped by status
    pub fn count_by_status(&self) -> Result<HashMap<CaptureStatus, u64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM captures GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = HashMap::new();
        for row in rows {
            let (status, count) = row?;
            counts.insert(status.parse::<CaptureStatus>()?, count as u64);
        }
        Ok(counts)
    }

    /// Explain why a guarded update touched nothing
    fn transition_error(conn: &Connection, id: Uuid, target: CaptureStatus) -> Result<Error> {
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM captures WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(match current {
            None => Error::not_found(format!("capture {}", id)),
            Some(status) => Error::invalid_transition(format!(
                "capture {} is {}, cannot move to {}",
                id, status, target
            )),
        })
    }

    // --- Context cache ---

    /// Look up a cached context payload
    pub fn cache_get(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT fingerprint, query, payload, fetched_at FROM context_cache WHERE fingerprint = ?1",
                params![fingerprint],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(fingerprint, query, payload, fetched_at)| {
            Ok(CacheEntry {
                fingerprint,
                query,
                payload,
                fetched_at: parse_ts(&fetched_at)?,
            })
        })
        .transpose()
    }

    /// Insert or refresh a cache entry, then evict the oldest fetches beyond
    /// `capacity`. Returns how many entries were evicted.
    pub fn cache_put(&self, entry: &CacheEntry, capacity: usize) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            r#"
            INSERT INTO context_cache (fingerprint, query, payload, fetched_at, seq)
            VALUES (?1, ?2, ?3, ?4, (SELECT COALESCE(MAX(seq), 0) + 1 FROM context_cache))
            ON CONFLICT(fingerprint) DO UPDATE SET
                query = excluded.query,
                payload = excluded.payload,
                fetched_at = excluded.fetched_at,
                seq = excluded.seq
            "#,
            params![entry.fingerprint, entry.query, entry.payload, ts(&entry.fetched_at)],
        )?;

        let evicted = tx.execute(
            r#"
            DELETE FROM context_cache WHERE fingerprint IN (
                SELECT fingerprint FROM context_cache
                ORDER BY fetched_at DESC, seq DESC
                LIMIT -1 OFFSET ?1
            )
            "#,
            params![capacity as i64],
        )?;
        tx.commit()?;

        Ok(evicted)
    }

    /// Remove cache entries fetched before `cutoff`
    pub fn cache_purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM context_cache WHERE fetched_at < ?1",
            params![ts(&cutoff)],
        )?;
        Ok(deleted)
    }

    /// Number of cached context entries
    pub fn cache_len(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM context_cache", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Fixed-width UTC timestamps so text comparison in SQL matches time order
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::storage(format!("bad timestamp {:?}: {}", raw, e)))
}

/// Intermediate struct for reading from SQLite
struct CaptureRow {
    id: String,
    session_id: String,
    input_text: String,
    output_text: String,
    channel: String,
    created_at: String,
    updated_at: String,
    status: String,
    retry_count: u32,
    last_error: Option<String>,
    sent_at: Option<String>,
}

impl CaptureRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            input_text: row.get(2)?,
            output_text: row.get(3)?,
            channel: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            status: row.get(7)?,
            retry_count: row.get(8)?,
            last_error: row.get(9)?,
            sent_at: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<CaptureRecord> {
        Ok(CaptureRecord {
            id: Uuid::parse_str(&self.id).map_err(|e| Error::storage(e.to_string()))?,
            session_id: self.session_id,
            input_text: self.input_text,
            output_text: self.output_text,
            channel: self.channel,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            status: self.status.parse()?,
            retry_count: self.retry_count,
            last_error: self.last_error,
            sent_at: self.sent_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}
