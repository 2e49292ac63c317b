use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, Row};
use tracing::debug;

use super::{StoredBucket, UsageStore};
use crate::error::{Error, Result};
use crate::types::{BucketKey, DateRange, SyncOutcome, SyncStatus, UsageBucket, UsageCounters};

const SCHEMA_VERSION: i64 = 1;

pub struct SqliteStore {
    conn: Connection,
    retention: usize,
}

fn conversion_error(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_time(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

/// SQLite integers are signed; saturated counters are stored as `i64::MAX`.
fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn row_to_bucket(row: &Row<'_>) -> rusqlite::Result<StoredBucket> {
    let date: String = row.get(2)?;
    let date: NaiveDate = date.parse().map_err(|e| conversion_error(2, e))?;
    Ok(StoredBucket {
        bucket: UsageBucket {
            key: BucketKey {
                provider: row.get(0)?,
                label: row.get(1)?,
                date,
                hour: row.get::<_, i64>(3)? as u8,
            },
            counters: UsageCounters {
                input_tokens: from_sql_count(row.get(4)?),
                output_tokens: from_sql_count(row.get(5)?),
                cache_read_tokens: from_sql_count(row.get(6)?),
                cache_write_tokens: from_sql_count(row.get(7)?),
                request_count: from_sql_count(row.get(8)?),
                estimated_cost_usd: row.get(9)?,
            },
        },
        synced_at: parse_time(10, row.get(10)?)?,
    })
}

fn row_to_outcome(row: &Row<'_>) -> rusqlite::Result<SyncOutcome> {
    let status: String = row.get(1)?;
    Ok(SyncOutcome {
        provider: row.get(0)?,
        // Unknown statuses only appear if the table was edited by hand.
        status: SyncStatus::parse(&status).unwrap_or(SyncStatus::Error),
        message: row.get(2)?,
        rows: row.get::<_, i64>(3)? as usize,
        synced_at: parse_time(4, row.get(4)?)?,
    })
}

impl SqliteStore {
    pub fn open(path: &Path, retention: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        debug!(path = %path.display(), "opened sqlite store");
        Self::init(conn, retention)
    }

    pub fn in_memory(retention: usize) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, retention)
    }

    fn init(conn: Connection, retention: usize) -> Result<Self> {
        let version: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        // Usage rows are derived data; the next sync recomputes them.
        if version < SCHEMA_VERSION {
            conn.execute_batch("DROP TABLE IF EXISTS usage_records;")?;
        }

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS usage_records (
                 provider            TEXT NOT NULL,
                 model               TEXT NOT NULL,
                 date                TEXT NOT NULL,
                 hour                INTEGER NOT NULL,
                 input_tokens        INTEGER NOT NULL,
                 output_tokens       INTEGER NOT NULL,
                 cache_read_tokens   INTEGER NOT NULL,
                 cache_write_tokens  INTEGER NOT NULL,
                 request_count       INTEGER NOT NULL,
                 estimated_cost_usd  REAL NOT NULL,
                 total_tokens        INTEGER NOT NULL,
                 synced_at           TEXT NOT NULL,
                 UNIQUE (provider, model, date, hour)
             );

             CREATE TABLE IF NOT EXISTS sync_log (
                 id         INTEGER PRIMARY KEY AUTOINCREMENT,
                 provider   TEXT NOT NULL,
                 status     TEXT NOT NULL,
                 message    TEXT NOT NULL,
                 rows       INTEGER NOT NULL DEFAULT 0,
                 synced_at  TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_usage_date ON usage_records(date);

             PRAGMA user_version = {SCHEMA_VERSION};"
        ))?;

        Ok(Self { conn, retention })
    }
}

impl UsageStore for SqliteStore {
    fn upsert_buckets(&mut self, rows: &[UsageBucket], synced_at: DateTime<Utc>) -> Result<usize> {
        let synced_at = synced_at.to_rfc3339();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO usage_records (
                    provider, model, date, hour,
                    input_tokens, output_tokens, cache_read_tokens, cache_write_tokens,
                    request_count, estimated_cost_usd, total_tokens, synced_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(provider, model, date, hour) DO UPDATE SET
                    input_tokens       = excluded.input_tokens,
                    output_tokens      = excluded.output_tokens,
                    cache_read_tokens  = excluded.cache_read_tokens,
                    cache_write_tokens = excluded.cache_write_tokens,
                    request_count      = excluded.request_count,
                    estimated_cost_usd = excluded.estimated_cost_usd,
                    total_tokens       = excluded.total_tokens,
                    synced_at          = excluded.synced_at",
            )?;
            for row in rows {
                let c = &row.counters;
                stmt.execute(params![
                    row.key.provider,
                    row.key.label,
                    row.key.date.to_string(),
                    i64::from(row.key.hour),
                    to_sql_count(c.input_tokens),
                    to_sql_count(c.output_tokens),
                    to_sql_count(c.cache_read_tokens),
                    to_sql_count(c.cache_write_tokens),
                    to_sql_count(c.request_count),
                    c.estimated_cost_usd,
                    to_sql_count(c.billable_tokens()),
                    synced_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    fn append_outcome(&mut self, outcome: &SyncOutcome) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO sync_log (provider, status, message, rows, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                outcome.provider,
                outcome.status.as_str(),
                outcome.message,
                outcome.rows as i64,
                outcome.synced_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "DELETE FROM sync_log WHERE id NOT IN
                (SELECT id FROM sync_log ORDER BY id DESC LIMIT ?1)",
            params![self.retention as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn buckets(&self, range: Option<&DateRange>) -> Result<Vec<StoredBucket>> {
        // ISO dates compare correctly as text.
        let (start, end) = match range {
            Some(r) => (r.start.to_string(), r.end.to_string()),
            None => ("0000-01-01".to_string(), "9999-12-31".to_string()),
        };
        let mut stmt = self.conn.prepare(
            "SELECT provider, model, date, hour,
                    input_tokens, output_tokens, cache_read_tokens, cache_write_tokens,
                    request_count, estimated_cost_usd, synced_at
               FROM usage_records
              WHERE date BETWEEN ?1 AND ?2
              ORDER BY provider, model, date, hour",
        )?;
        let rows = stmt
            .query_map(params![start, end], row_to_bucket)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn recent_outcomes(&self, limit: usize) -> Result<Vec<SyncOutcome>> {
        let mut stmt = self.conn.prepare(
            "SELECT provider, status, message, rows, synced_at
               FROM sync_log ORDER BY id DESC LIMIT ?1",
        )?;
        let outcomes = stmt
            .query_map(params![limit.min(i64::MAX as usize) as i64], row_to_outcome)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(outcomes)
    }

    fn latest_outcomes(&self) -> Result<Vec<SyncOutcome>> {
        let mut stmt = self.conn.prepare(
            "SELECT provider, status, message, rows, synced_at
               FROM sync_log
              WHERE id IN (SELECT MAX(id) FROM sync_log GROUP BY provider)
              ORDER BY provider",
        )?;
        let outcomes = stmt
            .query_map([], row_to_outcome)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(outcomes)
    }

    fn rebuild(&mut self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM usage_records", [])?)
    }
}
