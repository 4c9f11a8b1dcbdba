//! Durable FIFO buffer for task results produced while upstream is
//! unreachable.
//!
//! Backed by a single-file SQLite database so buffered results survive
//! process restarts. Capacity is evaluated on pending rows only; rows that
//! exhaust their retry budget move to a `failed` dead-letter state and stop
//! consuming capacity.

use crate::sink::{ResultEnvelope, ResultSink};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer capacity exceeded (current={current}, max={max})")]
    Full { current: i64, max: i64 },
    #[error("task {0} already buffered")]
    DuplicateTask(String),
    #[error(transparent)]
    Backend(#[from] sqlx::Error),
}

/// One buffered row.
#[derive(Debug, Clone, Serialize)]
pub struct BufferedResult {
    pub id: i64,
    pub task_id: String,
    pub agent_id: String,
    pub lease_token: String,
    pub result: Value,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub retry_count: i64,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub status: String,
}

impl BufferedResult {
    pub fn envelope(&self) -> ResultEnvelope {
        ResultEnvelope {
            task_id: self.task_id.clone(),
            agent_id: self.agent_id.clone(),
            lease_token: self.lease_token.clone(),
            result: self.result.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferMetrics {
    pub current: i64,
    pub max: i64,
    pub util_pct: f64,
    pub oldest_age_s: Option<f64>,
    pub newest_age_s: Option<f64>,
}

pub struct ResultBuffer {
    pool: SqlitePool,
    max_size: i64,
    max_retries: i64,
    // Serializes the capacity-check-then-insert pair in enqueue.
    enqueue_lock: Mutex<()>,
}

impl ResultBuffer {
    /// Open (creating if missing) the buffer database at `path`.
    pub async fn open(
        path: impl AsRef<Path>,
        max_size: i64,
        max_retries: i64,
    ) -> Result<Self, BufferError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let buffer = Self {
            pool,
            max_size,
            max_retries,
            enqueue_lock: Mutex::new(()),
        };
        buffer.init_schema().await?;

        tracing::info!(
            event = "weft.buffer.opened",
            path = %path.as_ref().display(),
            capacity = max_size,
            max_retries,
            "result buffer opened"
        );
        Ok(buffer)
    }

    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS buffered_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL UNIQUE,
                agent_id TEXT NOT NULL,
                lease_token TEXT NOT NULL,
                result_json TEXT NOT NULL,
                metadata_json TEXT,
                created_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_retry_at TEXT,
                status TEXT NOT NULL DEFAULT 'pending'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_buffered_results_created_at
             ON buffered_results(created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_buffered_results_status
             ON buffered_results(status)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Buffer one result. FIFO position is the insertion time; `task_id` is
    /// unique across pending rows (a duplicate is a caller error).
    pub async fn enqueue(
        &self,
        task_id: &str,
        agent_id: &str,
        lease_token: &str,
        result: Value,
        metadata: Option<Value>,
    ) -> Result<i64, BufferError> {
        let _guard = self.enqueue_lock.lock().await;

        let current = self.size().await?;
        if current >= self.max_size {
            return Err(BufferError::Full {
                current,
                max: self.max_size,
            });
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO buffered_results
              (task_id, agent_id, lease_token, result_json, metadata_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(task_id)
        .bind(agent_id)
        .bind(lease_token)
        .bind(result.to_string())
        .bind(metadata.as_ref().map(|m| m.to_string()))
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        let row_id = match inserted {
            Ok(done) => done.last_insert_rowid(),
            Err(err) => {
                if err
                    .as_database_error()
                    .is_some_and(|db| db.is_unique_violation())
                {
                    return Err(BufferError::DuplicateTask(task_id.to_string()));
                }
                return Err(err.into());
            }
        };

        tracing::info!(
            event = "weft.buffer.enqueued",
            task_id,
            agent_id,
            row_id,
            size = current + 1,
            capacity = self.max_size,
            "buffered task result"
        );
        Ok(row_id)
    }

    /// Pending row count. Failed rows do not count against capacity.
    pub async fn size(&self) -> Result<i64, BufferError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM buffered_results WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// All pending rows, oldest first.
    pub async fn pending(&self) -> Result<Vec<BufferedResult>, BufferError> {
        self.rows_with_status("pending").await
    }

    /// Dead-letter set: rows that exhausted their retry budget.
    pub async fn get_failed_results(&self) -> Result<Vec<BufferedResult>, BufferError> {
        self.rows_with_status("failed").await
    }

    async fn rows_with_status(&self, status: &str) -> Result<Vec<BufferedResult>, BufferError> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, agent_id, lease_token, result_json, metadata_json,
                   created_at, retry_count, last_retry_at, status
            FROM buffered_results
            WHERE status = ?1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            results.push(decode_row(&row)?);
        }
        Ok(results)
    }

    /// Flush pending rows oldest-first through `sink`.
    ///
    /// Rows over the retry budget transition to `failed` and are skipped.
    /// A per-row delivery error increments its retry count and moves on; one
    /// bad row never poisons the rest of the pass. Returns the number
    /// delivered.
    pub async fn flush(&self, sink: &dyn ResultSink) -> Result<usize, BufferError> {
        let rows = self.pending().await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let total = rows.len();
        let mut flushed = 0usize;
        for row in rows {
            if row.retry_count >= self.max_retries {
                tracing::warn!(
                    event = "weft.buffer.retries_exhausted",
                    task_id = %row.task_id,
                    retry_count = row.retry_count,
                    "marking buffered result as failed"
                );
                sqlx::query("UPDATE buffered_results SET status = 'failed' WHERE id = ?1")
                    .bind(row.id)
                    .execute(&self.pool)
                    .await?;
                continue;
            }

            match sink.deliver(&row.envelope()).await {
                Ok(()) => {
                    sqlx::query("DELETE FROM buffered_results WHERE id = ?1")
                        .bind(row.id)
                        .execute(&self.pool)
                        .await?;
                    flushed += 1;
                    tracing::info!(
                        event = "weft.buffer.flushed_row",
                        task_id = %row.task_id,
                        "flushed buffered result"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        event = "weft.buffer.flush_row_failed",
                        task_id = %row.task_id,
                        retry_count = row.retry_count + 1,
                        error = %err,
                        "failed to flush buffered result"
                    );
                    sqlx::query(
                        "UPDATE buffered_results
                         SET retry_count = retry_count + 1, last_retry_at = ?2
                         WHERE id = ?1",
                    )
                    .bind(row.id)
                    .bind(Utc::now())
                    .execute(&self.pool)
                    .await?;
                }
            }
        }

        tracing::info!(
            event = "weft.buffer.flush_complete",
            flushed,
            total,
            "flush pass complete"
        );
        Ok(flushed)
    }

    pub async fn metrics(&self) -> Result<BufferMetrics, BufferError> {
        let current = self.size().await?;

        let row = sqlx::query(
            "SELECT MIN(created_at) AS oldest, MAX(created_at) AS newest
             FROM buffered_results WHERE status = 'pending'",
        )
        .fetch_one(&self.pool)
        .await?;

        let now = Utc::now();
        let oldest: Option<DateTime<Utc>> = row.try_get("oldest")?;
        let newest: Option<DateTime<Utc>> = row.try_get("newest")?;

        let age = |t: Option<DateTime<Utc>>| {
            t.map(|t| ((now - t).num_milliseconds() as f64 / 1000.0).max(0.0))
        };

        let util_pct = if self.max_size > 0 {
            (current as f64 / self.max_size as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        Ok(BufferMetrics {
            current,
            max: self.max_size,
            util_pct,
            oldest_age_s: age(oldest),
            newest_age_s: age(newest),
        })
    }
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<BufferedResult, sqlx::Error> {
    let result_json: String = row.try_get("result_json")?;
    let metadata_json: Option<String> = row.try_get("metadata_json")?;

    let decode = |raw: &str| {
        serde_json::from_str(raw).map_err(|err| sqlx::Error::ColumnDecode {
            index: "result_json".to_string(),
            source: Box::new(err),
        })
    };

    Ok(BufferedResult {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        agent_id: row.try_get("agent_id")?,
        lease_token: row.try_get("lease_token")?,
        result: decode(&result_json)?,
        metadata: metadata_json.as_deref().map(decode).transpose()?,
        created_at: row.try_get("created_at")?,
        retry_count: row.try_get("retry_count")?,
        last_retry_at: row.try_get("last_retry_at")?,
        status: row.try_get("status")?,
    })
}
