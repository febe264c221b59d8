//! SQLite-backed job queue.
//!
//! Jobs, their uploads and their results live in a single `jobs` table, so a
//! restart loses nothing: queued jobs are still queued, and jobs that were
//! mid-conversion when the process died are put back in the queue on open.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tokio::sync::Notify;
use transcoding::converter::{MP4_CONTENT_TYPE, WEBP_CONTENT_TYPE};
use transcoding::{ConversionRequest, ConversionResult, OutputKind};
use uuid::Uuid;

use crate::jobs::{
    ClaimedJob, FetchOutcome, JobId, JobQueue, JobState, JobStatus, QueueError, QueueResult,
};

pub type DbPool = Pool<SqliteConnectionManager>;

const POOL_SIZE: u32 = 4;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Claimers re-check the table this often even without a local wakeup.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(500);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id           TEXT PRIMARY KEY,
    state        TEXT NOT NULL,
    quality      INTEGER NOT NULL,
    output_kind  TEXT NOT NULL,
    source       BLOB,
    result       BLOB,
    content_type TEXT,
    error        TEXT,
    created_at   TEXT NOT NULL,
    started_at   TEXT,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_state_created ON jobs (state, created_at);
";

const STATUS_COLS: &str = "id, state, error, created_at, started_at, completed_at";

pub struct SqliteJobQueue {
    pool: DbPool,
    wakeup: Notify,
}

impl SqliteJobQueue {
    /// Opens (or creates) the job database at `path`.
    pub fn open(path: &Path) -> QueueResult<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA busy_timeout = 5000;",
            )
        });
        let pool = Pool::builder()
            .max_size(POOL_SIZE)
            .connection_timeout(CONNECTION_TIMEOUT)
            .build(manager)?;

        log::info!("Opened job store at {}", path.display());
        Self::from_pool(pool)
    }

    /// Private in-memory database behind a single pooled connection.
    pub fn open_in_memory() -> QueueResult<Self> {
        let uri = format!("file:jobs_{}?mode=memory&cache=shared", Uuid::new_v4().simple());
        let manager = SqliteConnectionManager::file(uri);
        let pool = Pool::builder().max_size(1).build(manager)?;

        Self::from_pool(pool)
    }

    fn from_pool(pool: DbPool) -> QueueResult<Self> {
        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;

        let requeued = conn.execute(
            "UPDATE jobs SET state = 'queued', started_at = NULL WHERE state = 'processing'",
            [],
        )?;
        if requeued > 0 {
            log::warn!("Requeued {} jobs interrupted by a previous shutdown", requeued);
        }
        drop(conn);

        Ok(Self {
            pool,
            wakeup: Notify::new(),
        })
    }

    /// Runs `f` on a pooled connection off the async executor.
    async fn with_conn<T, F>(&self, f: F) -> QueueResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> QueueResult<T> {
            let mut conn = pool.get()?;
            Ok(f(&mut *conn)?)
        })
        .await
        .map_err(|e| QueueError::Task(e.to_string()))?
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, err.into())
}

fn timestamp(row: &Row<'_>, column: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let Some(raw) = row.get::<_, Option<String>>(column)? else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(&raw)
        .map(|parsed| Some(parsed.with_timezone(&Utc)))
        .map_err(|e| conversion_error(column, e))
}

fn job_id(row: &Row<'_>, column: usize) -> rusqlite::Result<JobId> {
    let raw: String = row.get(column)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(column, e))
}

fn job_state(row: &Row<'_>, column: usize) -> rusqlite::Result<JobState> {
    let raw: String = row.get(column)?;
    raw.parse().map_err(|e: String| conversion_error(column, e))
}

fn status_from_row(row: &Row<'_>) -> rusqlite::Result<JobStatus> {
    Ok(JobStatus {
        job_id: job_id(row, 0)?,
        status: job_state(row, 1)?,
        error: row.get(2)?,
        created_at: timestamp(row, 3)?.ok_or_else(|| conversion_error(3, "missing created_at"))?,
        started_at: timestamp(row, 4)?,
        completed_at: timestamp(row, 5)?,
    })
}

fn output_kind_name(kind: OutputKind) -> &'static str {
    match kind {
        OutputKind::AnimatedImage => "webp",
        OutputKind::Video => "mp4",
    }
}

fn stored_content_type(raw: &str) -> Option<&'static str> {
    match raw {
        WEBP_CONTENT_TYPE => Some(WEBP_CONTENT_TYPE),
        MP4_CONTENT_TYPE => Some(MP4_CONTENT_TYPE),
        _ => None,
    }
}

fn dequeue_next(conn: &mut Connection) -> rusqlite::Result<Option<ClaimedJob>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let next = tx
        .query_row(
            "SELECT id, quality, output_kind, source FROM jobs
             WHERE state = 'queued'
             ORDER BY created_at ASC, rowid ASC
             LIMIT 1",
            [],
            |row| {
                let kind: String = row.get(2)?;
                Ok(ClaimedJob {
                    id: job_id(row, 0)?,
                    request: ConversionRequest {
                        quality: row.get(1)?,
                        output_kind: kind.parse().map_err(|e: String| conversion_error(2, e))?,
                        source: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
                    },
                })
            },
        )
        .optional()?;

    if let Some(job) = &next {
        tx.execute(
            "UPDATE jobs SET state = 'processing', started_at = ?1 WHERE id = ?2",
            params![now(), job.id.to_string()],
        )?;
    }

    tx.commit()?;
    Ok(next)
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn submit(&self, request: ConversionRequest) -> QueueResult<JobId> {
        let id = Uuid::new_v4();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO jobs (id, state, quality, output_kind, source, created_at)
                 VALUES (?1, 'queued', ?2, ?3, ?4, ?5)",
                params![
                    id.to_string(),
                    request.quality,
                    output_kind_name(request.output_kind),
                    request.source,
                    now()
                ],
            )
        })
        .await?;

        self.wakeup.notify_one();
        log::info!("Queued job {}", id);
        Ok(id)
    }

    async fn poll(&self, id: JobId) -> QueueResult<Option<JobStatus>> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {STATUS_COLS} FROM jobs WHERE id = ?1"),
                [id.to_string()],
                status_from_row,
            )
            .optional()
        })
        .await
    }

    async fn fetch(&self, id: JobId) -> QueueResult<FetchOutcome> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let row = tx
                .query_row(
                    "SELECT state, result, content_type, error FROM jobs WHERE id = ?1",
                    [id.to_string()],
                    |row| {
                        Ok((
                            job_state(row, 0)?,
                            row.get::<_, Option<Vec<u8>>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                        ))
                    },
                )
                .optional()?;

            let outcome = match row {
                None => FetchOutcome::NotFound,
                Some((JobState::Completed, Some(bytes), Some(content_type), _)) => {
                    let content_type = stored_content_type(&content_type).ok_or_else(|| {
                        conversion_error(2, format!("unknown content type '{}'", content_type))
                    })?;
                    tx.execute("DELETE FROM jobs WHERE id = ?1", [id.to_string()])?;
                    log::info!("Result for job {} fetched", id);
                    FetchOutcome::Ready(ConversionResult {
                        bytes,
                        content_type,
                    })
                }
                Some((JobState::Completed, _, _, _)) => FetchOutcome::NotFound,
                Some((JobState::Failed, _, _, error)) => {
                    FetchOutcome::Failed(error.unwrap_or_default())
                }
                Some((state, _, _, _)) => FetchOutcome::Pending(state),
            };

            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn claim(&self) -> QueueResult<Option<ClaimedJob>> {
        loop {
            if let Some(job) = self.with_conn(dequeue_next).await? {
                return Ok(Some(job));
            }

            // Another process may share the database, so do not rely on the wakeup alone
            let _ = tokio::time::timeout(CLAIM_POLL_INTERVAL, self.wakeup.notified()).await;
        }
    }

    async fn complete(&self, id: JobId, outcome: Result<ConversionResult, String>) -> QueueResult<()> {
        let updated = self
            .with_conn(move |conn| {
                let (state, bytes, content_type, error) = match outcome {
                    Ok(result) => (JobState::Completed, Some(result.bytes), Some(result.content_type), None),
                    Err(error) => (JobState::Failed, None, None, Some(error)),
                };

                conn.execute(
                    "UPDATE jobs
                     SET state = ?1, result = ?2, content_type = ?3, error = ?4,
                         completed_at = ?5, source = NULL
                     WHERE id = ?6 AND state NOT IN ('completed', 'failed')",
                    params![state.as_str(), bytes, content_type, error, now(), id.to_string()],
                )
                .map(|changed| (changed, state))
            })
            .await?;

        match updated {
            (0, _) => log::warn!("Job {} missing or already finished, ignoring completion", id),
            (_, JobState::Completed) => log::info!("Job {} completed", id),
            (_, state) => log::warn!("Job {} {}", id, state.as_str()),
        }
        Ok(())
    }

    async fn prune(&self, retention: Duration) -> QueueResult<usize> {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return Ok(0);
        };
        let cutoff = cutoff.to_rfc3339_opts(SecondsFormat::Micros, true);

        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM jobs
                 WHERE state IN ('completed', 'failed') AND completed_at < ?1",
                [cutoff],
            )
        })
        .await
    }
}
