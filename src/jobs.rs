//! Asynchronous conversion jobs.
//!
//! A job moves `Queued -> Processing -> Completed | Failed` and never leaves
//! a terminal state. Its result can be fetched once; after that (or after the
//! retention window) the job is gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use transcoding::{ConversionRequest, ConversionResult, Converter};
use uuid::Uuid;

pub type JobId = Uuid;

/// Backoff after the job store fails to hand out work.
const CLAIM_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job store query failed: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Job store connection unavailable: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Job store task failed: {0}")]
    Task(String),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// Public view of a job, as returned by `poll`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: JobId,
    pub status: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A job handed to a worker.
#[derive(Debug)]
pub struct ClaimedJob {
    pub id: JobId,
    pub request: ConversionRequest,
}

/// What fetching a job's result found.
#[derive(Debug)]
pub enum FetchOutcome {
    Ready(ConversionResult),
    Pending(JobState),
    Failed(String),
    NotFound,
}

/// Queue backend seam. Implementations must be safe to share between the
/// HTTP handlers and any number of workers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn submit(&self, request: ConversionRequest) -> QueueResult<JobId>;

    async fn poll(&self, id: JobId) -> QueueResult<Option<JobStatus>>;

    /// Hands out a completed result at most once.
    async fn fetch(&self, id: JobId) -> QueueResult<FetchOutcome>;

    /// Waits for the next queued job and marks it `Processing`. `None` once
    /// the queue is closed.
    async fn claim(&self) -> QueueResult<Option<ClaimedJob>>;

    /// Records the outcome of a claimed job. Ignored if the job already
    /// reached a terminal state or no longer exists.
    async fn complete(&self, id: JobId, outcome: Result<ConversionResult, String>) -> QueueResult<()>;

    /// Drops terminal jobs that finished more than `retention` ago.
    async fn prune(&self, retention: Duration) -> QueueResult<usize>;
}

struct JobRecord {
    state: JobState,
    request: Option<ConversionRequest>,
    result: Option<ConversionResult>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    fn status(&self, id: JobId) -> JobStatus {
        JobStatus {
            job_id: id,
            status: self.state,
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// In-process queue backend. Jobs are lost when the process exits.
pub struct MemoryJobQueue {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    sender: mpsc::UnboundedSender<JobId>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<JobId>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            jobs: Mutex::new(HashMap::new()),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, JobRecord>> {
        // A panic while holding the lock cannot leave a record half-written
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn submit(&self, request: ConversionRequest) -> QueueResult<JobId> {
        let id = Uuid::new_v4();
        self.lock().insert(
            id,
            JobRecord {
                state: JobState::Queued,
                request: Some(request),
                result: None,
                error: None,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
            },
        );

        // The receiver lives as long as self, so this cannot fail
        if self.sender.send(id).is_err() {
            log::error!("Job queue closed, job {} will not be processed", id);
        }

        log::info!("Queued job {}", id);
        Ok(id)
    }

    async fn poll(&self, id: JobId) -> QueueResult<Option<JobStatus>> {
        Ok(self.lock().get(&id).map(|record| record.status(id)))
    }

    async fn fetch(&self, id: JobId) -> QueueResult<FetchOutcome> {
        let mut jobs = self.lock();

        let Some(record) = jobs.get_mut(&id) else {
            return Ok(FetchOutcome::NotFound);
        };

        Ok(match record.state {
            JobState::Completed => match record.result.take() {
                Some(result) => {
                    jobs.remove(&id);
                    log::info!("Result for job {} fetched", id);
                    FetchOutcome::Ready(result)
                }
                None => FetchOutcome::NotFound,
            },
            JobState::Failed => {
                FetchOutcome::Failed(record.error.clone().unwrap_or_default())
            }
            state => FetchOutcome::Pending(state),
        })
    }

    async fn claim(&self) -> QueueResult<Option<ClaimedJob>> {
        let mut receiver = self.receiver.lock().await;

        while let Some(id) = receiver.recv().await {
            let mut jobs = self.lock();

            // Pruned or otherwise gone before a worker got to it
            let Some(record) = jobs.get_mut(&id) else {
                continue;
            };
            let Some(request) = record.request.take() else {
                continue;
            };

            record.state = JobState::Processing;
            record.started_at = Some(Utc::now());
            return Ok(Some(ClaimedJob { id, request }));
        }

        Ok(None)
    }

    async fn complete(&self, id: JobId, outcome: Result<ConversionResult, String>) -> QueueResult<()> {
        let mut jobs = self.lock();

        let Some(record) = jobs.get_mut(&id) else {
            log::warn!("Completion for unknown job {}", id);
            return Ok(());
        };

        if record.state.is_terminal() {
            log::warn!("Job {} already {:?}, ignoring completion", id, record.state);
            return Ok(());
        }

        record.completed_at = Some(Utc::now());
        match outcome {
            Ok(result) => {
                log::info!("Job {} completed ({} bytes)", id, result.bytes.len());
                record.state = JobState::Completed;
                record.result = Some(result);
            }
            Err(error) => {
                log::warn!("Job {} failed: {}", id, error);
                record.state = JobState::Failed;
                record.error = Some(error);
            }
        }
        Ok(())
    }

    async fn prune(&self, retention: Duration) -> QueueResult<usize> {
        let now = Utc::now();

        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, record| match record.completed_at {
            Some(completed_at) if record.state.is_terminal() => now
                .signed_duration_since(completed_at)
                .to_std()
                .map(|age| age <= retention)
                .unwrap_or(true),
            _ => true,
        });
        Ok(before - jobs.len())
    }
}

/// Claims jobs one at a time and runs them through the converter.
pub struct JobWorker {
    queue: Arc<dyn JobQueue>,
    converter: Arc<Converter>,
    timeout: Duration,
    expose_details: bool,
}

impl JobWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        converter: Arc<Converter>,
        timeout: Duration,
        expose_details: bool,
    ) -> Self {
        Self {
            queue,
            converter,
            timeout,
            expose_details,
        }
    }

    /// Processes jobs until the queue closes.
    pub async fn run(self) {
        log::info!("Job worker started (timeout {:?})", self.timeout);
        while self.process_next().await {}
        log::info!("Job worker stopped");
    }

    /// Claims and finishes a single job. Returns `false` once the queue is closed.
    pub async fn process_next(&self) -> bool {
        let job = match self.queue.claim().await {
            Ok(Some(job)) => job,
            Ok(None) => return false,
            Err(err) => {
                log::error!("Failed to claim job: {}", err);
                tokio::time::sleep(CLAIM_RETRY_DELAY).await;
                return true;
            }
        };

        log::info!("Processing job {}", job.id);

        // Dropping a timed-out conversion drops its scratch space and kills ffmpeg
        let outcome = match tokio::time::timeout(self.timeout, self.converter.convert(job.request)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => {
                log::error!("Job {} conversion error: {}", job.id, err);
                Err(if err.is_client_error() || self.expose_details {
                    err.to_string()
                } else {
                    "Conversion failed".to_string()
                })
            }
            Err(_) => Err(format!(
                "Conversion timed out after {}s",
                self.timeout.as_secs_f32()
            )),
        };

        if let Err(err) = self.queue.complete(job.id, outcome).await {
            log::error!("Failed to record outcome of job {}: {}", job.id, err);
        }
        true
    }
}

/// Periodically drops finished jobs nobody fetched.
pub async fn run_retention_sweeper(queue: Arc<dyn JobQueue>, retention: Duration) {
    let period = (retention / 4).clamp(Duration::from_secs(1), Duration::from_secs(300));
    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;
        match queue.prune(retention).await {
            Ok(0) => {}
            Ok(removed) => log::info!("Retention sweep removed {} unfetched jobs", removed),
            Err(err) => log::error!("Retention sweep failed: {}", err),
        }
    }
}
