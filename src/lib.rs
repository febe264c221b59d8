//! # Recompress Worker
//!
//! An HTTP microservice that recompresses uploaded images and short
//! animations at a caller-chosen quality.
//!
//! Still images are re-encoded in-process to lossy WebP. Animated GIFs are
//! handed to ffmpeg and come back as animated WebP or MP4. The conversion
//! pipeline itself lives in the `transcoding` crate; this crate adds the
//! HTTP surface, API-key authentication and the asynchronous job queue.
//!
//! ## Modes
//!
//! - **sync**: `POST /convert` answers with the converted bytes.
//! - **queued**: `POST /convert` answers `202` with a job id; clients poll
//!   `GET /status/{job_id}` and collect the bytes once from
//!   `GET /result/{job_id}`.
//!
//! ## Architecture
//!
//! - [`config`]: environment configuration, loaded once at startup
//! - [`auth`]: `x-api-key` allow-list extractor
//! - [`error`]: error types and HTTP error responses
//! - [`handlers`]: HTTP request handlers and route registration
//! - [`jobs`]: job queue trait, in-memory backend and worker loop
//! - [`store`]: durable SQLite job queue
//!
//! ## Example
//!
//! ```no_run
//! use actix_web::{web, App, HttpServer};
//! use recompress_worker::{handlers, AppState, Config};
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let config = Config::from_env().expect("invalid configuration");
//!     let mode = config.mode;
//!     let state = web::Data::new(AppState::from_config(config).expect("job store unavailable"));
//!
//!     HttpServer::new(move || {
//!         App::new()
//!             .app_data(state.clone())
//!             .configure(handlers::routes(mode))
//!     })
//!     .bind("0.0.0.0:3000")?
//!     .run()
//!     .await
//! }
//! ```

use std::sync::Arc;

use transcoding::{Converter, FfmpegTranscoder, WebpStillEncoder};

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod store;

pub use config::{Config, ConfigError, Environment, JobStoreKind, ServiceMode};
pub use error::{Result, WorkerError};
pub use jobs::{JobQueue, JobState, JobStatus, JobWorker, MemoryJobQueue, QueueError};
pub use store::SqliteJobQueue;

/// Shared by every handler.
pub struct AppState {
    pub config: Arc<Config>,
    pub converter: Arc<Converter>,
    /// Present only in queued mode.
    pub jobs: Option<Arc<dyn JobQueue>>,
}

impl AppState {
    /// Wires the ffmpeg/WebP converter and, in queued mode, the configured
    /// job store.
    pub fn from_config(config: Config) -> std::result::Result<Self, QueueError> {
        let animated = FfmpegTranscoder::new(&config.ffmpeg_path, &config.scratch_dir)
            .with_timeout(config.job_timeout);
        let converter = Converter::new(
            Arc::new(WebpStillEncoder::new()),
            Arc::new(animated),
            config.still_concurrency,
        );

        let jobs: Option<Arc<dyn JobQueue>> = match (config.mode, config.job_store) {
            (ServiceMode::Sync, _) => None,
            (ServiceMode::Queued, JobStoreKind::Sqlite) => {
                Some(Arc::new(SqliteJobQueue::open(&config.job_db_path)?))
            }
            (ServiceMode::Queued, JobStoreKind::Memory) => Some(Arc::new(MemoryJobQueue::new())),
        };

        Ok(Self {
            config: Arc::new(config),
            converter: Arc::new(converter),
            jobs,
        })
    }

    /// One worker per configured slot, all sharing this state's queue.
    pub fn job_workers(&self) -> Vec<JobWorker> {
        let Some(queue) = &self.jobs else {
            return Vec::new();
        };

        (0..self.config.job_workers)
            .map(|_| {
                JobWorker::new(
                    Arc::clone(queue),
                    Arc::clone(&self.converter),
                    self.config.job_timeout,
                    self.config.expose_error_details(),
                )
            })
            .collect()
    }
}
