use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use futures_util::TryStreamExt;
use serde::Serialize;
use transcoding::{ConversionRequest, ConversionResult, OutputKind};
use uuid::Uuid;

use crate::auth::Authenticated;
use crate::config::ServiceMode;
use crate::error::{Result, WorkerError};
use crate::jobs::{FetchOutcome, JobQueue, JobState};
use crate::AppState;

/// Default when the form omits `quality`.
pub const DEFAULT_FORM_QUALITY: i64 = 80;

const MAX_TEXT_FIELD_BYTES: usize = 64;

/// Raw fields of a `/convert` upload.
#[derive(Debug, Default)]
struct UploadForm {
    file: Option<Vec<u8>>,
    quality: Option<String>,
    format: Option<String>,
}

impl UploadForm {
    fn into_request(self) -> Result<ConversionRequest> {
        let source = self
            .file
            .ok_or_else(|| WorkerError::InvalidInput("No file uploaded".to_string()))?;

        if source.is_empty() {
            return Err(WorkerError::InvalidInput("Empty file provided".to_string()));
        }

        let quality = match self.quality.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_FORM_QUALITY,
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                WorkerError::InvalidInput(format!(
                    "Quality must be an integer between 1 and 100, got {:?}",
                    raw
                ))
            })?,
        };

        let output_kind = match self.format.as_deref().map(str::trim) {
            None | Some("") => OutputKind::default(),
            Some(raw) => raw.parse::<OutputKind>().map_err(WorkerError::InvalidInput)?,
        };

        Ok(ConversionRequest {
            source,
            quality,
            output_kind,
        })
    }
}

/// Reads the `file`, `quality` and `format` fields, skipping anything else
async fn extract_upload(mut payload: Multipart, max_file_bytes: usize) -> Result<UploadForm> {
    let mut form = UploadForm::default();

    while let Some(mut field) = payload.try_next().await? {
        let name = field.content_disposition().get_name().map(str::to_string);

        match name.as_deref() {
            Some("file") => {
                if form.file.is_some() {
                    return Err(WorkerError::InvalidInput(
                        "Only one file may be uploaded per request".to_string(),
                    ));
                }

                let mut data = Vec::new();
                while let Some(chunk) = field.try_next().await? {
                    if data.len() + chunk.len() > max_file_bytes {
                        return Err(WorkerError::InvalidInput(format!(
                            "File exceeds the {} byte upload limit",
                            max_file_bytes
                        )));
                    }
                    data.extend_from_slice(&chunk);
                }
                form.file = Some(data);
            }
            Some(key @ ("quality" | "format")) => {
                let mut data = Vec::new();
                while let Some(chunk) = field.try_next().await? {
                    if data.len() + chunk.len() > MAX_TEXT_FIELD_BYTES {
                        return Err(WorkerError::InvalidInput(format!("Field {} is too long", key)));
                    }
                    data.extend_from_slice(&chunk);
                }
                let value = String::from_utf8(data).map_err(|_| {
                    WorkerError::InvalidInput(format!("Field {} must be UTF-8 text", key))
                })?;

                if key == "quality" {
                    form.quality = Some(value);
                } else {
                    form.format = Some(value);
                }
            }
            _ => {}
        }
    }

    Ok(form)
}

fn binary_response(result: ConversionResult) -> HttpResponse {
    HttpResponse::Ok()
        .content_type(result.content_type)
        .body(result.bytes)
}

fn job_queue(state: &AppState) -> Result<&dyn JobQueue> {
    state
        .jobs
        .as_deref()
        .ok_or_else(|| WorkerError::Internal("Job queue is not enabled".to_string()))
}

fn parse_job_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| WorkerError::NotFound("Job not found".to_string()))
}

/// `POST /convert` in sync mode: converts inline and answers with the bytes.
pub async fn convert(
    _auth: Authenticated,
    payload: Multipart,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let form = extract_upload(payload, state.config.max_upload_bytes).await?;
    let request = form.into_request()?;

    let result = state
        .converter
        .convert(request)
        .await
        .map_err(|e| WorkerError::from_transcode(e, state.config.expose_error_details()))?;

    Ok(binary_response(result))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedJob {
    pub job_id: Uuid,
    pub status: JobState,
}

/// `POST /convert` in queued mode: validates, enqueues and answers 202.
pub async fn submit_job(
    _auth: Authenticated,
    payload: Multipart,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let queue = job_queue(&state)?;
    let form = extract_upload(payload, state.config.max_upload_bytes).await?;
    let request = form.into_request()?;

    // Reject what would fail anyway before it takes a queue slot
    transcoding::validate(&request)
        .map_err(|e| WorkerError::from_transcode(e, state.config.expose_error_details()))?;

    let job_id = queue.submit(request).await?;

    Ok(HttpResponse::Accepted().json(SubmittedJob {
        job_id,
        status: JobState::Queued,
    }))
}

/// `GET /status/{job_id}`
pub async fn job_status(
    _auth: Authenticated,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let queue = job_queue(&state)?;
    let job_id = parse_job_id(&path)?;

    match queue.poll(job_id).await? {
        Some(status) => Ok(HttpResponse::Ok().json(status)),
        None => Err(WorkerError::NotFound("Job not found".to_string())),
    }
}

/// `GET /result/{job_id}`: answers with the converted bytes exactly once.
pub async fn fetch_result(
    _auth: Authenticated,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let queue = job_queue(&state)?;
    let job_id = parse_job_id(&path)?;

    match queue.fetch(job_id).await? {
        FetchOutcome::Ready(result) => Ok(binary_response(result)),
        FetchOutcome::Pending(_) => Err(WorkerError::NotFound("Job not completed".to_string())),
        FetchOutcome::Failed(error) => Err(WorkerError::NotFound(format!("Job failed: {}", error))),
        FetchOutcome::NotFound => Err(WorkerError::NotFound("Job not found".to_string())),
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub service: String,
    pub version: String,
    pub mode: String,
}

/// `GET /health`, unauthenticated.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(HealthStatus {
        status: "healthy".to_string(),
        service: "recompress-worker".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        mode: state.config.mode.as_str().to_string(),
    })
}

/// Registers the routes for `mode`.
pub fn routes(mode: ServiceMode) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg: &mut web::ServiceConfig| {
        cfg.route("/health", web::get().to(health_check));

        match mode {
            ServiceMode::Sync => {
                cfg.route("/convert", web::post().to(convert));
            }
            ServiceMode::Queued => {
                cfg.route("/convert", web::post().to(submit_job))
                    .route("/status/{job_id}", web::get().to(job_status))
                    .route("/result/{job_id}", web::get().to(fetch_result));
            }
        }
    }
}
