//! Process configuration, read once from the environment at startup.
//!
//! `Config::from_lookup` accepts any key lookup so tests can build a config
//! without touching the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::auth::ApiKeys;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_JOB_RETENTION_SECS: u64 = 3600;
pub const DEFAULT_JOB_WORKERS: usize = 1;
pub const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
pub const DEFAULT_JOB_DB_PATH: &str = "recompress-jobs.db";
pub const DEFAULT_REDIS_PORT: u16 = 6379;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Whether error details may be shown to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" | "test" => Ok(Self::Development),
            _ => Err("expected production or development".to_string()),
        }
    }
}

/// Which `/convert` behaviour the service exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    /// Convert inline and answer with the converted bytes.
    Sync,
    /// Enqueue a job and answer with its id.
    Queued,
}

impl ServiceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Queued => "queued",
        }
    }
}

impl FromStr for ServiceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "queued" | "queue" => Ok(Self::Queued),
            _ => Err("expected sync or queued".to_string()),
        }
    }
}

/// Where queued jobs are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStoreKind {
    /// SQLite file at `JOB_DB_PATH`; survives restarts.
    Sqlite,
    /// Process memory; lost on restart.
    Memory,
}

impl FromStr for JobStoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            _ => Err("expected sqlite or memory".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub api_keys: ApiKeys,
    pub environment: Environment,
    pub mode: ServiceMode,
    pub job_workers: usize,
    pub job_timeout: Duration,
    pub job_retention: Duration,
    pub ffmpeg_path: PathBuf,
    pub scratch_dir: PathBuf,
    pub still_concurrency: usize,
    pub max_upload_bytes: usize,
    pub job_store: JobStoreKind,
    pub job_db_path: PathBuf,
    /// `REDIS_HOST:REDIS_PORT` when set. Only reported at startup; jobs go
    /// to `job_store`.
    pub redis_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let api_keys = get("API_KEYS")
            .map(|raw| ApiKeys::parse(&raw))
            .filter(|keys| !keys.is_empty())
            .ok_or(ConfigError::Missing("API_KEYS"))?;

        let redis_port = parse_or(&get, "REDIS_PORT", DEFAULT_REDIS_PORT)?;
        let redis_endpoint = get("REDIS_HOST").map(|host| format!("{}:{}", host.trim(), redis_port));

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_or(&get, "PORT", DEFAULT_PORT)?,
            workers: parse_or(&get, "WORKERS", num_cpus::get())?,
            api_keys,
            environment: parse_or(&get, "APP_ENV", Environment::Development)?,
            mode: parse_or(&get, "SERVICE_MODE", ServiceMode::Sync)?,
            job_workers: parse_or(&get, "JOB_WORKERS", DEFAULT_JOB_WORKERS)?.max(1),
            job_timeout: Duration::from_secs(parse_or(
                &get,
                "JOB_TIMEOUT_SECS",
                DEFAULT_JOB_TIMEOUT_SECS,
            )?),
            job_retention: Duration::from_secs(parse_or(
                &get,
                "JOB_RETENTION_SECS",
                DEFAULT_JOB_RETENTION_SECS,
            )?),
            ffmpeg_path: get("FFMPEG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG_PATH)),
            scratch_dir: get("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            still_concurrency: parse_or(&get, "STILL_CONCURRENCY", num_cpus::get())?.max(1),
            max_upload_bytes: parse_or(&get, "MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
            job_store: parse_or(&get, "JOB_STORE", JobStoreKind::Sqlite)?,
            job_db_path: get("JOB_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_JOB_DB_PATH)),
            redis_endpoint,
        })
    }

    /// Whether upstream error text may be returned in `details`.
    pub fn expose_error_details(&self) -> bool {
        !self.environment.is_production()
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::from_lookup(lookup(&[("API_KEYS", "secret")])).unwrap();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert!(config.workers > 0);
        assert_eq!(config.mode, ServiceMode::Sync);
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.job_timeout, Duration::from_secs(60));
        assert_eq!(config.job_workers, 1);
        assert_eq!(config.ffmpeg_path, PathBuf::from("ffmpeg"));
        assert_eq!(config.job_store, JobStoreKind::Sqlite);
        assert_eq!(config.job_db_path, PathBuf::from("recompress-jobs.db"));
        assert!(config.redis_endpoint.is_none());
        assert!(config.expose_error_details());
    }

    #[test]
    fn test_missing_api_keys_fails_closed() {
        assert_eq!(
            Config::from_lookup(lookup(&[])).unwrap_err(),
            ConfigError::Missing("API_KEYS")
        );
        assert_eq!(
            Config::from_lookup(lookup(&[("API_KEYS", " , ,")])).unwrap_err(),
            ConfigError::Missing("API_KEYS")
        );
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("API_KEYS", "a,b"),
            ("PORT", "8088"),
            ("APP_ENV", "production"),
            ("SERVICE_MODE", "queued"),
            ("JOB_TIMEOUT_SECS", "5"),
            ("JOB_WORKERS", "0"),
            ("SCRATCH_DIR", "/var/tmp/recompress"),
        ]))
        .unwrap();

        assert_eq!(config.port, 8088);
        assert_eq!(config.mode, ServiceMode::Queued);
        assert!(!config.expose_error_details());
        assert_eq!(config.job_timeout, Duration::from_secs(5));
        assert_eq!(config.job_workers, 1);
        assert_eq!(config.scratch_dir, PathBuf::from("/var/tmp/recompress"));
        assert!(config.api_keys.contains("b"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = Config::from_lookup(lookup(&[("API_KEYS", "k"), ("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PORT", .. }));

        let err =
            Config::from_lookup(lookup(&[("API_KEYS", "k"), ("SERVICE_MODE", "batch")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SERVICE_MODE", .. }));

        let err =
            Config::from_lookup(lookup(&[("API_KEYS", "k"), ("JOB_STORE", "postgres")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "JOB_STORE", .. }));

        let err =
            Config::from_lookup(lookup(&[("API_KEYS", "k"), ("REDIS_PORT", "70000")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "REDIS_PORT", .. }));
    }

    #[test]
    fn test_job_store_settings() {
        let config = Config::from_lookup(lookup(&[
            ("API_KEYS", "k"),
            ("JOB_STORE", "memory"),
            ("JOB_DB_PATH", "/var/lib/recompress/jobs.db"),
            ("REDIS_HOST", "queue.internal"),
        ]))
        .unwrap();

        assert_eq!(config.job_store, JobStoreKind::Memory);
        assert_eq!(config.job_db_path, PathBuf::from("/var/lib/recompress/jobs.db"));
        assert_eq!(config.redis_endpoint.as_deref(), Some("queue.internal:6379"));

        let config = Config::from_lookup(lookup(&[
            ("API_KEYS", "k"),
            ("REDIS_HOST", "localhost"),
            ("REDIS_PORT", "6380"),
        ]))
        .unwrap();
        assert_eq!(config.redis_endpoint.as_deref(), Some("localhost:6380"));
    }
}
