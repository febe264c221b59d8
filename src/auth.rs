//! `x-api-key` authentication.
//!
//! Handlers take an [`Authenticated`] argument ahead of the multipart
//! payload, so a request with a missing or unknown key is answered with 401
//! before any of the upload is read or converted.

use std::future::{ready, Ready};

use actix_web::{dev::Payload, web, FromRequest, HttpRequest};
use subtle::ConstantTimeEq;

use crate::error::WorkerError;
use crate::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Allow-list of accepted API keys.
#[derive(Clone, Default)]
pub struct ApiKeys {
    keys: Vec<String>,
}

impl ApiKeys {
    /// Parses a comma-separated list, ignoring blanks.
    pub fn parse(raw: &str) -> Self {
        Self {
            keys: raw
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn contains(&self, candidate: &str) -> bool {
        // Check every key so timing does not reveal which one matched
        self.keys.iter().fold(false, |found, key| {
            let matched: bool = key.as_bytes().ct_eq(candidate.as_bytes()).into();
            found | matched
        })
    }
}

impl std::fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ApiKeys([{} redacted])", self.keys.len())
    }
}

/// Proof that the request carried a valid `x-api-key`.
#[derive(Debug)]
pub struct Authenticated;

impl Authenticated {
    fn check(req: &HttpRequest) -> Result<Self, WorkerError> {
        let state = req
            .app_data::<web::Data<AppState>>()
            .ok_or_else(|| WorkerError::Internal("Application state not configured".to_string()))?;

        let provided = req
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok());

        match provided {
            Some(key) if state.config.api_keys.contains(key) => Ok(Authenticated),
            Some(_) => {
                log::warn!("Rejected request to {} with invalid API key", req.path());
                Err(WorkerError::Unauthorized)
            }
            None => {
                log::warn!("Rejected request to {} without API key", req.path());
                Err(WorkerError::Unauthorized)
            }
        }
    }
}

impl FromRequest for Authenticated {
    type Error = WorkerError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(Self::check(req))
    }
}
