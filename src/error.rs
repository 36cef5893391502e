use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Unified error taxonomy: Validation, Transient network, Auth, Conflict,
/// Corruption, Crypto, Fatal boot.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad date string, bad status, duplicate habit name, malformed import.
    #[error("validation error: {0}")]
    Validation(String),

    /// Timeout, 5xx, fetch abort — callers retry with backoff before this
    /// surfaces.
    #[error("transient network error: {0}")]
    Transient(String),

    /// 401 from the vault: local sync key should be cleared.
    #[error("authentication error: {0}")]
    Auth(String),

    /// 409 from the vault: mandatory merge + re-push, never user-visible.
    #[error("sync conflict")]
    Conflict,

    /// Unparseable bitmap value, malformed dailyData entry, non-map
    /// monthlyLogs on merge — always downgrade gracefully; this variant
    /// exists for the cases that can't downgrade silently (store corruption).
    #[error("data corruption: {0}")]
    Corruption(String),

    /// Decrypt failure. Never retried with a different key automatically.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Any exception during bootstrap init.
    #[error("fatal boot error: {0}")]
    FatalBoot(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn corruption(err: impl std::fmt::Display) -> Self {
        EngineError::Corruption(err.to_string())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Transient(_) => StatusCode::BAD_GATEWAY,
            EngineError::Auth(_) => StatusCode::UNAUTHORIZED,
            EngineError::Conflict => StatusCode::CONFLICT,
            EngineError::Corruption(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Crypto(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::FatalBoot(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn stable_code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_FAILED",
            EngineError::Transient(_) => "UPSTREAM_ERROR",
            EngineError::Auth(_) => "UNAUTHORIZED",
            EngineError::Conflict => "CONFLICT",
            EngineError::Corruption(_) => "DATA_CORRUPTION",
            EngineError::Crypto(_) => "CRYPTO_ERROR",
            EngineError::FatalBoot(_) => "FATAL_BOOT_ERROR",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn title(&self) -> &'static str {
        match self.status_code() {
            StatusCode::UNPROCESSABLE_ENTITY => "Validation Failed",
            StatusCode::UNAUTHORIZED => "Unauthorized",
            StatusCode::CONFLICT => "Conflict",
            StatusCode::BAD_GATEWAY => "Bad Gateway",
            StatusCode::INTERNAL_SERVER_ERROR => "Internal Server Error",
            _ => "Error",
        }
    }
}

/// RFC7807 Problem Details, matching the teacher's `ProblemDetails` shape.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_url: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let title = self.title().to_string();
        let code = self.stable_code().to_string();
        let detail = Some(self.to_string());

        let problem = ProblemDetails {
            type_url: "about:blank".to_string(),
            title,
            status: status.as_u16(),
            detail,
            code,
            request_id: crate::request_id::current_request_id(),
        };

        let mut res = Json(problem).into_response();
        *res.status_mut() = status;
        res.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        res
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::Transient(err.to_string())
        } else {
            EngineError::Transient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_409() {
        assert_eq!(EngineError::Conflict.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn auth_error_maps_to_401() {
        assert_eq!(EngineError::Auth("bad key".into()).status_code(), StatusCode::UNAUTHORIZED);
    }
}
