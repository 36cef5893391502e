//! HTTP client wrapper for the vault server's two endpoints plus the
//! `/api/analyze` passthrough. Retry/backoff and header-based key-hash auth
//! follow the same shape as a save-provider client built around a header
//! credential and a shared timeout-bound client singleton.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::auth::SYNC_KEY_HEADER;
use crate::error::EngineError;
use crate::http::sync_client;

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
pub const MAX_RETRIES: u32 = 2;
pub const BASE_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Serialize)]
pub struct SyncPushRequest {
    pub last_modified: i64,
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct SyncBody {
    pub last_modified: i64,
    pub state: String,
}

pub enum PullOutcome {
    Empty,
    Found(SyncBody),
    Unauthorized,
}

pub enum PushOutcome {
    Accepted,
    Conflict(SyncBody),
}

pub struct SyncServerClient {
    base_url: String,
}

impl SyncServerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into() }
    }

    pub async fn pull(&self, key_hash: &str) -> Result<PullOutcome, EngineError> {
        let client = sync_client()?;
        let url = format!("{}/api/sync", self.base_url);
        let response = with_retry(|| {
            client
                .get(&url)
                .header(SYNC_KEY_HEADER, key_hash)
                .timeout(HTTP_TIMEOUT)
                .send()
        })
        .await?;

        match response.status().as_u16() {
            204 => Ok(PullOutcome::Empty),
            401 => Ok(PullOutcome::Unauthorized),
            200 => {
                let body: SyncBody = response.json().await.map_err(EngineError::from)?;
                Ok(PullOutcome::Found(body))
            }
            other => Err(EngineError::Transient(format!("unexpected pull status {other}"))),
        }
    }

    pub async fn push(&self, key_hash: &str, body: &SyncPushRequest) -> Result<PushOutcome, EngineError> {
        let client = sync_client()?;
        let url = format!("{}/api/sync", self.base_url);
        let response = with_retry(|| {
            client
                .post(&url)
                .header(SYNC_KEY_HEADER, key_hash)
                .timeout(HTTP_TIMEOUT)
                .json(body)
                .send()
        })
        .await?;

        match response.status().as_u16() {
            200 | 204 => Ok(PushOutcome::Accepted),
            409 => {
                let body: SyncBody = response.json().await.map_err(EngineError::from)?;
                Ok(PushOutcome::Conflict(body))
            }
            other => Err(EngineError::Transient(format!("unexpected push status {other}"))),
        }
    }

    pub async fn analyze(&self, prompt: &str, system_instruction: &str) -> Result<String, EngineError> {
        #[derive(Serialize)]
        struct AnalyzeRequest<'a> {
            prompt: &'a str,
            system_instruction: &'a str,
        }
        let client = sync_client()?;
        let url = format!("{}/api/analyze", self.base_url);
        let response = with_retry(|| {
            client
                .post(&url)
                .timeout(HTTP_TIMEOUT)
                .json(&AnalyzeRequest { prompt, system_instruction })
                .send()
        })
        .await?;
        response.text().await.map_err(EngineError::from)
    }
}

/// Exponential backoff with jitter: `base * 2^n`, up to `MAX_RETRIES`
/// retries. A response with `status < 500` (including 409, which the
/// caller handles specially) or the final attempt surfaces immediately.
async fn with_retry<F, Fut>(mut request: F) -> Result<reqwest::Response, EngineError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    let mut attempt = 0;
    loop {
        match request().await {
            Ok(response) => {
                let status = response.status();
                if status.is_server_error() && attempt < MAX_RETRIES {
                    attempt += 1;
                    sleep_with_jitter(attempt).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                if attempt >= MAX_RETRIES {
                    return Err(EngineError::from(err));
                }
                attempt += 1;
                sleep_with_jitter(attempt).await;
            }
        }
    }
}

async fn sleep_with_jitter(attempt: u32) {
    let backoff = BASE_BACKOFF * 2u32.pow(attempt - 1);
    let jitter_ms = rand::thread_rng().gen_range(0..50);
    tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_from_base() {
        assert_eq!(BASE_BACKOFF * 2u32.pow(0), Duration::from_millis(500));
        assert_eq!(BASE_BACKOFF * 2u32.pow(1), Duration::from_millis(1000));
    }
}
