//! The vault server: a deliberately dumb encrypted-blob store. It never sees
//! plaintext habit data, a passphrase, or a sync key — only a SHA-256 digest
//! of the key (`X-Sync-Key-Hash`) and an opaque ciphertext blob, matching
//! spec.md §6's server contract. Bootstrapped the way the teacher's
//! `main.rs` bootstraps its own axum service (tracing init, `ShutdownManager`,
//! `AppConfig::init_global`, CORS/compression layers, graceful shutdown with
//! a force-quit fallback) but without utoipa/Swagger, `SystemdWatchdog`, or
//! any of the teacher's domain routers — a two-endpoint blob store has no
//! meaningful API surface to browse or watchdog-notify about. See DESIGN.md.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;

use askesis_engine::config::AppConfig;
use askesis_engine::sync::SYNC_KEY_HEADER;
use askesis_engine::{EngineError, ShutdownManager};

#[derive(Clone)]
struct VaultState {
    pool: SqlitePool,
}

#[derive(Debug, Serialize, Deserialize)]
struct SyncBody {
    last_modified: i64,
    state: String,
}

async fn init_vault_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS vault_blobs (
            key_hash TEXT PRIMARY KEY,
            last_modified INTEGER NOT NULL,
            state TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

fn key_hash_from_headers(headers: &HeaderMap) -> Result<String, EngineError> {
    headers
        .get(SYNC_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| v.len() == 64 && v.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_string)
        .ok_or_else(|| EngineError::Auth(format!("missing or malformed {SYNC_KEY_HEADER} header")))
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

async fn health_check() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "askesis-vault",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

/// `GET /api/sync` — returns the stored blob for this key hash, or 204 if
/// nothing has ever been pushed under it, or 401 if the header is missing or
/// malformed.
async fn get_sync(State(state): State<Arc<VaultState>>, headers: HeaderMap) -> Response {
    let key_hash = match key_hash_from_headers(&headers) {
        Ok(h) => h,
        Err(err) => return err.into_response(),
    };

    let row = sqlx::query_as::<_, (i64, String)>(
        "SELECT last_modified, state FROM vault_blobs WHERE key_hash = ?1",
    )
    .bind(&key_hash)
    .fetch_optional(&state.pool)
    .await;

    match row {
        Ok(Some((last_modified, body))) => {
            Json(SyncBody { last_modified, state: body }).into_response()
        }
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => EngineError::from(err).into_response(),
    }
}

/// `POST /api/sync` — last-writer-wins with a 409 conflict: if the stored
/// record's `last_modified` is strictly newer than the pushed one, the push
/// is rejected and the stored record is returned so the client can merge and
/// retry, per spec.md §6.
async fn post_sync(
    State(state): State<Arc<VaultState>>,
    headers: HeaderMap,
    Json(body): Json<SyncBody>,
) -> Response {
    let key_hash = match key_hash_from_headers(&headers) {
        Ok(h) => h,
        Err(err) => return err.into_response(),
    };

    let existing = sqlx::query_as::<_, (i64, String)>(
        "SELECT last_modified, state FROM vault_blobs WHERE key_hash = ?1",
    )
    .bind(&key_hash)
    .fetch_optional(&state.pool)
    .await;

    let existing = match existing {
        Ok(row) => row,
        Err(err) => return EngineError::from(err).into_response(),
    };

    if let Some((stored_last_modified, stored_state)) = existing {
        if stored_last_modified > body.last_modified {
            return (
                StatusCode::CONFLICT,
                Json(SyncBody { last_modified: stored_last_modified, state: stored_state }),
            )
                .into_response();
        }
    }

    let result = sqlx::query(
        "INSERT INTO vault_blobs (key_hash, last_modified, state, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(key_hash) DO UPDATE SET
            last_modified = excluded.last_modified,
            state = excluded.state,
            updated_at = excluded.updated_at",
    )
    .bind(&key_hash)
    .bind(body.last_modified)
    .bind(&body.state)
    .bind(now_ms())
    .execute(&state.pool)
    .await;

    match result {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => EngineError::from(err).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    #[allow(dead_code)]
    prompt: String,
    #[allow(dead_code)]
    system_instruction: String,
}

/// `POST /api/analyze` — opaque passthrough stub. spec.md §4.5/§6 treat the
/// analysis provider as pluggable and out of scope for the vault itself; this
/// endpoint exists so the contract is implementable end to end without the
/// vault needing to know anything about the model behind it.
async fn post_analyze(Json(_req): Json<AnalyzeRequest>) -> Response {
    (StatusCode::OK, "no analysis provider configured").into_response()
}

fn build_router(state: Arc<VaultState>) -> Router {
    let config = AppConfig::global();

    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/api/sync", get(get_sync).post(post_sync))
        .route("/api/analyze", post(post_analyze))
        .with_state(state);

    if let Some(cors) = askesis_engine::cors::build_cors_layer(&config.cors) {
        app = app.layer(cors);
    }
    app = app.layer(CompressionLayer::new());
    app = app.layer(axum::middleware::from_fn(
        askesis_engine::request_id::request_id_middleware,
    ));
    app
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "askesis_engine=info,tower_http=info".into()),
        )
        .init();

    let shutdown_manager = ShutdownManager::new();

    if let Err(e) = AppConfig::init_global() {
        tracing::error!("config init failed: {}", e);
        std::process::exit(1);
    }
    let config = AppConfig::global();

    if let Err(e) = shutdown_manager.start_signal_handler().await {
        tracing::error!("signal handler failed to start: {}", e);
        std::process::exit(1);
    }

    let pool = match askesis_engine::persistence::store::connect_sqlite(&config.persistence.sqlite_path).await {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("failed to open vault database: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = init_vault_schema(&pool).await {
        tracing::error!("failed to initialize vault schema: {}", e);
        std::process::exit(1);
    }

    let app = build_router(Arc::new(VaultState { pool }));

    let addr = config.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        tracing::error!("failed to bind {}: {}", addr, e);
        std::process::exit(1);
    });

    tracing::info!("vault server: http://{}", addr);
    tracing::info!("health: http://{}/health", addr);

    let shutdown_config = &config.shutdown;
    let shutdown_timeout = shutdown_config.timeout_duration();
    let shutdown_signal = async move {
        let reason = shutdown_manager.wait_for_shutdown().await;
        tracing::info!("shutdown signal received: {:?}", reason);

        match tokio::time::timeout(shutdown_timeout, async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        })
        .await
        {
            Ok(_) => tracing::info!("graceful shutdown complete"),
            Err(_) => {
                tracing::warn!("graceful shutdown timed out");
                if shutdown_config.force_quit {
                    tracing::info!("forcing exit in {}s", shutdown_config.force_delay_secs);
                    tokio::time::sleep(shutdown_config.force_delay_duration()).await;
                }
            }
        }
    };

    let graceful = axum::serve(listener, app).with_graceful_shutdown(async {
        shutdown_signal.await;
        tracing::info!("closing http listener");
    });

    if let Err(e) = graceful.await {
        tracing::error!("server error: {}", e);
        std::process::exit(1);
    }

    tracing::info!("vault server shut down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> Arc<VaultState> {
        let pool = askesis_engine::persistence::store::connect_sqlite(":memory:").await.unwrap();
        init_vault_schema(&pool).await.unwrap();
        Arc::new(VaultState { pool })
    }

    fn bare_router(state: Arc<VaultState>) -> Router {
        Router::new()
            .route("/api/sync", get(get_sync).post(post_sync))
            .route("/api/analyze", post(post_analyze))
            .with_state(state)
    }

    #[tokio::test]
    async fn pull_with_no_stored_blob_returns_204() {
        let app = bare_router(test_state().await);
        let resp = app
            .oneshot(
                Request::get("/api/sync")
                    .header(SYNC_KEY_HEADER, "a".repeat(64))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn pull_without_header_returns_401() {
        let app = bare_router(test_state().await);
        let resp = app
            .oneshot(Request::get("/api/sync").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn push_then_pull_round_trips() {
        let state = test_state().await;
        let key_hash = "b".repeat(64);

        let push = bare_router(Arc::clone(&state))
            .oneshot(
                Request::post("/api/sync")
                    .header(SYNC_KEY_HEADER, &key_hash)
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::to_vec(&SyncBody { last_modified: 100, state: "ciphertext-a".into() }).unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(push.status(), StatusCode::NO_CONTENT);

        let pull = bare_router(Arc::clone(&state))
            .oneshot(
                Request::get("/api/sync")
                    .header(SYNC_KEY_HEADER, &key_hash)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(pull.status(), StatusCode::OK);
        let body = to_bytes(pull.into_body(), usize::MAX).await.unwrap();
        let parsed: SyncBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.last_modified, 100);
        assert_eq!(parsed.state, "ciphertext-a");
    }

    #[tokio::test]
    async fn push_older_than_stored_returns_409_with_stored_body() {
        let state = test_state().await;
        let key_hash = "c".repeat(64);

        bare_router(Arc::clone(&state))
            .oneshot(
                Request::post("/api/sync")
                    .header(SYNC_KEY_HEADER, &key_hash)
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::to_vec(&SyncBody { last_modified: 500, state: "newer".into() }).unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        let conflict = bare_router(Arc::clone(&state))
            .oneshot(
                Request::post("/api/sync")
                    .header(SYNC_KEY_HEADER, &key_hash)
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::to_vec(&SyncBody { last_modified: 100, state: "older".into() }).unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        let body = to_bytes(conflict.into_body(), usize::MAX).await.unwrap();
        let parsed: SyncBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.last_modified, 500);
        assert_eq!(parsed.state, "newer");
    }

    #[tokio::test]
    async fn analyze_stub_returns_200() {
        let app = bare_router(test_state().await);
        let resp = app
            .oneshot(
                Request::post("/api/analyze")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::to_vec(&json!({"prompt": "p", "system_instruction": "s"})).unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
