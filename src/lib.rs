/// Unified error taxonomy and RFC7807 rendering.
pub mod error;

/// Layered configuration (file + env, `OnceCell` global).
pub mod config;

/// CORS layer construction.
pub mod cors;

/// Graceful shutdown coordination.
pub mod shutdown;

/// Shared HTTP client singleton.
pub mod http;

/// Request-id middleware and task-local context.
pub mod request_id;

/// Passphrase-derived AES-256-GCM codec and BigInt/Map-safe JSON helpers.
pub mod crypto;

/// Core state engine: bitmap log, merge, selectors, action controller,
/// bootstrapper.
pub mod engine;

/// Split-store SQLite persistence.
pub mod persistence;

/// Sync orchestrator, vault client, auth, telemetry.
pub mod sync;

/// Background-task offload bridge.
pub mod worker;

pub use config::AppConfig;
pub use engine::{AppState, StateStore};
pub use error::EngineError;
pub use shutdown::{ShutdownHandle, ShutdownManager, ShutdownReason};
