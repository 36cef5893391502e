pub mod auth;
pub mod orchestrator;
pub mod server_client;
pub mod telemetry;

pub use auth::{generate_sync_key, key_hash_hex, SYNC_KEY_HEADER};
pub use orchestrator::{SyncOrchestrator, SyncStatus};
pub use server_client::SyncServerClient;
