use once_cell::sync::OnceCell;
use reqwest::Client;
use std::time::Duration;

/// Shared HTTP client (one connection pool, keep-alive) reused across every
/// sync request instead of building a fresh client per call.
static SYNC_CLIENT: OnceCell<Client> = OnceCell::new();

/// The client used by `sync::server_client`, fixed at a 15s timeout.
pub fn sync_client() -> Result<&'static Client, reqwest::Error> {
    SYNC_CLIENT.get_or_try_init(|| Client::builder().timeout(Duration::from_secs(15)).build())
}
