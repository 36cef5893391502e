//! The sync state machine: four caller-visible states
//! (`syncInitial`/`syncSaving`/`syncSynced`/`syncError`) driven by a
//! push/pull loop against the vault server. This orchestrator owns that
//! loop the way a save provider owns its own save/retry lifecycle, but
//! layered over the CRDT-lite merge instead of last-write-wins.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::NaiveDate;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::engine::merge::merge_states;
use crate::engine::model::{AppState, SyncLogKind};
use crate::engine::state_store::StateStore;
use crate::error::EngineError;
use crate::persistence::PersistenceStore;

use super::auth::key_hash_hex;
use super::server_client::{PullOutcome, PushOutcome, SyncPushRequest, SyncServerClient};
use super::telemetry::SyncCounters;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SyncStatus {
    SyncInitial,
    SyncSaving,
    SyncSynced { last_synced_at: i64 },
    SyncError { message: String },
}

/// Per-date single-flight guard for `/api/analyze` calls: never run the
/// same date's analysis twice concurrently.
#[derive(Default)]
struct AnalysisGuard {
    in_flight: StdMutex<BTreeSet<NaiveDate>>,
}

impl AnalysisGuard {
    /// Returns `true` if `date` was not already in flight (and marks it so).
    fn enter(&self, date: NaiveDate) -> bool {
        self.in_flight.lock().unwrap().insert(date)
    }

    fn leave(&self, date: NaiveDate) {
        self.in_flight.lock().unwrap().remove(&date);
    }
}

pub struct SyncOrchestrator {
    client: SyncServerClient,
    state_store: Arc<StateStore>,
    persistence: Arc<PersistenceStore>,
    sync_key: Uuid,
    passphrase: String,
    status: Mutex<SyncStatus>,
    counters: SyncCounters,
    initial_sync_done: std::sync::atomic::AtomicBool,
    analysis_guard: AnalysisGuard,
}

impl SyncOrchestrator {
    pub fn new(
        base_url: impl Into<String>,
        state_store: Arc<StateStore>,
        persistence: Arc<PersistenceStore>,
        sync_key: Uuid,
        passphrase: String,
    ) -> Self {
        Self {
            client: SyncServerClient::new(base_url),
            state_store,
            persistence,
            sync_key,
            passphrase,
            status: Mutex::new(SyncStatus::SyncInitial),
            counters: SyncCounters::default(),
            initial_sync_done: std::sync::atomic::AtomicBool::new(false),
            analysis_guard: AnalysisGuard::default(),
        }
    }

    pub async fn status(&self) -> SyncStatus {
        self.status.lock().await.clone()
    }

    pub fn telemetry(&self) -> super::telemetry::SyncTelemetrySnapshot {
        self.counters.snapshot()
    }

    fn key_hash(&self) -> String {
        key_hash_hex(self.sync_key)
    }

    /// The boot-time pull: fetches the remote blob (if any), merges it with
    /// whatever is already local, persists the result, and pushes back so
    /// the server reflects the merge. `lastModified` ties are broken in
    /// favor of the local side.
    pub async fn initial_pull_and_merge(&self, now_ms: i64) -> Result<(), EngineError> {
        *self.status.lock().await = SyncStatus::SyncSaving;
        let outcome = self.client.pull(&self.key_hash()).await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                self.fail(&err, now_ms).await;
                return Err(err);
            }
        };

        match outcome {
            PullOutcome::Empty => {
                // Nothing remote yet; push the local state to seed the vault.
                self.push_current(now_ms).await?;
            }
            PullOutcome::Unauthorized => {
                let err = EngineError::Auth("sync key rejected by server".to_string());
                self.fail(&err, now_ms).await;
                return Err(err);
            }
            PullOutcome::Found(body) => {
                let remote = self.decode_remote(&body.state)?;
                let merged = {
                    let local = self.state_store.lock().await;
                    merge_states(&local, &remote, now_ms)
                };
                self.state_store.replace(merged).await;
                self.persistence
                    .save_state(&self.state_store, now_ms, true, true)
                    .await?;
                self.push_current(now_ms).await?;
            }
        }

        self.initial_sync_done.store(true, std::sync::atomic::Ordering::SeqCst);
        self.succeed(now_ms).await;
        Ok(())
    }

    /// Steady-state push used after every local mutation's debounced save.
    /// A 409 triggers mandatory merge-then-retry exactly once; conflicts are
    /// never surfaced to the caller as an error.
    pub async fn push_current(&self, now_ms: i64) -> Result<(), EngineError> {
        *self.status.lock().await = SyncStatus::SyncSaving;
        let local_snapshot = self.state_store.lock().await.clone();
        let encoded = self.encode_state(&local_snapshot)?;
        self.counters.record_attempt(encoded.len() as u64);

        let request = SyncPushRequest { last_modified: local_snapshot.last_modified, state: encoded };
        match self.client.push(&self.key_hash(), &request).await {
            Ok(PushOutcome::Accepted) => {
                self.succeed(now_ms).await;
                Ok(())
            }
            Ok(PushOutcome::Conflict(body)) => {
                let remote = self.decode_remote(&body.state)?;
                let merged = merge_states(&local_snapshot, &remote, now_ms);
                self.state_store.replace(merged.clone()).await;
                self.persistence
                    .save_state(&self.state_store, now_ms, true, true)
                    .await?;

                let encoded = self.encode_state(&merged)?;
                let retry = SyncPushRequest { last_modified: merged.last_modified, state: encoded };
                match self.client.push(&self.key_hash(), &retry).await {
                    Ok(PushOutcome::Accepted) => {
                        self.succeed(now_ms).await;
                        Ok(())
                    }
                    Ok(PushOutcome::Conflict(_)) => {
                        let err = EngineError::Transient("repeated sync conflict after merge retry".to_string());
                        self.fail(&err, now_ms).await;
                        Err(err)
                    }
                    Err(err) => {
                        self.fail(&err, now_ms).await;
                        Err(err)
                    }
                }
            }
            Err(err) => {
                self.fail(&err, now_ms).await;
                Err(err)
            }
        }
    }

    /// `/api/analyze` passthrough with a per-date single-flight guard: a
    /// second call for the same date while one is outstanding returns `Ok(None)`
    /// rather than firing a duplicate request.
    pub async fn analyze_for_date(
        &self,
        date: NaiveDate,
        prompt: &str,
        system_instruction: &str,
    ) -> Result<Option<String>, EngineError> {
        if !self.analysis_guard.enter(date) {
            return Ok(None);
        }
        let result = self.client.analyze(prompt, system_instruction).await;
        self.analysis_guard.leave(date);
        result.map(Some)
    }

    fn encode_state(&self, state: &AppState) -> Result<String, EngineError> {
        let json = PersistenceStore::export_json(state)?;
        crate::crypto::codec::encrypt(json.as_bytes(), &self.passphrase)
    }

    fn decode_remote(&self, wire: &str) -> Result<AppState, EngineError> {
        let plaintext = crate::crypto::codec::decrypt(wire, &self.passphrase)?;
        let json = String::from_utf8(plaintext).map_err(EngineError::corruption)?;
        PersistenceStore::import_json(&json)
    }

    async fn succeed(&self, now_ms: i64) {
        self.counters.record_success();
        *self.status.lock().await = SyncStatus::SyncSynced { last_synced_at: now_ms };
        let mut guard = self.state_store.lock().await;
        guard.push_sync_log("Sync complete", SyncLogKind::Success, None, now_ms);
    }

    async fn fail(&self, err: &EngineError, now_ms: i64) {
        self.counters.record_failure(stable_code_for(err), err.to_string());
        *self.status.lock().await = SyncStatus::SyncError { message: err.to_string() };
        let mut guard = self.state_store.lock().await;
        guard.push_sync_log(err.to_string(), SyncLogKind::Error, None, now_ms);
    }
}

fn stable_code_for(err: &EngineError) -> &'static str {
    match err {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_guard_rejects_concurrent_same_date_entry() {
        let guard = AnalysisGuard::default();
        let date = NaiveDate::from_ymd_opt(2026, 3, 15).unwrap();
        assert!(guard.enter(date));
        assert!(!guard.enter(date));
        guard.leave(date);
        assert!(guard.enter(date));
    }

    #[test]
    fn analysis_guard_allows_distinct_dates_concurrently() {
        let guard = AnalysisGuard::default();
        let a = NaiveDate::from_ymd_opt(2026, 3, 15).unwrap();
        let b = NaiveDate::from_ymd_opt(2026, 3, 16).unwrap();
        assert!(guard.enter(a));
        assert!(guard.enter(b));
    }
}
