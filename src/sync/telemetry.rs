//! In-memory ring of sync log events plus observability counters, following
//! the same atomic-counter-plus-mutex-ring batching pattern a usage-stats
//! handle would use, scoped here to the sync orchestrator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::engine::model::SyncLogKind;

#[derive(Debug, Default)]
pub struct SyncCounters {
    total_syncs: AtomicU64,
    successful_syncs: AtomicU64,
    failed_syncs: AtomicU64,
    total_payload_bytes: AtomicU64,
    max_payload_bytes: AtomicU64,
    last_error: Mutex<Option<String>>,
    error_frequency: Mutex<std::collections::BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncTelemetrySnapshot {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub total_payload_bytes: u64,
    pub max_payload_bytes: u64,
    pub avg_payload_bytes: u64,
    pub error_frequency: std::collections::BTreeMap<String, u64>,
    pub last_error: Option<String>,
}

impl SyncCounters {
    pub fn record_attempt(&self, payload_bytes: u64) {
        self.total_syncs.fetch_add(1, Ordering::Relaxed);
        self.total_payload_bytes.fetch_add(payload_bytes, Ordering::Relaxed);
        self.max_payload_bytes.fetch_max(payload_bytes, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successful_syncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, code: &str, message: impl Into<String>) {
        self.failed_syncs.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().unwrap() = Some(message.into());
        *self.error_frequency.lock().unwrap().entry(code.to_string()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> SyncTelemetrySnapshot {
        let total = self.total_syncs.load(Ordering::Relaxed);
        let total_bytes = self.total_payload_bytes.load(Ordering::Relaxed);
        SyncTelemetrySnapshot {
            total_syncs: total,
            successful_syncs: self.successful_syncs.load(Ordering::Relaxed),
            failed_syncs: self.failed_syncs.load(Ordering::Relaxed),
            total_payload_bytes: total_bytes,
            max_payload_bytes: self.max_payload_bytes.load(Ordering::Relaxed),
            avg_payload_bytes: if total == 0 { 0 } else { total_bytes / total },
            error_frequency: self.error_frequency.lock().unwrap().clone(),
            last_error: self.last_error.lock().unwrap().clone(),
        }
    }
}

/// Appends to `state.sync_logs`, a bounded ring of at most
/// `SYNC_LOG_RING_CAPACITY` entries (see `AppState::push_sync_log`).
pub fn add_sync_log(
    state: &mut crate::engine::model::AppState,
    message: impl Into<String>,
    kind: SyncLogKind,
    icon: Option<String>,
    now_ms: i64,
) {
    state.push_sync_log(message, kind, icon, now_ms);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_computes_average_payload_bytes() {
        let counters = SyncCounters::default();
        counters.record_attempt(100);
        counters.record_attempt(300);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.total_syncs, 2);
        assert_eq!(snapshot.avg_payload_bytes, 200);
        assert_eq!(snapshot.max_payload_bytes, 300);
    }

    #[test]
    fn failure_tracks_last_error_and_frequency() {
        let counters = SyncCounters::default();
        counters.record_failure("UPSTREAM_ERROR", "boom");
        counters.record_failure("UPSTREAM_ERROR", "boom again");
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.failed_syncs, 2);
        assert_eq!(snapshot.error_frequency.get("UPSTREAM_ERROR"), Some(&2));
        assert_eq!(snapshot.last_error, Some("boom again".to_string()));
    }
}
