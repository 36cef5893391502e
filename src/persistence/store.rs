//! Split-store persistence over SQLite. The spec's browser-side "indexed
//! object database" has no server-side analogue, so this substitutes a
//! local `sqlx::SqlitePool` (WAL mode) the way the teacher's
//! `StatsStorage::connect_sqlite` does for its own hot-path table.
//!
//! One table, `app_state_store`, with exactly two rows keyed by the
//! constants from spec.md §6: `askesis_core_json` (the JSON record, which
//! never contains `monthly_logs`) and `askesis_logs_binary` (the hex-encoded
//! `serialize_for_cloud()` output).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::engine::bitmap;
use crate::engine::model::{AppState, DailyDiagnosis, Habit, HabitDayData, SyncLogEntry};
use crate::engine::state_store::StateStore;
use crate::error::EngineError;

use super::migrate;

pub const JSON_RECORD_KEY: &str = "askesis_core_json";
pub const BINARY_RECORD_KEY: &str = "askesis_logs_binary";

pub const SAVE_DEBOUNCE: Duration = Duration::from_millis(800);

/// The JSON record: `AppState` minus `monthly_logs` (split-store invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppStateJson {
    pub version: u32,
    pub habits: Vec<Habit>,
    pub daily_data: std::collections::BTreeMap<String, HabitDayData>,
    #[serde(with = "archives_as_hex")]
    pub archives: std::collections::BTreeMap<i32, Vec<u8>>,
    pub daily_diagnoses: std::collections::BTreeMap<chrono::NaiveDate, DailyDiagnosis>,
    pub notifications_shown: std::collections::BTreeSet<String>,
    pub pending_21_day_habit_ids: std::collections::VecDeque<uuid::Uuid>,
    pub pending_consolidation_habit_ids: std::collections::VecDeque<uuid::Uuid>,
    pub sync_logs: std::collections::VecDeque<SyncLogEntry>,
    pub has_onboarded: bool,
    pub last_modified: i64,
}

mod archives_as_hex {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(map: &BTreeMap<i32, Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        let hexed: BTreeMap<i32, String> = map.iter().map(|(k, v)| (*k, hex::encode(v))).collect();
        hexed.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<i32, Vec<u8>>, D::Error> {
        let hexed = BTreeMap::<i32, String>::deserialize(d)?;
        hexed
            .into_iter()
            .map(|(k, v)| hex::decode(v).map(|bytes| (k, bytes)).map_err(serde::de::Error::custom))
            .collect()
    }
}

impl AppStateJson {
    pub fn from_state(state: &AppState) -> Self {
        Self {
            version: state.version,
            habits: state.habits.clone(),
            daily_data: state.daily_data.clone(),
            archives: state.archives.clone(),
            daily_diagnoses: state.daily_diagnoses.clone(),
            notifications_shown: state.notifications_shown.clone(),
            pending_21_day_habit_ids: state.pending_21_day_habit_ids.clone(),
            pending_consolidation_habit_ids: state.pending_consolidation_habit_ids.clone(),
            sync_logs: state.sync_logs.clone(),
            has_onboarded: state.has_onboarded,
            last_modified: state.last_modified,
        }
    }

    pub fn into_state(self, monthly_logs: bitmap::MonthlyLogs) -> AppState {
        AppState {
            version: self.version,
            habits: self.habits,
            daily_data: self.daily_data,
            archives: self.archives,
            monthly_logs,
            daily_diagnoses: self.daily_diagnoses,
            notifications_shown: self.notifications_shown,
            pending_21_day_habit_ids: self.pending_21_day_habit_ids,
            pending_consolidation_habit_ids: self.pending_consolidation_habit_ids,
            sync_logs: self.sync_logs,
            has_onboarded: self.has_onboarded,
            last_modified: self.last_modified,
        }
    }
}

pub async fn connect_sqlite(path: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new().max_connections(4).connect_with(options).await?;
    sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
    init_schema(&pool).await?;
    Ok(pool)
}

async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS app_state_store (
            record_key TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub struct PersistenceStore {
    pool: SqlitePool,
    pending: Mutex<Option<AppState>>,
    debounce_handle: Mutex<Option<JoinHandle<()>>>,
    /// Serializes the actual write: "a new save awaits the active save."
    write_lock: Mutex<()>,
}

impl PersistenceStore {
    pub fn new(pool: SqlitePool) -> Arc<Self> {
        Arc::new(Self {
            pool,
            pending: Mutex::new(None),
            debounce_handle: Mutex::new(None),
            write_lock: Mutex::new(()),
        })
    }

    /// Bumps `last_modified` on `state_store`, snapshots the state, and
    /// schedules a debounced write (or flushes immediately).
    pub async fn save_state(
        self: &Arc<Self>,
        state_store: &StateStore,
        now_ms: i64,
        immediate: bool,
        initial_sync_done: bool,
    ) -> Result<(), EngineError> {
        let snapshot = {
            let mut guard = state_store.lock().await;
            guard.bump_last_modified(now_ms, initial_sync_done);
            guard.clone()
        };
        *self.pending.lock().await = Some(snapshot);

        if let Some(handle) = self.debounce_handle.lock().await.take() {
            handle.abort();
        }

        if immediate {
            self.flush().await
        } else {
            let this = Arc::clone(self);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(SAVE_DEBOUNCE).await;
                if let Err(err) = this.flush().await {
                    tracing::warn!(error = %err, "debounced save failed");
                }
            });
            *self.debounce_handle.lock().await = Some(handle);
            Ok(())
        }
    }

    async fn flush(&self) -> Result<(), EngineError> {
        let _write_guard = self.write_lock.lock().await;
        let Some(state) = self.pending.lock().await.take() else {
            return Ok(());
        };
        self.write_now(&state).await
    }

    async fn write_now(&self, state: &AppState) -> Result<(), EngineError> {
        let json_record = AppStateJson::from_state(state);
        let json_payload = serde_json::to_string(&json_record).map_err(EngineError::corruption)?;
        let binary_pairs = bitmap::serialize_for_cloud(&state.monthly_logs);
        let binary_payload = serde_json::to_string(&binary_pairs).map_err(EngineError::corruption)?;

        let now = chrono::Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await.map_err(EngineError::from)?;
        sqlx::query(
            "INSERT INTO app_state_store (record_key, payload, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(record_key) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
        )
        .bind(JSON_RECORD_KEY)
        .bind(&json_payload)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(EngineError::from)?;

        sqlx::query(
            "INSERT INTO app_state_store (record_key, payload, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(record_key) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
        )
        .bind(BINARY_RECORD_KEY)
        .bind(&binary_payload)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(EngineError::from)?;

        tx.commit().await.map_err(EngineError::from)?;
        Ok(())
    }

    /// Reads both records, migrates if the stored version differs, and
    /// reassembles a full `AppState`. Returns `None` if nothing has been
    /// saved yet.
    pub async fn load_state(&self) -> Result<Option<AppState>, EngineError> {
        let json_row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM app_state_store WHERE record_key = ?1")
                .bind(JSON_RECORD_KEY)
                .fetch_optional(&self.pool)
                .await
                .map_err(EngineError::from)?;
        let Some((json_payload,)) = json_row else {
            return Ok(None);
        };

        let mut json_value: serde_json::Value =
            serde_json::from_str(&json_payload).map_err(EngineError::corruption)?;
        migrate::migrate_to_current(&mut json_value);
        let json_record: AppStateJson =
            serde_json::from_value(json_value).map_err(EngineError::corruption)?;

        let binary_row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM app_state_store WHERE record_key = ?1")
                .bind(BINARY_RECORD_KEY)
                .fetch_optional(&self.pool)
                .await
                .map_err(EngineError::from)?;
        let monthly_logs = match binary_row {
            Some((binary_payload,)) => {
                let pairs: Vec<(String, String)> =
                    serde_json::from_str(&binary_payload).map_err(EngineError::corruption)?;
                bitmap::deserialize_from_cloud(&pairs)
            }
            None => bitmap::MonthlyLogs::new(),
        };

        Ok(Some(json_record.into_state(monthly_logs)))
    }

    /// Deletes both stored records. Used by the bootstrapper's auto-heal
    /// path when the session attempt counter exceeds its max, the local
    /// analogue of "unregister service workers, clear caches, reload".
    pub async fn clear_all(&self) -> Result<(), EngineError> {
        let _write_guard = self.write_lock.lock().await;
        *self.pending.lock().await = None;
        if let Some(handle) = self.debounce_handle.lock().await.take() {
            handle.abort();
        }
        sqlx::query("DELETE FROM app_state_store")
            .execute(&self.pool)
            .await
            .map_err(EngineError::from)?;
        Ok(())
    }

    /// Pretty-printed JSON of the full state with `monthlyLogsSerialized` as
    /// `[key, hex]` pairs, per the export file format in spec.md §6.
    pub fn export_json(state: &AppState) -> Result<String, EngineError> {
        #[derive(Serialize)]
        struct Export<'a> {
            #[serde(flatten)]
            core: &'a AppStateJson,
            monthly_logs_serialized: Vec<(String, String)>,
        }
        let core = AppStateJson::from_state(state);
        let export = Export {
            core: &core,
            monthly_logs_serialized: bitmap::serialize_for_cloud(&state.monthly_logs),
        };
        serde_json::to_string_pretty(&export).map_err(EngineError::corruption)
    }

    /// Validates presence of `habits` and `version`, then builds a full
    /// `AppState` from an export payload.
    pub fn import_json(payload: &str) -> Result<AppState, EngineError> {
        let mut value: serde_json::Value =
            serde_json::from_str(payload).map_err(|e| EngineError::Validation(e.to_string()))?;
        if !value.get("habits").is_some_and(|v| v.is_array()) {
            return Err(EngineError::Validation("import payload missing habits array".to_string()));
        }
        if value.get("version").is_none() {
            return Err(EngineError::Validation("import payload missing version".to_string()));
        }
        let pairs_value = value
            .as_object_mut()
            .and_then(|obj| obj.remove("monthly_logs_serialized"))
            .unwrap_or(serde_json::Value::Array(vec![]));
        let pairs: Vec<(String, String)> =
            serde_json::from_value(pairs_value).unwrap_or_default();

        migrate::migrate_to_current(&mut value);
        let core: AppStateJson = serde_json::from_value(value).map_err(EngineError::corruption)?;
        let monthly_logs = bitmap::deserialize_from_cloud(&pairs);
        Ok(core.into_state(monthly_logs))
    }
}

pub fn export_file_name(today: chrono::NaiveDate) -> String {
    format!("askesis-backup-{today}.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::TimeSlot;
    use crate::engine::bitmap;
    use uuid::Uuid;

    async fn temp_store() -> Arc<PersistenceStore> {
        let pool = connect_sqlite(":memory:").await.expect("connect sqlite");
        PersistenceStore::new(pool)
    }

    #[tokio::test]
    async fn save_then_load_is_a_fixed_point() {
        let persistence = temp_store().await;
        let mut state = AppState::empty(1000);
        let habit_id = Uuid::new_v4();
        bitmap::set_status(
            &mut state.monthly_logs,
            habit_id,
            chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            TimeSlot::Morning,
            crate::engine::model::HabitStatus::Done,
        );
        let store = StateStore::new(state);

        persistence.save_state(&store, 2000, true, true).await.unwrap();
        let loaded = persistence.load_state().await.unwrap().expect("state present");

        let original = store.lock().await;
        assert_eq!(loaded.habits.len(), original.habits.len());
        assert_eq!(loaded.monthly_logs, original.monthly_logs);
    }

    #[tokio::test]
    async fn load_state_returns_none_when_nothing_saved() {
        let persistence = temp_store().await;
        assert!(persistence.load_state().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_all_removes_previously_saved_state() {
        let persistence = temp_store().await;
        let store = StateStore::new(AppState::empty(1000));
        persistence.save_state(&store, 2000, true, true).await.unwrap();
        assert!(persistence.load_state().await.unwrap().is_some());

        persistence.clear_all().await.unwrap();
        assert!(persistence.load_state().await.unwrap().is_none());
    }

    #[test]
    fn export_then_import_round_trips_habits_and_logs() {
        let mut state = AppState::empty(500);
        let habit_id = Uuid::new_v4();
        bitmap::set_status(
            &mut state.monthly_logs,
            habit_id,
            chrono::NaiveDate::from_ymd_opt(2026, 2, 2).unwrap(),
            TimeSlot::Evening,
            crate::engine::model::HabitStatus::DonePlus,
        );
        let exported = PersistenceStore::export_json(&state).unwrap();
        let imported = PersistenceStore::import_json(&exported).unwrap();
        assert_eq!(imported.monthly_logs, state.monthly_logs);
    }
}
