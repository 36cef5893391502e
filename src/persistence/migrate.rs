//! Migration pipeline: a list of steps keyed by `from_version`, run forward
//! from whatever `version` is found in the stored JSON record up to
//! `CURRENT_STATE_VERSION`. Grounded in the same "load, validate,
//! default-fill" shape as the config loader's `#[serde(default = ...)]`
//! fields — each step only has to fill in what an old record is missing.

use serde_json::Value;

use crate::engine::model::CURRENT_STATE_VERSION;

type MigrationStep = fn(&mut Value);

/// `STEPS[i]` migrates a record from version `i + 1` to version `i + 2`.
const STEPS: &[MigrationStep] = &[migrate_v1_to_v2, migrate_v2_to_v3];

/// Adds `has_onboarded` (introduced in v2) if absent.
fn migrate_v1_to_v2(value: &mut Value) {
    if let Some(obj) = value.as_object_mut()
        && !obj.contains_key("has_onboarded")
    {
        obj.insert("has_onboarded".to_string(), Value::Bool(false));
    }
}

/// Adds `sync_logs` (introduced in v3) if absent.
fn migrate_v2_to_v3(value: &mut Value) {
    if let Some(obj) = value.as_object_mut()
        && !obj.contains_key("sync_logs")
    {
        obj.insert("sync_logs".to_string(), Value::Array(vec![]));
    }
}

/// Runs every applicable step in order and stamps the resulting version.
/// A record with no `version` field at all is treated as version 1.
pub fn migrate_to_current(value: &mut Value) {
    let from_version = value
        .get("version")
        .and_then(Value::as_u64)
        .unwrap_or(1) as usize;

    for step in STEPS.iter().skip(from_version.saturating_sub(1)) {
        step(value);
    }

    if let Some(obj) = value.as_object_mut() {
        obj.insert("version".to_string(), Value::from(CURRENT_STATE_VERSION));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn migrates_v1_record_forward_to_current() {
        let mut value = json!({
            "version": 1,
            "habits": [],
            "daily_data": {},
            "archives": {},
            "daily_diagnoses": {},
            "notifications_shown": [],
            "pending_21_day_habit_ids": [],
            "pending_consolidation_habit_ids": [],
            "last_modified": 0,
        });
        migrate_to_current(&mut value);
        assert_eq!(value["version"], CURRENT_STATE_VERSION);
        assert_eq!(value["has_onboarded"], false);
        assert_eq!(value["sync_logs"], serde_json::Value::Array(vec![]));
    }

    #[test]
    fn leaves_current_version_record_untouched_besides_stamping() {
        let mut value = json!({
            "version": CURRENT_STATE_VERSION,
            "has_onboarded": true,
            "sync_logs": [],
        });
        migrate_to_current(&mut value);
        assert_eq!(value["has_onboarded"], true);
    }
}
