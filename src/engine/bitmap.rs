//! Bitmap Log Service: the compact per-(habit, month) completion log.
//!
//! Each entry packs four states times three time-of-day slots times up to
//! 31 days into a single big integer. Bit offset of (day, slot) is
//! `6*day + 2*slot`; reading is `(mask >> offset) & 0b11`.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use num_bigint::BigUint;
use num_traits::Zero;

use super::model::{HabitId, HabitStatus, TimeSlot};

pub type MonthlyLogs = BTreeMap<String, BigUint>;

fn month_key(habit_id: HabitId, date: NaiveDate) -> String {
    format!("{habit_id}_{:04}-{:02}", date.year(), date.month())
}

fn bit_offset(date: NaiveDate, slot: TimeSlot) -> u32 {
    let day_index = date.day0();
    6 * day_index + 2 * slot.slot_index()
}

/// Reads the status at `(habit_id, date, slot)`. Absent keys read as `Null`.
pub fn get_status(logs: &MonthlyLogs, habit_id: HabitId, date: NaiveDate, slot: TimeSlot) -> HabitStatus {
    let key = month_key(habit_id, date);
    let Some(mask) = logs.get(&key) else {
        return HabitStatus::Null;
    };
    let offset = bit_offset(date, slot);
    let bits = ((mask >> offset) & BigUint::from(0b11u8))
        .to_u32_digits()
        .first()
        .copied()
        .unwrap_or(0) as u8;
    HabitStatus::from_bits(bits)
}

/// Sets the status at `(habit_id, date, slot)`, clearing the prior two bits
/// before OR-ing in the new value. Writing `Null` simply clears the bits.
pub fn set_status(logs: &mut MonthlyLogs, habit_id: HabitId, date: NaiveDate, slot: TimeSlot, status: HabitStatus) {
    let key = month_key(habit_id, date);
    let offset = bit_offset(date, slot);
    let mut entry = logs.remove(&key).unwrap_or_else(BigUint::zero);
    clear_two_bits(&mut entry, offset);
    if status.to_bits() != 0 {
        entry |= BigUint::from(status.to_bits()) << offset;
    }
    if !entry.is_zero() {
        logs.insert(key, entry);
    }
}

/// `BigUint` has no native bitwise NOT (it's unbounded), so clearing a
/// two-bit group is done by subtracting out whatever is currently set there.
fn clear_two_bits(value: &mut BigUint, offset: u32) {
    let mask = BigUint::from(0b11u8) << offset;
    let set_bits = &*value & &mask;
    *value -= set_bits;
}

/// Removes every monthly-log entry belonging to `habit_id`.
pub fn prune_logs_for_habit(logs: &mut MonthlyLogs, habit_id: HabitId) {
    let prefix = format!("{habit_id}_");
    logs.retain(|k, _| !k.starts_with(&prefix));
}

/// `[(key, hexString)]`, suitable for posting to a worker or over the wire.
pub fn serialize_for_cloud(logs: &MonthlyLogs) -> Vec<(String, String)> {
    logs.iter()
        .map(|(k, v)| (k.clone(), v.to_str_radix(16)))
        .collect()
}

/// Inverse of `serialize_for_cloud`. Entries that fail to parse as hex are
/// dropped with a warning rather than aborting the whole load.
pub fn deserialize_from_cloud(pairs: &[(String, String)]) -> MonthlyLogs {
    let mut out = MonthlyLogs::new();
    for (key, hex) in pairs {
        match BigUint::parse_bytes(hex.as_bytes(), 16) {
            Some(value) => {
                if !value.is_zero() {
                    out.insert(key.clone(), value);
                }
            }
            None => {
                tracing::warn!(key = %key, hex = %hex, "dropping unparseable monthly-log entry");
            }
        }
    }
    out
}

/// Bitwise-OR merge: `winner` entries take precedence bit-for-bit over
/// `loser` entries at the same slot position, since status bits are
/// mutually exclusive within a slot. Computed as
/// `winner | (loser & !winner_slot_mask)` per two-bit group so a winner's
/// explicit `Null` (cleared bits) still loses to information the loser has
/// at that exact slot only when the winner truly has nothing there.
pub fn merge_logs(loser: &MonthlyLogs, winner: &MonthlyLogs) -> MonthlyLogs {
    let mut out = winner.clone();
    for (key, loser_mask) in loser {
        match out.get(key) {
            Some(winner_mask) => {
                let merged = merge_masks(winner_mask, loser_mask);
                out.insert(key.clone(), merged);
            }
            None => {
                out.insert(key.clone(), loser_mask.clone());
            }
        }
    }
    out
}

/// Per-two-bit-group merge of a single month's mask: wherever `winner` has a
/// non-zero slot it stands; wherever `winner` is zero, `loser`'s bits for
/// that slot are copied in.
fn merge_masks(winner: &BigUint, loser: &BigUint) -> BigUint {
    let mut result = winner.clone();
    let two = BigUint::from(0b11u8);
    // 31 days * 3 slots = 93 two-bit groups, offsets 0..=184 step 2.
    for group in 0..93u32 {
        let offset = group * 2;
        let winner_bits = (winner >> offset) & &two;
        if winner_bits.is_zero() {
            let loser_bits = (loser >> offset) & &two;
            if !loser_bits.is_zero() {
                result |= loser_bits << offset;
            }
        }
    }
    result
}

/// `{"YYYY-MM": [[key, hex], …]}` grouped by calendar month for shard sync.
pub fn get_logs_grouped_by_month(logs: &MonthlyLogs) -> BTreeMap<String, Vec<(String, String)>> {
    let mut grouped: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
    for (key, value) in logs {
        let Some((_, month)) = key.rsplit_once('_') else {
            continue;
        };
        grouped
            .entry(month.to_string())
            .or_default()
            .push((key.clone(), value.to_str_radix(16)));
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut logs = MonthlyLogs::new();
        let id = Uuid::new_v4();
        set_status(&mut logs, id, d(2026, 3, 15), TimeSlot::Afternoon, HabitStatus::Done);
        assert_eq!(get_status(&logs, id, d(2026, 3, 15), TimeSlot::Afternoon), HabitStatus::Done);
        assert_eq!(get_status(&logs, id, d(2026, 3, 15), TimeSlot::Morning), HabitStatus::Null);
    }

    #[test]
    fn offset_matches_spec_example() {
        // S3: (h, 2026-03-15, Afternoon) => offset 6*14 + 2*1 = 86.
        assert_eq!(bit_offset(d(2026, 3, 15), TimeSlot::Afternoon), 86);
    }

    #[test]
    fn writing_null_clears_bits() {
        let mut logs = MonthlyLogs::new();
        let id = Uuid::new_v4();
        set_status(&mut logs, id, d(2026, 1, 1), TimeSlot::Morning, HabitStatus::DonePlus);
        set_status(&mut logs, id, d(2026, 1, 1), TimeSlot::Morning, HabitStatus::Null);
        assert_eq!(get_status(&logs, id, d(2026, 1, 1), TimeSlot::Morning), HabitStatus::Null);
        assert!(logs.is_empty(), "all-zero mask should be pruned");
    }

    #[test]
    fn setting_one_slot_does_not_disturb_another() {
        let mut logs = MonthlyLogs::new();
        let id = Uuid::new_v4();
        set_status(&mut logs, id, d(2026, 1, 1), TimeSlot::Morning, HabitStatus::Done);
        set_status(&mut logs, id, d(2026, 1, 1), TimeSlot::Evening, HabitStatus::Deferred);
        assert_eq!(get_status(&logs, id, d(2026, 1, 1), TimeSlot::Morning), HabitStatus::Done);
        assert_eq!(get_status(&logs, id, d(2026, 1, 1), TimeSlot::Evening), HabitStatus::Deferred);
    }

    #[test]
    fn serialize_round_trips_through_deserialize() {
        let mut logs = MonthlyLogs::new();
        let id = Uuid::new_v4();
        set_status(&mut logs, id, d(2026, 3, 15), TimeSlot::Afternoon, HabitStatus::Done);
        let pairs = serialize_for_cloud(&logs);
        let restored = deserialize_from_cloud(&pairs);
        assert_eq!(restored, logs);
    }

    #[test]
    fn prune_removes_only_matching_habit() {
        let mut logs = MonthlyLogs::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        set_status(&mut logs, a, d(2026, 1, 1), TimeSlot::Morning, HabitStatus::Done);
        set_status(&mut logs, b, d(2026, 1, 1), TimeSlot::Morning, HabitStatus::Done);
        prune_logs_for_habit(&mut logs, a);
        assert_eq!(logs.len(), 1);
        assert!(logs.keys().next().unwrap().starts_with(&b.to_string()));
    }

    #[test]
    fn merge_logs_is_bitwise_or_and_never_loses_loser_only_bits() {
        let id = Uuid::new_v4();
        let mut local = MonthlyLogs::new();
        set_status(&mut local, id, d(2026, 1, 5), TimeSlot::Morning, HabitStatus::Done);
        let mut server = MonthlyLogs::new();
        set_status(&mut server, id, d(2026, 1, 5), TimeSlot::Afternoon, HabitStatus::Deferred);

        let merged = merge_logs(&local, &server);
        assert_eq!(get_status(&merged, id, d(2026, 1, 5), TimeSlot::Morning), HabitStatus::Done);
        assert_eq!(get_status(&merged, id, d(2026, 1, 5), TimeSlot::Afternoon), HabitStatus::Deferred);
    }

    #[test]
    fn merge_logs_conflict_winner_takes_slot() {
        // S4: local has Done at Morning, server (winner) has Deferred at Morning.
        let id = Uuid::new_v4();
        let mut local = MonthlyLogs::new();
        set_status(&mut local, id, d(2026, 1, 5), TimeSlot::Morning, HabitStatus::Done);
        let mut server = MonthlyLogs::new();
        set_status(&mut server, id, d(2026, 1, 5), TimeSlot::Morning, HabitStatus::Deferred);

        let merged = merge_logs(&local, &server);
        assert_eq!(get_status(&merged, id, d(2026, 1, 5), TimeSlot::Morning), HabitStatus::Deferred);
    }
}
