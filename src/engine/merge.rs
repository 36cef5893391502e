//! CRDT-lite reconciliation of two full `AppState`s. Never throws:
//! malformed input is dropped with a warning and the winner is retained.

use super::bitmap;
use super::model::{AppState, Habit, HabitSchedule};

/// Merges `local` and `incoming` per spec.md §4.4 and returns the result.
/// `now_ms` is used only for the final `last_modified` bump.
pub fn merge_states(local: &AppState, incoming: &AppState, now_ms: i64) -> AppState {
    let (winner, loser) = select_base(local, incoming);

    let mut merged = winner.clone();
    merge_habits_into(&mut merged.habits, &loser.habits);
    merge_daily_data_into(&mut merged, loser);
    merged.monthly_logs = bitmap::merge_logs(&loser.monthly_logs, &winner.monthly_logs);
    merge_archives_into(&mut merged.archives, &loser.archives);
    for key in &loser.notifications_shown {
        merged.notifications_shown.insert(key.clone());
    }
    for id in &loser.pending_21_day_habit_ids {
        if !merged.pending_21_day_habit_ids.contains(id) {
            merged.pending_21_day_habit_ids.push_back(*id);
        }
    }
    for id in &loser.pending_consolidation_habit_ids {
        if !merged.pending_consolidation_habit_ids.contains(id) {
            merged.pending_consolidation_habit_ids.push_back(*id);
        }
    }

    merged.last_modified = local.last_modified.max(incoming.last_modified).max(now_ms) + 1;
    merged
}

/// "If one side has zero habits and the other has habits, the non-empty
/// side wins (protects against accidental reset). Otherwise the side with
/// greater `last_modified` wins; ties go to local."
fn select_base<'a>(local: &'a AppState, incoming: &'a AppState) -> (&'a AppState, &'a AppState) {
    if local.habits.is_empty() && !incoming.habits.is_empty() {
        return (incoming, local);
    }
    if incoming.habits.is_empty() && !local.habits.is_empty() {
        return (local, incoming);
    }
    if incoming.last_modified > local.last_modified {
        (incoming, local)
    } else {
        (local, incoming)
    }
}

fn merge_habits_into(winner_habits: &mut Vec<Habit>, loser_habits: &[Habit]) {
    for loser_habit in loser_habits {
        match winner_habits.iter_mut().find(|h| h.id == loser_habit.id) {
            Some(winner_habit) => merge_habit_fields(winner_habit, loser_habit),
            None => winner_habits.push(loser_habit.clone()),
        }
    }
}

fn merge_habit_fields(winner: &mut Habit, loser: &Habit) {
    // deletedOn: later date wins (deletion propagates forward).
    winner.deleted_on = match (winner.deleted_on, loser.deleted_on) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };
    // graduatedOn: earlier date wins.
    winner.graduated_on = match (winner.graduated_on, loser.graduated_on) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };
    merge_schedule_history(&mut winner.schedule_history, &loser.schedule_history);
}

/// Merges two schedule-history lists keyed by `start_date`. On conflict
/// (both sides define an interval with the same `start_date`): take the
/// earlier `end_date` if both have one, and fill missing philosophy from
/// the loser side.
fn merge_schedule_history(winner: &mut Vec<HabitSchedule>, loser: &[HabitSchedule]) {
    for loser_entry in loser {
        match winner.iter_mut().find(|w| w.start_date == loser_entry.start_date) {
            Some(existing) => {
                existing.end_date = match (existing.end_date, loser_entry.end_date) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (Some(a), None) => Some(a),
                    (None, Some(b)) => Some(b),
                    (None, None) => None,
                };
                if existing.philosophy.is_none() {
                    existing.philosophy = loser_entry.philosophy.clone();
                }
            }
            None => winner.push(loser_entry.clone()),
        }
    }
    winner.sort_by_key(|s| s.start_date);
}

fn merge_daily_data_into(merged: &mut AppState, loser: &AppState) {
    for (key, loser_entry) in &loser.daily_data {
        match merged.daily_data.get_mut(key) {
            None => {
                merged.daily_data.insert(key.clone(), loser_entry.clone());
            }
            Some(winner_entry) => {
                if winner_entry.daily_schedule.is_none() {
                    winner_entry.daily_schedule = loser_entry.daily_schedule.clone();
                }
                for (slot, loser_instance) in &loser_entry.instances {
                    let winner_instance = winner_entry.instances.entry(*slot).or_default();
                    let winner_len = winner_instance.note.as_deref().map(str::len).unwrap_or(0);
                    let loser_len = loser_instance.note.as_deref().map(str::len).unwrap_or(0);
                    if loser_len > winner_len {
                        winner_instance.note = loser_instance.note.clone();
                    }
                    if winner_instance.goal_override.is_none() {
                        winner_instance.goal_override = loser_instance.goal_override;
                    }
                }
            }
        }
    }
}

fn merge_archives_into(winner: &mut std::collections::BTreeMap<i32, Vec<u8>>, loser: &std::collections::BTreeMap<i32, Vec<u8>>) {
    for (year, blob) in loser {
        winner.entry(*year).or_insert_with(|| blob.clone());
    }
}
