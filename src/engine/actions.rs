//! Action Controller: the only path by which `AppState` is mutated once the
//! engine has booted. Mirrors the shape of `SyncOrchestrator` in
//! `crate::sync::orchestrator` (an `Arc<StateStore>` plus a small amount of
//! owned coordination state) but adds the single-slot confirm-then-apply
//! lock spec.md §4.6 calls `ActionContext`: only one pending drop, ending,
//! or deletion confirmation may be outstanding at a time.

use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{watch, Mutex};

use super::model::{
    daily_data_key, Frequency, Goal, Habit, HabitId, HabitInstanceData, HabitSchedule, HabitStatus, TimeSlot,
};
use super::selectors::{self, STREAK_CONSOLIDATED, STREAK_SEMI_CONSOLIDATED};
use super::state_store::StateStore;
use super::{bitmap, model::SyncLogKind};
use crate::error::EngineError;

/// What the caller should refresh after a mutation, per spec.md §4.6's
/// "Post-events" column. The engine has no DOM to dispatch events into, so
/// this enum stands in for `habitsChanged`/`render-app` — callers (the CLI,
/// or a future UI host) match on it to decide how much to redraw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshScope {
    /// `(habit_id, date)` changed; nothing else needs rebuilding.
    Partial { habit_id: HabitId, date: NaiveDate },
    /// Schedule history, the habit list, or archives changed; rebuild
    /// everything derived.
    Full,
}

/// A streak milestone hit as a side effect of `toggle_habit_status`. Callers
/// decide what to do with it (spec.md leaves this as a UI notification;
/// here it's surfaced as data instead of pushed through a side channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreakMilestone {
    SemiConsolidated,
    Consolidated,
}

/// The "just today" vs "from now on" choice a drop/edit flow resolves to,
/// per spec.md §4.6 `handleHabitDrop`/`saveHabitFromModal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeChoice {
    JustToday,
    FromNowOn,
}

/// What kind of confirm-then-apply flow currently holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingActionKind {
    HabitDrop,
    HabitEnding,
    HabitDeletion,
}

/// The single slot spec.md §4.6 calls `ActionContext`: at most one
/// confirm-then-apply flow (drop / ending / permanent deletion) may be
/// pending at a time. Acquired via `ActionController::begin_pending` and
/// released by either `confirm_pending` or `cancel_pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAction {
    pub kind: PendingActionKind,
    pub habit_id: HabitId,
}

/// Input to `save_habit_from_modal`, covering both "create" and "edit".
pub struct HabitModalInput {
    pub editing_habit_id: Option<HabitId>,
    pub target_date: NaiveDate,
    pub display_name: String,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub goal: Goal,
    pub philosophy: Option<String>,
    pub frequency: Frequency,
    pub times: std::collections::BTreeSet<TimeSlot>,
    pub schedule_anchor: NaiveDate,
}

/// Owns the process-wide action lock and the boot-lock readiness signal
/// (spec.md §4.6: "gate mutations behind `initialSyncDone`"), and exposes
/// every operation in spec.md §4.6's table as an `async fn`.
pub struct ActionController {
    store: Arc<StateStore>,
    pending: Mutex<Option<PendingAction>>,
    initial_sync_done_tx: watch::Sender<bool>,
}

impl ActionController {
    pub fn new(store: Arc<StateStore>) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { store, pending: Mutex::new(None), initial_sync_done_tx: tx }
    }

    pub fn subscribe_boot_done(&self) -> watch::Receiver<bool> {
        self.initial_sync_done_tx.subscribe()
    }

    pub fn mark_boot_done(&self) {
        let _ = self.initial_sync_done_tx.send(true);
    }

    fn require_booted(&self) -> Result<(), EngineError> {
        if *self.initial_sync_done_tx.borrow() {
            Ok(())
        } else {
            Err(EngineError::Validation("action rejected: boot not complete".to_string()))
        }
    }

    /// Acquires the single-slot confirm lock for a drop/ending/deletion flow.
    /// Fails if another flow is already pending, per spec.md §4.6 "no batch
    /// in flight" / "no action lock" preconditions.
    pub async fn begin_pending(&self, action: PendingAction) -> Result<(), EngineError> {
        let mut slot = self.pending.lock().await;
        if slot.is_some() {
            return Err(EngineError::Validation("another confirmation is already pending".to_string()));
        }
        *slot = Some(action);
        Ok(())
    }

    pub async fn cancel_pending(&self) {
        *self.pending.lock().await = None;
    }

    async fn take_pending(&self, expected: PendingActionKind, habit_id: HabitId) -> Result<(), EngineError> {
        let mut slot = self.pending.lock().await;
        match *slot {
            Some(p) if p.kind == expected && p.habit_id == habit_id => {
                *slot = None;
                Ok(())
            }
            _ => Err(EngineError::Validation("no matching pending confirmation".to_string())),
        }
    }

    /// `toggleHabitStatus(id, time, date)`: NULL -> DONE -> DEFERRED -> NULL,
    /// with DONE_PLUS collapsing to DEFERRED on the next press. Returns a
    /// milestone if the new status is DONE and the streak just crossed 21 or
    /// 66 days and hasn't notified for that milestone before.
    pub async fn toggle_habit_status(
        &self,
        habit_id: HabitId,
        slot: TimeSlot,
        date: NaiveDate,
        now_ms: i64,
    ) -> Result<(RefreshScope, Option<StreakMilestone>), EngineError> {
        self.require_booted()?;
        let mut state = self.store.lock().await;
        if state.habit(habit_id).is_none() {
            return Err(EngineError::Validation(format!("no such habit: {habit_id}")));
        }

        let current = bitmap::get_status(&state.monthly_logs, habit_id, date, slot);
        let next = match current {
            HabitStatus::Null => HabitStatus::Done,
            HabitStatus::Done => HabitStatus::Deferred,
            HabitStatus::Deferred => HabitStatus::Null,
            HabitStatus::DonePlus => HabitStatus::Deferred,
        };
        bitmap::set_status(&mut state.monthly_logs, habit_id, date, slot, next);
        state.bump_last_modified(now_ms, *self.initial_sync_done_tx.borrow());

        let milestone = if next == HabitStatus::Done {
            let habit = state.habit(habit_id).expect("checked above").clone();
            let streak = selectors::calculate_habit_streak(&habit, &state.monthly_logs, date);
            self.milestone_for_streak(&mut state, habit_id, streak)
        } else {
            None
        };

        drop(state);
        self.store.invalidate_for_date_change(habit_id, date);
        Ok((RefreshScope::Partial { habit_id, date }, milestone))
    }

    fn milestone_for_streak(
        &self,
        state: &mut super::model::AppState,
        habit_id: HabitId,
        streak: u32,
    ) -> Option<StreakMilestone> {
        let (key_suffix, milestone) = if streak >= STREAK_CONSOLIDATED {
            (STREAK_CONSOLIDATED, StreakMilestone::Consolidated)
        } else if streak >= STREAK_SEMI_CONSOLIDATED {
            (STREAK_SEMI_CONSOLIDATED, StreakMilestone::SemiConsolidated)
        } else {
            return None;
        };
        let key = format!("{habit_id}-{key_suffix}");
        if state.notifications_shown.contains(&key) {
            return None;
        }
        state.notifications_shown.insert(key);
        Some(milestone)
    }

    /// `markAllHabitsForDate(date, outcome)`: every habit appearing on `date`
    /// with a non-empty effective schedule has every scheduled slot set to
    /// DONE (`completed`) or DEFERRED (`snoozed`) where it isn't already.
    pub async fn mark_all_habits_for_date(
        &self,
        date: NaiveDate,
        outcome: BatchOutcome,
        now_ms: i64,
    ) -> Result<RefreshScope, EngineError> {
        self.require_booted()?;
        let mut state = self.store.lock().await;
        let target_status = match outcome {
            BatchOutcome::Completed => HabitStatus::Done,
            BatchOutcome::Snoozed => HabitStatus::Deferred,
        };

        let habits = state.habits.clone();
        for habit in &habits {
            if !selectors::should_habit_appear_on_date(habit, date) {
                continue;
            }
            let key = daily_data_key(habit.id, date);
            let daily_override = state.daily_data.get(&key).and_then(|d| d.daily_schedule.as_ref());
            let effective = selectors::get_effective_schedule_for_habit_on_date(habit, date, daily_override);
            if effective.is_empty() {
                continue;
            }
            for slot in effective {
                let current = bitmap::get_status(&state.monthly_logs, habit.id, date, slot);
                if current != target_status {
                    bitmap::set_status(&mut state.monthly_logs, habit.id, date, slot, target_status);
                }
            }
        }
        state.bump_last_modified(now_ms, *self.initial_sync_done_tx.borrow());
        drop(state);
        self.store.invalidate_all_caches();
        Ok(RefreshScope::Full)
    }

    /// `handleHabitDrop(id, fromTime, toTime, scope)`. "Just today" only
    /// touches the per-day override for `date`; "From now on" runs the
    /// schedule-history amendment algorithm from `date` onward, moving
    /// `from_slot` out of and `to_slot` into the habit's time set.
    pub async fn handle_habit_drop(
        &self,
        habit_id: HabitId,
        from_slot: TimeSlot,
        to_slot: TimeSlot,
        date: NaiveDate,
        scope: ScopeChoice,
        now_ms: i64,
    ) -> Result<RefreshScope, EngineError> {
        self.require_booted()?;
        let mut state = self.store.lock().await;
        if state.habit(habit_id).is_none() {
            return Err(EngineError::Validation(format!("no such habit: {habit_id}")));
        }

        match scope {
            ScopeChoice::JustToday => {
                let key = daily_data_key(habit_id, date);
                let entry = state.daily_data.entry(key).or_default();
                let mut times = entry
                    .daily_schedule
                    .clone()
                    .unwrap_or_else(|| {
                        selectors::get_effective_schedule_for_habit_on_date(state.habit(habit_id).unwrap(), date, None)
                    });
                times.remove(&from_slot);
                times.insert(to_slot);
                entry.daily_schedule = Some(times);
                state.bump_last_modified(now_ms, *self.initial_sync_done_tx.borrow());
                drop(state);
                self.store.invalidate_for_date_change(habit_id, date);
                Ok(RefreshScope::Partial { habit_id, date })
            }
            ScopeChoice::FromNowOn => {
                let habit = state.habit_mut(habit_id).expect("checked above");
                let mut times = schedule_covering(habit, date).times.clone();
                times.remove(&from_slot);
                times.insert(to_slot);
                amend_schedule_from(habit, date, |s| s.times = times.clone());
                state.bump_last_modified(now_ms, *self.initial_sync_done_tx.borrow());
                drop(state);
                self.store.invalidate_all_caches();
                Ok(RefreshScope::Full)
            }
        }
    }

    /// `saveHabitFromModal`. On create: reuse an active habit sharing the
    /// new display name by amending its schedule from `target_date`, or
    /// append a brand-new habit starting at `target_date`. On edit: amend
    /// the edited habit's schedule from `target_date`, pulling `created_on`
    /// back if `target_date` precedes it.
    pub async fn save_habit_from_modal(&self, input: HabitModalInput, now_ms: i64) -> Result<RefreshScope, EngineError> {
        self.require_booted()?;
        if input.display_name.trim().is_empty() {
            return Err(EngineError::Validation("habit name must not be empty".to_string()));
        }

        let new_fields = |s: &mut HabitSchedule| {
            s.display_name = input.display_name.clone();
            s.icon = input.icon.clone();
            s.color = input.color.clone();
            s.goal = input.goal.clone();
            s.philosophy = input.philosophy.clone();
            s.frequency = input.frequency.clone();
            s.times = input.times.clone();
            s.schedule_anchor = input.schedule_anchor;
        };

        let mut state = self.store.lock().await;
        match input.editing_habit_id {
            Some(habit_id) => {
                let habit = state
                    .habit_mut(habit_id)
                    .ok_or_else(|| EngineError::Validation(format!("no such habit: {habit_id}")))?;
                if input.target_date < habit.created_on {
                    habit.created_on = input.target_date;
                }
                amend_schedule_from(habit, input.target_date, new_fields);
            }
            None => {
                let reuse = state
                    .habits
                    .iter_mut()
                    .find(|h| !h.is_deleted() && h.schedule_history.last().is_some_and(|s| s.display_name == input.display_name));
                match reuse {
                    Some(habit) => amend_schedule_from(habit, input.target_date, new_fields),
                    None => {
                        let mut schedule = HabitSchedule {
                            start_date: input.target_date,
                            end_date: None,
                            display_name: input.display_name.clone(),
                            icon: input.icon.clone(),
                            color: input.color.clone(),
                            goal: input.goal.clone(),
                            philosophy: input.philosophy.clone(),
                            frequency: input.frequency.clone(),
                            times: input.times.clone(),
                            schedule_anchor: input.schedule_anchor,
                        };
                        new_fields(&mut schedule);
                        schedule.start_date = input.target_date;
                        state.habits.push(Habit {
                            id: HabitId::new_v4(),
                            created_on: input.target_date,
                            graduated_on: None,
                            deleted_on: None,
                            schedule_history: vec![schedule],
                        });
                    }
                }
            }
        }
        state.bump_last_modified(now_ms, *self.initial_sync_done_tx.borrow());
        drop(state);
        self.store.invalidate_all_caches();
        Ok(RefreshScope::Full)
    }

    /// `requestHabitEndingFromModal(id)`, step one: take the confirm lock.
    pub async fn request_habit_ending(&self, habit_id: HabitId) -> Result<(), EngineError> {
        self.require_booted()?;
        self.begin_pending(PendingAction { kind: PendingActionKind::HabitEnding, habit_id }).await
    }

    /// Confirmation for `request_habit_ending`: sets the tail schedule's
    /// `end_date = target_date`.
    pub async fn confirm_habit_ending(&self, habit_id: HabitId, target_date: NaiveDate, now_ms: i64) -> Result<RefreshScope, EngineError> {
        self.take_pending(PendingActionKind::HabitEnding, habit_id).await?;
        let mut state = self.store.lock().await;
        let habit = state
            .habit_mut(habit_id)
            .ok_or_else(|| EngineError::Validation(format!("no such habit: {habit_id}")))?;
        if let Some(tail) = habit.schedule_history.last_mut() {
            tail.end_date = Some(target_date);
        }
        state.bump_last_modified(now_ms, *self.initial_sync_done_tx.borrow());
        drop(state);
        self.store.invalidate_all_caches();
        Ok(RefreshScope::Full)
    }

    /// `requestHabitPermanentDeletion(id)`, step one: take the confirm lock.
    pub async fn request_habit_deletion(&self, habit_id: HabitId) -> Result<(), EngineError> {
        self.require_booted()?;
        self.begin_pending(PendingAction { kind: PendingActionKind::HabitDeletion, habit_id }).await
    }

    /// Confirmation for `request_habit_deletion`: soft-deletes the habit
    /// (`deleted_on = created_on`), prunes its bitmap entries, drops its
    /// per-day entries, and schedules an archive-prune in the background.
    pub async fn confirm_habit_deletion(&self, habit_id: HabitId, now_ms: i64) -> Result<RefreshScope, EngineError> {
        self.take_pending(PendingActionKind::HabitDeletion, habit_id).await?;
        let mut state = self.store.lock().await;
        {
            let habit = state
                .habit_mut(habit_id)
                .ok_or_else(|| EngineError::Validation(format!("no such habit: {habit_id}")))?;
            habit.deleted_on = Some(habit.created_on);
        }
        bitmap::prune_logs_for_habit(&mut state.monthly_logs, habit_id);
        let prefix = habit_id.to_string();
        state.daily_data.retain(|key, _| !key.starts_with(&prefix));
        state.bump_last_modified(now_ms, *self.initial_sync_done_tx.borrow());
        drop(state);
        self.store.invalidate_all_caches();
        Ok(RefreshScope::Full)
    }

    /// `handleHabitDrop`/general confirm escape hatch: drops whatever is
    /// pending without applying it.
    pub async fn cancel_habit_action(&self, habit_id: HabitId, kind: PendingActionKind) -> Result<(), EngineError> {
        self.take_pending(kind, habit_id).await
    }

    /// `graduateHabit(id)`: marks a habit as graduated as of `selected_date`.
    pub async fn graduate_habit(&self, habit_id: HabitId, selected_date: NaiveDate, now_ms: i64) -> Result<RefreshScope, EngineError> {
        self.require_booted()?;
        let mut state = self.store.lock().await;
        let habit = state
            .habit_mut(habit_id)
            .ok_or_else(|| EngineError::Validation(format!("no such habit: {habit_id}")))?;
        habit.graduated_on = Some(selected_date);
        state.bump_last_modified(now_ms, *self.initial_sync_done_tx.borrow());
        drop(state);
        self.store.invalidate_all_caches();
        Ok(RefreshScope::Full)
    }

    /// `setGoalOverride(id, date, time, value)`: sets the per-instance goal
    /// override, then flips DONE<->DONE_PLUS if the override crosses the
    /// covering schedule's numeric goal total and the slot is currently
    /// marked complete.
    pub async fn set_goal_override(
        &self,
        habit_id: HabitId,
        date: NaiveDate,
        slot: TimeSlot,
        value: f64,
        now_ms: i64,
    ) -> Result<RefreshScope, EngineError> {
        self.require_booted()?;
        let mut state = self.store.lock().await;
        let habit = state
            .habit(habit_id)
            .ok_or_else(|| EngineError::Validation(format!("no such habit: {habit_id}")))?
            .clone();

        let key = daily_data_key(habit_id, date);
        let entry = state.daily_data.entry(key).or_default();
        let instance = entry.instances.entry(slot).or_insert_with(HabitInstanceData::default);
        instance.goal_override = Some(value);

        let current = bitmap::get_status(&state.monthly_logs, habit_id, date, slot);
        if current.is_completed()
            && let Some(schedule) = selectors::get_schedule_for_date(&habit, date)
            && let Goal::Numeric { total } = schedule.goal
        {
            let crossed = value >= total;
            let next = if crossed { HabitStatus::DonePlus } else { HabitStatus::Done };
            if next != current {
                bitmap::set_status(&mut state.monthly_logs, habit_id, date, slot, next);
            }
        }
        state.bump_last_modified(now_ms, *self.initial_sync_done_tx.borrow());
        drop(state);
        self.store.invalidate_for_date_change(habit_id, date);
        Ok(RefreshScope::Partial { habit_id, date })
    }

    /// `performArchivalCheck()`: gathers `dailyData` entries older than
    /// `threshold_days`, groups them by year, hands each year's batch to the
    /// worker bridge for gzip compression into `archives`, then drops the
    /// pulled hot entries. Returns the number of entries archived.
    pub async fn perform_archival_check(&self, today: NaiveDate, threshold_days: i64, now_ms: i64) -> Result<usize, EngineError> {
        let mut state = self.store.lock().await;
        let cutoff = today - chrono::Duration::days(threshold_days);

        let mut by_year: std::collections::BTreeMap<i32, Vec<(String, HabitInstanceDump)>> = std::collections::BTreeMap::new();
        for (key, data) in &state.daily_data {
            let Some((_, date)) = super::model::parse_daily_data_key(key) else { continue };
            if date >= cutoff {
                continue;
            }
            by_year.entry(date.year_for_archive()).or_default().push((key.clone(), HabitInstanceDump::from(data)));
        }

        let mut archived = 0usize;
        for (year, entries) in by_year {
            archived += entries.len();
            let keys: Vec<String> = entries.iter().map(|(k, _)| k.clone()).collect();
            let payload = serde_json::to_vec(&entries).map_err(EngineError::from)?;
            let compressed = crate::worker::dispatch(move || crate::crypto::json::gzip_compress(&payload)).await?;
            state
                .archives
                .entry(year)
                .and_modify(|existing| existing.extend_from_slice(&compressed))
                .or_insert(compressed);
            for key in keys {
                state.daily_data.remove(&key);
            }
        }
        if archived > 0 {
            state.bump_last_modified(now_ms, *self.initial_sync_done_tx.borrow());
        }
        Ok(archived)
    }

    /// `resetApplicationData()`: clears all in-memory state and caches. The
    /// caller is responsible for clearing persistence and the sync key and
    /// for restarting the bootstrapper, since those live outside `StateStore`.
    pub async fn reset_application_data(&self, now_ms: i64) {
        self.store.replace(super::model::AppState::empty(now_ms)).await;
        *self.pending.lock().await = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed,
    Snoozed,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct HabitInstanceDump {
    daily_schedule: Option<std::collections::BTreeSet<TimeSlot>>,
    instances: std::collections::BTreeMap<TimeSlot, HabitInstanceData>,
}

impl From<&super::model::HabitDayData> for HabitInstanceDump {
    fn from(data: &super::model::HabitDayData) -> Self {
        Self { daily_schedule: data.daily_schedule.clone(), instances: data.instances.clone() }
    }
}

trait ArchiveYear {
    fn year_for_archive(&self) -> i32;
}

impl ArchiveYear for NaiveDate {
    fn year_for_archive(&self) -> i32 {
        use chrono::Datelike;
        self.year()
    }
}

fn schedule_covering(habit: &Habit, date: NaiveDate) -> &HabitSchedule {
    habit
        .schedule_history
        .iter()
        .find(|s| s.covers(date))
        .unwrap_or_else(|| habit.schedule_history.last().expect("non-empty schedule history"))
}

/// The schedule-history amendment algorithm from spec.md §4.6
/// `_requestFutureScheduleChange`: find the interval containing
/// `target_date`. If `target_date` equals that interval's `start_date`,
/// update it in place. Otherwise split it — set its `end_date =
/// target_date` and append a new interval starting there with the updated
/// fields. The last interval is always open-ended, so it covers any date at
/// or after its own `start_date`; the only way `target_date` falls outside
/// every interval is when it precedes the *earliest* one (the
/// `save_habit_from_modal` "extend `created_on` back" path). In that case
/// the earliest interval's `start_date` is pulled back to `target_date` and
/// the new fields are applied to it in place, the same as the
/// "update in place" case, just for the first entry instead of a later one
/// — this keeps the history contiguous instead of appending a clamped,
/// out-of-order tail. Always re-sorts by `start_date` and clears
/// `graduated_on`.
fn amend_schedule_from(habit: &mut Habit, target_date: NaiveDate, apply: impl FnOnce(&mut HabitSchedule)) {
    let containing_index = habit.schedule_history.iter().position(|s| s.covers(target_date));

    match containing_index {
        Some(idx) if habit.schedule_history[idx].start_date == target_date => {
            apply(&mut habit.schedule_history[idx]);
        }
        Some(idx) => {
            let mut new_entry = habit.schedule_history[idx].clone();
            habit.schedule_history[idx].end_date = Some(target_date);
            new_entry.start_date = target_date;
            new_entry.end_date = None;
            apply(&mut new_entry);
            habit.schedule_history.insert(idx + 1, new_entry);
        }
        None => {
            let first = habit
                .schedule_history
                .first_mut()
                .expect("schedule history is never empty");
            first.start_date = target_date;
            apply(first);
        }
    }

    habit.schedule_history.sort_by_key(|s| s.start_date);
    habit.graduated_on = None;
}

/// The reorder algorithm from spec.md §4.6: splice `moved` out of the habit
/// list, then insert it at `target`'s index, offset by one for `'after'`
/// (and corrected for the shift when `moved` preceded `target` in the
/// original order).
pub fn reorder_habits(habits: &mut Vec<Habit>, moved_id: HabitId, target_id: HabitId, position: ReorderPosition) -> Result<(), EngineError> {
    let moved_index = habits
        .iter()
        .position(|h| h.id == moved_id)
        .ok_or_else(|| EngineError::Validation(format!("no such habit: {moved_id}")))?;
    let moved = habits.remove(moved_index);

    // `target_index` is computed after removal, so it already reflects the
    // shift `moved_index < target_index` would otherwise require adjusting
    // for.
    let target_index = habits
        .iter()
        .position(|h| h.id == target_id)
        .ok_or_else(|| EngineError::Validation(format!("no such habit: {target_id}")))?;

    let insert_at = match position {
        ReorderPosition::Before => target_index,
        ReorderPosition::After => target_index + 1,
    };
    habits.insert(insert_at.min(habits.len()), moved);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderPosition {
    Before,
    After,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::AppState;
    use std::collections::BTreeSet;

    fn schedule(start: NaiveDate, times: &[TimeSlot]) -> HabitSchedule {
        HabitSchedule {
            start_date: start,
            end_date: None,
            display_name: "Run".to_string(),
            icon: None,
            color: None,
            goal: Goal::Check,
            philosophy: None,
            frequency: Frequency::Daily,
            times: times.iter().copied().collect(),
            schedule_anchor: start,
        }
    }

    async fn controller_with_habit(created: NaiveDate, times: &[TimeSlot]) -> (ActionController, HabitId) {
        let mut state = AppState::empty(0);
        let id = HabitId::new_v4();
        state.habits.push(Habit {
            id,
            created_on: created,
            graduated_on: None,
            deleted_on: None,
            schedule_history: vec![schedule(created, times)],
        });
        let store = Arc::new(StateStore::new(state));
        let controller = ActionController::new(store);
        controller.mark_boot_done();
        (controller, id)
    }

    #[tokio::test]
    async fn toggle_cycles_null_done_deferred_null() {
        let created = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let (controller, id) = controller_with_habit(created, &[TimeSlot::Morning]).await;

        let (scope, milestone) = controller.toggle_habit_status(id, TimeSlot::Morning, created, 10).await.unwrap();
        assert_eq!(scope, RefreshScope::Partial { habit_id: id, date: created });
        assert!(milestone.is_none());

        controller.toggle_habit_status(id, TimeSlot::Morning, created, 20).await.unwrap();
        let state = controller.store.lock().await;
        assert_eq!(bitmap::get_status(&state.monthly_logs, id, created, TimeSlot::Morning), HabitStatus::Deferred);
        drop(state);

        controller.toggle_habit_status(id, TimeSlot::Morning, created, 30).await.unwrap();
        let state = controller.store.lock().await;
        assert_eq!(bitmap::get_status(&state.monthly_logs, id, created, TimeSlot::Morning), HabitStatus::Null);
    }

    #[tokio::test]
    async fn toggle_rejects_before_boot() {
        let created = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let mut state = AppState::empty(0);
        let id = HabitId::new_v4();
        state.habits.push(Habit { id, created_on: created, graduated_on: None, deleted_on: None, schedule_history: vec![schedule(created, &[TimeSlot::Morning])] });
        let controller = ActionController::new(Arc::new(StateStore::new(state)));
        let result = controller.toggle_habit_status(id, TimeSlot::Morning, created, 10).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn mark_all_sets_every_appearing_habit() {
        let created = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let (controller, id) = controller_with_habit(created, &[TimeSlot::Morning, TimeSlot::Evening]).await;
        controller.mark_all_habits_for_date(created, BatchOutcome::Completed, 10).await.unwrap();
        let state = controller.store.lock().await;
        assert_eq!(bitmap::get_status(&state.monthly_logs, id, created, TimeSlot::Morning), HabitStatus::Done);
        assert_eq!(bitmap::get_status(&state.monthly_logs, id, created, TimeSlot::Evening), HabitStatus::Done);
    }

    #[tokio::test]
    async fn deletion_requires_confirmation_lock() {
        let created = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let (controller, id) = controller_with_habit(created, &[TimeSlot::Morning]).await;

        let direct = controller.confirm_habit_deletion(id, 10).await;
        assert!(direct.is_err());

        controller.request_habit_deletion(id).await.unwrap();
        controller.confirm_habit_deletion(id, 10).await.unwrap();
        let state = controller.store.lock().await;
        let habit = state.habit(id).unwrap();
        assert_eq!(habit.deleted_on, Some(created));
    }

    #[tokio::test]
    async fn only_one_pending_confirmation_at_a_time() {
        let created = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let (controller, id) = controller_with_habit(created, &[TimeSlot::Morning]).await;
        controller.request_habit_deletion(id).await.unwrap();
        let second = controller.request_habit_ending(id).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn schedule_amendment_splits_interval_at_target_date() {
        let created = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let (controller, id) = controller_with_habit(created, &[TimeSlot::Morning]).await;
        let target = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();

        controller
            .save_habit_from_modal(
                HabitModalInput {
                    editing_habit_id: Some(id),
                    target_date: target,
                    display_name: "Run".to_string(),
                    icon: None,
                    color: None,
                    goal: Goal::Check,
                    philosophy: None,
                    frequency: Frequency::Daily,
                    times: BTreeSet::from([TimeSlot::Evening]),
                    schedule_anchor: target,
                },
                20,
            )
            .await
            .unwrap();

        let state = controller.store.lock().await;
        let habit = state.habit(id).unwrap();
        assert_eq!(habit.schedule_history.len(), 2);
        assert_eq!(habit.schedule_history[0].end_date, Some(target));
        assert_eq!(habit.schedule_history[1].times, BTreeSet::from([TimeSlot::Evening]));
        assert!(habit.schedule_history_is_well_formed());
    }

    #[tokio::test]
    async fn goal_override_flips_to_done_plus_on_crossing() {
        let created = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let mut state = AppState::empty(0);
        let id = HabitId::new_v4();
        let mut sched = schedule(created, &[TimeSlot::Morning]);
        sched.goal = Goal::Numeric { total: 10.0 };
        state.habits.push(Habit { id, created_on: created, graduated_on: None, deleted_on: None, schedule_history: vec![sched] });
        bitmap::set_status(&mut state.monthly_logs, id, created, TimeSlot::Morning, HabitStatus::Done);
        let store = Arc::new(StateStore::new(state));
        let controller = ActionController::new(store);
        controller.mark_boot_done();

        controller.set_goal_override(id, created, TimeSlot::Morning, 12.0, 10).await.unwrap();
        let state = controller.store.lock().await;
        assert_eq!(bitmap::get_status(&state.monthly_logs, id, created, TimeSlot::Morning), HabitStatus::DonePlus);
    }

    #[tokio::test]
    async fn reorder_moves_habit_after_target() {
        let mut habits = Vec::new();
        let mut ids = Vec::new();
        for i in 0..3 {
            let id = HabitId::new_v4();
            ids.push(id);
            habits.push(Habit {
                id,
                created_on: NaiveDate::from_ymd_opt(2026, 1, 1 + i).unwrap(),
                graduated_on: None,
                deleted_on: None,
                schedule_history: vec![schedule(NaiveDate::from_ymd_opt(2026, 1, 1 + i).unwrap(), &[TimeSlot::Morning])],
            });
        }
        reorder_habits(&mut habits, ids[0], ids[2], ReorderPosition::After).unwrap();
        let order: Vec<_> = habits.iter().map(|h| h.id).collect();
        assert_eq!(order, vec![ids[1], ids[2], ids[0]]);
    }

    #[tokio::test]
    async fn archival_check_moves_old_entries_into_archives() {
        let today = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let old_date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let (controller, id) = controller_with_habit(old_date, &[TimeSlot::Morning]).await;
        {
            let mut state = controller.store.lock().await;
            state.daily_data.insert(daily_data_key(id, old_date), super::super::model::HabitDayData { daily_schedule: None, instances: Default::default() });
        }

        let archived = controller.perform_archival_check(today, 90, 100).await.unwrap();
        assert_eq!(archived, 1);
        let state = controller.store.lock().await;
        assert!(!state.daily_data.contains_key(&daily_data_key(id, old_date)));
        assert!(state.archives.contains_key(&2025));
    }
}
