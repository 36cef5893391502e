//! Pure, memoized derivations over habits and the bitmap log. None of these
//! functions mutate `AppState`; the memoization layer is a separate cache
//! object callers invalidate explicitly on schedule or status changes.

use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate};
use moka::sync::Cache;

use super::bitmap::{self, MonthlyLogs};
use super::model::{Frequency, Habit, HabitId, HabitSchedule, HabitStatus, TimeSlot};

pub const STREAK_SEMI_CONSOLIDATED: u32 = 21;
pub const STREAK_CONSOLIDATED: u32 = 66;

/// The `HabitSchedule` covering `date`, or the last schedule in history if
/// `date` is beyond every interval's `start_date`.
pub fn get_schedule_for_date(habit: &Habit, date: NaiveDate) -> Option<&HabitSchedule> {
    habit
        .schedule_history
        .iter()
        .find(|s| s.covers(date))
        .or_else(|| habit.schedule_history.last())
}

/// The effective time-slot set for a habit on a date: the per-day override
/// if present, else the covering schedule's `times`.
pub fn get_effective_schedule_for_habit_on_date(
    habit: &Habit,
    date: NaiveDate,
    daily_override: Option<&BTreeSet<TimeSlot>>,
) -> BTreeSet<TimeSlot> {
    if let Some(times) = daily_override {
        return times.clone();
    }
    get_schedule_for_date(habit, date)
        .map(|s| s.times.clone())
        .unwrap_or_default()
}

/// Applies frequency rules plus lifecycle bounds (`created_on`, `deleted_on`,
/// `graduated_on`) to decide whether a habit should appear on `date`.
pub fn should_habit_appear_on_date(habit: &Habit, date: NaiveDate) -> bool {
    if date < habit.created_on {
        return false;
    }
    if let Some(deleted_on) = habit.deleted_on
        && date >= deleted_on
    {
        return false;
    }
    if let Some(graduated_on) = habit.graduated_on
        && graduated_on <= date
    {
        return false;
    }
    let Some(schedule) = get_schedule_for_date(habit, date) else {
        return false;
    };
    match &schedule.frequency {
        Frequency::Daily => true,
        Frequency::SpecificDaysOfWeek { days } => {
            let weekday = date.weekday().num_days_from_sunday() as u8;
            days.contains(&weekday)
        }
        Frequency::Interval { period } => {
            if *period == 0 {
                return false;
            }
            let days_from_anchor = (date - schedule.schedule_anchor).num_days();
            days_from_anchor.rem_euclid(*period as i64) == 0
        }
    }
}

/// Counts consecutive days ending at `date` (inclusive) where the habit
/// appeared and every scheduled slot was `Done` or `DonePlus`.
pub fn calculate_habit_streak(habit: &Habit, logs: &MonthlyLogs, date: NaiveDate) -> u32 {
    let mut streak = 0u32;
    let mut cursor = date;
    loop {
        if !should_habit_appear_on_date(habit, cursor) {
            break;
        }
        let effective = get_effective_schedule_for_habit_on_date(habit, cursor, None);
        if effective.is_empty() {
            break;
        }
        let all_done = effective
            .iter()
            .all(|slot| bitmap::get_status(logs, habit.id, cursor, *slot).is_completed());
        if !all_done {
            break;
        }
        streak += 1;
        let Some(prev) = cursor.pred_opt() else {
            break;
        };
        if prev < habit.created_on {
            break;
        }
        cursor = prev;
    }
    streak
}

#[derive(Debug, Clone)]
pub struct HabitDisplayInfo {
    pub name: String,
    pub icon: Option<String>,
    pub color: Option<String>,
}

/// Resolves display properties from the schedule covering `date`, falling
/// back to the last schedule entry when no date is supplied.
pub fn get_habit_display_info(habit: &Habit, date: Option<NaiveDate>) -> Option<HabitDisplayInfo> {
    let schedule = match date {
        Some(d) => get_schedule_for_date(habit, d),
        None => habit.schedule_history.last(),
    }?;
    Some(HabitDisplayInfo {
        name: schedule.display_name.clone(),
        icon: schedule.icon.clone(),
        color: schedule.color.clone(),
    })
}

/// Memoization layer over the pure selectors above. Two independent caches
/// mirror the two invalidation granularities the engine needs: a full wipe
/// on schedule-history mutation, and a per-(habit, date) wipe on status
/// change (streaks depend on bitmap contents, schedules don't).
#[derive(Clone)]
pub struct SelectorCache {
    streaks: Cache<(HabitId, NaiveDate), u32>,
}

impl SelectorCache {
    pub fn new() -> Self {
        Self {
            streaks: Cache::builder().max_capacity(10_000).build(),
        }
    }

    pub fn streak(&self, habit: &Habit, logs: &MonthlyLogs, date: NaiveDate) -> u32 {
        let key = (habit.id, date);
        if let Some(cached) = self.streaks.get(&key) {
            return cached;
        }
        let computed = calculate_habit_streak(habit, logs, date);
        self.streaks.insert(key, computed);
        computed
    }

    /// Called on any schedule-history mutation: schedules affect appearance
    /// and thus every cached streak, so the whole cache is dropped.
    pub fn invalidate_all(&self) {
        self.streaks.invalidate_all();
    }

    /// Called on a per-day status change: only that date's derived values
    /// for that habit are stale. Streaks are backward-looking, so later
    /// dates that depend on this one are stale too; the cache is keyed
    /// per-date so we conservatively clear forward from `date`.
    pub fn invalidate_for_date_change(&self, habit_id: HabitId, date: NaiveDate) {
        self.streaks.invalidate(&(habit_id, date));
        for offset in 1..=400i64 {
            if let Some(future) = date.checked_add_signed(chrono::Duration::days(offset)) {
                self.streaks.invalidate(&(habit_id, future));
            }
        }
    }
}

impl Default for SelectorCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::Goal;
    use uuid::Uuid;

    fn daily_habit(created: NaiveDate, times: &[TimeSlot]) -> Habit {
        Habit {
            id: Uuid::new_v4(),
            created_on: created,
            graduated_on: None,
            deleted_on: None,
            schedule_history: vec![HabitSchedule {
                start_date: created,
                end_date: None,
                display_name: "Run".to_string(),
                icon: None,
                color: None,
                goal: Goal::Check,
                philosophy: None,
                frequency: Frequency::Daily,
                times: times.iter().copied().collect(),
                schedule_anchor: created,
            }],
        }
    }

    #[test]
    fn streak_counts_consecutive_completed_days() {
        let created = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let habit = daily_habit(created, &[TimeSlot::Morning]);
        let mut logs = MonthlyLogs::new();
        bitmap::set_status(&mut logs, habit.id, created, TimeSlot::Morning, HabitStatus::Done);
        assert_eq!(calculate_habit_streak(&habit, &logs, created), 1);

        let day2 = created.succ_opt().unwrap();
        bitmap::set_status(&mut logs, habit.id, day2, TimeSlot::Morning, HabitStatus::Done);
        assert_eq!(calculate_habit_streak(&habit, &logs, day2), 2);
    }

    #[test]
    fn should_appear_respects_weekday_set() {
        let created = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(); // Thursday
        let mut habit = daily_habit(created, &[TimeSlot::Morning]);
        habit.schedule_history[0].frequency = Frequency::SpecificDaysOfWeek { days: vec![4] }; // Thursday
        assert!(should_habit_appear_on_date(&habit, created));
        let friday = created.succ_opt().unwrap();
        assert!(!should_habit_appear_on_date(&habit, friday));
    }

    #[test]
    fn graduated_habit_stops_appearing() {
        let created = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let mut habit = daily_habit(created, &[TimeSlot::Morning]);
        habit.graduated_on = Some(created.succ_opt().unwrap());
        assert!(should_habit_appear_on_date(&habit, created));
        assert!(!should_habit_appear_on_date(&habit, habit.graduated_on.unwrap()));
    }
}
