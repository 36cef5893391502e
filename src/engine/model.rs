use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::NaiveDate;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type HabitId = Uuid;

/// One of the three fixed time-of-day slots. The day is never divided by
/// clock hours, only by these three buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSlot {
    Morning,
    Afternoon,
    Evening,
}

impl TimeSlot {
    pub const ALL: [TimeSlot; 3] = [TimeSlot::Morning, TimeSlot::Afternoon, TimeSlot::Evening];

    /// Bit-pair index within a day's 6-bit group (0, 1, 2).
    pub fn slot_index(self) -> u32 {
        match self {
            TimeSlot::Morning => 0,
            TimeSlot::Afternoon => 1,
            TimeSlot::Evening => 2,
        }
    }
}

/// The four mutually-exclusive per-slot statuses, packed as 2 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HabitStatus {
    Null = 0,
    Done = 1,
    Deferred = 2,
    DonePlus = 3,
}

impl HabitStatus {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => HabitStatus::Null,
            1 => HabitStatus::Done,
            2 => HabitStatus::Deferred,
            _ => HabitStatus::DonePlus,
        }
    }

    pub fn to_bits(self) -> u8 {
        self as u8
    }

    pub fn is_completed(self) -> bool {
        matches!(self, HabitStatus::Done | HabitStatus::DonePlus)
    }
}

/// A habit's completion goal: either a simple check-off or a numeric target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Goal {
    Check,
    Numeric { total: f64 },
}

/// How often a habit is expected to appear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    SpecificDaysOfWeek {
        /// ISO weekday numbers, 0 = Sunday through 6 = Saturday.
        days: Vec<u8>,
    },
    Interval {
        period: u32,
    },
}

/// The properties that govern a habit during `[start_date, end_date)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HabitSchedule {
    pub start_date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub end_date: Option<NaiveDate>,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub color: Option<String>,
    pub goal: Goal,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub philosophy: Option<String>,
    pub frequency: Frequency,
    pub times: BTreeSet<TimeSlot>,
    /// ISO date defining interval phase for `Frequency::Interval`.
    pub schedule_anchor: NaiveDate,
}

impl HabitSchedule {
    pub fn covers(&self, date: NaiveDate) -> bool {
        date >= self.start_date && self.end_date.is_none_or(|end| date < end)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HabitInstanceData {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub goal_override: Option<f64>,
}

/// Manual overrides for a single (date, habit) pair. Completion status is
/// never stored here; it lives in the bitmap log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HabitDayData {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub daily_schedule: Option<BTreeSet<TimeSlot>>,
    #[serde(default)]
    pub instances: BTreeMap<TimeSlot, HabitInstanceData>,
}

impl HabitDayData {
    pub fn is_empty(&self) -> bool {
        self.daily_schedule.is_none() && self.instances.values().all(|i| i.note.is_none() && i.goal_override.is_none())
    }
}

/// A single habit: identity plus an ordered, non-overlapping schedule history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Habit {
    pub id: HabitId,
    pub created_on: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub graduated_on: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deleted_on: Option<NaiveDate>,
    /// Sorted ascending by `start_date`; half-open, contiguous intervals.
    pub schedule_history: Vec<HabitSchedule>,
}

impl Habit {
    pub fn is_deleted(&self) -> bool {
        self.deleted_on.is_some()
    }

    /// Dev-time invariant check: schedule history is non-empty, sorted, and
    /// every entry's `end_date` (if set) equals the next entry's `start_date`.
    pub fn schedule_history_is_well_formed(&self) -> bool {
        if self.schedule_history.is_empty() {
            return false;
        }
        self.schedule_history.windows(2).all(|pair| {
            let (a, b) = (&pair[0], &pair[1]);
            a.start_date <= b.start_date && a.end_date == Some(b.start_date)
        })
    }
}

/// Builds the dailyData map key `"{habitId}_{date}"` used throughout the
/// persisted representation.
pub fn daily_data_key(habit_id: HabitId, date: NaiveDate) -> String {
    format!("{habit_id}_{date}")
}

pub fn parse_daily_data_key(key: &str) -> Option<(HabitId, NaiveDate)> {
    let (id_part, date_part) = key.rsplit_once('_')?;
    let habit_id = Uuid::parse_str(id_part).ok()?;
    let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
    Some((habit_id, date))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyDiagnosis {
    pub level: String,
    pub themes: Vec<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncLogKind {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub message: String,
    pub kind: SyncLogKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub icon: Option<String>,
    pub timestamp: i64,
}

pub const SYNC_LOG_RING_CAPACITY: usize = 100;

/// The aggregate root. `monthly_logs` is intentionally excluded from this
/// struct's serde impl (split-store invariant: the JSON record never
/// contains it) — see `crate::persistence::store` for how the two halves
/// are reassembled.
#[derive(Debug, Clone)]
pub struct AppState {
    pub version: u32,
    pub habits: Vec<Habit>,
    /// Keyed by `daily_data_key(habit_id, date)`.
    pub daily_data: BTreeMap<String, HabitDayData>,
    /// Year -> gzip-compressed blob of archived day-records.
    pub archives: BTreeMap<i32, Vec<u8>>,
    /// Keyed by `"{habitId}_{YYYY-MM}"`.
    pub monthly_logs: BTreeMap<String, BigUint>,
    pub daily_diagnoses: BTreeMap<NaiveDate, DailyDiagnosis>,
    /// Set semantics; keys look like `"{habitId}-{streak}"`.
    pub notifications_shown: BTreeSet<String>,
    pub pending_21_day_habit_ids: VecDeque<HabitId>,
    pub pending_consolidation_habit_ids: VecDeque<HabitId>,
    pub sync_logs: VecDeque<SyncLogEntry>,
    pub has_onboarded: bool,
    pub last_modified: i64,
}

impl AppState {
    pub fn empty(now_ms: i64) -> Self {
        Self {
            version: CURRENT_STATE_VERSION,
            habits: Vec::new(),
            daily_data: BTreeMap::new(),
            archives: BTreeMap::new(),
            monthly_logs: BTreeMap::new(),
            daily_diagnoses: BTreeMap::new(),
            notifications_shown: BTreeSet::new(),
            pending_21_day_habit_ids: VecDeque::new(),
            pending_consolidation_habit_ids: VecDeque::new(),
            sync_logs: VecDeque::new(),
            has_onboarded: false,
            last_modified: now_ms,
        }
    }

    pub fn habit(&self, id: HabitId) -> Option<&Habit> {
        self.habits.iter().find(|h| h.id == id)
    }

    pub fn habit_mut(&mut self, id: HabitId) -> Option<&mut Habit> {
        self.habits.iter_mut().find(|h| h.id == id)
    }

    /// Bumps `last_modified` per spec.md §4.3: strictly monotonic, either
    /// wall-clock-or-later once sync has completed once, or a plain +1
    /// counter while still booting (to keep sync decisions deterministic).
    pub fn bump_last_modified(&mut self, now_ms: i64, initial_sync_done: bool) {
        self.last_modified = if initial_sync_done {
            now_ms.max(self.last_modified + 1)
        } else {
            self.last_modified + 1
        };
    }

    pub fn push_sync_log(&mut self, message: impl Into<String>, kind: SyncLogKind, icon: Option<String>, now_ms: i64) {
        if self.sync_logs.len() >= SYNC_LOG_RING_CAPACITY {
            self.sync_logs.pop_front();
        }
        self.sync_logs.push_back(SyncLogEntry {
            message: message.into(),
            kind,
            icon,
            timestamp: now_ms,
        });
    }
}

pub const CURRENT_STATE_VERSION: u32 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(start: &str, end: Option<&str>) -> HabitSchedule {
        HabitSchedule {
            start_date: NaiveDate::parse_from_str(start, "%Y-%m-%d").unwrap(),
            end_date: end.map(|e| NaiveDate::parse_from_str(e, "%Y-%m-%d").unwrap()),
            display_name: "Run".to_string(),
            icon: None,
            color: None,
            goal: Goal::Check,
            philosophy: None,
            frequency: Frequency::Daily,
            times: BTreeSet::from([TimeSlot::Morning]),
            schedule_anchor: NaiveDate::parse_from_str(start, "%Y-%m-%d").unwrap(),
        }
    }

    #[test]
    fn daily_data_key_round_trips() {
        let id = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2026, 3, 15).unwrap();
        let key = daily_data_key(id, date);
        assert_eq!(parse_daily_data_key(&key), Some((id, date)));
    }

    #[test]
    fn well_formed_schedule_history_requires_contiguity() {
        let habit = Habit {
            id: Uuid::new_v4(),
            created_on: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            graduated_on: None,
            deleted_on: None,
            schedule_history: vec![
                schedule("2026-01-01", Some("2026-02-15")),
                schedule("2026-02-15", None),
            ],
        };
        assert!(habit.schedule_history_is_well_formed());
    }

    #[test]
    fn gap_between_intervals_is_not_well_formed() {
        let habit = Habit {
            id: Uuid::new_v4(),
            created_on: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            graduated_on: None,
            deleted_on: None,
            schedule_history: vec![
                schedule("2026-01-01", Some("2026-02-10")),
                schedule("2026-02-15", None),
            ],
        };
        assert!(!habit.schedule_history_is_well_formed());
    }

    #[test]
    fn bump_last_modified_is_strictly_increasing_pre_sync() {
        let mut state = AppState::empty(1000);
        state.bump_last_modified(1000, false);
        assert_eq!(state.last_modified, 1001);
        state.bump_last_modified(1000, false);
        assert_eq!(state.last_modified, 1002);
    }

    #[test]
    fn bump_last_modified_uses_wall_clock_post_sync() {
        let mut state = AppState::empty(1000);
        state.bump_last_modified(5000, true);
        assert_eq!(state.last_modified, 5000);
        state.bump_last_modified(100, true);
        assert_eq!(state.last_modified, 5001);
    }
}
