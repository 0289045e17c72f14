//! Schedule engine: decides which remote schedules fire in the current
//! wall-clock minute.
//!
//! The schedule list is replaced wholesale on every refresh; the only state
//! that survives between ticks is the [`TriggerLedger`]. The ledger is wiped
//! exactly once per observed minute, which gives at-most-one fire per
//! schedule per calendar minute no matter how often the loop ticks.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use time::{Date, Duration, OffsetDateTime, Weekday};
use tracing::debug;

use crate::actuator::Actuator;

// ---------------------------------------------------------------------------
// Schedule types
// ---------------------------------------------------------------------------

/// Opaque schedule identity as handed out by the remote schedule source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScheduleId(String);

impl ScheduleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WateringMode {
    Manual,
    /// Also start watering from the moisture threshold alone, outside the
    /// schedule's time slot.
    Auto,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleKind {
    Watering {
        moisture_threshold: u8,
        mode: WateringMode,
    },
    Fertilizing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recurrence {
    Weekly { weekdays: Vec<Weekday> },
    Monthly { days_of_month: BTreeSet<u8> },
}

impl Recurrence {
    fn matches(&self, now: OffsetDateTime) -> bool {
        match self {
            Self::Weekly { weekdays } => weekdays.contains(&now.weekday()),
            Self::Monthly { days_of_month } => days_of_month.contains(&now.day()),
        }
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Weekly { weekdays } => {
                let names: Vec<String> = weekdays.iter().map(|d| d.to_string()).collect();
                write!(f, "weekly on {}", names.join(", "))
            }
            Self::Monthly { days_of_month } => {
                let days: Vec<String> = days_of_month.iter().map(|d| d.to_string()).collect();
                write!(f, "monthly on day {}", days.join(", "))
            }
        }
    }
}

/// Minute-resolution time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    /// Seconds are dropped: matching is per minute.
    pub fn of(now: OffsetDateTime) -> Self {
        Self {
            hour: now.hour(),
            minute: now.minute(),
        }
    }
}

impl FromStr for TimeOfDay {
    type Err = String;

    /// Accepts `"HH:MM"` (a single-digit hour is tolerated).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("time '{s}' is not HH:MM"))?;
        if m.len() != 2 || h.is_empty() || h.len() > 2 {
            return Err(format!("time '{s}' is not HH:MM"));
        }
        let hour: u8 = h.parse().map_err(|_| format!("bad hour in '{s}'"))?;
        let minute: u8 = m.parse().map_err(|_| format!("bad minute in '{s}'"))?;
        Self::new(hour, minute).ok_or_else(|| format!("time '{s}' out of range"))
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub id: ScheduleId,
    pub kind: ScheduleKind,
    pub time_of_day: TimeOfDay,
    pub recurrence: Recurrence,
    pub duration_min: u32,
    pub enabled: bool,
}

impl Schedule {
    pub fn actuator(&self) -> Actuator {
        match self.kind {
            ScheduleKind::Watering { .. } => Actuator::Water,
            ScheduleKind::Fertilizing => Actuator::Fertilizer,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(i64::from(self.duration_min))
    }

    pub fn moisture_threshold(&self) -> Option<u8> {
        match self.kind {
            ScheduleKind::Watering {
                moisture_threshold, ..
            } => Some(moisture_threshold),
            ScheduleKind::Fertilizing => None,
        }
    }

    pub fn is_auto_watering(&self) -> bool {
        matches!(
            self.kind,
            ScheduleKind::Watering {
                mode: WateringMode::Auto,
                ..
            }
        )
    }
}

/// First enabled schedule driving `actuator`, in list order.
pub fn first_enabled(schedules: &[Schedule], actuator: Actuator) -> Option<&Schedule> {
    schedules
        .iter()
        .find(|s| s.enabled && s.actuator() == actuator)
}

pub fn find<'a>(schedules: &'a [Schedule], id: &ScheduleId) -> Option<&'a Schedule> {
    schedules.iter().find(|s| &s.id == id)
}

// ---------------------------------------------------------------------------
// Trigger ledger
// ---------------------------------------------------------------------------

type MinuteStamp = (Date, u8, u8);

fn minute_of(now: OffsetDateTime) -> MinuteStamp {
    (now.date(), now.hour(), now.minute())
}

/// Which schedules already fired during the current wall-clock minute.
#[derive(Debug, Default)]
pub struct TriggerLedger {
    minute: Option<MinuteStamp>,
    fired: HashSet<ScheduleId>,
}

impl TriggerLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_fired(&self, id: &ScheduleId) -> bool {
        self.fired.contains(id)
    }

    /// Forget everything if `now` is in a different minute than last seen.
    fn roll(&mut self, now: OffsetDateTime) {
        let stamp = minute_of(now);
        if self.minute != Some(stamp) {
            self.fired.clear();
            self.minute = Some(stamp);
        }
    }

    fn mark(&mut self, id: &ScheduleId) {
        self.fired.insert(id.clone());
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FireEvent {
    pub schedule_id: ScheduleId,
    pub kind: Actuator,
}

/// Decide which schedules fire at `now`.
///
/// A schedule is marked in the ledger as soon as it matches, whether or not
/// the caller ends up acting on the fire event.
pub fn evaluate(
    now: OffsetDateTime,
    schedules: &[Schedule],
    ledger: &mut TriggerLedger,
) -> Vec<FireEvent> {
    ledger.roll(now);
    let time_of_day = TimeOfDay::of(now);

    let mut fired = Vec::new();
    for schedule in schedules {
        if !schedule.enabled
            || schedule.time_of_day != time_of_day
            || ledger.has_fired(&schedule.id)
        {
            continue;
        }
        if !schedule.recurrence.matches(now) {
            continue;
        }

        ledger.mark(&schedule.id);
        debug!(
            schedule = %schedule.id,
            at = %time_of_day,
            recurrence = %schedule.recurrence,
            "schedule fired"
        );
        fired.push(FireEvent {
            schedule_id: schedule.id.clone(),
            kind: schedule.actuator(),
        });
    }
    fired
}

// ===========================================================================
// Tests
// ===========================================================================
