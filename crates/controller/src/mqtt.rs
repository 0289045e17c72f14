use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, Weekday};
use tracing::warn;

use crate::schedule::{Recurrence, Schedule, ScheduleId, ScheduleKind, TimeOfDay, WateringMode};
use crate::transport::SessionState;

const DEFAULT_MOISTURE_THRESHOLD: u8 = 60;

// ---------------------------------------------------------------------------
// Inbound: sensor readings
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct ReadingMsg {
    pub(crate) ts: i64,
    pub(crate) moisture_percent: u8,
    #[serde(default)]
    pub(crate) temperature: Option<f32>,
    #[serde(default)]
    pub(crate) humidity: Option<f32>,
}

// ---------------------------------------------------------------------------
// Inbound: schedule list (also the shape of `[[schedules]]` config seeds)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ScheduleMsg {
    #[serde(rename = "_id", alias = "id")]
    pub(crate) id: String,
    #[serde(rename = "type")]
    pub(crate) kind: String,
    pub(crate) time: String,
    #[serde(default)]
    pub(crate) duration: u32,
    #[serde(default)]
    pub(crate) enabled: bool,
    #[serde(default)]
    pub(crate) days: Vec<String>,
    #[serde(default)]
    pub(crate) calendar_days: Vec<i64>,
    #[serde(default)]
    pub(crate) settings: ScheduleSettingsMsg,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct ScheduleSettingsMsg {
    pub(crate) moisture_threshold: u8,
    pub(crate) moisture_mode: String,
}

impl Default for ScheduleSettingsMsg {
    fn default() -> Self {
        Self {
            moisture_threshold: DEFAULT_MOISTURE_THRESHOLD,
            moisture_mode: "manual".to_string(),
        }
    }
}

/// Weekday from a full or three-letter English name, any case.
pub(crate) fn parse_weekday(name: &str) -> Option<Weekday> {
    let name = name.trim().to_ascii_lowercase();
    let day = match name.get(..3)? {
        "mon" => Weekday::Monday,
        "tue" => Weekday::Tuesday,
        "wed" => Weekday::Wednesday,
        "thu" => Weekday::Thursday,
        "fri" => Weekday::Friday,
        "sat" => Weekday::Saturday,
        "sun" => Weekday::Sunday,
        _ => return None,
    };
    // Either the abbreviation itself or the full name.
    (name.len() == 3 || name == day.to_string().to_ascii_lowercase()).then_some(day)
}

impl ScheduleMsg {
    /// Convert to a core schedule. Unknown weekday names and out-of-range
    /// calendar days are discarded; only a bad id, type or time rejects the
    /// whole entry.
    pub(crate) fn to_schedule(&self) -> Result<Schedule, String> {
        if self.id.trim().is_empty() {
            return Err("schedule has no _id".to_string());
        }

        let kind = match self.kind.trim().to_ascii_lowercase().as_str() {
            "watering" => ScheduleKind::Watering {
                moisture_threshold: self.settings.moisture_threshold.min(100),
                mode: if self.settings.moisture_mode.eq_ignore_ascii_case("auto") {
                    WateringMode::Auto
                } else {
                    WateringMode::Manual
                },
            },
            "fertilizing" => ScheduleKind::Fertilizing,
            other => return Err(format!("schedule '{}': unknown type '{other}'", self.id)),
        };

        let time_of_day: TimeOfDay = self
            .time
            .parse()
            .map_err(|e| format!("schedule '{}': {e}", self.id))?;

        let recurrence = if !self.days.is_empty() {
            let mut weekdays = Vec::new();
            for name in &self.days {
                match parse_weekday(name) {
                    Some(d) if !weekdays.contains(&d) => weekdays.push(d),
                    Some(_) => {}
                    None => warn!(schedule = %self.id, day = %name, "unknown weekday ignored"),
                }
            }
            Recurrence::Weekly { weekdays }
        } else if !self.calendar_days.is_empty() {
            let days_of_month: BTreeSet<u8> = self
                .calendar_days
                .iter()
                .filter_map(|d| u8::try_from(*d).ok())
                .filter(|d| (1..=31).contains(d))
                .collect();
            Recurrence::Monthly { days_of_month }
        } else {
            Recurrence::Weekly {
                weekdays: Vec::new(),
            }
        };

        Ok(Schedule {
            id: ScheduleId::new(self.id.trim()),
            kind,
            time_of_day,
            recurrence,
            duration_min: self.duration,
            enabled: self.enabled,
        })
    }
}

impl From<&Schedule> for ScheduleMsg {
    fn from(s: &Schedule) -> Self {
        let (kind, settings) = match s.kind {
            ScheduleKind::Watering {
                moisture_threshold,
                mode,
            } => (
                "watering",
                ScheduleSettingsMsg {
                    moisture_threshold,
                    moisture_mode: match mode {
                        WateringMode::Auto => "auto".to_string(),
                        WateringMode::Manual => "manual".to_string(),
                    },
                },
            ),
            ScheduleKind::Fertilizing => ("fertilizing", ScheduleSettingsMsg::default()),
        };
        let (days, calendar_days) = match &s.recurrence {
            Recurrence::Weekly { weekdays } => {
                (weekdays.iter().map(|d| d.to_string()).collect(), Vec::new())
            }
            Recurrence::Monthly { days_of_month } => {
                (Vec::new(), days_of_month.iter().map(|d| i64::from(*d)).collect())
            }
        };
        Self {
            id: s.id.as_str().to_owned(),
            kind: kind.to_string(),
            time: s.time_of_day.to_string(),
            duration: s.duration_min,
            enabled: s.enabled,
            days,
            calendar_days,
            settings,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScheduleListMsg {
    #[serde(default)]
    schedules: Vec<serde_json::Value>,
}

/// Parse a full replacement schedule list. A malformed envelope is an
/// error; a malformed entry is logged and skipped.
pub(crate) fn parse_schedule_list(payload: &[u8]) -> Result<Vec<Schedule>, serde_json::Error> {
    let list: ScheduleListMsg = serde_json::from_slice(payload)?;
    let mut schedules = Vec::with_capacity(list.schedules.len());
    for value in list.schedules {
        let converted = serde_json::from_value::<ScheduleMsg>(value)
            .map_err(|e| e.to_string())
            .and_then(|msg| msg.to_schedule());
        match converted {
            Ok(s) => schedules.push(s),
            Err(e) => warn!("schedule entry dropped: {e}"),
        }
    }
    Ok(schedules)
}

// ---------------------------------------------------------------------------
// Outbound: telemetry + audit events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub(crate) struct TelemetryMsg {
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) ts: OffsetDateTime,
    pub(crate) moisture_percent: u8,
    pub(crate) moisture_status: &'static str,
    pub(crate) temperature: Option<f32>,
    pub(crate) humidity: Option<f32>,
    pub(crate) water: bool,
    pub(crate) fertilizer: bool,
    pub(crate) transport: SessionState,
    pub(crate) queued_notifications: usize,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct EventMsg {
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) ts: OffsetDateTime,
    pub(crate) category: String,
    pub(crate) action: String,
    pub(crate) detail: String,
}

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

/// Extract probe_id from "tele/<probe_id>/reading".
pub(crate) fn extract_probe_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "reading" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

pub(crate) fn schedules_topic(plant_id: &str) -> String {
    format!("plant/{plant_id}/schedules")
}

pub(crate) fn schedules_request_topic(plant_id: &str) -> String {
    format!("plant/{plant_id}/schedules/get")
}

pub(crate) fn telemetry_topic(plant_id: &str) -> String {
    format!("plant/{plant_id}/telemetry")
}

pub(crate) fn events_topic(plant_id: &str) -> String {
    format!("plant/{plant_id}/events")
}

// ===========================================================================
// Tests
// ===========================================================================
