//! Pump state machines for the water and fertilizer actuators.
//!
//! ## Per-actuator state machine
//!
//! ```text
//! Idle ──[schedule fire passes gating | auto-mode threshold]──▶ Running
//!  ▲                                                               │
//!  └──[disconnected | target reached | duration completed]─────────┘
//! ```
//!
//! The two pumps are independent and open-loop: nothing here interlocks
//! them or observes whether a relay really switched. Moisture follows the
//! sensor convention 0 = saturated, higher = drier.

use std::fmt;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::notify::NotificationQueue;
use crate::schedule::{self, FireEvent, Schedule, ScheduleId};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Actuator {
    Water,
    Fertilizer,
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Water => write!(f, "water"),
            Self::Fertilizer => write!(f, "fertilizer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActuatorState {
    Idle,
    /// `source` is the schedule whose settings control this run.
    Running {
        started_at: OffsetDateTime,
        source: ScheduleId,
    },
}

impl ActuatorState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn started_at(&self) -> Option<OffsetDateTime> {
        match self {
            Self::Running { started_at, .. } => Some(*started_at),
            Self::Idle => None,
        }
    }
}

/// Safety limits and fallbacks shared by both pumps.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Readings at or above this are a disconnected / out-of-soil sensor.
    pub disconnect_ceiling: u8,
    /// Stop threshold when no enabled watering schedule exists.
    pub default_threshold: u8,
    pub fallback_water: Duration,
    pub fallback_fertilizer: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartReason {
    Scheduled {
        schedule_id: ScheduleId,
        /// Resolved run length, fallback included.
        run_for: Duration,
        /// Reading at fire time (watering only).
        moisture: Option<u8>,
    },
    AutoThreshold {
        schedule_id: ScheduleId,
        moisture: u8,
        threshold: u8,
    },
}

impl fmt::Display for StartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled {
                run_for,
                moisture: Some(m),
                ..
            } => write!(f, "Scheduled for {} (moisture {m}%)", RunLength(*run_for)),
            Self::Scheduled { run_for, .. } => {
                write!(f, "Scheduled for {}", RunLength(*run_for))
            }
            Self::AutoThreshold {
                moisture,
                threshold,
                ..
            } => write!(f, "Moisture: {moisture}% (Threshold: {threshold}%)"),
        }
    }
}

/// Whole minutes when the length divides evenly, seconds otherwise.
struct RunLength(Duration);

impl fmt::Display for RunLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.whole_seconds();
        if secs % 60 == 0 {
            write!(f, "{} minutes", secs / 60)
        } else {
            write!(f, "{secs} seconds")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    SensorDisconnected,
    TargetReached,
    DurationCompleted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SensorDisconnected => write!(f, "Sensor disconnected or out of soil"),
            Self::TargetReached => write!(f, "Target moisture reached"),
            Self::DurationCompleted => write!(f, "Duration completed"),
        }
    }
}

/// A state change (or a deliberate non-change) worth reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpEvent {
    Started {
        actuator: Actuator,
        reason: StartReason,
    },
    Stopped {
        actuator: Actuator,
        reason: StopReason,
        moisture: u8,
        elapsed: Duration,
    },
    /// A watering schedule fired but the soil reading vetoed it.
    WateringSkipped {
        schedule_id: ScheduleId,
        moisture: u8,
        threshold: u8,
        disconnected: bool,
    },
}

impl PumpEvent {
    /// Human-facing notification text.
    pub fn message(&self) -> String {
        match self {
            Self::Started {
                actuator: Actuator::Water,
                reason,
            } => format!("Started watering. {reason}"),
            Self::Started {
                actuator: Actuator::Fertilizer,
                reason,
            } => format!("Started fertilizing. {reason}"),
            Self::Stopped {
                actuator: Actuator::Water,
                reason,
                moisture,
                elapsed,
            } => format!(
                "Watering stopped. {reason}. Final moisture {moisture}%, ran {}s",
                elapsed.whole_seconds()
            ),
            Self::Stopped {
                actuator: Actuator::Fertilizer,
                reason,
                ..
            } => format!("Fertilizer cycle completed. {reason}"),
            Self::WateringSkipped {
                moisture,
                disconnected: true,
                ..
            } => format!("Scheduled watering skipped. Sensor disconnected ({moisture}%)"),
            Self::WateringSkipped {
                moisture,
                threshold,
                ..
            } => format!(
                "Scheduled watering skipped. Soil already moist: {moisture}% (Threshold: {threshold}%)"
            ),
        }
    }
}

/// Settings in force for a run, resolved from the current schedule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RunPlan {
    threshold: u8,
    duration: Duration,
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Pumps {
    water: ActuatorState,
    fertilizer: ActuatorState,
    limits: Limits,
}

impl Pumps {
    /// Both pumps start idle.
    pub fn new(limits: Limits) -> Self {
        Self {
            water: ActuatorState::Idle,
            fertilizer: ActuatorState::Idle,
            limits,
        }
    }

    pub fn state(&self, actuator: Actuator) -> &ActuatorState {
        match actuator {
            Actuator::Water => &self.water,
            Actuator::Fertilizer => &self.fertilizer,
        }
    }

    pub fn is_running(&self, actuator: Actuator) -> bool {
        self.state(actuator).is_running()
    }

    fn state_mut(&mut self, actuator: Actuator) -> &mut ActuatorState {
        match actuator {
            Actuator::Water => &mut self.water,
            Actuator::Fertilizer => &mut self.fertilizer,
        }
    }

    /// Per-tick evaluation: stop conditions for running pumps, and the
    /// auto-mode watering rule for an idle water pump.
    pub fn update(
        &mut self,
        now: OffsetDateTime,
        moisture: u8,
        schedules: &[Schedule],
        queue: &mut NotificationQueue,
    ) -> Vec<PumpEvent> {
        let mut events = Vec::new();

        match self.water.clone() {
            ActuatorState::Running { started_at, source } => {
                let plan = self.plan(Actuator::Water, &source, schedules);
                let elapsed = now - started_at;
                if let Some(reason) = self.water_stop_reason(moisture, elapsed, plan) {
                    events.push(self.stop(Actuator::Water, reason, moisture, elapsed, now, queue));
                }
            }
            ActuatorState::Idle => {
                if let Some(s) = self.auto_candidate(moisture, schedules) {
                    let reason = StartReason::AutoThreshold {
                        schedule_id: s.id.clone(),
                        moisture,
                        threshold: s.moisture_threshold().unwrap_or(self.limits.default_threshold),
                    };
                    let source = s.id.clone();
                    events.push(self.start(Actuator::Water, source, reason, now, queue));
                }
            }
        }

        if let ActuatorState::Running { started_at, source } = self.fertilizer.clone() {
            let plan = self.plan(Actuator::Fertilizer, &source, schedules);
            let elapsed = now - started_at;
            if elapsed >= plan.duration {
                events.push(self.stop(
                    Actuator::Fertilizer,
                    StopReason::DurationCompleted,
                    moisture,
                    elapsed,
                    now,
                    queue,
                ));
            }
        }

        events
    }

    /// Apply the start policy for a schedule fire event.
    pub fn on_fire(
        &mut self,
        fire: &FireEvent,
        now: OffsetDateTime,
        moisture: u8,
        schedules: &[Schedule],
        queue: &mut NotificationQueue,
    ) -> Option<PumpEvent> {
        if self.is_running(fire.kind) {
            debug!(actuator = %fire.kind, schedule = %fire.schedule_id, "already running, fire ignored");
            return None;
        }

        let schedule = schedule::find(schedules, &fire.schedule_id);
        let run_for = self.plan(fire.kind, &fire.schedule_id, schedules).duration;

        let reason = match fire.kind {
            Actuator::Water => {
                let threshold = schedule
                    .and_then(Schedule::moisture_threshold)
                    .unwrap_or(self.limits.default_threshold);
                let disconnected = moisture >= self.limits.disconnect_ceiling;
                if disconnected || moisture <= threshold {
                    let event = PumpEvent::WateringSkipped {
                        schedule_id: fire.schedule_id.clone(),
                        moisture,
                        threshold,
                        disconnected,
                    };
                    info!(
                        schedule = %fire.schedule_id,
                        moisture,
                        threshold,
                        disconnected,
                        "scheduled watering skipped"
                    );
                    queue.enqueue(now, event.message());
                    return Some(event);
                }
                StartReason::Scheduled {
                    schedule_id: fire.schedule_id.clone(),
                    run_for,
                    moisture: Some(moisture),
                }
            }
            Actuator::Fertilizer => StartReason::Scheduled {
                schedule_id: fire.schedule_id.clone(),
                run_for,
                moisture: None,
            },
        };

        Some(self.start(fire.kind, fire.schedule_id.clone(), reason, now, queue))
    }

    // -- Transitions ----------------------------------------------------

    fn start(
        &mut self,
        actuator: Actuator,
        source: ScheduleId,
        reason: StartReason,
        now: OffsetDateTime,
        queue: &mut NotificationQueue,
    ) -> PumpEvent {
        info!(%actuator, schedule = %source, %reason, "pump started");
        *self.state_mut(actuator) = ActuatorState::Running {
            started_at: now,
            source,
        };
        let event = PumpEvent::Started { actuator, reason };
        queue.enqueue(now, event.message());
        event
    }

    fn stop(
        &mut self,
        actuator: Actuator,
        reason: StopReason,
        moisture: u8,
        elapsed: Duration,
        now: OffsetDateTime,
        queue: &mut NotificationQueue,
    ) -> PumpEvent {
        info!(
            %actuator,
            %reason,
            moisture,
            elapsed_sec = elapsed.whole_seconds(),
            "pump stopped"
        );
        *self.state_mut(actuator) = ActuatorState::Idle;
        let event = PumpEvent::Stopped {
            actuator,
            reason,
            moisture,
            elapsed,
        };
        queue.enqueue(now, event.message());
        event
    }

    // -- Rules ----------------------------------------------------------

    /// First matching reason wins: disconnected, then target, then duration.
    fn water_stop_reason(&self, moisture: u8, elapsed: Duration, plan: RunPlan) -> Option<StopReason> {
        if moisture >= self.limits.disconnect_ceiling {
            Some(StopReason::SensorDisconnected)
        } else if moisture <= plan.threshold {
            Some(StopReason::TargetReached)
        } else if elapsed >= plan.duration {
            Some(StopReason::DurationCompleted)
        } else {
            None
        }
    }

    /// First enabled auto-mode watering schedule whose threshold is exceeded
    /// by a plausible reading.
    fn auto_candidate<'a>(&self, moisture: u8, schedules: &'a [Schedule]) -> Option<&'a Schedule> {
        if moisture >= self.limits.disconnect_ceiling {
            return None;
        }
        schedules.iter().find(|s| {
            s.enabled
                && s.is_auto_watering()
                && s.moisture_threshold().is_some_and(|t| moisture > t)
        })
    }

    /// Controlling settings: the schedule that started the run while it is
    /// still listed and enabled, else the first enabled schedule of the same
    /// kind, else the configured fallbacks. A zero duration falls back too.
    fn plan(&self, actuator: Actuator, source: &ScheduleId, schedules: &[Schedule]) -> RunPlan {
        let fallback = match actuator {
            Actuator::Water => self.limits.fallback_water,
            Actuator::Fertilizer => self.limits.fallback_fertilizer,
        };
        let controlling = schedules
            .iter()
            .find(|s| s.enabled && &s.id == source && s.actuator() == actuator)
            .or_else(|| schedule::first_enabled(schedules, actuator));

        match controlling {
            Some(s) => RunPlan {
                threshold: s.moisture_threshold().unwrap_or(self.limits.default_threshold),
                duration: if s.duration_min == 0 {
                    fallback
                } else {
                    s.duration()
                },
            },
            None => RunPlan {
                threshold: self.limits.default_threshold,
                duration: fallback,
            },
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RetryPolicy;
    use crate::schedule::{Recurrence, ScheduleKind, TimeOfDay, WateringMode};
    use time::macros::datetime;
    use time::Weekday;

    const T0: OffsetDateTime = datetime!(2024-01-01 08:00:00 UTC);

    fn limits() -> Limits {
        Limits {
            disconnect_ceiling: 95,
            default_threshold: 60,
            fallback_water: Duration::seconds(30),
            fallback_fertilizer: Duration::seconds(50),
        }
    }

    fn queue() -> NotificationQueue {
        NotificationQueue::new(
            RetryPolicy {
                max_attempts: 3,
                retry_interval: Duration::seconds(10),
            },
            "",
        )
    }

    fn watering(id: &str, threshold: u8, mode: WateringMode) -> Schedule {
        Schedule {
            id: ScheduleId::new(id),
            kind: ScheduleKind::Watering {
                moisture_threshold: threshold,
                mode,
            },
            time_of_day: TimeOfDay::new(8, 0).unwrap(),
            recurrence: Recurrence::Weekly {
                weekdays: vec![Weekday::Monday],
            },
            duration_min: 10,
            enabled: true,
        }
    }

    fn fertilizing(id: &str, duration_min: u32) -> Schedule {
        Schedule {
            id: ScheduleId::new(id),
            kind: ScheduleKind::Fertilizing,
            time_of_day: TimeOfDay::new(8, 0).unwrap(),
            recurrence: Recurrence::Monthly {
                days_of_month: [1].into_iter().collect(),
            },
            duration_min,
            enabled: true,
        }
    }

    fn fire(id: &str, kind: Actuator) -> FireEvent {
        FireEvent {
            schedule_id: ScheduleId::new(id),
            kind,
        }
    }

    fn at(secs: i64) -> OffsetDateTime {
        T0 + Duration::seconds(secs)
    }

    /// Start watering from a fire of "w1" at T0 with a wet-enough reading.
    fn running_water(schedules: &[Schedule], q: &mut NotificationQueue) -> Pumps {
        let mut pumps = Pumps::new(limits());
        let ev = pumps.on_fire(&fire("w1", Actuator::Water), T0, 80, schedules, q);
        assert!(matches!(ev, Some(PumpEvent::Started { .. })));
        pumps
    }

    // -- Schedule-triggered starts --------------------------------------

    #[test]
    fn scheduled_watering_starts_when_soil_dry() {
        let schedules = vec![watering("w1", 60, WateringMode::Manual)];
        let mut q = queue();
        let mut pumps = Pumps::new(limits());

        let ev = pumps
            .on_fire(&fire("w1", Actuator::Water), T0, 80, &schedules, &mut q)
            .unwrap();

        assert!(pumps.is_running(Actuator::Water));
        assert_eq!(pumps.state(Actuator::Water).started_at(), Some(T0));
        assert!(matches!(ev, PumpEvent::Started { actuator: Actuator::Water, .. }));
        assert_eq!(q.len(), 1);
        let text = &q.head().unwrap().text;
        assert!(text.contains("Started watering"), "{text}");
        assert!(text.contains("80"), "{text}");
    }

    #[test]
    fn scheduled_watering_skipped_when_soil_moist() {
        let schedules = vec![watering("w1", 60, WateringMode::Manual)];
        let mut q = queue();
        let mut pumps = Pumps::new(limits());

        let ev = pumps
            .on_fire(&fire("w1", Actuator::Water), T0, 50, &schedules, &mut q)
            .unwrap();

        assert!(!pumps.is_running(Actuator::Water));
        assert!(matches!(
            ev,
            PumpEvent::WateringSkipped { moisture: 50, threshold: 60, disconnected: false, .. }
        ));
        let text = &q.head().unwrap().text;
        assert!(text.contains("skipped"), "{text}");
        assert!(text.contains("50"), "{text}");
    }

    #[test]
    fn scheduled_watering_skipped_at_threshold_exactly() {
        let schedules = vec![watering("w1", 60, WateringMode::Manual)];
        let mut q = queue();
        let mut pumps = Pumps::new(limits());
        pumps.on_fire(&fire("w1", Actuator::Water), T0, 60, &schedules, &mut q);
        assert!(!pumps.is_running(Actuator::Water));
    }

    #[test]
    fn scheduled_watering_skipped_when_sensor_disconnected() {
        let schedules = vec![watering("w1", 60, WateringMode::Manual)];
        let mut q = queue();
        let mut pumps = Pumps::new(limits());

        let ev = pumps
            .on_fire(&fire("w1", Actuator::Water), T0, 95, &schedules, &mut q)
            .unwrap();

        assert!(!pumps.is_running(Actuator::Water));
        assert!(matches!(ev, PumpEvent::WateringSkipped { disconnected: true, .. }));
        assert!(q.head().unwrap().text.contains("Sensor disconnected"));
    }

    #[test]
    fn fertilizing_starts_regardless_of_moisture() {
        let schedules = vec![fertilizing("f1", 5)];
        let mut q = queue();
        let mut pumps = Pumps::new(limits());

        let ev = pumps.on_fire(&fire("f1", Actuator::Fertilizer), T0, 99, &schedules, &mut q);

        assert!(matches!(ev, Some(PumpEvent::Started { actuator: Actuator::Fertilizer, .. })));
        assert!(pumps.is_running(Actuator::Fertilizer));
        assert!(q.head().unwrap().text.contains("Started fertilizing"));
    }

    #[test]
    fn fire_while_running_is_ignored() {
        let schedules = vec![fertilizing("f1", 5)];
        let mut q = queue();
        let mut pumps = Pumps::new(limits());
        pumps.on_fire(&fire("f1", Actuator::Fertilizer), T0, 50, &schedules, &mut q);

        let ev = pumps.on_fire(&fire("f1", Actuator::Fertilizer), at(60), 50, &schedules, &mut q);
        assert_eq!(ev, None);
        assert_eq!(q.len(), 1);
        assert_eq!(pumps.state(Actuator::Fertilizer).started_at(), Some(T0));
    }

    #[test]
    fn pumps_are_independent() {
        let schedules = vec![watering("w1", 60, WateringMode::Manual), fertilizing("f1", 5)];
        let mut q = queue();
        let mut pumps = running_water(&schedules, &mut q);
        pumps.on_fire(&fire("f1", Actuator::Fertilizer), T0, 80, &schedules, &mut q);
        assert!(pumps.is_running(Actuator::Water));
        assert!(pumps.is_running(Actuator::Fertilizer));
    }

    // -- Watering stop rules --------------------------------------------

    #[test]
    fn watering_keeps_running_within_limits() {
        let schedules = vec![watering("w1", 60, WateringMode::Manual)];
        let mut q = queue();
        let mut pumps = running_water(&schedules, &mut q);

        let events = pumps.update(at(60), 75, &schedules, &mut q);
        assert!(events.is_empty());
        assert!(pumps.is_running(Actuator::Water));
    }

    #[test]
    fn watering_stops_when_target_reached() {
        let schedules = vec![watering("w1", 60, WateringMode::Manual)];
        let mut q = queue();
        let mut pumps = running_water(&schedules, &mut q);

        let events = pumps.update(at(90), 58, &schedules, &mut q);
        assert_eq!(
            events,
            vec![PumpEvent::Stopped {
                actuator: Actuator::Water,
                reason: StopReason::TargetReached,
                moisture: 58,
                elapsed: Duration::seconds(90),
            }]
        );
        assert!(!pumps.is_running(Actuator::Water));
        let last = q.iter().last().unwrap();
        assert!(last.text.contains("Target moisture reached"), "{}", last.text);
    }

    #[test]
    fn watering_stops_after_schedule_duration() {
        let schedules = vec![watering("w1", 60, WateringMode::Manual)];
        let mut q = queue();
        let mut pumps = running_water(&schedules, &mut q);

        assert!(pumps.update(at(599), 80, &schedules, &mut q).is_empty());
        let events = pumps.update(at(600), 80, &schedules, &mut q);
        assert!(matches!(
            events.as_slice(),
            [PumpEvent::Stopped { reason: StopReason::DurationCompleted, .. }]
        ));
    }

    #[test]
    fn disconnected_wins_over_duration() {
        let schedules = vec![watering("w1", 60, WateringMode::Manual)];
        let mut q = queue();
        let mut pumps = running_water(&schedules, &mut q);

        // Past duration and past the threshold, but the sensor reads 96%.
        let events = pumps.update(at(3600), 96, &schedules, &mut q);
        assert!(matches!(
            events.as_slice(),
            [PumpEvent::Stopped { reason: StopReason::SensorDisconnected, moisture: 96, .. }]
        ));
    }

    #[test]
    fn target_wins_over_duration() {
        let schedules = vec![watering("w1", 60, WateringMode::Manual)];
        let mut q = queue();
        let mut pumps = running_water(&schedules, &mut q);

        let events = pumps.update(at(3600), 40, &schedules, &mut q);
        assert!(matches!(
            events.as_slice(),
            [PumpEvent::Stopped { reason: StopReason::TargetReached, .. }]
        ));
    }

    #[test]
    fn stop_notification_carries_reading_and_runtime() {
        let schedules = vec![watering("w1", 60, WateringMode::Manual)];
        let mut q = queue();
        let mut pumps = running_water(&schedules, &mut q);
        pumps.update(at(600), 80, &schedules, &mut q);

        let texts: Vec<&str> = q.iter().map(|n| n.text.as_str()).collect();
        assert_eq!(texts.len(), 2);
        let text = texts[1];
        assert!(text.starts_with("Watering stopped"), "{text}");
        assert!(text.contains("Duration completed"), "{text}");
        assert!(text.contains("80%"), "{text}");
        assert!(text.contains("600s"), "{text}");
    }

    #[test]
    fn watering_falls_back_when_schedule_removed() {
        let schedules = vec![watering("w1", 60, WateringMode::Manual)];
        let mut q = queue();
        let mut pumps = running_water(&schedules, &mut q);

        // Refreshed list no longer has any watering schedule: 30s fallback.
        let refreshed: Vec<Schedule> = Vec::new();
        assert!(pumps.update(at(29), 80, &refreshed, &mut q).is_empty());
        let events = pumps.update(at(30), 80, &refreshed, &mut q);
        assert!(matches!(
            events.as_slice(),
            [PumpEvent::Stopped { reason: StopReason::DurationCompleted, .. }]
        ));
    }

    #[test]
    fn refreshed_duration_takes_effect() {
        let schedules = vec![watering("w1", 60, WateringMode::Manual)];
        let mut q = queue();
        let mut pumps = running_water(&schedules, &mut q);

        let shorter = vec![Schedule {
            duration_min: 1,
            ..watering("w1", 60, WateringMode::Manual)
        }];
        let events = pumps.update(at(60), 80, &shorter, &mut q);
        assert_eq!(events.len(), 1);
    }

    // -- Fertilizer stop rule -------------------------------------------

    #[test]
    fn fertilizer_stops_only_on_duration() {
        let schedules = vec![fertilizing("f1", 5)];
        let mut q = queue();
        let mut pumps = Pumps::new(limits());
        pumps.on_fire(&fire("f1", Actuator::Fertilizer), T0, 50, &schedules, &mut q);

        // Moisture extremes do not matter to the fertilizer pump.
        assert!(pumps.update(at(120), 99, &schedules, &mut q).is_empty());
        assert!(pumps.update(at(240), 0, &schedules, &mut q).is_empty());

        let events = pumps.update(at(300), 50, &schedules, &mut q);
        assert!(matches!(
            events.as_slice(),
            [PumpEvent::Stopped {
                actuator: Actuator::Fertilizer,
                reason: StopReason::DurationCompleted,
                ..
            }]
        ));
        assert!(q.len() >= 2);
    }

    #[test]
    fn zero_duration_fertilizer_uses_fallback() {
        let schedules = vec![fertilizing("f1", 0)];
        let mut q = queue();
        let mut pumps = Pumps::new(limits());
        pumps.on_fire(&fire("f1", Actuator::Fertilizer), T0, 50, &schedules, &mut q);

        assert!(pumps.update(at(49), 50, &schedules, &mut q).is_empty());
        assert_eq!(pumps.update(at(50), 50, &schedules, &mut q).len(), 1);
    }

    #[test]
    fn zero_duration_start_announces_fallback_length() {
        let mut q = queue();
        let mut pumps = Pumps::new(limits());
        let ev = pumps
            .on_fire(&fire("f1", Actuator::Fertilizer), T0, 50, &[fertilizing("f1", 0)], &mut q)
            .unwrap();

        assert!(matches!(
            ev,
            PumpEvent::Started {
                reason: StartReason::Scheduled { run_for, .. },
                ..
            } if run_for == Duration::seconds(50)
        ));
        let text = &q.head().unwrap().text;
        assert!(text.contains("Scheduled for 50 seconds"), "{text}");
        assert!(!text.contains("0 minutes"), "{text}");
    }

    #[test]
    fn scheduled_start_announces_minutes() {
        let mut q = queue();
        running_water(&[watering("w1", 60, WateringMode::Manual)], &mut q);
        let text = &q.head().unwrap().text;
        assert!(text.contains("Scheduled for 10 minutes (moisture 80%)"), "{text}");
    }

    // -- Auto mode -------------------------------------------------------

    #[test]
    fn auto_mode_starts_watering_above_threshold() {
        let schedules = vec![watering("auto", 60, WateringMode::Auto)];
        let mut q = queue();
        let mut pumps = Pumps::new(limits());

        let events = pumps.update(T0, 70, &schedules, &mut q);
        assert!(matches!(
            events.as_slice(),
            [PumpEvent::Started {
                actuator: Actuator::Water,
                reason: StartReason::AutoThreshold { moisture: 70, threshold: 60, .. },
            }]
        ));
        let text = &q.head().unwrap().text;
        assert!(text.contains("Moisture: 70%"), "{text}");
        assert!(text.contains("Threshold: 60%"), "{text}");
    }

    #[test]
    fn auto_mode_ignores_wet_and_disconnected_readings() {
        let schedules = vec![watering("auto", 60, WateringMode::Auto)];
        let mut q = queue();
        let mut pumps = Pumps::new(limits());

        assert!(pumps.update(T0, 60, &schedules, &mut q).is_empty());
        assert!(pumps.update(T0, 95, &schedules, &mut q).is_empty());
        assert!(pumps.update(T0, 100, &schedules, &mut q).is_empty());
        assert!(q.is_empty());
    }

    #[test]
    fn manual_mode_never_auto_starts() {
        let schedules = vec![watering("w1", 60, WateringMode::Manual)];
        let mut q = queue();
        let mut pumps = Pumps::new(limits());
        assert!(pumps.update(T0, 90, &schedules, &mut q).is_empty());
    }

    #[test]
    fn disabled_auto_schedule_is_ignored() {
        let schedules = vec![Schedule {
            enabled: false,
            ..watering("auto", 60, WateringMode::Auto)
        }];
        let mut q = queue();
        let mut pumps = Pumps::new(limits());
        assert!(pumps.update(T0, 90, &schedules, &mut q).is_empty());
    }

    #[test]
    fn auto_picks_first_satisfied_schedule() {
        let schedules = vec![
            watering("strict", 85, WateringMode::Auto),
            watering("loose", 50, WateringMode::Auto),
        ];
        let mut q = queue();
        let mut pumps = Pumps::new(limits());

        let events = pumps.update(T0, 70, &schedules, &mut q);
        assert!(matches!(
            events.as_slice(),
            [PumpEvent::Started { reason: StartReason::AutoThreshold { threshold: 50, .. }, .. }]
        ));
        assert!(matches!(
            pumps.state(Actuator::Water),
            ActuatorState::Running { source, .. } if source.as_str() == "loose"
        ));
    }

    #[test]
    fn auto_run_stops_at_its_own_threshold() {
        let schedules = vec![watering("auto", 60, WateringMode::Auto)];
        let mut q = queue();
        let mut pumps = Pumps::new(limits());
        pumps.update(T0, 70, &schedules, &mut q);

        let events = pumps.update(at(20), 60, &schedules, &mut q);
        assert!(matches!(
            events.as_slice(),
            [PumpEvent::Stopped { reason: StopReason::TargetReached, .. }]
        ));
    }
}
