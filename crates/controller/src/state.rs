use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;

use crate::actuator::Actuator;
use crate::controller::ControlEvent;
use crate::mqtt::{ScheduleMsg, TelemetryMsg};
use crate::schedule::Schedule;
use crate::transport::SessionState;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

/// Below this (and not dry) the soil reads as "HUMID" rather than "WET".
const HUMID_THRESHOLD: u8 = 35;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub reading: Option<ReadingState>,
    pub water: ActuatorView,
    pub fertilizer: ActuatorView,
    pub transport: SessionState,
    /// Undelivered notification texts, head first.
    pub pending_notifications: Vec<String>,
    /// Schedules the controller is currently running with.
    pub schedules: Vec<Schedule>,
    /// Latest list from the broker, not yet picked up by the control loop.
    pending_schedules: Option<Vec<Schedule>>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct ReadingState {
    pub probe_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub moisture_percent: u8,
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
}

#[derive(Clone, Default, Serialize)]
pub struct ActuatorView {
    pub on: bool,
    /// Controller time the current run started.
    #[serde(with = "time::serde::rfc3339::option")]
    pub running_since: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_changed: Option<OffsetDateTime>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Actuator,
    Schedule,
    Notification,
    Transport,
    Diagnostics,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub reading: Option<ReadingState>,
    pub water: ActuatorView,
    pub fertilizer: ActuatorView,
    pub transport: SessionState,
    pub pending_notifications: Vec<String>,
    pub schedule_count: usize,
    pub events: Vec<SystemEvent>,
}

/// Label shown next to a moisture percentage (0 = saturated).
pub fn moisture_status(percent: u8, disconnect_ceiling: u8, dry_threshold: u8) -> &'static str {
    if percent >= disconnect_ceiling {
        "SENSOR ERROR"
    } else if percent > dry_threshold {
        "DRY"
    } else if percent > HUMID_THRESHOLD {
        "HUMID"
    } else {
        "WET"
    }
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(seed: Vec<Schedule>) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            reading: None,
            water: ActuatorView::default(),
            fertilizer: ActuatorView::default(),
            transport: SessionState::Uninitialized,
            pending_notifications: Vec::new(),
            schedules: seed,
            pending_schedules: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a sensor reading from a probe.
    pub fn record_reading(
        &mut self,
        probe_id: &str,
        moisture_percent: u8,
        temperature: Option<f32>,
        humidity: Option<f32>,
    ) {
        let moisture_percent = moisture_percent.min(100);
        self.reading = Some(ReadingState {
            probe_id: probe_id.to_string(),
            received_at: OffsetDateTime::now_utc(),
            moisture_percent,
            temperature,
            humidity,
        });
        self.push_event(EventKind::Reading, format!("{probe_id}: moisture={moisture_percent}%"));
    }

    /// Moisture to feed the controller: the latest reading if it is fresh,
    /// otherwise 100 (treated as a disconnected sensor).
    pub fn effective_moisture(&self, now: OffsetDateTime, stale_after: Duration) -> u8 {
        match &self.reading {
            Some(r) if now - r.received_at <= stale_after => r.moisture_percent,
            _ => 100,
        }
    }

    /// Hand a freshly received schedule list to the control loop.
    pub fn offer_schedules(&mut self, schedules: Vec<Schedule>) {
        self.push_event(
            EventKind::Schedule,
            format!("received {} schedule(s)", schedules.len()),
        );
        self.pending_schedules = Some(schedules);
    }

    pub fn take_pending_schedules(&mut self) -> Option<Vec<Schedule>> {
        self.pending_schedules.take()
    }

    /// Mirror the pump states after a tick (`Some(start)` while running);
    /// logs only real changes.
    pub fn record_outputs(
        &mut self,
        water: Option<OffsetDateTime>,
        fertilizer: Option<OffsetDateTime>,
    ) {
        for (actuator, since) in [(Actuator::Water, water), (Actuator::Fertilizer, fertilizer)] {
            let view = match actuator {
                Actuator::Water => &mut self.water,
                Actuator::Fertilizer => &mut self.fertilizer,
            };
            view.running_since = since;
            let on = since.is_some();
            if view.on != on {
                view.on = on;
                view.last_changed = Some(OffsetDateTime::now_utc());
                let state_str = if on { "ON" } else { "OFF" };
                self.push_event(EventKind::Actuator, format!("{actuator} relay {state_str}"));
            }
        }
    }

    /// Record an event produced by the decision core.
    pub fn record_control(&mut self, event: &ControlEvent) {
        let kind = match event.category() {
            "schedule" => EventKind::Schedule,
            "notification" => EventKind::Notification,
            "transport" => EventKind::Transport,
            _ => EventKind::Actuator,
        };
        self.push_event(kind, event.to_string());
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn record_diagnostics(&mut self, detail: String) {
        self.push_event(EventKind::Diagnostics, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            reading: self.reading.clone(),
            water: self.water.clone(),
            fertilizer: self.fertilizer.clone(),
            transport: self.transport,
            pending_notifications: self.pending_notifications.clone(),
            schedule_count: self.schedules.len(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    pub fn schedule_list(&self) -> Vec<ScheduleMsg> {
        self.schedules.iter().map(ScheduleMsg::from).collect()
    }

    /// Telemetry snapshot; `moisture_percent` is what the controller sees.
    pub fn telemetry(
        &self,
        now: OffsetDateTime,
        moisture_percent: u8,
        disconnect_ceiling: u8,
        dry_threshold: u8,
    ) -> TelemetryMsg {
        TelemetryMsg {
            ts: now,
            moisture_percent,
            moisture_status: moisture_status(moisture_percent, disconnect_ceiling, dry_threshold),
            temperature: self.reading.as_ref().and_then(|r| r.temperature),
            humidity: self.reading.as_ref().and_then(|r| r.humidity),
            water: self.water.on,
            fertilizer: self.fertilizer.on,
            transport: self.transport,
            queued_notifications: self.pending_notifications.len(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
