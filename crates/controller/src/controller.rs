//! The control loop's single owner of the decision core.
//!
//! One [`Controller::tick`] runs, in order: schedule replacement, pump
//! update, schedule evaluation (and fire handling), transport recovery poll,
//! and at most one notification attempt. Nothing in here blocks except the
//! transport primitives, which bound their own waits. A tick that ran a
//! recovery handshake leaves the notification attempt to the next tick, so
//! only one blocking transport phase ever runs per tick.

use std::fmt;

use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::actuator::{Actuator, Limits, PumpEvent, Pumps};
use crate::notify::{DrainOutcome, NotificationQueue, RetryPolicy};
use crate::schedule::{self, FireEvent, Schedule, TriggerLedger};
use crate::transport::{RecoveryOutcome, SessionState, Transport, TransportSession};

/// Everything the core needs to build itself.
#[derive(Debug, Clone)]
pub struct Settings {
    pub limits: Limits,
    pub retry: RetryPolicy,
    pub message_prefix: String,
    pub recovery_interval: Duration,
    pub recipients: Vec<String>,
}

/// Inputs for one tick.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub now: OffsetDateTime,
    /// 0 = saturated, 100 = bone dry (or no usable reading).
    pub moisture_percent: u8,
    /// A fresh full replacement list, if one arrived since the last tick.
    pub schedules: Option<Vec<Schedule>>,
}

/// Something that happened during a tick and belongs in the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Fired(FireEvent),
    Pump(PumpEvent),
    Delivered { recipient: String },
    Dropped { text: String, attempts: u32 },
    Retrying { attempts: u32 },
    Recovery(RecoveryOutcome),
}

impl ControlEvent {
    /// Short machine-friendly category (`"water"`, `"schedule"`, ...).
    pub fn category(&self) -> &'static str {
        match self {
            Self::Fired(_) => "schedule",
            Self::Pump(PumpEvent::Started { actuator, .. })
            | Self::Pump(PumpEvent::Stopped { actuator, .. }) => match actuator {
                Actuator::Water => "water",
                Actuator::Fertilizer => "fertilizer",
            },
            Self::Pump(PumpEvent::WateringSkipped { .. }) => "water",
            Self::Delivered { .. } | Self::Dropped { .. } | Self::Retrying { .. } => "notification",
            Self::Recovery(_) => "transport",
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::Fired(_) => "fired",
            Self::Pump(PumpEvent::Started { .. }) => "started",
            Self::Pump(PumpEvent::Stopped {
                actuator: Actuator::Fertilizer,
                ..
            }) => "completed",
            Self::Pump(PumpEvent::Stopped { .. }) => "stopped",
            Self::Pump(PumpEvent::WateringSkipped { .. }) => "skipped",
            Self::Delivered { .. } => "delivered",
            Self::Dropped { .. } => "dropped",
            Self::Retrying { .. } => "retrying",
            Self::Recovery(RecoveryOutcome::Recovered) => "recovered",
            Self::Recovery(RecoveryOutcome::StillFailing) => "recovery_failed",
        }
    }
}

impl fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fired(fire) => write!(f, "Schedule {} fired ({})", fire.schedule_id, fire.kind),
            Self::Pump(ev) => f.write_str(&ev.message()),
            Self::Delivered { recipient } => write!(f, "Notification delivered to {recipient}"),
            Self::Dropped { text, attempts } => {
                write!(f, "Notification dropped after {attempts} attempts: {text}")
            }
            Self::Retrying { attempts } => write!(f, "Notification failed (attempt {attempts})"),
            Self::Recovery(RecoveryOutcome::Recovered) => write!(f, "SMS transport recovered"),
            Self::Recovery(RecoveryOutcome::StillFailing) => {
                write!(f, "SMS transport recovery failed")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub events: Vec<ControlEvent>,
    pub water_on: bool,
    pub fertilizer_on: bool,
    /// `None` when a recovery handshake ran this tick.
    pub drain: Option<DrainOutcome>,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Controller {
    schedules: Vec<Schedule>,
    ledger: TriggerLedger,
    pumps: Pumps,
    queue: NotificationQueue,
    session: TransportSession,
    recipients: Vec<String>,
}

impl Controller {
    /// `seed` is the schedule list in force until the first refresh.
    pub fn new(settings: Settings, seed: Vec<Schedule>) -> Self {
        Self {
            schedules: seed,
            ledger: TriggerLedger::new(),
            pumps: Pumps::new(settings.limits),
            queue: NotificationQueue::new(settings.retry, settings.message_prefix),
            session: TransportSession::new(settings.recovery_interval),
            recipients: settings.recipients,
        }
    }

    /// Startup handshake. Call once before the first tick.
    pub fn start<T: Transport + ?Sized>(
        &mut self,
        now: OffsetDateTime,
        transport: &mut T,
    ) -> SessionState {
        self.session.start(now, transport)
    }

    pub fn schedules(&self) -> &[Schedule] {
        &self.schedules
    }

    pub fn pumps(&self) -> &Pumps {
        &self.pumps
    }

    pub fn queue(&self) -> &NotificationQueue {
        &self.queue
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn tick<T: Transport + ?Sized>(&mut self, snap: Snapshot, transport: &mut T) -> TickReport {
        let Snapshot {
            now,
            moisture_percent: moisture,
            schedules,
        } = snap;

        if let Some(fresh) = schedules {
            self.schedules = fresh;
        }

        let mut events: Vec<ControlEvent> = self
            .pumps
            .update(now, moisture, &self.schedules, &mut self.queue)
            .into_iter()
            .map(ControlEvent::Pump)
            .collect();

        for fire in schedule::evaluate(now, &self.schedules, &mut self.ledger) {
            let outcome = self
                .pumps
                .on_fire(&fire, now, moisture, &self.schedules, &mut self.queue);
            events.push(ControlEvent::Fired(fire));
            events.extend(outcome.map(ControlEvent::Pump));
        }

        let recovery = self.session.poll_recovery(now, transport);
        if let Some(outcome) = recovery {
            events.push(ControlEvent::Recovery(outcome));
        }

        let drain = recovery.is_none().then(|| {
            self.queue
                .drain_one(now, transport, &mut self.session, &self.recipients)
        });
        match &drain {
            None => debug!("notification attempt deferred, handshake ran this tick"),
            Some(drain) => events.extend(drain_event(drain)),
        }

        TickReport {
            events,
            water_on: self.pumps.is_running(Actuator::Water),
            fertilizer_on: self.pumps.is_running(Actuator::Fertilizer),
            drain,
        }
    }
}

fn drain_event(drain: &DrainOutcome) -> Option<ControlEvent> {
    match drain {
        DrainOutcome::Delivered { recipient, .. } => Some(ControlEvent::Delivered {
            recipient: recipient.clone(),
        }),
        DrainOutcome::Dropped { text, attempts } => Some(ControlEvent::Dropped {
            text: text.clone(),
            attempts: *attempts,
        }),
        DrainOutcome::Retrying { attempts, .. } => Some(ControlEvent::Retrying {
            attempts: *attempts,
        }),
        DrainOutcome::TransportUnavailable(Some(outcome)) => Some(ControlEvent::Recovery(*outcome)),
        _ => None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
