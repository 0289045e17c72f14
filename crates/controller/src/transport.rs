//! Transport session machine: tracks whether the SMS channel is usable and
//! drives timed recovery when it is not.
//!
//! ```text
//! Uninitialized ──[startup handshake]──▶ Ready ──[hard send failure]──▶ Error
//!                         │                ▲                              │
//!                         └────────────────┼──────────[failed]──────────▶ │
//!                                          └──[recovery handshake, after  │
//!                                              recovery_interval]─────────┘
//! ```
//!
//! The machine never touches hardware itself; the [`Transport`] it is handed
//! owns the byte-level protocol and must bound every blocking wait.

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Boundary primitives
// ---------------------------------------------------------------------------

/// Result of sending one message to one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Success,
    /// This message/recipient failed; the channel itself is still usable.
    SoftFailure,
    /// The channel is unusable until a new handshake succeeds.
    HardFailure,
}

/// Result of (re-)initialising the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Success,
    Failure,
}

/// Store-and-forward channel used to reach a human.
pub trait Transport {
    fn handshake(&mut self) -> Handshake;
    fn send(&mut self, recipient: &str, text: &str) -> SendResult;
}

// ---------------------------------------------------------------------------
// Session machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Uninitialized,
    Ready,
    Error,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

/// What a recovery attempt achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered,
    StillFailing,
}

#[derive(Debug)]
pub struct TransportSession {
    state: SessionState,
    last_recovery_attempt_at: Option<OffsetDateTime>,
    recovery_interval: Duration,
}

impl TransportSession {
    pub fn new(recovery_interval: Duration) -> Self {
        Self {
            state: SessionState::Uninitialized,
            last_recovery_attempt_at: None,
            recovery_interval,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Run the one-off startup handshake. Only valid from `Uninitialized`;
    /// later calls return the current state untouched.
    ///
    /// The startup attempt also arms the recovery cooldown.
    pub fn start<T: Transport + ?Sized>(
        &mut self,
        now: OffsetDateTime,
        transport: &mut T,
    ) -> SessionState {
        if self.state != SessionState::Uninitialized {
            return self.state;
        }

        self.last_recovery_attempt_at = Some(now);
        self.state = match transport.handshake() {
            Handshake::Success => {
                info!("transport: handshake ok, session ready");
                SessionState::Ready
            }
            Handshake::Failure => {
                warn!("transport: startup handshake failed, will retry later");
                SessionState::Error
            }
        };
        self.state
    }

    /// Re-run the handshake if the session is in `Error` and the cooldown has
    /// elapsed. Returns `None` when no attempt was made.
    pub fn poll_recovery<T: Transport + ?Sized>(
        &mut self,
        now: OffsetDateTime,
        transport: &mut T,
    ) -> Option<RecoveryOutcome> {
        if self.state != SessionState::Error {
            return None;
        }
        if let Some(last) = self.last_recovery_attempt_at {
            if now - last < self.recovery_interval {
                return None;
            }
        }

        // Stamp before the outcome is known so repeated failures still
        // respect the cooldown.
        self.last_recovery_attempt_at = Some(now);
        info!("transport: attempting recovery");

        match transport.handshake() {
            Handshake::Success => {
                info!("transport: recovered");
                self.state = SessionState::Ready;
                Some(RecoveryOutcome::Recovered)
            }
            Handshake::Failure => {
                warn!("transport: recovery failed");
                Some(RecoveryOutcome::StillFailing)
            }
        }
    }

    /// A send reported a hard failure signature.
    pub fn mark_failed(&mut self) {
        if self.state == SessionState::Ready {
            warn!("transport: hard failure, session now in error");
        }
        self.state = SessionState::Error;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
