//! Outbound notification queue.
//!
//! Strict FIFO: only the head is ever attempted, and a single cooldown is
//! shared by the whole queue. A head that keeps failing holds everything
//! behind it until it is dropped after `max_attempts`, so status updates are
//! never delivered out of order.

use std::collections::VecDeque;

use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::transport::{RecoveryOutcome, SendResult, Transport, TransportSession};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNotification {
    pub text: String,
    pub attempts: u32,
    pub next_attempt_at: OffsetDateTime,
}

/// What one `drain_one` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Empty,
    /// The shared cooldown since the last attempt has not elapsed.
    CoolingDown,
    /// The head has a later `next_attempt_at`.
    NotDue,
    /// The session is not ready; no attempt was consumed. Carries the result
    /// of the recovery check, if one ran.
    TransportUnavailable(Option<RecoveryOutcome>),
    Delivered { recipient: String, text: String },
    Retrying { attempts: u32, next_attempt_at: OffsetDateTime },
    Dropped { text: String, attempts: u32 },
}

#[derive(Debug)]
pub struct NotificationQueue {
    pending: VecDeque<PendingNotification>,
    policy: RetryPolicy,
    prefix: String,
    last_attempt_at: Option<OffsetDateTime>,
}

impl NotificationQueue {
    /// `prefix` is prepended to every message (e.g. the system's name).
    pub fn new(policy: RetryPolicy, prefix: impl Into<String>) -> Self {
        Self {
            pending: VecDeque::new(),
            policy,
            prefix: prefix.into(),
            last_attempt_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn head(&self) -> Option<&PendingNotification> {
        self.pending.front()
    }

    /// Pending messages, head first.
    pub fn iter(&self) -> impl Iterator<Item = &PendingNotification> {
        self.pending.iter()
    }

    pub fn enqueue(&mut self, now: OffsetDateTime, text: impl AsRef<str>) {
        let text = if self.prefix.is_empty() {
            text.as_ref().to_string()
        } else {
            format!("{}: {}", self.prefix, text.as_ref())
        };
        debug!(queued = self.pending.len() + 1, %text, "notify: enqueued");
        self.pending.push_back(PendingNotification {
            text,
            attempts: 0,
            next_attempt_at: now,
        });
    }

    /// Make at most one delivery attempt for the head of the queue.
    pub fn drain_one<T: Transport + ?Sized>(
        &mut self,
        now: OffsetDateTime,
        transport: &mut T,
        session: &mut TransportSession,
        recipients: &[String],
    ) -> DrainOutcome {
        let Some(head) = self.pending.front_mut() else {
            return DrainOutcome::Empty;
        };

        if let Some(last) = self.last_attempt_at {
            if now - last < self.policy.retry_interval {
                return DrainOutcome::CoolingDown;
            }
        }
        if now < head.next_attempt_at {
            return DrainOutcome::NotDue;
        }

        if !session.is_ready() {
            return DrainOutcome::TransportUnavailable(session.poll_recovery(now, transport));
        }

        self.last_attempt_at = Some(now);

        let mut delivered_to = None;
        for recipient in recipients {
            match transport.send(recipient, &head.text) {
                SendResult::Success => {
                    delivered_to = Some(recipient.clone());
                    break;
                }
                SendResult::SoftFailure => {
                    debug!(%recipient, "notify: send failed, trying next recipient");
                }
                SendResult::HardFailure => {
                    warn!(%recipient, "notify: transport hard failure, aborting attempt");
                    session.mark_failed();
                    break;
                }
            }
        }

        if let Some(recipient) = delivered_to {
            let text = head.text.clone();
            self.pending.pop_front();
            info!(%recipient, remaining = self.pending.len(), "notify: delivered");
            return DrainOutcome::Delivered { recipient, text };
        }

        head.attempts += 1;
        if head.attempts >= self.policy.max_attempts {
            let attempts = head.attempts;
            let text = head.text.clone();
            self.pending.pop_front();
            warn!(attempts, %text, "notify: retries exhausted, message dropped");
            return DrainOutcome::Dropped { text, attempts };
        }

        head.next_attempt_at = now + self.policy.retry_interval;
        info!(
            attempts = head.attempts,
            max_attempts = self.policy.max_attempts,
            "notify: delivery failed, will retry"
        );
        DrainOutcome::Retrying {
            attempts: head.attempts,
            next_attempt_at: head.next_attempt_at,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
