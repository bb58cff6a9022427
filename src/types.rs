use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
    P4,
}

impl Priority {
    pub fn as_u8(self) -> u8 {
        match self {
            Priority::P0 => 0,
            Priority::P1 => 1,
            Priority::P2 => 2,
            Priority::P3 => 3,
            Priority::P4 => 4,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Priority::P0),
            1 => Some(Priority::P1),
            2 => Some(Priority::P2),
            3 => Some(Priority::P3),
            4 => Some(Priority::P4),
            _ => None,
        }
    }
}

/// How strongly a delivery has been confirmed. Variants are declared in
/// ascending strength so `max` never downgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    None,
    Injected,
    Echoed,
    FileAcked,
    McpAcked,
    Active,
}

impl Confidence {
    /// Confirmation level: Injected is L0, Echoed L1, file/MCP acks L2,
    /// observed activity L3.
    pub fn level(self) -> u8 {
        match self {
            Confidence::None => 0,
            Confidence::Injected => 0,
            Confidence::Echoed => 1,
            Confidence::FileAcked | Confidence::McpAcked => 2,
            Confidence::Active => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Queued,
    Injected,
    Verified,
    Retry,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Verified | DeliveryStatus::Failed)
    }

    /// The allowed edges of the delivery lifecycle. Everything else is a bug.
    pub fn can_transition(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Failed)
                | (Queued, Injected)
                | (Queued, Failed)
                | (Injected, Verified)
                | (Injected, Retry)
                | (Injected, Failed)
                | (Retry, Queued)
                | (Retry, Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    PtyClosed,
    MaxRetriesExceeded,
    SessionTerminated,
    QueueOverflow,
}

impl FailReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailReason::PtyClosed => "pty_closed",
            FailReason::MaxRetriesExceeded => "max_retries_exceeded",
            FailReason::SessionTerminated => "session_terminated",
            FailReason::QueueOverflow => "queue_overflow",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("delivery {id}: illegal transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub id: String,
    pub from: DeliveryStatus,
    pub to: DeliveryStatus,
}

/// A SEND handed over by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEvent {
    pub id: String,
    pub from: String,
    pub to: String,
    pub body: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub thread_id: Option<String>,
}

impl SendEvent {
    /// Resolve the wire priority. P0 is reserved for the interactive
    /// passthrough and is clamped to P1; absent priorities default to P2 for
    /// direct messages and P3 for channels.
    pub fn effective_priority(&self) -> Priority {
        match self.priority {
            Some(Priority::P0) => Priority::P1,
            Some(p) => p,
            None if self.to.starts_with('#') => Priority::P3,
            None => Priority::P2,
        }
    }
}

/// One live delivery, owned by the session that received it. Other
/// components only ever see the events it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub body: String,
    pub priority: Priority,
    pub created_at: Instant,
    pub attempt: u32,
    pub max_attempts: u32,
    pub status: DeliveryStatus,
    pub confidence: Confidence,
}

impl PendingDelivery {
    pub fn new(event: SendEvent, max_attempts: u32, now: Instant) -> Self {
        let priority = event.effective_priority();
        Self {
            id: event.id,
            sender: event.from,
            recipient: event.to,
            body: event.body,
            priority,
            created_at: now,
            attempt: 1,
            max_attempts,
            status: DeliveryStatus::Pending,
            confidence: Confidence::None,
        }
    }

    pub fn advance(&mut self, next: DeliveryStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition(next) {
            return Err(TransitionError {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Confidence only ever goes up.
    pub fn raise_confidence(&mut self, confidence: Confidence) {
        self.confidence = self.confidence.max(confidence);
    }
}

pub(crate) fn short_token() -> String {
    let mut token = Uuid::new_v4().simple().to_string();
    token.truncate(8);
    token
}

/// One or more coalesced bodies from the same (sender, recipient), written
/// to the PTY as a single payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionBlock {
    pub token: String,
    pub sender: String,
    pub recipient: String,
    pub bodies: Vec<String>,
    pub delivery_ids: Vec<String>,
    pub priority: Priority,
    pub attempt: u32,
}

impl InjectionBlock {
    pub fn for_delivery(delivery: &PendingDelivery) -> Self {
        Self {
            token: short_token(),
            sender: delivery.sender.clone(),
            recipient: delivery.recipient.clone(),
            bodies: vec![delivery.body.clone()],
            delivery_ids: vec![delivery.id.clone()],
            priority: delivery.priority,
            attempt: 1,
        }
    }

    /// Fold a later delivery from the same sender into this block; bodies
    /// keep arrival order.
    pub fn absorb(&mut self, delivery: &PendingDelivery) {
        self.bodies.push(delivery.body.clone());
        self.delivery_ids.push(delivery.id.clone());
        self.priority = self.priority.min(delivery.priority);
    }

    pub fn body_bytes(&self) -> usize {
        self.bodies.iter().map(String::len).sum()
    }

    pub fn payload(&self) -> String {
        let body = self.bodies.join("\n");
        if self.recipient.starts_with('#') {
            format!(
                "Courier message from {} in {} [{}]: {}",
                self.sender, self.recipient, self.token, body
            )
        } else {
            format!(
                "Courier message from {} [{}]: {}",
                self.sender, self.token, body
            )
        }
    }
}
