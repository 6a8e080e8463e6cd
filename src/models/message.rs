//! Dispatch queue messages and their dead-letter form.
//!
//! A message lives in exactly one place at a time: the dispatch queue (as
//! `Visible` or `InFlight`) or the dead-letter queue. Deleted messages are
//! gone from both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies a message for its whole life, including after a move to the DLQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proof of a single receipt.
///
/// Every receive issues a new token, so a consumer whose visibility window
/// lapsed cannot delete a message that has since been handed to someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptHandle {
    pub message_id: MessageId,
    pub token: Uuid,
}

impl ReceiptHandle {
    pub(crate) fn issue(message_id: MessageId) -> Self {
        Self {
            message_id,
            token: Uuid::new_v4(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Eligible for `receive()`.
    Visible,
    /// Held by one consumer until `visible_at`.
    InFlight,
}

/// A queued reference to a stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,

    /// Key of the stored object this message points at.
    pub payload: String,

    /// Number of receives so far. Incremented at receipt, never reset.
    pub receive_count: u32,

    pub enqueued_at: DateTime<Utc>,

    /// While in flight, the instant the message becomes receivable again.
    pub visible_at: DateTime<Utc>,
}

/// What a successful `receive` hands to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: Message,
    pub receipt: ReceiptHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    /// Already deleted, moved to the DLQ, or the receipt is stale.
    NoOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DeadLetterReason {
    MaxReceiveCountExceeded { max_receive_count: u32 },
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxReceiveCountExceeded { max_receive_count } => {
                write!(f, "exceeded max receive count of {}", max_receive_count)
            }
        }
    }
}

/// A poison message parked for manual inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: Message,
    pub moved_at: DateTime<Utc>,
    pub reason: DeadLetterReason,
}
