//! Queue item model and delivery reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::message::{OutboundMessage, Platform};
use crate::quota::AdmissionReason;

/// Delivery priority, 1 (lowest) to 5 (highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    pub const LOW: Self = Self(1);
    pub const NORMAL: Self = Self(3);
    pub const HIGH: Self = Self(4);
    pub const URGENT: Self = Self(5);

    /// Clamp into the valid range.
    pub fn new(value: u8) -> Self {
        Self(value.clamp(1, 5))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Self::new(value)
    }
}

/// Lifecycle of a queue item.
///
/// `Enqueued → Admitted → Sending → {Sent | Retry(n) → Sending | Dropped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "attempt")]
pub enum ItemState {
    Enqueued,
    Admitted,
    Sending,
    Retry(u32),
    Sent,
    Dropped,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Dropped)
    }
}

/// The inbound message an outbound item was produced from. Used to record
/// correlations once the item is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageOrigin {
    pub platform: Platform,
    pub message_id: String,
    pub author_id: String,
    pub channel_id: String,
    pub content: String,
}

/// One outbound LINE message waiting in the queue.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: Uuid,
    /// LINE user, group or room id.
    pub destination: String,
    pub payload: OutboundMessage,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    /// Attempts made so far.
    pub attempt: u32,
    pub max_attempts: u32,
    pub state: ItemState,
    /// Source messages merged into this item, in order.
    pub origins: Vec<MessageOrigin>,
    /// Insertion order; breaks priority ties FIFO.
    pub(crate) seq: u64,
    /// When the first message of a batch arrived.
    pub(crate) batch_opened: Instant,
    pub(crate) lines: usize,
}

impl QueueItem {
    pub(crate) fn new(
        destination: String,
        payload: OutboundMessage,
        priority: Priority,
        max_attempts: u32,
        origin: Option<MessageOrigin>,
        seq: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            destination,
            payload,
            priority,
            enqueued_at: Utc::now(),
            attempt: 0,
            max_attempts,
            state: ItemState::Enqueued,
            origins: origin.into_iter().collect(),
            seq,
            batch_opened: Instant::now(),
            lines: 1,
        }
    }

    /// Whether `self` is delivered before `other`.
    pub(crate) fn goes_before(&self, other: &QueueItem) -> bool {
        (std::cmp::Reverse(self.priority), self.seq) < (std::cmp::Reverse(other.priority), other.seq)
    }
}

/// Why an item left the queue without being delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum DropReason {
    /// The quota governor refused it.
    Rejected(AdmissionReason),
    /// The platform refused it for good.
    Permanent(String),
    /// Transient failures used up every attempt.
    AttemptsExhausted(String),
    /// Discarded by an administrative clear.
    Cleared,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
            Self::Permanent(reason) => write!(f, "permanent failure: {reason}"),
            Self::AttemptsExhausted(reason) => write!(f, "attempts exhausted: {reason}"),
            Self::Cleared => write!(f, "cleared"),
        }
    }
}

/// Terminal outcome of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DeliveryOutcome {
    Sent { message_id: String },
    Dropped { reason: DropReason },
}

/// Published once per item when it reaches a terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    pub item_id: Uuid,
    pub destination: String,
    pub payload: OutboundMessage,
    pub origins: Vec<MessageOrigin>,
    pub attempts: u32,
    pub outcome: DeliveryOutcome,
}

/// What one call to `drain()` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainSummary {
    pub sent: usize,
    pub dropped: usize,
    pub retried: usize,
    /// Items left waiting for quota when the drain stopped.
    pub held: usize,
    /// Another drain was already running.
    pub skipped: bool,
}
