//! Outbound delivery to LINE through the quota-aware queue.

pub mod item;
pub mod queue;

pub use item::{
    DeliveryOutcome, DeliveryReport, DrainSummary, DropReason, ItemState, MessageOrigin, Priority,
    QueueItem,
};
pub use queue::{DeliveryQueue, QueueStats};
