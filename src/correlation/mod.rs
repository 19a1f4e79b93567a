//! Maps each forwarded message to its original.

pub mod store;

pub use store::{CorrelationMeta, CorrelationStore, MessageCorrelation, spawn_sweep_task};
