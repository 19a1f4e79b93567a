//! LINE ⇄ Discord bridge — correlation, quota-aware delivery and reply chains.

pub mod bridge;
pub mod channels;
pub mod config;
pub mod correlation;
pub mod delivery;
pub mod error;
pub mod message;
pub mod quota;
pub mod reply;
pub mod snapshot;
pub mod webhook;
