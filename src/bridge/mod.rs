//! Routing and the inbound entry points.

pub mod routes;
pub mod service;

pub use routes::RouteTable;
pub use service::{
    Bridge, BridgeDeps, BridgeOptions, BridgeStats, HealthReport, IgnoreReason, InboundOutcome,
};
