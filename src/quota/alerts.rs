//! Quota threshold alerts.

use serde::{Deserialize, Serialize};

/// Severity of a quota alert, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Critical,
    Emergency,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
            Self::Emergency => write!(f, "emergency"),
        }
    }
}

/// Raised when the remaining budget crosses a configured threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaAlert {
    pub level: AlertLevel,
    pub period: String,
    pub sent: u32,
    pub capacity: u32,
    pub remaining: u32,
}

impl std::fmt::Display for QuotaAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} of {} LINE messages left for {} ({} sent)",
            self.level, self.remaining, self.capacity, self.period, self.sent
        )
    }
}
