//! Error types for the LINE ⇄ Discord bridge.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Correlation store errors.
///
/// Persistence failures never invalidate the in-memory indices; callers log
/// them and carry on.
#[derive(Debug, thiserror::Error)]
pub enum CorrelationError {
    #[error("Failed to persist correlations to {path}: {source}")]
    Persistence {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize correlations: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Quota snapshot errors. The governor keeps counting in memory when these
/// occur.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("Failed to access quota state at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Quota state is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Errors talking to a platform API.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Request to {platform} failed: {reason}")]
    RequestFailed { platform: String, reason: String },

    #[error("{platform} returned status {status}: {body}")]
    Status {
        platform: String,
        status: u16,
        retry_after: Option<Duration>,
        body: String,
    },

    #[error("Invalid response from {platform}: {reason}")]
    InvalidResponse { platform: String, reason: String },
}

impl ChannelError {
    /// HTTP status carried by the error, if the platform answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// `Retry-After` hint, if the platform sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// A failed delivery attempt out of the queue.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    /// 5xx, network failure or timeout. Eligible for retry.
    #[error("Transient delivery failure (status {status:?}): {reason}")]
    Transient { status: Option<u16>, reason: String },

    /// Anything the platform will keep refusing, including 429 once the
    /// monthly budget is gone.
    #[error("Permanent delivery failure (status {status:?}): {reason}")]
    Permanent {
        status: Option<u16>,
        retry_after: Option<Duration>,
        reason: String,
    },
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transient { status, .. } | Self::Permanent { status, .. } => *status,
        }
    }

    /// Wait the platform asked for before trying again, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Permanent { retry_after, .. } => *retry_after,
            Self::Transient { .. } => None,
        }
    }

    pub(crate) fn timed_out(after: Duration) -> Self {
        Self::Transient {
            status: None,
            reason: format!("send timed out after {after:?}"),
        }
    }
}

impl From<ChannelError> for DeliveryError {
    fn from(err: ChannelError) -> Self {
        let reason = err.to_string();
        match err.status() {
            Some(status) if (500..600).contains(&status) => Self::Transient {
                status: Some(status),
                reason,
            },
            Some(status) => Self::Permanent {
                status: Some(status),
                retry_after: err.retry_after(),
                reason,
            },
            // No status: the request never got an answer (network, timeout).
            None => match err {
                ChannelError::InvalidResponse { .. } => Self::Permanent {
                    status: None,
                    retry_after: None,
                    reason,
                },
                _ => Self::Transient {
                    status: None,
                    reason,
                },
            },
        }
    }
}

/// Reply subsystem errors. Always contained by the reply guard.
#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("Correlation lookup failed: {0}")]
    Lookup(String),

    #[error("Reply delivery failed: {0}")]
    Delivery(#[from] ChannelError),

    #[error("Reply handling timed out after {0:?}")]
    Timeout(Duration),

    #[error("Reply task panicked: {0}")]
    Panicked(String),

    #[error("Reply matcher self-test failed: {matcher}")]
    SelfTest { matcher: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16) -> ChannelError {
        ChannelError::Status {
            platform: "line".into(),
            status,
            retry_after: None,
            body: String::new(),
        }
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(DeliveryError::from(status(503)).is_transient());
        assert!(DeliveryError::from(status(500)).is_transient());
    }

    #[test]
    fn rate_limit_is_permanent() {
        let err = DeliveryError::from(ChannelError::Status {
            platform: "line".into(),
            status: 429,
            retry_after: Some(Duration::from_secs(30)),
            body: "monthly limit".into(),
        });
        assert!(!err.is_transient());
        assert_eq!(err.status(), Some(429));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn network_failure_is_transient() {
        let err = DeliveryError::from(ChannelError::RequestFailed {
            platform: "line".into(),
            reason: "connection reset".into(),
        });
        assert!(err.is_transient());
        assert_eq!(err.status(), None);
    }

    #[test]
    fn send_timeout_is_transient() {
        let err = DeliveryError::timed_out(Duration::from_secs(10));
        assert!(err.is_transient());
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn bad_request_is_permanent() {
        assert!(!DeliveryError::from(status(400)).is_transient());
    }
}
