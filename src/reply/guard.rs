//! Fault isolation for the reply path.
//!
//! Every reply call runs in its own task under a fixed timeout. Errors,
//! panics and timeouts are counted and logged, never returned, so a broken
//! reply subsystem degrades to "replies arrive as plain messages". The
//! guarded work never sends, so abandoning it on timeout cannot leave a
//! half-delivered reply behind.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::ReplyError;
use crate::message::{InboundMessage, Platform};

use super::reconstructor::{ReplyHandler, ReplyPlan};

/// Reply-path health counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GuardStats {
    pub successes: u64,
    /// Errors, panics and timeouts.
    pub failures: u64,
    /// The subset of `failures` that hit the timeout.
    pub timeouts: u64,
    /// `successes / (successes + failures)`, 1.0 before any call.
    pub success_rate: f64,
}

/// Wraps a [`ReplyHandler`] so its failures never escape.
pub struct ReplyGuard {
    handler: Arc<dyn ReplyHandler>,
    timeout: Duration,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

impl ReplyGuard {
    pub fn new(handler: Arc<dyn ReplyHandler>, timeout: Duration) -> Self {
        Self {
            handler,
            timeout,
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Run the reply path for `message`. `None` means it failed; the caller
    /// should treat the message as an ordinary one.
    pub async fn prepare_reply(
        &self,
        message: &InboundMessage,
        platform: Platform,
    ) -> Option<ReplyPlan> {
        let handler = Arc::clone(&self.handler);
        let owned = message.clone();
        let mut task =
            tokio::spawn(async move { handler.prepare_reply(&owned, platform).await });

        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(Ok(plan))) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                debug!(message_id = %message.id, ?plan, "Reply path finished");
                Some(plan)
            }
            Ok(Ok(Err(e))) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(message_id = %message.id, platform = %platform, error = %e, "Reply path failed");
                None
            }
            Ok(Err(join_err)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(message_id = %message.id, platform = %platform, error = %join_err, "Reply path panicked");
                None
            }
            Err(_) => {
                task.abort();
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    message_id = %message.id,
                    platform = %platform,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Reply path timed out"
                );
                None
            }
        }
    }

    pub fn stats(&self) -> GuardStats {
        let successes = self.successes.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let total = successes + failures;
        GuardStats {
            successes,
            failures,
            timeouts: self.timeouts.load(Ordering::Relaxed),
            success_rate: if total == 0 {
                1.0
            } else {
                successes as f64 / total as f64
            },
        }
    }

    /// Self-test the reply detection under the same timeout.
    pub async fn health_check(&self) -> Result<(), ReplyError> {
        let handler = Arc::clone(&self.handler);
        let check = tokio::task::spawn_blocking(move || handler.self_test());
        match tokio::time::timeout(self.timeout, check).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ReplyError::Panicked(join_err.to_string())),
            Err(_) => Err(ReplyError::Timeout(self.timeout)),
        }
    }
}
