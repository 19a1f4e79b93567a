//! Quota governor — monthly LINE send budget and importance policy.
//!
//! LINE meters push messages per calendar month. The governor counts sends
//! against a capacity set below the plan's hard limit, lazily resets at
//! month rollover, and decides which messages may still go out once the
//! budget is spent.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};

use crate::config::QuotaConfig;
use crate::error::QuotaError;
use crate::message::OutboundMessage;
use crate::snapshot::write_replacing;

use super::alerts::{AlertLevel, QuotaAlert};
use super::clock::{Clock, SystemClock};

/// LINE bills by the calendar month in Japan Standard Time.
const PERIOD_UTC_OFFSET_SECS: i32 = 9 * 3600;

const ALERT_CHANNEL_CAPACITY: usize = 32;

/// Calendar period (`YYYY-MM`) containing `now`.
pub fn period_key(now: DateTime<Utc>) -> String {
    match FixedOffset::east_opt(PERIOD_UTC_OFFSET_SECS) {
        Some(tz) => now.with_timezone(&tz).format("%Y-%m").to_string(),
        None => now.format("%Y-%m").to_string(),
    }
}

/// Mutable quota bookkeeping for the current period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaState {
    pub period_key: String,
    pub sent_count: u32,
    pub capacity: u32,
    pub safety_margin: u32,
    pub limit_reached: bool,
    #[serde(default)]
    pub alerted_tiers: HashSet<AlertLevel>,
    #[serde(default)]
    pub last_alert_at: Option<DateTime<Utc>>,
}

impl QuotaState {
    fn fresh(period_key: String, config: &QuotaConfig) -> Self {
        Self {
            period_key,
            sent_count: 0,
            capacity: config.capacity(),
            safety_margin: config.safety_margin,
            limit_reached: false,
            alerted_tiers: HashSet::new(),
            last_alert_at: None,
        }
    }

    fn can_send(&self) -> bool {
        self.sent_count < self.capacity && !self.limit_reached
    }

    fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.sent_count)
    }
}

/// Why a message was or was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionReason {
    WithinQuota,
    ImportantOverride,
    QuotaExhausted,
    /// Important, but the contractual limit itself is used up.
    HardLimitReached,
}

impl std::fmt::Display for AdmissionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WithinQuota => write!(f, "within quota"),
            Self::ImportantOverride => write!(f, "important override"),
            Self::QuotaExhausted => write!(f, "quota exhausted"),
            Self::HardLimitReached => write!(f, "hard limit reached"),
        }
    }
}

/// Result of [`QuotaGovernor::should_admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub allowed: bool,
    pub reason: AdmissionReason,
}

/// Point-in-time view of the quota, for stats endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub period: String,
    pub sent: u32,
    pub capacity: u32,
    pub hard_limit: u32,
    pub remaining: u32,
    pub limit_reached: bool,
}

/// Tracks the monthly LINE send budget.
pub struct QuotaGovernor {
    config: QuotaConfig,
    state: Mutex<QuotaState>,
    clock: Arc<dyn Clock>,
    alerts_tx: broadcast::Sender<QuotaAlert>,
    urgent_keywords: Vec<String>,
}

impl QuotaGovernor {
    /// Create a governor with a fresh in-memory state.
    pub fn new(config: QuotaConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        let state = QuotaState::fresh(period_key(clock.now()), &config);
        Arc::new(Self::with_state(config, clock, state))
    }

    /// Create a governor, restoring the persisted counter when one exists for
    /// the current period.
    pub async fn load(config: QuotaConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        let current = period_key(clock.now());
        let mut state = QuotaState::fresh(current.clone(), &config);

        if let Some(path) = &config.state_path {
            match read_state(path).await {
                Ok(Some(saved)) if saved.period_key == current => {
                    info!(
                        period = %saved.period_key,
                        sent = saved.sent_count,
                        "Restored quota counter"
                    );
                    state.sent_count = saved.sent_count;
                    state.limit_reached =
                        saved.limit_reached || saved.sent_count >= state.capacity;
                    state.alerted_tiers = saved.alerted_tiers;
                    state.last_alert_at = saved.last_alert_at;
                }
                Ok(Some(saved)) => {
                    info!(
                        saved_period = %saved.period_key,
                        period = %current,
                        "Persisted quota counter is from an earlier period, starting fresh"
                    );
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Quota state unreadable, starting fresh"),
            }
        }

        Arc::new(Self::with_state(config, clock, state))
    }

    /// Create a governor on the system clock.
    pub fn with_system_clock(config: QuotaConfig) -> Arc<Self> {
        Self::new(config, Arc::new(SystemClock))
    }

    fn with_state(config: QuotaConfig, clock: Arc<dyn Clock>, state: QuotaState) -> Self {
        let (alerts_tx, _rx) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        let urgent_keywords = config
            .urgent_keywords
            .iter()
            .map(|k| k.to_lowercase())
            .collect();
        Self {
            config,
            state: Mutex::new(state),
            clock,
            alerts_tx,
            urgent_keywords,
        }
    }

    /// Subscribe to threshold alerts.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<QuotaAlert> {
        self.alerts_tx.subscribe()
    }

    /// Reset the counters if the calendar period has changed since the last
    /// observation. Returns whether a reset happened.
    pub async fn reset_if_new_period(&self) -> bool {
        let mut state = self.state.lock().await;
        self.roll_period(&mut state)
    }

    fn roll_period(&self, state: &mut QuotaState) -> bool {
        let current = period_key(self.clock.now());
        if state.period_key == current {
            return false;
        }
        info!(
            previous = %state.period_key,
            period = %current,
            sent = state.sent_count,
            "Quota period rolled over"
        );
        *state = QuotaState::fresh(current, &self.config);
        true
    }

    /// Whether a regular send fits in the budget.
    pub async fn can_send(&self) -> bool {
        let mut state = self.state.lock().await;
        self.roll_period(&mut state);
        state.can_send()
    }

    /// Count one successful send.
    pub async fn record_sent(&self) {
        let mut state = self.state.lock().await;
        self.roll_period(&mut state);

        state.sent_count += 1;
        if state.sent_count >= state.capacity && !state.limit_reached {
            state.limit_reached = true;
            warn!(
                period = %state.period_key,
                sent = state.sent_count,
                capacity = state.capacity,
                "Monthly LINE quota reached"
            );
        }
        debug!(sent = state.sent_count, remaining = state.remaining(), "Send recorded");

        self.evaluate_alerts(&mut state);
        self.persist(&state).await;
    }

    /// Flag the budget as spent regardless of the local count, e.g. after the
    /// platform answered 429.
    pub async fn mark_limit_reached(&self) {
        let mut state = self.state.lock().await;
        self.roll_period(&mut state);
        if !state.limit_reached {
            state.limit_reached = true;
            warn!(period = %state.period_key, sent = state.sent_count, "Quota marked exhausted by platform");
            self.persist(&state).await;
        }
    }

    /// Media always counts as important; text does when it contains one of
    /// the urgent keywords (case-insensitive).
    pub fn classify(&self, message: &OutboundMessage) -> bool {
        if message.kind.is_media() {
            return true;
        }
        let text = message.text.to_lowercase();
        self.urgent_keywords.iter().any(|k| text.contains(k.as_str()))
    }

    /// Decide whether `message` may be sent now.
    pub async fn should_admit(&self, message: &OutboundMessage) -> Admission {
        let mut state = self.state.lock().await;
        self.roll_period(&mut state);

        if state.can_send() {
            return Admission {
                allowed: true,
                reason: AdmissionReason::WithinQuota,
            };
        }
        if !self.classify(message) {
            return Admission {
                allowed: false,
                reason: AdmissionReason::QuotaExhausted,
            };
        }
        if state.sent_count < self.config.hard_limit {
            Admission {
                allowed: true,
                reason: AdmissionReason::ImportantOverride,
            }
        } else {
            Admission {
                allowed: false,
                reason: AdmissionReason::HardLimitReached,
            }
        }
    }

    pub async fn status(&self) -> QuotaStatus {
        let mut state = self.state.lock().await;
        self.roll_period(&mut state);
        QuotaStatus {
            period: state.period_key.clone(),
            sent: state.sent_count,
            capacity: state.capacity,
            hard_limit: self.config.hard_limit,
            remaining: state.remaining(),
            limit_reached: state.limit_reached,
        }
    }

    /// Emit at most one alert for the thresholds crossed by the current count.
    ///
    /// Crossing several tiers at once reports only the most severe and marks
    /// the rest as alerted. While the cooldown is running nothing is marked,
    /// so the tier is reported on the first send after the cooldown.
    fn evaluate_alerts(&self, state: &mut QuotaState) {
        if state.capacity == 0 {
            return;
        }
        let remaining = state.remaining();
        let crossed: Vec<AlertLevel> = self
            .config
            .alert_thresholds
            .iter()
            .filter(|t| f64::from(remaining) <= t.remaining_ratio * f64::from(state.capacity))
            .map(|t| t.level)
            .filter(|level| !state.alerted_tiers.contains(level))
            .collect();

        let Some(&level) = crossed.iter().max() else {
            return;
        };

        let now = self.clock.now();
        if let Some(last) = state.last_alert_at {
            let cooldown = chrono::Duration::from_std(self.config.alert_cooldown)
                .unwrap_or(chrono::Duration::zero());
            if now - last < cooldown {
                debug!(level = %level, "Quota alert suppressed by cooldown");
                return;
            }
        }

        state.alerted_tiers.extend(crossed);
        state.last_alert_at = Some(now);

        let alert = QuotaAlert {
            level,
            period: state.period_key.clone(),
            sent: state.sent_count,
            capacity: state.capacity,
            remaining,
        };
        match level {
            AlertLevel::Warning => warn!(%alert, "Quota alert"),
            AlertLevel::Critical | AlertLevel::Emergency => error!(%alert, "Quota alert"),
        }
        // Ok if nobody is subscribed
        let _ = self.alerts_tx.send(alert);
    }

    async fn persist(&self, state: &QuotaState) {
        let Some(path) = &self.config.state_path else {
            return;
        };
        if let Err(e) = write_state(path, state).await {
            warn!(error = %e, "Failed to persist quota state");
        }
    }
}

async fn read_state(path: &Path) -> Result<Option<QuotaState>, QuotaError> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(QuotaError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

async fn write_state(path: &Path, state: &QuotaState) -> Result<(), QuotaError> {
    let body = serde_json::to_vec_pretty(state)?;
    write_replacing(path, &body)
        .await
        .map_err(|source| QuotaError::Io {
            path: path.display().to_string(),
            source,
        })
}
