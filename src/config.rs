//! Configuration types.
//!
//! Every section has sensible defaults and a `from_env()` constructor reading
//! `LINE_BRIDGE_*` variables. Credentials are the only required values.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::quota::AlertLevel;

/// Complete bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub line: LineCredentials,
    pub discord: DiscordCredentials,
    pub routes: Vec<Route>,
    pub quota: QuotaConfig,
    pub queue: QueueConfig,
    pub reply: ReplyConfig,
    pub correlation: CorrelationConfig,
    pub server: ServerConfig,
}

impl BridgeConfig {
    /// Load the full configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            line: LineCredentials {
                channel_access_token: SecretString::from(required("LINE_CHANNEL_ACCESS_TOKEN")?),
            },
            discord: DiscordCredentials {
                bot_token: SecretString::from(required("DISCORD_BOT_TOKEN")?),
                bot_user_id: std::env::var("DISCORD_BOT_USER_ID").ok(),
                alert_channel_id: std::env::var("DISCORD_ALERT_CHANNEL_ID").ok(),
            },
            routes: match std::env::var("LINE_BRIDGE_ROUTES") {
                Ok(raw) => parse_routes(&raw)?,
                Err(_) => Vec::new(),
            },
            quota: QuotaConfig::from_env()?,
            queue: QueueConfig::from_env()?,
            reply: ReplyConfig::from_env()?,
            correlation: CorrelationConfig::from_env()?,
            server: ServerConfig::from_env()?,
        })
    }
}

/// LINE Messaging API credentials.
#[derive(Debug, Clone)]
pub struct LineCredentials {
    pub channel_access_token: SecretString,
}

/// Discord bot credentials.
#[derive(Debug, Clone)]
pub struct DiscordCredentials {
    pub bot_token: SecretString,
    /// The bot's own user id; messages authored by it are never bridged back.
    pub bot_user_id: Option<String>,
    /// Channel that receives quota alerts, if any.
    pub alert_channel_id: Option<String>,
}

/// A pairing of a LINE source (user, group or room) with a Discord channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub line_id: String,
    pub discord_channel_id: String,
}

/// Parse `line_id=discord_channel_id` pairs separated by commas.
pub fn parse_routes(raw: &str) -> Result<Vec<Route>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (line_id, discord_channel_id) =
                pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                    key: "LINE_BRIDGE_ROUTES".into(),
                    message: format!("expected line_id=discord_channel_id, got '{pair}'"),
                })?;
            Ok(Route {
                line_id: line_id.trim().to_string(),
                discord_channel_id: discord_channel_id.trim().to_string(),
            })
        })
        .collect()
}

/// One remaining-budget threshold that raises an alert when crossed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThreshold {
    pub level: AlertLevel,
    /// Fraction of capacity still available (0.2 = 20% left).
    pub remaining_ratio: f64,
}

/// Monthly LINE send budget.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Contractual monthly message cap from the LINE plan.
    pub hard_limit: u32,
    /// Sends held back below the hard limit. Only important messages may use them.
    pub safety_margin: u32,
    /// Case-insensitive substrings that mark a text message as important.
    pub urgent_keywords: Vec<String>,
    /// Descending thresholds; each alerts at most once per period.
    pub alert_thresholds: Vec<AlertThreshold>,
    /// Minimum spacing between two alerts.
    pub alert_cooldown: Duration,
    /// Where the quota counter is persisted across restarts (none = memory only).
    pub state_path: Option<PathBuf>,
}

impl QuotaConfig {
    /// Sends allowed before the governor reports the quota as exhausted.
    pub fn capacity(&self) -> u32 {
        self.hard_limit.saturating_sub(self.safety_margin)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            hard_limit: env_or("LINE_BRIDGE_QUOTA_HARD_LIMIT", defaults.hard_limit)?,
            safety_margin: env_or("LINE_BRIDGE_QUOTA_SAFETY_MARGIN", defaults.safety_margin)?,
            urgent_keywords: std::env::var("LINE_BRIDGE_URGENT_KEYWORDS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.urgent_keywords),
            alert_thresholds: defaults.alert_thresholds,
            alert_cooldown: Duration::from_secs(env_or(
                "LINE_BRIDGE_ALERT_COOLDOWN_SECS",
                defaults.alert_cooldown.as_secs(),
            )?),
            state_path: std::env::var("LINE_BRIDGE_QUOTA_STATE_PATH")
                .map(PathBuf::from)
                .ok()
                .or(defaults.state_path),
        })
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            hard_limit: 200,
            safety_margin: 10,
            urgent_keywords: ["urgent", "emergency", "asap", "緊急", "至急"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            alert_thresholds: vec![
                AlertThreshold {
                    level: AlertLevel::Warning,
                    remaining_ratio: 0.2,
                },
                AlertThreshold {
                    level: AlertLevel::Critical,
                    remaining_ratio: 0.1,
                },
                AlertThreshold {
                    level: AlertLevel::Emergency,
                    remaining_ratio: 0.05,
                },
            ],
            alert_cooldown: Duration::from_secs(3600),
            state_path: Some(PathBuf::from("./data/quota.json")),
        }
    }
}

/// Outbound LINE delivery queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum queued items; further enqueues are rejected.
    pub capacity: usize,
    /// Attempts per item, including the first.
    pub max_attempts: u32,
    /// Minimum spacing between two sends.
    pub send_interval: Duration,
    /// Wait before re-draining after the quota ran out mid-drain.
    pub quota_backoff: Duration,
    /// Text for the same destination enqueued within this window is merged.
    pub batch_window: Duration,
    /// Upper bound on lines merged into one message.
    pub max_batch_lines: usize,
    /// Longest a single push may take before it counts as a transient failure.
    pub send_timeout: Duration,
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            capacity: env_or("LINE_BRIDGE_QUEUE_CAPACITY", defaults.capacity)?,
            max_attempts: env_or("LINE_BRIDGE_QUEUE_MAX_ATTEMPTS", defaults.max_attempts)?,
            send_interval: Duration::from_millis(env_or(
                "LINE_BRIDGE_SEND_INTERVAL_MS",
                defaults.send_interval.as_millis() as u64,
            )?),
            quota_backoff: Duration::from_secs(env_or(
                "LINE_BRIDGE_QUOTA_BACKOFF_SECS",
                defaults.quota_backoff.as_secs(),
            )?),
            batch_window: Duration::from_millis(env_or(
                "LINE_BRIDGE_BATCH_WINDOW_MS",
                defaults.batch_window.as_millis() as u64,
            )?),
            max_batch_lines: env_or("LINE_BRIDGE_MAX_BATCH_LINES", defaults.max_batch_lines)?,
            send_timeout: Duration::from_secs(env_or(
                "LINE_BRIDGE_SEND_TIMEOUT_SECS",
                defaults.send_timeout.as_secs(),
            )?),
        })
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            max_attempts: 3,
            send_interval: Duration::from_secs(1),
            quota_backoff: Duration::from_secs(60),
            batch_window: Duration::from_secs(3),
            max_batch_lines: 20,
            send_timeout: Duration::from_secs(15),
        }
    }
}

/// Reply reconstruction.
#[derive(Debug, Clone)]
pub struct ReplyConfig {
    /// Upper bound on one reply-handling call.
    pub timeout: Duration,
    /// Characters of the replied-to message quoted in the reply header.
    pub snippet_chars: usize,
}

impl ReplyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            timeout: Duration::from_millis(env_or(
                "LINE_BRIDGE_REPLY_TIMEOUT_MS",
                defaults.timeout.as_millis() as u64,
            )?),
            snippet_chars: env_or("LINE_BRIDGE_REPLY_SNIPPET_CHARS", defaults.snippet_chars)?,
        })
    }
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            snippet_chars: 50,
        }
    }
}

/// Correlation store persistence and retention.
#[derive(Debug, Clone)]
pub struct CorrelationConfig {
    pub path: PathBuf,
    /// Correlations older than this are removed by the sweep.
    pub max_age_days: u32,
    pub sweep_interval: Duration,
    /// Characters of message content kept in each correlation.
    pub snapshot_chars: usize,
}

impl CorrelationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            path: std::env::var("LINE_BRIDGE_CORRELATION_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.path),
            max_age_days: env_or("LINE_BRIDGE_CORRELATION_MAX_AGE_DAYS", defaults.max_age_days)?,
            sweep_interval: Duration::from_secs(env_or(
                "LINE_BRIDGE_CORRELATION_SWEEP_SECS",
                defaults.sweep_interval.as_secs(),
            )?),
            snapshot_chars: env_or("LINE_BRIDGE_SNAPSHOT_CHARS", defaults.snapshot_chars)?,
        })
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/correlations.json"),
            max_age_days: 30,
            sweep_interval: Duration::from_secs(6 * 3600),
            snapshot_chars: 200,
        }
    }
}

/// HTTP server for webhooks and admin endpoints.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: env_or("LINE_BRIDGE_PORT", Self::default().port)?,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

fn required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
