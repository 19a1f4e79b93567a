//! Narrow send/fetch traits over LINE and Discord, plus their HTTP clients.
//!
//! The core never talks HTTP itself. It holds `Arc<dyn LineSender>` and
//! `Arc<dyn DiscordSender>`; `LineClient` and `DiscordClient` are the
//! production implementations, tests substitute stubs.

pub mod discord;
pub mod line;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::message::OutboundMessage;

pub use discord::DiscordClient;
pub use line::LineClient;

/// Id assigned by the platform to a message we sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub message_id: String,
}

/// A Discord message fetched by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedMessage {
    pub id: String,
    pub author_id: String,
    pub content: String,
}

/// LINE Messaging API operations used by the bridge.
#[async_trait]
pub trait LineSender: Send + Sync {
    /// Push messages to a user, group or room. Counts against the monthly quota.
    async fn push(&self, to: &str, messages: &[OutboundMessage]) -> Result<SentMessage, ChannelError>;

    /// Answer a webhook event with its reply token. Not metered.
    async fn reply(
        &self,
        reply_token: &str,
        messages: &[OutboundMessage],
    ) -> Result<SentMessage, ChannelError>;

    /// Download the binary content of a media message.
    async fn fetch_content(&self, message_id: &str) -> Result<Vec<u8>, ChannelError>;
}

/// Discord REST operations used by the bridge.
#[async_trait]
pub trait DiscordSender: Send + Sync {
    /// Post a message to a channel.
    async fn send(&self, channel_id: &str, content: &str) -> Result<SentMessage, ChannelError>;

    /// Fetch a single message from a channel.
    async fn fetch_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<FetchedMessage, ChannelError>;
}

/// Build a `ChannelError` from a non-success HTTP response.
pub(crate) async fn status_error(platform: &str, resp: reqwest::Response) -> ChannelError {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = resp.text().await.unwrap_or_default();
    ChannelError::Status {
        platform: platform.to_string(),
        status,
        retry_after,
        body,
    }
}

/// `Retry-After` in (possibly fractional) seconds.
pub(crate) fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

pub(crate) fn request_failed(platform: &str, err: reqwest::Error) -> ChannelError {
    ChannelError::RequestFailed {
        platform: platform.to_string(),
        reason: err.to_string(),
    }
}
