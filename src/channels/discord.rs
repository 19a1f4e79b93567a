//! Discord REST client.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::channels::{DiscordSender, FetchedMessage, SentMessage, request_failed, status_error};
use crate::error::ChannelError;

const API_BASE: &str = "https://discord.com/api/v10";

/// Per-request deadline, connect included.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum message length for Discord's create-message endpoint.
const DISCORD_MAX_MESSAGE_LENGTH: usize = 2000;

#[derive(Debug, Deserialize)]
struct MessageResponse {
    id: String,
    #[serde(default)]
    content: String,
    author: Option<AuthorResponse>,
}

#[derive(Debug, Deserialize)]
struct AuthorResponse {
    id: String,
}

/// Posts and fetches channel messages with a bot token.
pub struct DiscordClient {
    bot_token: SecretString,
    client: reqwest::Client,
}

impl DiscordClient {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    fn messages_url(&self, channel_id: &str) -> String {
        format!("{API_BASE}/channels/{channel_id}/messages")
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.bot_token.expose_secret())
    }

    async fn send_chunk(&self, channel_id: &str, content: &str) -> Result<SentMessage, ChannelError> {
        let resp = self
            .client
            .post(self.messages_url(channel_id))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .json(&serde_json::json!({
                "content": content,
                "allowed_mentions": { "parse": [] },
            }))
            .send()
            .await
            .map_err(|e| request_failed("discord", e))?;

        if !resp.status().is_success() {
            return Err(status_error("discord", resp).await);
        }

        let parsed: MessageResponse = resp.json().await.map_err(|e| ChannelError::InvalidResponse {
            platform: "discord".into(),
            reason: e.to_string(),
        })?;
        Ok(SentMessage {
            message_id: parsed.id,
        })
    }
}

#[async_trait]
impl DiscordSender for DiscordClient {
    /// Long content is split; the id of the first chunk is returned since
    /// that is the message users see the start of and reply to.
    async fn send(&self, channel_id: &str, content: &str) -> Result<SentMessage, ChannelError> {
        let mut first = None;
        for chunk in split_message(content, DISCORD_MAX_MESSAGE_LENGTH) {
            let sent = self.send_chunk(channel_id, &chunk).await?;
            first.get_or_insert(sent);
        }
        first.ok_or_else(|| ChannelError::InvalidResponse {
            platform: "discord".into(),
            reason: "nothing to send".into(),
        })
    }

    async fn fetch_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<FetchedMessage, ChannelError> {
        let resp = self
            .client
            .get(format!("{}/{message_id}", self.messages_url(channel_id)))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .send()
            .await
            .map_err(|e| request_failed("discord", e))?;

        if !resp.status().is_success() {
            return Err(status_error("discord", resp).await);
        }

        let parsed: MessageResponse = resp.json().await.map_err(|e| ChannelError::InvalidResponse {
            platform: "discord".into(),
            reason: e.to_string(),
        })?;
        Ok(FetchedMessage {
            id: parsed.id,
            author_id: parsed.author.map(|a| a.id).unwrap_or_default(),
            content: parsed.content,
        })
    }
}

/// Split text into chunks of at most `max_len` characters, preferring line
/// then word boundaries.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.chars().count() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        // Byte offset of the first char past the limit
        let limit = remaining
            .char_indices()
            .nth(max_len)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(limit);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { limit } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_message_short() {
        assert_eq!(split_message("Hello", 2000), vec!["Hello"]);
    }

    #[test]
    fn split_message_exact_limit() {
        let msg = "a".repeat(2000);
        let chunks = split_message(&msg, 2000);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn split_message_prefers_newline() {
        let msg = format!("{}\n{}", "a".repeat(1500), "b".repeat(1000));
        let chunks = split_message(&msg, 2000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(1500));
        assert_eq!(chunks[1], "b".repeat(1000));
    }

    #[test]
    fn split_message_multibyte() {
        let msg = "あ".repeat(2500);
        let chunks = split_message(&msg, 2000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 2000);
        assert_eq!(chunks[1].chars().count(), 500);
    }

    #[test]
    fn messages_url() {
        let client = DiscordClient::new(SecretString::from("token"));
        assert_eq!(
            client.messages_url("123"),
            "https://discord.com/api/v10/channels/123/messages"
        );
        assert_eq!(client.auth_header(), "Bot token");
    }
}
