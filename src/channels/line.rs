//! LINE Messaging API client.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::channels::{LineSender, SentMessage, request_failed, status_error};
use crate::error::ChannelError;
use crate::message::{MessageKind, OutboundMessage};

const API_BASE: &str = "https://api.line.me/v2/bot";
const DATA_API_BASE: &str = "https://api-data.line.me/v2/bot";

/// Per-request deadline, connect included.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// LINE accepts at most five message objects per request.
const MAX_MESSAGES_PER_REQUEST: usize = 5;

/// Maximum characters in a single text message object.
const MAX_TEXT_LENGTH: usize = 5000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    #[serde(default)]
    sent_messages: Vec<SentMessageEntry>,
}

#[derive(Debug, Deserialize)]
struct SentMessageEntry {
    id: String,
}

/// Thin `reqwest` wrapper over the push, reply and content endpoints.
pub struct LineClient {
    access_token: SecretString,
    client: reqwest::Client,
}

impl LineClient {
    pub fn new(access_token: SecretString) -> Self {
        Self {
            access_token,
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{API_BASE}/{path}")
    }

    async fn post_messages(&self, path: &str, body: Value) -> Result<SentMessage, ChannelError> {
        let resp = self
            .client
            .post(self.api_url(path))
            .bearer_auth(self.access_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| request_failed("line", e))?;

        if !resp.status().is_success() {
            return Err(status_error("line", resp).await);
        }

        let parsed: SendResponse = resp.json().await.map_err(|e| ChannelError::InvalidResponse {
            platform: "line".into(),
            reason: e.to_string(),
        })?;

        // The first sent message is the one replies will quote.
        parsed
            .sent_messages
            .into_iter()
            .next()
            .map(|m| SentMessage { message_id: m.id })
            .ok_or_else(|| ChannelError::InvalidResponse {
                platform: "line".into(),
                reason: "response carried no sentMessages".into(),
            })
    }
}

#[async_trait]
impl LineSender for LineClient {
    async fn push(&self, to: &str, messages: &[OutboundMessage]) -> Result<SentMessage, ChannelError> {
        let body = json!({
            "to": to,
            "messages": message_objects(messages),
        });
        let sent = self.post_messages("message/push", body).await?;
        tracing::debug!(to, message_id = %sent.message_id, "LINE push sent");
        Ok(sent)
    }

    async fn reply(
        &self,
        reply_token: &str,
        messages: &[OutboundMessage],
    ) -> Result<SentMessage, ChannelError> {
        let body = json!({
            "replyToken": reply_token,
            "messages": message_objects(messages),
        });
        self.post_messages("message/reply", body).await
    }

    async fn fetch_content(&self, message_id: &str) -> Result<Vec<u8>, ChannelError> {
        let resp = self
            .client
            .get(format!("{DATA_API_BASE}/message/{message_id}/content"))
            .bearer_auth(self.access_token.expose_secret())
            .send()
            .await
            .map_err(|e| request_failed("line", e))?;

        if !resp.status().is_success() {
            return Err(status_error("line", resp).await);
        }

        let bytes = resp.bytes().await.map_err(|e| request_failed("line", e))?;
        Ok(bytes.to_vec())
    }
}

/// Convert outbound messages into LINE message objects.
fn message_objects(messages: &[OutboundMessage]) -> Vec<Value> {
    messages
        .iter()
        .take(MAX_MESSAGES_PER_REQUEST)
        .map(message_object)
        .collect()
}

fn message_object(message: &OutboundMessage) -> Value {
    match (message.kind, message.media_url.as_deref()) {
        (MessageKind::Image, Some(url)) => json!({
            "type": "image",
            "originalContentUrl": url,
            "previewImageUrl": url,
        }),
        // Other media need metadata LINE requires up front (duration,
        // preview); send the link instead.
        (kind, Some(url)) if kind.is_media() => {
            let link = format!("{}: {url}", kind.as_str());
            if message.text.is_empty() {
                text_object(&link)
            } else {
                text_object(&format!("{}\n{link}", message.text))
            }
        }
        _ => text_object(&message.text),
    }
}

fn text_object(text: &str) -> Value {
    // LINE rejects empty text objects.
    let text: String = if text.is_empty() {
        " ".to_string()
    } else {
        text.chars().take(MAX_TEXT_LENGTH).collect()
    };
    json!({"type": "text", "text": text})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_message_object() {
        let v = message_object(&OutboundMessage::text("hello"));
        assert_eq!(v, json!({"type": "text", "text": "hello"}));
    }

    #[test]
    fn image_message_object() {
        let v = message_object(&OutboundMessage::media(MessageKind::Image, "https://cdn/x.png"));
        assert_eq!(v["type"], "image");
        assert_eq!(v["originalContentUrl"], "https://cdn/x.png");
        assert_eq!(v["previewImageUrl"], "https://cdn/x.png");
    }

    #[test]
    fn other_media_becomes_link() {
        let v = message_object(&OutboundMessage::media(MessageKind::File, "https://cdn/doc.pdf"));
        assert_eq!(v, json!({"type": "text", "text": "file: https://cdn/doc.pdf"}));

        let mut captioned = OutboundMessage::media(MessageKind::Video, "https://cdn/v.mp4");
        captioned.text = "Alice:".into();
        let v = message_object(&captioned);
        assert_eq!(v["text"], "Alice:\nvideo: https://cdn/v.mp4");
    }

    #[test]
    fn long_text_is_capped() {
        let v = message_object(&OutboundMessage::text("a".repeat(MAX_TEXT_LENGTH + 10)));
        assert_eq!(v["text"].as_str().unwrap().chars().count(), MAX_TEXT_LENGTH);
    }

    #[test]
    fn at_most_five_objects() {
        let messages: Vec<_> = (0..7).map(|i| OutboundMessage::text(i.to_string())).collect();
        assert_eq!(message_objects(&messages).len(), MAX_MESSAGES_PER_REQUEST);
    }

    #[test]
    fn api_url() {
        let client = LineClient::new(SecretString::from("token"));
        assert_eq!(
            client.api_url("message/push"),
            "https://api.line.me/v2/bot/message/push"
        );
    }
}
