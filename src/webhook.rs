//! HTTP surface: LINE webhook, Discord relay, health, stats and admin.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::bridge::{Bridge, InboundOutcome};
use crate::message::{InboundMessage, MessageKind, Platform};

/// Build the router for all bridge endpoints.
pub fn bridge_routes(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/webhook/line", post(line_webhook))
        .route("/webhook/discord", post(discord_relay))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/admin/queue/flush", post(flush_queue))
        .route("/admin/queue/clear", post(clear_queue))
        .with_state(bridge)
}

// ── LINE ────────────────────────────────────────────────────────────────

/// Body LINE posts to the webhook URL.
#[derive(Debug, Deserialize)]
pub struct LineWebhookBody {
    #[serde(default)]
    pub events: Vec<LineEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub source: Option<LineSource>,
    #[serde(default)]
    pub message: Option<LineMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
}

impl LineSource {
    /// The conversation id: group or room when present, else the user.
    fn conversation_id(&self) -> Option<&str> {
        self.group_id
            .as_deref()
            .or(self.room_id.as_deref())
            .or(self.user_id.as_deref())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub quoted_message_id: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

/// Convert a LINE webhook event into an inbound message. Non-message events
/// and events without a source are skipped.
pub fn line_event_to_inbound(event: LineEvent) -> Option<InboundMessage> {
    if event.event_type != "message" {
        return None;
    }
    let source = event.source?;
    let message = event.message?;
    let channel_id = source.conversation_id()?.to_string();
    let author_id = source.user_id.clone().unwrap_or_else(|| channel_id.clone());

    let kind = match message.message_type.as_str() {
        "text" => MessageKind::Text,
        "image" => MessageKind::Image,
        "video" => MessageKind::Video,
        "audio" => MessageKind::Audio,
        "file" => MessageKind::File,
        "sticker" => MessageKind::Sticker,
        "location" => MessageKind::Location,
        other => {
            debug!(message_type = other, "Unsupported LINE message type");
            return None;
        }
    };
    let text = match kind {
        MessageKind::File => message.file_name.unwrap_or_default(),
        MessageKind::Location => message
            .title
            .into_iter()
            .chain(message.address)
            .collect::<Vec<_>>()
            .join(" "),
        _ => message.text.unwrap_or_default(),
    };

    Some(InboundMessage {
        id: message.id,
        platform: Platform::Line,
        channel_id,
        author_id,
        author_name: None,
        kind,
        text,
        media_url: None,
        native_reply_to: message.quoted_message_id,
        referenced_id: None,
        referenced_content: None,
        received_at: event
            .timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now),
    })
}

async fn line_webhook(
    State(bridge): State<Arc<Bridge>>,
    Json(body): Json<LineWebhookBody>,
) -> impl IntoResponse {
    let mut outcomes = Vec::new();
    for event in body.events {
        let Some(message) = line_event_to_inbound(event) else {
            continue;
        };
        outcomes.push(bridge.handle_inbound_from_line(&message).await);
    }
    // LINE retries anything but 200, so the status never reflects outcomes.
    (StatusCode::OK, Json(serde_json::json!({ "results": outcomes })))
}

// ── Discord ─────────────────────────────────────────────────────────────

/// Message relayed by the Discord gateway process.
#[derive(Debug, Deserialize)]
pub struct DiscordRelayMessage {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<DiscordAttachment>,
    #[serde(default)]
    pub referenced_message: Option<DiscordReference>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct DiscordAttachment {
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DiscordReference {
    pub id: String,
    #[serde(default)]
    pub content: Option<String>,
}

impl DiscordAttachment {
    fn kind(&self) -> MessageKind {
        match self.content_type.as_deref() {
            Some(t) if t.starts_with("image/") => MessageKind::Image,
            Some(t) if t.starts_with("video/") => MessageKind::Video,
            Some(t) if t.starts_with("audio/") => MessageKind::Audio,
            _ => MessageKind::File,
        }
    }
}

impl From<DiscordRelayMessage> for InboundMessage {
    /// Only the first attachment is carried.
    fn from(relay: DiscordRelayMessage) -> Self {
        let attachment = relay.attachments.into_iter().next();
        let (kind, media_url) = match attachment {
            Some(a) => (a.kind(), Some(a.url)),
            None => (MessageKind::Text, None),
        };
        let (referenced_id, referenced_content) = match relay.referenced_message {
            Some(r) => (Some(r.id), r.content),
            None => (None, None),
        };
        InboundMessage {
            id: relay.id,
            platform: Platform::Discord,
            channel_id: relay.channel_id,
            author_id: relay.author_id,
            author_name: relay.author_name,
            kind,
            text: relay.content,
            media_url,
            native_reply_to: None,
            referenced_id,
            referenced_content,
            received_at: relay.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

async fn discord_relay(
    State(bridge): State<Arc<Bridge>>,
    Json(relay): Json<DiscordRelayMessage>,
) -> impl IntoResponse {
    let message = InboundMessage::from(relay);
    let outcome = bridge.handle_inbound_from_discord(&message).await;
    let status = match outcome {
        InboundOutcome::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
        InboundOutcome::Failed { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::OK,
    };
    (status, Json(outcome))
}

// ── Health & stats ──────────────────────────────────────────────────────

async fn health(State(bridge): State<Arc<Bridge>>) -> impl IntoResponse {
    Json(bridge.health().await)
}

async fn stats(State(bridge): State<Arc<Bridge>>) -> impl IntoResponse {
    Json(bridge.stats().await)
}

// ── Admin ───────────────────────────────────────────────────────────────

async fn flush_queue(State(bridge): State<Arc<Bridge>>) -> impl IntoResponse {
    let summary = bridge.flush_queue().await;
    info!(?summary, "Queue flushed via admin endpoint");
    Json(summary)
}

async fn clear_queue(State(bridge): State<Arc<Bridge>>) -> impl IntoResponse {
    let cleared = bridge.clear_queue().await;
    Json(serde_json::json!({ "cleared": cleared }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(json: serde_json::Value) -> LineEvent {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn text_event_with_quote() {
        let msg = line_event_to_inbound(event(serde_json::json!({
            "type": "message",
            "timestamp": 1_700_000_000_000i64,
            "source": { "type": "group", "groupId": "Cgroup", "userId": "Uuser" },
            "message": { "id": "468789", "type": "text", "text": "ok", "quotedMessageId": "468700" }
        })))
        .unwrap();

        assert_eq!(msg.channel_id, "Cgroup");
        assert_eq!(msg.author_id, "Uuser");
        assert_eq!(msg.native_reply_to.as_deref(), Some("468700"));
        assert_eq!(msg.received_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn one_on_one_uses_user_id() {
        let msg = line_event_to_inbound(event(serde_json::json!({
            "type": "message",
            "source": { "type": "user", "userId": "Uuser" },
            "message": { "id": "1", "type": "file", "fileName": "notes.pdf" }
        })))
        .unwrap();
        assert_eq!(msg.channel_id, "Uuser");
        assert_eq!(msg.kind, MessageKind::File);
        assert_eq!(msg.text, "notes.pdf");
    }

    #[test]
    fn non_message_events_are_skipped() {
        assert!(line_event_to_inbound(event(serde_json::json!({
            "type": "follow",
            "source": { "type": "user", "userId": "Uuser" }
        })))
        .is_none());
    }

    #[test]
    fn discord_relay_conversion() {
        let relay: DiscordRelayMessage = serde_json::from_value(serde_json::json!({
            "id": "D2",
            "channel_id": "111",
            "author_id": "A1",
            "content": "nice",
            "attachments": [{ "url": "https://cdn/x.png", "content_type": "image/png" }],
            "referenced_message": { "id": "D1", "content": "[ref:L1]" }
        }))
        .unwrap();
        let msg = InboundMessage::from(relay);
        assert_eq!(msg.kind, MessageKind::Image);
        assert_eq!(msg.media_url.as_deref(), Some("https://cdn/x.png"));
        assert_eq!(msg.referenced_id.as_deref(), Some("D1"));
        assert_eq!(msg.referenced_content.as_deref(), Some("[ref:L1]"));
    }
}
