//! Shared message types used across the bridge core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two platforms the bridge connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// LINE Messaging API. Sends are metered against a monthly quota.
    Line,
    /// Discord. Quota-free.
    Discord,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Line => "line",
            Self::Discord => "discord",
        }
    }

    /// The platform on the other side of the bridge.
    pub fn counterpart(&self) -> Self {
        match self {
            Self::Line => Self::Discord,
            Self::Discord => Self::Line,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index direction for correlation lookups.
///
/// `LineToDiscord` is keyed by LINE message ids and yields Discord ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    LineToDiscord,
    DiscordToLine,
}

impl Direction {
    /// Direction whose keys are ids native to `platform`.
    pub fn keyed_by(platform: Platform) -> Self {
        match platform {
            Platform::Line => Self::LineToDiscord,
            Platform::Discord => Self::DiscordToLine,
        }
    }

    pub fn reverse(&self) -> Self {
        match self {
            Self::LineToDiscord => Self::DiscordToLine,
            Self::DiscordToLine => Self::LineToDiscord,
        }
    }
}

/// Message content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    File,
    Sticker,
    Location,
}

impl MessageKind {
    /// Whether the message carries media content.
    pub fn is_media(&self) -> bool {
        matches!(self, Self::Image | Self::Video | Self::Audio | Self::File)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::File => "file",
            Self::Sticker => "sticker",
            Self::Location => "location",
        }
    }
}

/// A message on its way out to a platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    /// Body for text messages; caption or placeholder otherwise.
    pub text: String,
    /// Public URL of the media, for media kinds.
    pub media_url: Option<String>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            text: text.into(),
            media_url: None,
        }
    }

    pub fn media(kind: MessageKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            text: String::new(),
            media_url: Some(url.into()),
        }
    }
}

/// Unified inbound message from either platform.
///
/// Webhook handlers convert the native payloads into this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Platform-native message id.
    pub id: String,
    pub platform: Platform,
    /// LINE source (user, group or room id) or Discord channel id.
    pub channel_id: String,
    pub author_id: String,
    #[serde(default)]
    pub author_name: Option<String>,
    pub kind: MessageKind,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media_url: Option<String>,
    /// Native reply reference (LINE `quotedMessageId`).
    #[serde(default)]
    pub native_reply_to: Option<String>,
    /// Id of the message this one references (Discord message reference).
    #[serde(default)]
    pub referenced_id: Option<String>,
    /// Text of the referenced message, when the platform delivered it inline.
    #[serde(default)]
    pub referenced_content: Option<String>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Display name to prefix forwarded messages with.
    pub fn display_author(&self) -> &str {
        self.author_name.as_deref().unwrap_or(&self.author_id)
    }
}

/// Truncate to at most `max` characters, appending an ellipsis when cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kinds() {
        assert!(MessageKind::Image.is_media());
        assert!(MessageKind::File.is_media());
        assert!(!MessageKind::Text.is_media());
        assert!(!MessageKind::Sticker.is_media());
    }

    #[test]
    fn direction_keyed_by_source_platform() {
        assert_eq!(Direction::keyed_by(Platform::Line), Direction::LineToDiscord);
        assert_eq!(Direction::keyed_by(Platform::Discord).reverse(), Direction::LineToDiscord);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("こんにちは世界", 5), "こんにちは…");
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
