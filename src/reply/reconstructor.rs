//! Reply reconstruction — carry reply relationships across the bridge.
//!
//! A reply on one platform is detected, the replied-to message is mapped to
//! its copy on the other platform through the correlation store, and a
//! reply-annotated text embedding that copy's id is produced. Because the id
//! is embedded as a token, a reply to the annotated message can be resolved
//! the same way, to any depth.
//!
//! Nothing here sends. The bridge delivers the annotated text on its normal
//! forwarding path, in place of the plain rendering.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::channels::DiscordSender;
use crate::config::ReplyConfig;
use crate::correlation::{CorrelationStore, MessageCorrelation};
use crate::error::ReplyError;
use crate::message::{Direction, InboundMessage, Platform, truncate_chars};

use super::matchers::{ReplyMatcher, default_matchers, first_match, ref_token};

/// A detected reply: which message is being answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyIntent {
    /// Id of the replied-to message, native to `platform`.
    pub originating_id: String,
    /// Platform the reply was written on.
    pub platform: Platform,
    /// Detection strategy that produced the intent.
    pub strategy: &'static str,
}

/// The replied-to message mapped onto the other platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedReply {
    pub intent: ReplyIntent,
    /// Id of the replied-to message's counterpart on the other platform.
    pub counterpart_id: String,
    /// Content of the replied-to message, as recorded at bridging time.
    pub content_snapshot: String,
}

/// What the reply path decided for one inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ReplyPlan {
    /// No reply intent found.
    NotAReply,
    /// A reply, but its target was never bridged or has expired.
    Unmatched,
    /// Forward `text` instead of the plain rendering.
    Chained { counterpart_id: String, text: String },
}

/// Correlation reads the reply path depends on.
#[async_trait]
pub trait CorrelationIndex: Send + Sync {
    async fn find(
        &self,
        id: &str,
        direction: Direction,
    ) -> Result<Option<MessageCorrelation>, ReplyError>;
}

#[async_trait]
impl CorrelationIndex for CorrelationStore {
    async fn find(
        &self,
        id: &str,
        direction: Direction,
    ) -> Result<Option<MessageCorrelation>, ReplyError> {
        Ok(self.get(id, direction).await)
    }
}

/// The reply operations the isolation guard wraps.
#[async_trait]
pub trait ReplyHandler: Send + Sync {
    /// Detect, resolve and format a reply for `message`. Must not send.
    async fn prepare_reply(
        &self,
        message: &InboundMessage,
        platform: Platform,
    ) -> Result<ReplyPlan, ReplyError>;

    /// Cheap check that detection still works.
    fn self_test(&self) -> Result<(), ReplyError>;
}

/// Detects and rebuilds cross-platform reply chains.
pub struct ReplyReconstructor {
    config: ReplyConfig,
    correlations: Arc<dyn CorrelationIndex>,
    discord: Arc<dyn DiscordSender>,
    matchers: Vec<ReplyMatcher>,
    unmatched: AtomicU64,
}

impl ReplyReconstructor {
    pub fn new(
        config: ReplyConfig,
        correlations: Arc<dyn CorrelationIndex>,
        discord: Arc<dyn DiscordSender>,
    ) -> Self {
        Self {
            config,
            correlations,
            discord,
            matchers: default_matchers(),
            unmatched: AtomicU64::new(0),
        }
    }

    /// Replies whose target could not be resolved.
    pub fn unmatched_count(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    /// Find a reply intent in `message`.
    ///
    /// LINE carries a native quote reference. Discord is matched on text: the
    /// message's own text first, then its native reference, then whatever
    /// text the referenced message carried.
    pub fn detect(&self, message: &InboundMessage, platform: Platform) -> Option<ReplyIntent> {
        let intent = |(strategy, id): (&'static str, String)| ReplyIntent {
            originating_id: id,
            platform,
            strategy,
        };

        match platform {
            Platform::Line => message
                .native_reply_to
                .clone()
                .map(|id| ("line_quote", id))
                .or_else(|| first_match(&self.matchers, &message.text))
                .map(intent),
            Platform::Discord => first_match(&self.matchers, &message.text)
                .or_else(|| {
                    message
                        .referenced_id
                        .clone()
                        .map(|id| ("discord_reference", id))
                })
                .or_else(|| {
                    message
                        .referenced_content
                        .as_deref()
                        .and_then(|content| first_match(&self.matchers, content))
                })
                .map(intent),
        }
    }

    /// Map the replied-to message onto the other platform.
    pub async fn resolve(&self, intent: &ReplyIntent) -> Result<Option<ResolvedReply>, ReplyError> {
        let direction = Direction::keyed_by(intent.platform);
        let found = self
            .correlations
            .find(&intent.originating_id, direction)
            .await?;

        Ok(found.and_then(|c| {
            let counterpart_id = c.counterpart_of(&intent.originating_id)?.to_string();
            Some(ResolvedReply {
                intent: intent.clone(),
                counterpart_id,
                content_snapshot: c.content_snapshot,
            })
        }))
    }

    /// Build the reply-annotated text. The counterpart id is embedded as a
    /// token `detect` recognises.
    pub fn format(&self, resolved: &ResolvedReply, author: &str, body: &str) -> String {
        let snippet = truncate_chars(
            &resolved.content_snapshot.replace('\n', " "),
            self.config.snippet_chars,
        );
        format!(
            "↩️ {author} replied to \"{snippet}\" {}\n{body}",
            ref_token(&resolved.counterpart_id)
        )
    }

    /// For a Discord reply whose reference did not resolve, look for a token
    /// inside the referenced message itself.
    async fn resolve_via_referenced_content(
        &self,
        message: &InboundMessage,
    ) -> Result<Option<ResolvedReply>, ReplyError> {
        let Some(referenced_id) = message.referenced_id.as_deref() else {
            return Ok(None);
        };
        let content = match &message.referenced_content {
            Some(content) => content.clone(),
            None => {
                self.discord
                    .fetch_message(&message.channel_id, referenced_id)
                    .await?
                    .content
            }
        };
        let Some((strategy, id)) = first_match(&self.matchers, &content) else {
            return Ok(None);
        };
        let intent = ReplyIntent {
            originating_id: id,
            platform: Platform::Discord,
            strategy,
        };
        self.resolve(&intent).await
    }
}

#[async_trait]
impl ReplyHandler for ReplyReconstructor {
    async fn prepare_reply(
        &self,
        message: &InboundMessage,
        platform: Platform,
    ) -> Result<ReplyPlan, ReplyError> {
        let Some(intent) = self.detect(message, platform) else {
            return Ok(ReplyPlan::NotAReply);
        };
        debug!(
            message_id = %message.id,
            originating_id = %intent.originating_id,
            strategy = intent.strategy,
            "Reply intent detected"
        );

        let mut resolved = self.resolve(&intent).await?;
        if resolved.is_none() && intent.strategy == "discord_reference" {
            resolved = self.resolve_via_referenced_content(message).await?;
        }

        let Some(resolved) = resolved else {
            self.unmatched.fetch_add(1, Ordering::Relaxed);
            info!(
                message_id = %message.id,
                originating_id = %intent.originating_id,
                platform = %platform,
                "Reply target not bridged, forwarding unchained"
            );
            return Ok(ReplyPlan::Unmatched);
        };

        let text = self.format(&resolved, message.display_author(), &message.text);
        debug!(
            message_id = %message.id,
            counterpart_id = %resolved.counterpart_id,
            "Reply chained"
        );
        Ok(ReplyPlan::Chained {
            counterpart_id: resolved.counterpart_id,
            text,
        })
    }

    fn self_test(&self) -> Result<(), ReplyError> {
        match self.matchers.iter().find(|m| !m.self_test()) {
            Some(m) => Err(ReplyError::SelfTest {
                matcher: m.name.to_string(),
            }),
            None => Ok(()),
        }
    }
}
