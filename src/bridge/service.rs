//! Entry points the webhook layer calls.
//!
//! LINE → Discord is forwarded directly, since Discord has no send quota.
//! Discord → LINE goes through the delivery queue. Every inbound message is
//! first offered to the guarded reply path. When it yields a chained reply,
//! that text is forwarded in place of the plain rendering; either way the
//! message is sent exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::channels::DiscordSender;
use crate::config::{BridgeConfig, ReplyConfig, Route};
use crate::correlation::{CorrelationMeta, CorrelationStore};
use crate::delivery::{
    DeliveryOutcome, DeliveryQueue, DrainSummary, MessageOrigin, Priority, QueueStats,
};
use crate::message::{InboundMessage, MessageKind, OutboundMessage, Platform};
use crate::quota::{QuotaGovernor, QuotaStatus};
use crate::reply::{GuardStats, ReplyGuard, ReplyPlan, ReplyReconstructor};

use super::routes::RouteTable;

/// Shared services the bridge is built on.
pub struct BridgeDeps {
    pub correlations: Arc<CorrelationStore>,
    pub quota: Arc<QuotaGovernor>,
    pub queue: Arc<DeliveryQueue>,
    pub discord: Arc<dyn DiscordSender>,
}

/// Bridge behaviour settings.
#[derive(Debug, Clone, Default)]
pub struct BridgeOptions {
    pub routes: Vec<Route>,
    pub reply: ReplyConfig,
    /// Messages authored by this Discord user are never bridged.
    pub bot_user_id: Option<String>,
    /// Discord channel quota alerts are posted to.
    pub alert_channel_id: Option<String>,
}

impl BridgeOptions {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            routes: config.routes.clone(),
            reply: config.reply.clone(),
            bot_user_id: config.discord.bot_user_id.clone(),
            alert_channel_id: config.discord.alert_channel_id.clone(),
        }
    }
}

/// Why an inbound message was not bridged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// Authored by the bridge itself.
    OwnMessage,
    /// The conversation has no paired channel.
    NoRoute,
    /// Nothing to forward.
    Empty,
}

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum InboundOutcome {
    Ignored { reason: IgnoreReason },
    /// Posted to Discord. `reply_to` is set when it went out as a chained
    /// reply to that Discord message.
    Forwarded {
        message_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },
    /// Queued for LINE, chained to `reply_to` if set.
    Enqueued {
        priority: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },
    QueueFull,
    Failed { error: String },
}

/// Correlation index sizes.
#[derive(Debug, Clone, Serialize)]
pub struct CorrelationCounts {
    pub line_to_discord: usize,
    pub discord_to_line: usize,
}

/// Everything the stats endpoint reports.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStats {
    pub routes: usize,
    pub forwarded_to_discord: u64,
    pub enqueued_for_line: u64,
    pub forward_failures: u64,
    pub replies: GuardStats,
    pub unmatched_replies: u64,
    pub queue: QueueStats,
    pub quota: QuotaStatus,
    pub correlations: CorrelationCounts,
}

/// Result of a health probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    /// Reply detection self-test error, if it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_subsystem: Option<String>,
    pub quota_limit_reached: bool,
}

/// LINE ⇄ Discord bridge.
pub struct Bridge {
    routes: RouteTable,
    bot_user_id: Option<String>,
    alert_channel_id: Option<String>,
    correlations: Arc<CorrelationStore>,
    quota: Arc<QuotaGovernor>,
    queue: Arc<DeliveryQueue>,
    discord: Arc<dyn DiscordSender>,
    reconstructor: Arc<ReplyReconstructor>,
    reply_guard: ReplyGuard,
    forwarded_to_discord: AtomicU64,
    enqueued_for_line: AtomicU64,
    forward_failures: AtomicU64,
}

impl Bridge {
    pub fn new(options: BridgeOptions, deps: BridgeDeps) -> Arc<Self> {
        let timeout = options.reply.timeout;
        let reconstructor = Arc::new(ReplyReconstructor::new(
            options.reply,
            deps.correlations.clone(),
            deps.discord.clone(),
        ));
        let reply_guard = ReplyGuard::new(reconstructor.clone(), timeout);

        Arc::new(Self {
            routes: RouteTable::new(&options.routes),
            bot_user_id: options.bot_user_id,
            alert_channel_id: options.alert_channel_id,
            correlations: deps.correlations,
            quota: deps.quota,
            queue: deps.queue,
            discord: deps.discord,
            reconstructor,
            reply_guard,
            forwarded_to_discord: AtomicU64::new(0),
            enqueued_for_line: AtomicU64::new(0),
            forward_failures: AtomicU64::new(0),
        })
    }

    /// Queue a message for a LINE destination and kick the drain loop.
    pub async fn enqueue_outbound(
        &self,
        destination: &str,
        message: OutboundMessage,
        priority: Priority,
    ) -> bool {
        self.enqueue(destination, message, priority, None).await
    }

    async fn enqueue(
        &self,
        destination: &str,
        message: OutboundMessage,
        priority: Priority,
        origin: Option<MessageOrigin>,
    ) -> bool {
        let accepted = self
            .queue
            .enqueue_from(destination, message, priority, origin)
            .await;
        if accepted {
            self.enqueued_for_line.fetch_add(1, Ordering::Relaxed);
            self.queue.spawn_drain();
        }
        accepted
    }

    /// Bridge a message received from LINE.
    pub async fn handle_inbound_from_line(&self, message: &InboundMessage) -> InboundOutcome {
        let Some(channel_id) = self.routes.discord_for(&message.channel_id) else {
            debug!(source = %message.channel_id, "No route for LINE source, ignoring");
            return InboundOutcome::Ignored {
                reason: IgnoreReason::NoRoute,
            };
        };
        if is_blank(message) {
            return InboundOutcome::Ignored {
                reason: IgnoreReason::Empty,
            };
        }

        let (reply_to, content) = match self.chained_reply(message, Platform::Line).await {
            Some((counterpart_id, text)) => (Some(counterpart_id), text),
            None => (None, discord_content(message)),
        };
        match self.discord.send(channel_id, &content).await {
            Ok(sent) => {
                self.forwarded_to_discord.fetch_add(1, Ordering::Relaxed);
                self.record(Platform::Line, &message.id, &sent.message_id, meta_of(message))
                    .await;
                info!(
                    line_message_id = %message.id,
                    discord_message_id = %sent.message_id,
                    channel_id,
                    reply_to = reply_to.as_deref(),
                    "Forwarded LINE message to Discord"
                );
                InboundOutcome::Forwarded {
                    message_id: sent.message_id,
                    reply_to,
                }
            }
            Err(e) => {
                self.forward_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    line_message_id = %message.id,
                    channel_id,
                    error = %e,
                    "Failed to forward LINE message to Discord"
                );
                InboundOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Bridge a message received from Discord.
    pub async fn handle_inbound_from_discord(&self, message: &InboundMessage) -> InboundOutcome {
        if self.bot_user_id.as_deref() == Some(message.author_id.as_str()) {
            return InboundOutcome::Ignored {
                reason: IgnoreReason::OwnMessage,
            };
        }
        let Some(destination) = self.routes.line_for(&message.channel_id) else {
            debug!(channel_id = %message.channel_id, "No route for Discord channel, ignoring");
            return InboundOutcome::Ignored {
                reason: IgnoreReason::NoRoute,
            };
        };
        if is_blank(message) {
            return InboundOutcome::Ignored {
                reason: IgnoreReason::Empty,
            };
        }

        let mut outbound = line_outbound(message);
        let reply_to = match self.chained_reply(message, Platform::Discord).await {
            Some((counterpart_id, text)) => {
                outbound.text = text;
                Some(counterpart_id)
            }
            None => None,
        };
        let priority = if self.quota.classify(&outbound) {
            Priority::HIGH
        } else {
            Priority::NORMAL
        };
        let origin = MessageOrigin {
            platform: Platform::Discord,
            message_id: message.id.clone(),
            author_id: message.author_id.clone(),
            channel_id: message.channel_id.clone(),
            content: message.text.clone(),
        };

        if self.enqueue(destination, outbound, priority, Some(origin)).await {
            InboundOutcome::Enqueued {
                priority: priority.get(),
                reply_to,
            }
        } else {
            InboundOutcome::QueueFull
        }
    }

    /// Offer `message` to the reply path. Returns the counterpart id and the
    /// annotated text when it chained the message to an earlier one.
    async fn chained_reply(
        &self,
        message: &InboundMessage,
        platform: Platform,
    ) -> Option<(String, String)> {
        match self.reply_guard.prepare_reply(message, platform).await? {
            ReplyPlan::Chained {
                counterpart_id,
                text,
            } => Some((counterpart_id, text)),
            ReplyPlan::NotAReply | ReplyPlan::Unmatched => None,
        }
    }

    async fn record(&self, origin: Platform, source_id: &str, target_id: &str, meta: CorrelationMeta) {
        if let Err(e) = self.correlations.create(origin, source_id, target_id, meta).await {
            warn!(error = %e, source_id, target_id, "Correlation kept in memory only");
        }
    }

    /// Record a correlation for every Discord message the queue delivers.
    pub fn spawn_report_consumer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let bridge = Arc::clone(self);
        let mut reports = self.queue.subscribe();
        tokio::spawn(async move {
            loop {
                let report = match reports.recv().await {
                    Ok(report) => report,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Delivery report consumer lagged, correlations lost");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                match report.outcome {
                    DeliveryOutcome::Sent { message_id } => {
                        // A batched item maps every merged source to the one LINE message.
                        let (bridge, message_id) = (&bridge, &message_id);
                        join_all(report.origins.into_iter().map(|origin| async move {
                            bridge
                                .record(
                                    origin.platform,
                                    &origin.message_id,
                                    message_id,
                                    CorrelationMeta {
                                        source_user_id: origin.author_id,
                                        channel_id: origin.channel_id,
                                        content: origin.content,
                                    },
                                )
                                .await
                        }))
                        .await;
                    }
                    DeliveryOutcome::Dropped { reason } => {
                        debug!(item_id = %report.item_id, %reason, "Queued message not delivered");
                    }
                }
            }
        })
    }

    /// Post quota alerts to the configured Discord channel.
    pub fn spawn_alert_forwarder(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let channel_id = self.alert_channel_id.clone()?;
        let discord = Arc::clone(&self.discord);
        let mut alerts = self.quota.subscribe_alerts();
        Some(tokio::spawn(async move {
            loop {
                let alert = match alerts.recv().await {
                    Ok(alert) => alert,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                if let Err(e) = discord.send(&channel_id, &format!("⚠️ {alert}")).await {
                    warn!(error = %e, "Failed to post quota alert to Discord");
                }
            }
        }))
    }

    pub async fn flush_queue(&self) -> DrainSummary {
        self.queue.flush().await
    }

    pub async fn clear_queue(&self) -> usize {
        self.queue.clear().await
    }

    pub async fn stats(&self) -> BridgeStats {
        let (line_to_discord, discord_to_line) = self.correlations.len().await;
        BridgeStats {
            routes: self.routes.len(),
            forwarded_to_discord: self.forwarded_to_discord.load(Ordering::Relaxed),
            enqueued_for_line: self.enqueued_for_line.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
            replies: self.reply_guard.stats(),
            unmatched_replies: self.reconstructor.unmatched_count(),
            queue: self.queue.stats().await,
            quota: self.quota.status().await,
            correlations: CorrelationCounts {
                line_to_discord,
                discord_to_line,
            },
        }
    }

    /// The reply subsystem's health never makes the bridge unhealthy, only
    /// degraded.
    pub async fn health(&self) -> HealthReport {
        let reply_subsystem = self.reply_guard.health_check().await.err().map(|e| e.to_string());
        HealthReport {
            status: if reply_subsystem.is_some() { "degraded" } else { "ok" },
            reply_subsystem,
            quota_limit_reached: self.quota.status().await.limit_reached,
        }
    }
}

fn is_blank(message: &InboundMessage) -> bool {
    message.kind == MessageKind::Text && message.text.trim().is_empty()
}

fn meta_of(message: &InboundMessage) -> CorrelationMeta {
    CorrelationMeta {
        source_user_id: message.author_id.clone(),
        channel_id: message.channel_id.clone(),
        content: message.text.clone(),
    }
}

/// Discord rendering of a LINE message. Media becomes a placeholder line.
fn discord_content(message: &InboundMessage) -> String {
    let author = message.display_author();
    match message.kind {
        MessageKind::Text => format!("**{author}**: {}", message.text),
        kind => {
            let mut content = format!("**{author}** sent {}", placeholder_noun(kind));
            if !message.text.is_empty() {
                content.push_str(": ");
                content.push_str(&message.text);
            }
            if let Some(url) = &message.media_url {
                content.push('\n');
                content.push_str(url);
            }
            content
        }
    }
}

fn placeholder_noun(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "a message",
        MessageKind::Image => "an image",
        MessageKind::Video => "a video",
        MessageKind::Audio => "a voice message",
        MessageKind::File => "a file",
        MessageKind::Sticker => "a sticker",
        MessageKind::Location => "a location",
    }
}

/// LINE rendering of a Discord message.
fn line_outbound(message: &InboundMessage) -> OutboundMessage {
    let author = message.display_author();
    let text = if message.text.is_empty() {
        author.to_string()
    } else {
        format!("{author}: {}", message.text)
    };
    match (&message.media_url, message.kind.is_media()) {
        (Some(url), true) => OutboundMessage {
            kind: message.kind,
            text,
            media_url: Some(url.clone()),
        },
        _ => OutboundMessage::text(text),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn inbound(kind: MessageKind, text: &str) -> InboundMessage {
        InboundMessage {
            id: "1".into(),
            platform: Platform::Line,
            channel_id: "C1".into(),
            author_id: "U1".into(),
            author_name: Some("Alice".into()),
            kind,
            text: text.into(),
            media_url: None,
            native_reply_to: None,
            referenced_id: None,
            referenced_content: None,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn text_is_prefixed_with_author() {
        assert_eq!(discord_content(&inbound(MessageKind::Text, "hi")), "**Alice**: hi");
        assert_eq!(line_outbound(&inbound(MessageKind::Text, "hi")).text, "Alice: hi");
    }

    #[test]
    fn line_media_becomes_placeholder() {
        assert_eq!(
            discord_content(&inbound(MessageKind::Image, "")),
            "**Alice** sent an image"
        );
        assert_eq!(
            discord_content(&inbound(MessageKind::File, "report.pdf")),
            "**Alice** sent a file: report.pdf"
        );
    }

    #[test]
    fn discord_attachment_keeps_media() {
        let mut msg = inbound(MessageKind::Image, "look");
        msg.media_url = Some("https://cdn.discordapp.com/a.png".into());
        let out = line_outbound(&msg);
        assert_eq!(out.kind, MessageKind::Image);
        assert_eq!(out.media_url.as_deref(), Some("https://cdn.discordapp.com/a.png"));
        assert_eq!(out.text, "Alice: look");

        // No URL: fall back to text
        let out = line_outbound(&inbound(MessageKind::Video, ""));
        assert_eq!(out.kind, MessageKind::Text);
        assert_eq!(out.text, "Alice");
    }

    #[test]
    fn blank_text_is_ignored_but_media_is_not() {
        assert!(is_blank(&inbound(MessageKind::Text, "   ")));
        assert!(!is_blank(&inbound(MessageKind::Sticker, "")));
    }
}
