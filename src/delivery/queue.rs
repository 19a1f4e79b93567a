//! Delivery queue — bounded, priority-ordered, quota-aware LINE outbox.
//!
//! Items are kept sorted by priority (descending) then arrival. A single
//! drain loop at a time pops the head, asks the quota governor for
//! admission, pushes through the LINE sender and spaces sends by a fixed
//! interval. When the monthly budget runs out the loop parks and a timer
//! retries after a backoff.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::channels::LineSender;
use crate::config::QueueConfig;
use crate::error::DeliveryError;
use crate::message::{MessageKind, OutboundMessage};
use crate::quota::QuotaGovernor;

use super::item::{
    DeliveryOutcome, DeliveryReport, DrainSummary, DropReason, ItemState, MessageOrigin, Priority,
    QueueItem,
};

const REPORT_CHANNEL_CAPACITY: usize = 1024;

/// Queue counters, for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub length: usize,
    pub in_flight: usize,
    pub capacity: usize,
    pub sent: u64,
    pub dropped: u64,
    pub retried: u64,
    /// Enqueues refused because the queue was full.
    pub rejected: u64,
    pub draining: bool,
}

struct QueueInner {
    items: VecDeque<QueueItem>,
    /// Items popped by the drain loop and not yet settled. They still count
    /// against capacity so a retry always has room to go back.
    in_flight: usize,
    next_seq: u64,
}

/// Why a drain cycle stopped.
enum CycleEnd {
    Empty,
    QuotaHeld,
}

/// Resets the drain flag when the cycle ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Bounded outbound queue in front of the LINE push API.
pub struct DeliveryQueue {
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    quota: Arc<QuotaGovernor>,
    sender: Arc<dyn LineSender>,
    reports_tx: broadcast::Sender<DeliveryReport>,
    draining: AtomicBool,
    backoff_scheduled: AtomicBool,
    sent: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
    rejected: AtomicU64,
}

impl DeliveryQueue {
    pub fn new(
        config: QueueConfig,
        quota: Arc<QuotaGovernor>,
        sender: Arc<dyn LineSender>,
    ) -> Arc<Self> {
        let (reports_tx, _rx) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                in_flight: 0,
                next_seq: 0,
            }),
            quota,
            sender,
            reports_tx,
            draining: AtomicBool::new(false),
            backoff_scheduled: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Subscribe to terminal delivery outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryReport> {
        self.reports_tx.subscribe()
    }

    /// Queue a message for `destination`.
    ///
    /// Returns `false` without side effects when the queue is full. Text for
    /// a destination that already has an unsent text item opened within the
    /// batch window is appended to that item as a new line.
    pub async fn enqueue(
        &self,
        destination: &str,
        message: OutboundMessage,
        priority: Priority,
    ) -> bool {
        self.enqueue_from(destination, message, priority, None).await
    }

    /// Like [`enqueue`](Self::enqueue), remembering which inbound message
    /// produced this one.
    pub async fn enqueue_from(
        &self,
        destination: &str,
        message: OutboundMessage,
        priority: Priority,
        origin: Option<MessageOrigin>,
    ) -> bool {
        let mut inner = self.inner.lock().await;

        let batch = if message.kind == MessageKind::Text {
            self.batch_target(&inner.items, destination)
                .and_then(|pos| inner.items.remove(pos))
        } else {
            None
        };
        if let Some(mut item) = batch {
            item.payload.text.push('\n');
            item.payload.text.push_str(&message.text);
            item.lines += 1;
            item.priority = item.priority.max(priority);
            item.origins.extend(origin);
            debug!(
                item_id = %item.id,
                destination,
                lines = item.lines,
                "Batched text into queued item"
            );
            insert_sorted(&mut inner.items, item);
            return true;
        }

        // Merging above never grows the queue, so only new items hit the bound.
        if inner.items.len() + inner.in_flight >= self.config.capacity {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                destination,
                capacity = self.config.capacity,
                "Delivery queue full, rejecting message"
            );
            return false;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let item = QueueItem::new(
            destination.to_string(),
            message,
            priority,
            self.config.max_attempts,
            origin,
            seq,
        );
        info!(
            item_id = %item.id,
            destination,
            priority = priority.get(),
            kind = item.payload.kind.as_str(),
            "Message enqueued"
        );
        insert_sorted(&mut inner.items, item);
        true
    }

    /// Index of a queued text item for `destination` that can take another line.
    fn batch_target(&self, items: &VecDeque<QueueItem>, destination: &str) -> Option<usize> {
        items.iter().position(|item| {
            item.destination == destination
                && item.payload.kind == MessageKind::Text
                && item.attempt == 0
                && item.lines < self.config.max_batch_lines
                && item.batch_opened.elapsed() < self.config.batch_window
        })
    }

    /// Deliver queued items until the queue is empty or the quota runs out.
    ///
    /// Only one drain runs at a time; a concurrent call returns immediately
    /// with `skipped` set.
    pub async fn drain(self: &Arc<Self>) -> DrainSummary {
        let mut summary = DrainSummary::default();
        let mut first_cycle = true;

        loop {
            let Some(guard) = DrainGuard::acquire(&self.draining) else {
                // The running drain will pick up whatever is queued.
                summary.skipped = first_cycle;
                return summary;
            };
            first_cycle = false;

            let end = self.drain_cycle(&mut summary).await;
            drop(guard);

            match end {
                CycleEnd::QuotaHeld => {
                    summary.held = self.len().await;
                    info!(
                        held = summary.held,
                        backoff_secs = self.config.quota_backoff.as_secs(),
                        "Quota exhausted, parking delivery queue"
                    );
                    self.schedule_backoff();
                    return summary;
                }
                // An enqueue may have slipped in between the last pop and the
                // flag being cleared; go round again rather than strand it.
                CycleEnd::Empty if self.is_empty().await => return summary,
                CycleEnd::Empty => continue,
            }
        }
    }

    async fn drain_cycle(&self, summary: &mut DrainSummary) -> CycleEnd {
        loop {
            let can_send = self.quota.can_send().await;

            let mut item = {
                let mut inner = self.inner.lock().await;
                if inner.items.is_empty() {
                    return CycleEnd::Empty;
                }
                let picked = if can_send {
                    inner.items.pop_front()
                } else {
                    // Over budget: only important items may still go out.
                    let pos = inner
                        .items
                        .iter()
                        .position(|item| self.quota.classify(&item.payload));
                    pos.and_then(|pos| inner.items.remove(pos))
                };
                match picked {
                    Some(item) => {
                        inner.in_flight += 1;
                        item
                    }
                    None => return CycleEnd::QuotaHeld,
                }
            };

            let admission = self.quota.should_admit(&item.payload).await;
            if !admission.allowed {
                if self.quota.classify(&item.payload) {
                    // Important but past the hard limit: hold it.
                    let mut inner = self.inner.lock().await;
                    inner.in_flight -= 1;
                    inner.items.push_front(item);
                    return CycleEnd::QuotaHeld;
                }
                warn!(
                    item_id = %item.id,
                    destination = %item.destination,
                    reason = %admission.reason,
                    "Message not admitted, dropping"
                );
                self.settle_dropped(&mut item, DropReason::Rejected(admission.reason))
                    .await;
                summary.dropped += 1;
                continue;
            }

            item.state = ItemState::Admitted;
            debug!(item_id = %item.id, reason = %admission.reason, "Message admitted");

            item.state = ItemState::Sending;
            item.attempt += 1;
            let started = Instant::now();
            let push = self
                .sender
                .push(&item.destination, std::slice::from_ref(&item.payload));
            let result = match tokio::time::timeout(self.config.send_timeout, push).await {
                Ok(result) => result.map_err(DeliveryError::from),
                Err(_) => Err(DeliveryError::timed_out(self.config.send_timeout)),
            };

            match result {
                Ok(sent) => {
                    self.quota.record_sent().await;
                    item.state = ItemState::Sent;
                    info!(
                        item_id = %item.id,
                        destination = %item.destination,
                        message_id = %sent.message_id,
                        attempt = item.attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Message delivered"
                    );
                    self.sent.fetch_add(1, Ordering::Relaxed);
                    self.inner.lock().await.in_flight -= 1;
                    self.publish(&item, DeliveryOutcome::Sent {
                        message_id: sent.message_id,
                    });
                    summary.sent += 1;
                }
                Err(err) if err.is_transient() && item.attempt < item.max_attempts => {
                    item.state = ItemState::Retry(item.attempt);
                    warn!(
                        item_id = %item.id,
                        attempt = item.attempt,
                        max_attempts = item.max_attempts,
                        error = %err,
                        "Transient delivery failure, retrying"
                    );
                    self.retried.fetch_add(1, Ordering::Relaxed);
                    let mut inner = self.inner.lock().await;
                    inner.in_flight -= 1;
                    inner.items.push_front(item);
                    summary.retried += 1;
                }
                Err(err) => {
                    if err.status() == Some(429) && err.to_string().contains("monthly limit") {
                        self.quota.mark_limit_reached().await;
                    }
                    let reason = if err.is_transient() {
                        DropReason::AttemptsExhausted(err.to_string())
                    } else {
                        DropReason::Permanent(err.to_string())
                    };
                    error!(
                        item_id = %item.id,
                        destination = %item.destination,
                        attempt = item.attempt,
                        retry_after_secs = err.retry_after().map(|d| d.as_secs()),
                        error = %err,
                        "Delivery failed, dropping message"
                    );
                    self.settle_dropped(&mut item, reason).await;
                    summary.dropped += 1;
                }
            }

            tokio::time::sleep(self.config.send_interval).await;
        }
    }

    async fn settle_dropped(&self, item: &mut QueueItem, reason: DropReason) {
        item.state = ItemState::Dropped;
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().await.in_flight -= 1;
        self.publish(item, DeliveryOutcome::Dropped { reason });
    }

    fn publish(&self, item: &QueueItem, outcome: DeliveryOutcome) {
        // Ok if nobody is subscribed
        let _ = self.reports_tx.send(DeliveryReport {
            item_id: item.id,
            destination: item.destination.clone(),
            payload: item.payload.clone(),
            origins: item.origins.clone(),
            attempts: item.attempt,
            outcome,
        });
    }

    /// Re-run `drain()` once after the quota backoff. At most one timer is
    /// pending at a time.
    fn schedule_backoff(self: &Arc<Self>) {
        if self.backoff_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(queue.config.quota_backoff).await;
            queue.backoff_scheduled.store(false, Ordering::Release);
            let summary = queue.drain().await;
            debug!(?summary, "Backoff drain finished");
        });
    }

    /// Start a drain in the background and log its summary.
    pub fn spawn_drain(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let summary = queue.drain().await;
            if !summary.skipped {
                debug!(?summary, "Drain finished");
            }
        })
    }

    /// Drain immediately, without waiting for a pending backoff timer.
    ///
    /// The drain runs on its own task, so a caller that stops waiting does
    /// not cancel it halfway through a send.
    pub async fn flush(self: &Arc<Self>) -> DrainSummary {
        let length = self.len().await;
        info!(length, "Flushing delivery queue");
        let queue = Arc::clone(self);
        match tokio::spawn(async move { queue.drain().await }).await {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "Flush drain task failed");
                DrainSummary::default()
            }
        }
    }

    /// Discard every queued item. Returns how many were discarded.
    pub async fn clear(&self) -> usize {
        let drained: Vec<QueueItem> = {
            let mut inner = self.inner.lock().await;
            inner.items.drain(..).collect()
        };
        for mut item in drained.iter().cloned() {
            item.state = ItemState::Dropped;
            self.publish(&item, DeliveryOutcome::Dropped {
                reason: DropReason::Cleared,
            });
        }
        self.dropped
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        warn!(count = drained.len(), "Delivery queue cleared");
        drained.len()
    }

    /// Queued items, excluding one currently being sent.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.items.is_empty()
    }

    /// Snapshot of the queued items in delivery order.
    pub async fn snapshot(&self) -> Vec<QueueItem> {
        self.inner.lock().await.items.iter().cloned().collect()
    }

    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        QueueStats {
            length: inner.items.len(),
            in_flight: inner.in_flight,
            capacity: self.config.capacity,
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            draining: self.draining.load(Ordering::Acquire),
        }
    }
}

/// Insert keeping `(priority desc, seq asc)` order.
fn insert_sorted(items: &mut VecDeque<QueueItem>, item: QueueItem) {
    let pos = items
        .iter()
        .position(|existing| item.goes_before(existing))
        .unwrap_or(items.len());
    items.insert(pos, item);
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::channels::SentMessage;
    use crate::config::QuotaConfig;
    use crate::error::ChannelError;

    /// Records pushes; fails with the scripted errors first.
    #[derive(Default)]
    struct ScriptedLine {
        pushed: StdMutex<Vec<(String, String)>>,
        failures: StdMutex<VecDeque<ChannelError>>,
    }

    impl ScriptedLine {
        fn failing_with(errors: Vec<ChannelError>) -> Arc<Self> {
            Arc::new(Self {
                pushed: StdMutex::new(Vec::new()),
                failures: StdMutex::new(errors.into()),
            })
        }

        fn pushed(&self) -> Vec<(String, String)> {
            self.pushed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LineSender for ScriptedLine {
        async fn push(
            &self,
            to: &str,
            messages: &[OutboundMessage],
        ) -> Result<SentMessage, ChannelError> {
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            let mut pushed = self.pushed.lock().unwrap();
            pushed.push((to.to_string(), messages[0].text.clone()));
            Ok(SentMessage {
                message_id: format!("L{}", pushed.len()),
            })
        }

        async fn reply(
            &self,
            _reply_token: &str,
            _messages: &[OutboundMessage],
        ) -> Result<SentMessage, ChannelError> {
            unimplemented!("not used by the queue")
        }

        async fn fetch_content(&self, _message_id: &str) -> Result<Vec<u8>, ChannelError> {
            unimplemented!("not used by the queue")
        }
    }

    /// First push never answers; later ones succeed.
    #[derive(Default)]
    struct StallingLine {
        calls: StdMutex<u32>,
    }

    #[async_trait]
    impl LineSender for StallingLine {
        async fn push(
            &self,
            _to: &str,
            _messages: &[OutboundMessage],
        ) -> Result<SentMessage, ChannelError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if call == 1 {
                std::future::pending::<()>().await;
            }
            Ok(SentMessage {
                message_id: format!("L{call}"),
            })
        }

        async fn reply(
            &self,
            _reply_token: &str,
            _messages: &[OutboundMessage],
        ) -> Result<SentMessage, ChannelError> {
            unimplemented!("not used by the queue")
        }

        async fn fetch_content(&self, _message_id: &str) -> Result<Vec<u8>, ChannelError> {
            unimplemented!("not used by the queue")
        }
    }

    fn status(status: u16, body: &str) -> ChannelError {
        ChannelError::Status {
            platform: "line".into(),
            status,
            retry_after: None,
            body: body.into(),
        }
    }

    fn queue_config() -> QueueConfig {
        QueueConfig {
            capacity: 3,
            max_attempts: 3,
            send_interval: Duration::from_millis(100),
            quota_backoff: Duration::from_secs(60),
            batch_window: Duration::ZERO,
            max_batch_lines: 20,
            send_timeout: Duration::from_secs(10),
        }
    }

    fn governor(hard_limit: u32) -> Arc<QuotaGovernor> {
        QuotaGovernor::with_system_clock(QuotaConfig {
            hard_limit,
            safety_margin: 0,
            state_path: None,
            ..QuotaConfig::default()
        })
    }

    fn setup(config: QueueConfig, hard_limit: u32) -> (Arc<DeliveryQueue>, Arc<ScriptedLine>) {
        let line = ScriptedLine::failing_with(Vec::new());
        let queue = DeliveryQueue::new(config, governor(hard_limit), line.clone());
        (queue, line)
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_when_full() {
        let (queue, _line) = setup(queue_config(), 100);
        for dest in ["U1", "U2", "U3"] {
            assert!(queue.enqueue(dest, OutboundMessage::text("hi"), Priority::NORMAL).await);
        }
        assert!(!queue.enqueue("U4", OutboundMessage::text("hi"), Priority::URGENT).await);
        assert_eq!(queue.len().await, 3);
        assert_eq!(queue.stats().await.rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drains_by_priority() {
        let (queue, line) = setup(queue_config(), 100);
        queue.enqueue("U1", OutboundMessage::text("p1"), Priority::new(1)).await;
        queue.enqueue("U2", OutboundMessage::text("p5"), Priority::new(5)).await;
        queue.enqueue("U3", OutboundMessage::text("p3"), Priority::new(3)).await;

        let summary = queue.drain().await;
        assert_eq!(summary.sent, 3);

        let order: Vec<String> = line.pushed().into_iter().map(|(_, text)| text).collect();
        assert_eq!(order, vec!["p5", "p3", "p1"]);
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_priority_is_fifo() {
        let (queue, line) = setup(queue_config(), 100);
        for (dest, text) in [("U1", "first"), ("U2", "second"), ("U3", "third")] {
            queue.enqueue(dest, OutboundMessage::text(text), Priority::NORMAL).await;
        }
        queue.drain().await;
        let order: Vec<String> = line.pushed().into_iter().map(|(_, text)| text).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_text_within_window() {
        let (queue, line) = setup(
            QueueConfig {
                batch_window: Duration::from_secs(3),
                ..queue_config()
            },
            100,
        );
        for text in ["one", "two", "three"] {
            assert!(queue.enqueue("U1", OutboundMessage::text(text), Priority::NORMAL).await);
        }
        assert_eq!(queue.len().await, 1);

        queue.drain().await;
        assert_eq!(line.pushed(), vec![("U1".to_string(), "one\ntwo\nthree".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn no_batching_after_window() {
        let (queue, line) = setup(
            QueueConfig {
                batch_window: Duration::from_secs(3),
                ..queue_config()
            },
            100,
        );
        queue.enqueue("U1", OutboundMessage::text("early"), Priority::NORMAL).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        queue.enqueue("U1", OutboundMessage::text("late"), Priority::NORMAL).await;
        assert_eq!(queue.len().await, 2);

        queue.drain().await;
        assert_eq!(line.pushed().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retries_at_head() {
        let line = ScriptedLine::failing_with(vec![status(503, "unavailable")]);
        let queue = DeliveryQueue::new(queue_config(), governor(100), line.clone());
        let mut reports = queue.subscribe();

        queue.enqueue("U1", OutboundMessage::text("first"), Priority::NORMAL).await;
        queue.enqueue("U2", OutboundMessage::text("second"), Priority::NORMAL).await;

        let summary = queue.drain().await;
        assert_eq!(summary.retried, 1);
        assert_eq!(summary.sent, 2);

        let order: Vec<String> = line.pushed().into_iter().map(|(_, text)| text).collect();
        assert_eq!(order, vec!["first", "second"]);

        let report = reports.recv().await.unwrap();
        assert_eq!(report.attempts, 2);
        assert!(matches!(report.outcome, DeliveryOutcome::Sent { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_attempts() {
        let line = ScriptedLine::failing_with(vec![
            status(500, "a"),
            status(502, "b"),
            status(503, "c"),
        ]);
        let queue = DeliveryQueue::new(queue_config(), governor(100), line.clone());
        let mut reports = queue.subscribe();

        queue.enqueue("U1", OutboundMessage::text("doomed"), Priority::NORMAL).await;
        let summary = queue.drain().await;

        assert_eq!(summary.retried, 2);
        assert_eq!(summary.dropped, 1);
        assert!(line.pushed().is_empty());

        let report = reports.recv().await.unwrap();
        assert_eq!(report.attempts, 3);
        assert!(matches!(
            report.outcome,
            DeliveryOutcome::Dropped {
                reason: DropReason::AttemptsExhausted(_)
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_drops_immediately() {
        let line = ScriptedLine::failing_with(vec![status(429, "You have reached your monthly limit.")]);
        let quota = governor(100);
        let queue = DeliveryQueue::new(queue_config(), quota.clone(), line.clone());

        queue.enqueue("U1", OutboundMessage::text("hello"), Priority::NORMAL).await;
        let summary = queue.drain().await;

        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.retried, 0);
        assert!(!quota.can_send().await, "monthly 429 marks the quota spent");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_quota_holds_and_resumes_after_backoff() {
        let quota = QuotaGovernor::with_system_clock(QuotaConfig {
            hard_limit: 2,
            safety_margin: 1,
            state_path: None,
            ..QuotaConfig::default()
        });
        let line = ScriptedLine::failing_with(Vec::new());
        let queue = DeliveryQueue::new(queue_config(), quota.clone(), line.clone());

        queue.enqueue("U1", OutboundMessage::text("fits"), Priority::NORMAL).await;
        queue.enqueue("U2", OutboundMessage::text("waits"), Priority::NORMAL).await;
        queue
            .enqueue("U3", OutboundMessage::media(MessageKind::Image, "https://x/y.png"), Priority::LOW)
            .await;

        let summary = queue.drain().await;
        // Capacity 1: "fits" goes out, the image rides the safety margin,
        // "waits" is held.
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.held, 1);
        assert_eq!(queue.len().await, 1);

        // Backoff timer fires but the quota is still spent: still held.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(line.pushed().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_drain_is_skipped() {
        let (queue, _line) = setup(queue_config(), 100);
        queue.enqueue("U1", OutboundMessage::text("a"), Priority::NORMAL).await;
        queue.enqueue("U2", OutboundMessage::text("b"), Priority::NORMAL).await;

        let (first, second) = tokio::join!(queue.drain(), queue.drain());
        assert!(first.skipped ^ second.skipped);
        assert_eq!(first.sent + second.sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_reports_count() {
        let (queue, _line) = setup(queue_config(), 100);
        let mut reports = queue.subscribe();
        queue.enqueue("U1", OutboundMessage::text("a"), Priority::NORMAL).await;
        queue.enqueue("U2", OutboundMessage::text("b"), Priority::NORMAL).await;

        assert_eq!(queue.clear().await, 2);
        assert!(queue.is_empty().await);
        let report = reports.recv().await.unwrap();
        assert!(matches!(
            report.outcome,
            DeliveryOutcome::Dropped {
                reason: DropReason::Cleared
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reports_carry_origins() {
        let (queue, _line) = setup(queue_config(), 100);
        let mut reports = queue.subscribe();
        let origin = MessageOrigin {
            platform: crate::message::Platform::Discord,
            message_id: "D1".into(),
            author_id: "A1".into(),
            channel_id: "C1".into(),
            content: "hello".into(),
        };
        queue
            .enqueue_from("U1", OutboundMessage::text("hello"), Priority::NORMAL, Some(origin.clone()))
            .await;
        queue.drain().await;

        let report = reports.recv().await.unwrap();
        assert_eq!(report.origins, vec![origin]);
        assert_eq!(
            report.outcome,
            DeliveryOutcome::Sent {
                message_id: "L1".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_push_times_out_and_retries() {
        let line = Arc::new(StallingLine::default());
        let queue = DeliveryQueue::new(queue_config(), governor(100), line.clone());
        let mut reports = queue.subscribe();

        queue.enqueue("U1", OutboundMessage::text("a"), Priority::NORMAL).await;
        queue.enqueue("U2", OutboundMessage::text("b"), Priority::NORMAL).await;

        let summary = tokio::time::timeout(Duration::from_secs(3600), queue.drain())
            .await
            .expect("drain should not hang on a stalled push");
        assert_eq!(summary.retried, 1);
        assert_eq!(summary.sent, 2);

        let stats = queue.stats().await;
        assert_eq!(stats.length, 0);
        assert_eq!(stats.in_flight, 0);

        let first = reports.recv().await.unwrap();
        assert_eq!(first.payload.text, "a");
        assert_eq!(first.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_still_takes_batched_text() {
        let (queue, line) = setup(
            QueueConfig {
                batch_window: Duration::from_secs(3),
                ..queue_config()
            },
            100,
        );
        for dest in ["U1", "U2", "U3"] {
            assert!(queue.enqueue(dest, OutboundMessage::text("hi"), Priority::NORMAL).await);
        }
        assert!(queue.enqueue("U1", OutboundMessage::text("again"), Priority::NORMAL).await);
        assert!(!queue.enqueue("U4", OutboundMessage::text("new"), Priority::NORMAL).await);
        assert_eq!(queue.len().await, 3);

        queue.drain().await;
        assert_eq!(line.pushed()[0], ("U1".to_string(), "hi\nagain".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_drains_queue() {
        let (queue, line) = setup(queue_config(), 100);
        queue.enqueue("U1", OutboundMessage::text("a"), Priority::NORMAL).await;

        let summary = queue.flush().await;
        assert_eq!(summary.sent, 1);
        assert_eq!(line.pushed().len(), 1);
    }
}
