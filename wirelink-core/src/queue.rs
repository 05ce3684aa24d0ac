//! Queued resend layer: survives short disconnects by replaying sends.
//!
//! A [`QueuedEndpoint`] wraps an [`Endpoint`] with a bounded FIFO queue.
//! Sends that fail because the transport is down are enqueued and replayed
//! by a single background flusher, which runs on a fixed cadence and
//! immediately after the link comes back. Retention is governed by age,
//! retry, and capacity policies, with *critical* messages (actions matching
//! a configured prefix set) favored on every axis. Entries that expire,
//! exhaust their retries, or get displaced under capacity pressure are lost;
//! nothing survives a process restart.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::QueueConfig;
use crate::endpoint::{Endpoint, MessageSender};
use crate::envelope::{Envelope, ErrorDetail};
use crate::error::{Error, Result};
use crate::types::{ActionName, ChannelId};

/// One message waiting to be replayed.
#[derive(Debug, Clone)]
struct QueuedEntry {
    envelope: Envelope,
    channel_id: Option<ChannelId>,
    queued_at: Instant,
    retries: u32,
    critical: bool,
}

/// Snapshot of queue occupancy for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Entries currently held.
    pub total: usize,
    /// Entries classified critical.
    pub critical: usize,
    /// Entries classified normal.
    pub normal: usize,
    /// Age of the oldest entry, if any.
    pub oldest_age: Option<Duration>,
}

/// An [`Endpoint`] wrapper that queues sends across disconnects.
pub struct QueuedEndpoint {
    inner: Arc<Endpoint>,
    config: QueueConfig,
    queue: Mutex<VecDeque<QueuedEntry>>,
    last_connected: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl QueuedEndpoint {
    /// Wrap an endpoint and start the background flusher.
    #[must_use]
    pub fn new(inner: Arc<Endpoint>, config: QueueConfig) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let queued = Arc::new(Self {
            last_connected: AtomicBool::new(!inner.is_closed()),
            queue: Mutex::new(VecDeque::with_capacity(config.max_queue_size)),
            inner,
            config,
            shutdown_tx,
            flusher: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        // Subscribe before spawning so a close racing the spawn still lands.
        let shutdown_rx = queued.shutdown_tx.subscribe();
        let handle = tokio::spawn(Self::run_flusher(queued.clone(), shutdown_rx));
        *queued.flusher.lock() = Some(handle);
        queued
    }

    /// The wrapped endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.inner
    }

    /// Periodic flush loop; also fires immediately when the link transitions
    /// from down to up.
    async fn run_flusher(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    trace!("flusher stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let connected = !self.inner.is_closed();
                    let was_connected = self.last_connected.swap(connected, Ordering::SeqCst);
                    if connected && !was_connected {
                        info!("connection restored, flushing message queue");
                    }
                    if connected {
                        self.flush().await;
                    }
                }
            }
        }
    }

    /// Attempt to drain the queue in FIFO order, applying age and retry
    /// policy. Entries enqueued while a flush is in progress land after any
    /// retained entries.
    async fn flush(&self) {
        if self.inner.is_closed() {
            return;
        }
        let snapshot: Vec<QueuedEntry> = {
            let mut queue = self.queue.lock();
            if queue.is_empty() {
                return;
            }
            queue.drain(..).collect()
        };

        let mut retained: VecDeque<QueuedEntry> = VecDeque::new();
        let (mut sent, mut expired, mut dropped) = (0usize, 0usize, 0usize);

        for mut entry in snapshot {
            let age = entry.queued_at.elapsed();
            if age > self.config.age_budget(entry.critical) {
                expired += 1;
                if entry.critical {
                    warn!(
                        action = entry.envelope.action(),
                        age_ms = age.as_millis() as u64,
                        "dropping expired critical message"
                    );
                } else {
                    debug!(
                        action = entry.envelope.action(),
                        age_ms = age.as_millis() as u64,
                        "dropping expired message"
                    );
                }
                continue;
            }

            match self.inner.send(entry.envelope.clone(), entry.channel_id.clone()).await {
                Ok(()) => {
                    sent += 1;
                    debug!(
                        action = entry.envelope.action(),
                        age_ms = age.as_millis() as u64,
                        "sent queued message"
                    );
                }
                Err(e) => {
                    entry.retries += 1;
                    if entry.retries >= self.config.retry_budget(entry.critical) {
                        dropped += 1;
                        warn!(
                            action = entry.envelope.action(),
                            retries = entry.retries,
                            error = %e,
                            "dropping message after max retries"
                        );
                    } else {
                        retained.push_back(entry);
                    }
                }
            }
        }

        {
            let mut queue = self.queue.lock();
            for entry in queue.drain(..) {
                retained.push_back(entry);
            }
            *queue = retained;
        }

        if sent > 0 || expired > 0 || dropped > 0 {
            info!(sent, expired, dropped, remaining = self.size(), "queue flush completed");
        }
    }

    /// Whether an envelope counts as critical under the configured prefixes.
    fn is_critical(&self, envelope: &Envelope) -> bool {
        self.config
            .critical_action_prefixes
            .iter()
            .any(|prefix| envelope.action().starts_with(prefix.as_str()))
    }

    /// Append an entry, displacing under capacity pressure: oldest
    /// non-critical first, oldest of all only when every entry is critical.
    fn enqueue(&self, envelope: Envelope, channel_id: Option<ChannelId>, critical: bool) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.max_queue_size {
            if let Some(position) = queue.iter().position(|entry| !entry.critical) {
                queue.remove(position);
                warn!("queue full, dropped oldest non-critical message");
            } else {
                queue.pop_front();
                warn!("queue full, dropped oldest message");
            }
        }
        queue.push_back(QueuedEntry {
            envelope,
            channel_id,
            queued_at: Instant::now(),
            retries: 0,
            critical,
        });
        debug!(queue_size = queue.len(), critical, "message queued");
    }

    /// Send an envelope, queuing it if the transport is down.
    ///
    /// Queued critical sends report success so higher layers do not surface
    /// a spurious failure for a message that will go out on reconnect.
    ///
    /// # Errors
    /// The original send error for queued non-critical messages; encode and
    /// other non-connection errors unqueued and unchanged.
    pub async fn send(&self, envelope: Envelope, channel: Option<ChannelId>) -> Result<()> {
        match self.inner.send(envelope.clone(), channel.clone()).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_queueable() => {
                let critical = self.is_critical(&envelope);
                self.enqueue(envelope, channel, critical);
                if critical {
                    info!("critical message queued, suppressing error");
                    Ok(())
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Send a fire-and-forget event on a channel, queuing it if the
    /// transport is down.
    ///
    /// # Errors
    /// Same policy as [`QueuedEndpoint::send`].
    pub async fn send_event(
        &self,
        action: impl Into<ActionName> + Send,
        payload: Option<Value>,
        channel: impl Into<ChannelId> + Send,
    ) -> Result<()> {
        let envelope = Envelope::event(action, self.config.source.clone(), payload);
        self.send(envelope, Some(channel.into())).await
    }

    /// Send a success reply to `request`, queuing it if the transport is
    /// down.
    ///
    /// # Errors
    /// [`Error::UnsupportedMessage`] if `request` is not a request envelope;
    /// otherwise same policy as [`QueuedEndpoint::send`].
    pub async fn send_response(&self, request: &Envelope, payload: Option<Value>) -> Result<()> {
        let request_id = request
            .request_id()
            .ok_or_else(|| Error::UnsupportedMessage { kind: request.kind().to_string() })?;
        let mut envelope = Envelope::response(
            request.action(),
            self.config.source.clone(),
            request_id,
            payload,
        );
        if let Some(channel) = request.channel_id() {
            envelope.set_channel_id(channel);
        }
        self.send(envelope, None).await
    }

    /// Send an error reply to `request`, queuing it if the transport is
    /// down.
    ///
    /// # Errors
    /// [`Error::UnsupportedMessage`] if `request` is not a request envelope;
    /// otherwise same policy as [`QueuedEndpoint::send`].
    pub async fn send_error(&self, request: &Envelope, error: ErrorDetail) -> Result<()> {
        let request_id = request
            .request_id()
            .ok_or_else(|| Error::UnsupportedMessage { kind: request.kind().to_string() })?;
        let mut envelope =
            Envelope::error(request.action(), self.config.source.clone(), request_id, error);
        if let Some(channel) = request.channel_id() {
            envelope.set_channel_id(channel);
        }
        self.send(envelope, None).await
    }

    /// Send a request through the wrapped endpoint and await its reply.
    /// Requests needing a live peer are never queued.
    ///
    /// # Errors
    /// See [`Endpoint::send_and_await`].
    pub async fn send_and_await(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope> {
        self.inner.send_and_await(envelope, timeout).await
    }

    /// Run the wrapped endpoint's listen loop. See [`Endpoint::listen`].
    ///
    /// # Errors
    /// See [`Endpoint::listen`].
    pub async fn listen(&self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        self.inner.listen(shutdown).await
    }

    /// Take the wrapped endpoint's inbound stream. See [`Endpoint::inbound`].
    #[must_use]
    pub fn inbound(&self) -> Option<tokio::sync::mpsc::Receiver<Envelope>> {
        self.inner.inbound()
    }

    /// Whether the wrapped endpoint is closed or disconnected.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of entries currently queued.
    #[must_use]
    pub fn size(&self) -> usize {
        self.queue.lock().len()
    }

    /// Occupancy snapshot for monitoring.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let queue = self.queue.lock();
        let critical = queue.iter().filter(|entry| entry.critical).count();
        let oldest_age = queue.iter().map(|entry| entry.queued_at.elapsed()).max();
        QueueStats { total: queue.len(), critical, normal: queue.len() - critical, oldest_age }
    }

    /// Run one flush attempt immediately.
    pub async fn flush_now(&self) {
        self.flush().await;
    }

    /// Wait until the queue drains or `timeout` elapses; returns whether it
    /// drained.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.size() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.size() == 0
    }

    /// Close the queued layer: stop the flusher, make one final flush
    /// attempt, log anything still undelivered, then close the wrapped
    /// endpoint. Idempotent.
    ///
    /// # Errors
    /// Propagates transport teardown failures from the wrapped endpoint.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(());
        let handle = self.flusher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.flush().await;
        let remaining = self.size();
        if remaining > 0 {
            warn!(remaining, "closing with messages still queued");
        }
        self.inner.close().await
    }
}

#[async_trait]
impl MessageSender for QueuedEndpoint {
    async fn send(&self, envelope: Envelope, channel: Option<ChannelId>) -> Result<()> {
        QueuedEndpoint::send(self, envelope, channel).await
    }

    fn source(&self) -> &str {
        &self.config.source
    }

    fn is_closed(&self) -> bool {
        QueuedEndpoint::is_closed(self)
    }
}

impl std::fmt::Debug for QueuedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedEndpoint")
            .field("queued", &self.size())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::test_utils::MockConnection;

    fn queued_over(conn: &Arc<MockConnection>, config: QueueConfig) -> Arc<QueuedEndpoint> {
        let endpoint = Arc::new(Endpoint::new(
            conn.clone() as Arc<dyn crate::connection::Connection>,
            EndpointConfig::default(),
        ));
        QueuedEndpoint::new(endpoint, config)
    }

    fn webrtc_config() -> QueueConfig {
        QueueConfig {
            critical_action_prefixes: vec!["webrtc.session".into()],
            // Slow cadence keeps the background flusher out of these tests.
            flush_interval: Duration::from_secs(3600),
            ..QueueConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connected_send_passes_through() {
        let conn = MockConnection::new();
        let queued = queued_over(&conn, webrtc_config());

        queued.send(Envelope::event("net.up", "device", None), None).await.unwrap();
        assert_eq!(queued.size(), 0);
        assert_eq!(conn.sent_envelopes().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_send_queues_and_errors() {
        let conn = MockConnection::new();
        let queued = queued_over(&conn, webrtc_config());
        conn.set_down(true);

        let err = queued
            .send(Envelope::event("net.up", "device", None), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert_eq!(queued.size(), 1);
    }

    #[tokio::test]
    async fn test_critical_send_suppresses_error() {
        let conn = MockConnection::new();
        let queued = queued_over(&conn, webrtc_config());
        conn.set_down(true);

        queued
            .send(Envelope::event("webrtc.session.offer", "device", None), None)
            .await
            .unwrap();
        assert_eq!(queued.stats().critical, 1);
    }

    #[tokio::test]
    async fn test_non_connection_errors_are_not_queued() {
        let conn = MockConnection::new();
        let queued = queued_over(&conn, webrtc_config());
        // Link reports connected but the write faults: not a queueable error.
        conn.set_fail_sends(true);

        let err = queued
            .send(Envelope::event("webrtc.session.offer", "device", None), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert_eq!(queued.size(), 0);
    }

    #[tokio::test]
    async fn test_capacity_displacement_prefers_non_critical() {
        let conn = MockConnection::new();
        let queued = queued_over(
            &conn,
            QueueConfig { max_queue_size: 3, ..webrtc_config() },
        );
        conn.set_down(true);

        for action in ["n.one", "webrtc.session.c1", "n.two", "n.three", "webrtc.session.c2"] {
            let _ = queued.send(Envelope::event(action, "device", None), None).await;
        }

        let actions: Vec<String> = queued
            .queue
            .lock()
            .iter()
            .map(|entry| entry.envelope.action().to_owned())
            .collect();
        assert_eq!(actions, vec!["webrtc.session.c1", "n.three", "webrtc.session.c2"]);
    }

    #[tokio::test]
    async fn test_all_critical_displaces_oldest() {
        let conn = MockConnection::new();
        let queued = queued_over(
            &conn,
            QueueConfig { max_queue_size: 2, ..webrtc_config() },
        );
        conn.set_down(true);

        for action in ["webrtc.session.a", "webrtc.session.b", "webrtc.session.c"] {
            queued.send(Envelope::event(action, "device", None), None).await.unwrap();
        }

        let actions: Vec<String> = queued
            .queue
            .lock()
            .iter()
            .map(|entry| entry.envelope.action().to_owned())
            .collect();
        assert_eq!(actions, vec!["webrtc.session.b", "webrtc.session.c"]);
    }

    #[tokio::test]
    async fn test_flush_preserves_fifo_order() {
        let conn = MockConnection::new();
        let queued = queued_over(&conn, webrtc_config());
        conn.set_down(true);

        for action in ["first", "webrtc.session.mid", "last"] {
            let _ = queued.send(Envelope::event(action, "device", None), None).await;
        }
        assert_eq!(queued.size(), 3);

        conn.set_down(false);
        queued.flush_now().await;

        let actions: Vec<String> =
            conn.sent_envelopes().iter().map(|e| e.action().to_owned()).collect();
        assert_eq!(actions, vec!["first", "webrtc.session.mid", "last"]);
        assert_eq!(queued.size(), 0);
    }

    #[tokio::test]
    async fn test_expired_messages_are_dropped_not_sent() {
        let conn = MockConnection::new();
        let queued = queued_over(
            &conn,
            QueueConfig {
                max_message_age: Duration::from_millis(5),
                ..webrtc_config()
            },
        );
        conn.set_down(true);

        let _ = queued.send(Envelope::event("stale", "device", None), None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        conn.set_down(false);
        queued.flush_now().await;

        assert_eq!(queued.size(), 0);
        assert!(conn.sent_envelopes().is_empty());
    }

    #[tokio::test]
    async fn test_critical_age_bound_applies() {
        let conn = MockConnection::new();
        let queued = queued_over(
            &conn,
            QueueConfig {
                max_message_age: Duration::from_millis(5),
                max_critical_age: Duration::from_secs(60),
                ..webrtc_config()
            },
        );
        conn.set_down(true);

        let _ = queued.send(Envelope::event("stale", "device", None), None).await;
        queued
            .send(Envelope::event("webrtc.session.keep", "device", None), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        conn.set_down(false);
        queued.flush_now().await;

        let actions: Vec<String> =
            conn.sent_envelopes().iter().map(|e| e.action().to_owned()).collect();
        assert_eq!(actions, vec!["webrtc.session.keep"]);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_drops_entry() {
        let conn = MockConnection::new();
        let queued = queued_over(
            &conn,
            QueueConfig { max_retries: 2, ..webrtc_config() },
        );
        conn.set_down(true);
        let _ = queued.send(Envelope::event("flaky", "device", None), None).await;

        // Link is up but writes fail: each flush burns one retry.
        conn.set_down(false);
        conn.set_fail_sends(true);

        queued.flush_now().await;
        assert_eq!(queued.size(), 1);
        queued.flush_now().await;
        assert_eq!(queued.size(), 0, "entry dropped once retries reach the budget");

        conn.set_fail_sends(false);
        queued.flush_now().await;
        assert!(conn.sent_envelopes().is_empty());
    }

    #[tokio::test]
    async fn test_stats_reflect_queue_contents() {
        let conn = MockConnection::new();
        let queued = queued_over(&conn, webrtc_config());
        conn.set_down(true);

        let _ = queued.send(Envelope::event("n.one", "device", None), None).await;
        queued
            .send(Envelope::event("webrtc.session.x", "device", None), None)
            .await
            .unwrap();

        let stats = queued.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.critical, 1);
        assert_eq!(stats.normal, 1);
        assert!(stats.oldest_age.is_some());
    }

    #[tokio::test]
    async fn test_close_makes_final_flush_attempt() {
        let conn = MockConnection::new();
        let queued = queued_over(&conn, webrtc_config());
        conn.set_down(true);

        let _ = queued.send(Envelope::event("late", "device", None), None).await;
        conn.set_down(false);

        queued.close().await.unwrap();
        assert_eq!(conn.sent_envelopes().len(), 1);
        assert!(queued.is_closed());

        // Idempotent.
        queued.close().await.unwrap();
    }
}
