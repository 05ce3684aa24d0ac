//! Connection-scoped messaging endpoint.
//!
//! An [`Endpoint`] owns one [`Connection`] and everything scoped to it: the
//! listen loop that parses inbound frames, the bounded inbound channel, the
//! outbound envelope writer, and the correlator that matches response/error
//! envelopes to pending [`send_and_await`](Endpoint::send_and_await) callers.
//!
//! ## Concurrency
//!
//! `listen` runs as its own task; any number of tasks may call the send
//! primitives concurrently. Waiter registration and resolution are atomic
//! per `request_id`. When consumers stop draining [`Endpoint::inbound`], the
//! listen loop drops overflow envelopes with a warning instead of blocking
//! the read pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::codec;
use crate::config::EndpointConfig;
use crate::connection::Connection;
use crate::envelope::{Envelope, ErrorDetail};
use crate::error::{Error, Result};
use crate::types::{ActionName, ChannelId, RequestId, SourceTag};

/// Outbound-send capability shared by [`Endpoint`] and
/// [`crate::queue::QueuedEndpoint`].
///
/// The router replies through this seam, so handlers work identically over a
/// raw endpoint and over the queued layer.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Send one envelope, optionally stamping a channel selector first.
    ///
    /// # Errors
    /// Propagates encode and transport failures; see the implementor for its
    /// queueing behavior.
    async fn send(&self, envelope: Envelope, channel: Option<ChannelId>) -> Result<()>;

    /// Source tag stamped on envelopes this sender originates.
    fn source(&self) -> &str;

    /// Whether the underlying endpoint is closed or disconnected.
    fn is_closed(&self) -> bool;
}

/// One stateful messaging endpoint tied to one transport connection.
pub struct Endpoint {
    conn: Arc<dyn Connection>,
    source: SourceTag,
    inbound_tx: Mutex<Option<mpsc::Sender<Envelope>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    waiters: DashMap<RequestId, oneshot::Sender<Envelope>>,
    closed: AtomicBool,
}

impl Endpoint {
    /// Create an endpoint over the given transport.
    #[must_use]
    pub fn new(conn: Arc<dyn Connection>, config: EndpointConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.inbound_capacity.max(1));
        Self {
            conn,
            source: config.source,
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
            waiters: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Source tag stamped on envelopes this endpoint originates.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Take the inbound stream of parsed envelopes. Yields `None` after the
    /// first call: the endpoint has exactly one consumer side.
    ///
    /// Replies consumed by a pending [`Endpoint::send_and_await`] waiter are
    /// not delivered here; everything else is, including late replies whose
    /// waiter already timed out.
    #[must_use]
    pub fn inbound(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.inbound_rx.lock().take()
    }

    /// Read frames from the transport until cancelled or the transport
    /// closes, forwarding parsed envelopes to the inbound channel.
    ///
    /// Cancellation arrives through `shutdown`; dropping the corresponding
    /// sender counts as cancellation. Either way the endpoint is closed
    /// before returning. A frame that fails to parse is logged and skipped;
    /// the loop stays live.
    ///
    /// # Errors
    /// Propagates transport teardown failures from [`Endpoint::close`].
    pub async fn listen(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::select! {
                signal = shutdown.recv() => {
                    if matches!(signal, Err(broadcast::error::RecvError::Lagged(_))) {
                        continue;
                    }
                    trace!("shutdown signalled, closing endpoint");
                    return self.close().await;
                }
                frame = self.conn.recv() => {
                    let Some(frame) = frame else {
                        trace!("transport frame stream closed");
                        return self.close().await;
                    };
                    match codec::parse(&frame) {
                        Ok(envelope) => self.deliver(envelope),
                        Err(e) => warn!(error = %e, "failed to parse inbound frame"),
                    }
                }
            }
        }
    }

    /// Route a parsed envelope: resolve a pending waiter if one matches,
    /// otherwise forward to the inbound channel.
    fn deliver(&self, envelope: Envelope) {
        if envelope.is_reply() {
            let reply_to = envelope.reply_to().unwrap_or_default().to_owned();
            if let Some((_, waiter)) = self.waiters.remove(&reply_to) {
                if waiter.send(envelope).is_err() {
                    trace!(%reply_to, "waiter dropped before reply delivery");
                }
                return;
            }
            debug!(%reply_to, "reply without pending waiter, forwarding to inbound");
        }

        let Some(tx) = self.inbound_tx.lock().as_ref().cloned() else {
            return;
        };
        match tx.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                warn!(
                    action = envelope.action(),
                    kind = %envelope.kind(),
                    "inbound channel full, dropping envelope"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Encode and write one envelope, stamping `channel` first if given.
    ///
    /// # Errors
    /// [`Error::EndpointClosed`] once the endpoint is closed; otherwise
    /// encode errors or the transport's write error.
    pub async fn send(&self, mut envelope: Envelope, channel: Option<ChannelId>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::EndpointClosed);
        }
        if let Some(channel) = channel {
            envelope.set_channel_id(channel);
        }
        let frame = codec::encode(&envelope)?;
        self.conn.send(frame).await
    }

    /// Send a request and wait for its correlated reply.
    ///
    /// The waiter is registered under the envelope's `request_id` before the
    /// frame is written, so a reply can never race past it. A matching error
    /// envelope resolves to [`Error::Peer`]; endpoint closure resolves every
    /// outstanding waiter to [`Error::EndpointClosed`].
    ///
    /// # Errors
    /// [`Error::MissingRequestId`] if the envelope is not a request,
    /// [`Error::Timeout`] if no reply arrives in time, plus any send error.
    pub async fn send_and_await(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope> {
        let request_id = envelope.request_id().ok_or(Error::MissingRequestId)?.to_owned();

        let (tx, rx) = oneshot::channel();
        self.waiters.insert(request_id.clone(), tx);

        if let Err(e) = self.send(envelope, None).await {
            self.waiters.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.waiters.remove(&request_id);
                Err(Error::Timeout { timeout })
            }
            // The waiter was dropped without resolution: endpoint closed.
            Ok(Err(_)) => Err(Error::EndpointClosed),
            Ok(Ok(reply)) => match reply {
                Envelope::Error { error, .. } => Err(Error::Peer {
                    code: error.code,
                    message: error.message,
                    details: error.details,
                }),
                reply => Ok(reply),
            },
        }
    }

    /// Send a success reply to `request`, mirroring its action, channel, and
    /// `request_id`.
    ///
    /// # Errors
    /// [`Error::UnsupportedMessage`] if `request` is not a request envelope,
    /// plus any send error.
    pub async fn send_response(&self, request: &Envelope, payload: Option<Value>) -> Result<()> {
        let request_id = request
            .request_id()
            .ok_or_else(|| Error::UnsupportedMessage { kind: request.kind().to_string() })?;
        let mut envelope =
            Envelope::response(request.action(), self.source.clone(), request_id, payload);
        if let Some(channel) = request.channel_id() {
            envelope.set_channel_id(channel);
        }
        self.send(envelope, None).await
    }

    /// Send an error reply to `request`, mirroring its action, channel, and
    /// `request_id`.
    ///
    /// # Errors
    /// [`Error::UnsupportedMessage`] if `request` is not a request envelope,
    /// plus any send error.
    pub async fn send_error(&self, request: &Envelope, error: ErrorDetail) -> Result<()> {
        let request_id = request
            .request_id()
            .ok_or_else(|| Error::UnsupportedMessage { kind: request.kind().to_string() })?;
        let mut envelope =
            Envelope::error(request.action(), self.source.clone(), request_id, error);
        if let Some(channel) = request.channel_id() {
            envelope.set_channel_id(channel);
        }
        self.send(envelope, None).await
    }

    /// Send a fire-and-forget event on a channel.
    ///
    /// # Errors
    /// Propagates any send error.
    pub async fn send_event(
        &self,
        action: impl Into<ActionName> + Send,
        payload: Option<Value>,
        channel: impl Into<ChannelId> + Send,
    ) -> Result<()> {
        let envelope = Envelope::event(action, self.source.clone(), payload);
        self.send(envelope, Some(channel.into())).await
    }

    /// Send an envelope stamped with the given channel.
    ///
    /// # Errors
    /// Propagates any send error.
    pub async fn send_to_channel(&self, channel: ChannelId, envelope: Envelope) -> Result<()> {
        self.send(envelope, Some(channel)).await
    }

    /// Send an envelope without touching its channel selector.
    ///
    /// # Errors
    /// Propagates any send error.
    pub async fn broadcast(&self, envelope: Envelope) -> Result<()> {
        self.send(envelope, None).await
    }

    /// Close the endpoint: close the inbound channel exactly once, resolve
    /// all pending waiters with [`Error::EndpointClosed`], then close the
    /// transport. Idempotent; later calls are no-ops.
    ///
    /// # Errors
    /// Propagates transport teardown failures from the first call.
    pub async fn close(&self) -> Result<()> {
        let first = self.inbound_tx.lock().take().is_some();
        if !first {
            return Ok(());
        }
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders resolves every outstanding waiter.
        self.waiters.clear();
        self.conn.close().await
    }

    /// Whether the endpoint is closed or its transport is down.
    ///
    /// Becomes permanently true after [`Endpoint::close`]; may flap with the
    /// transport's own connectivity before that (a reconnecting
    /// [`Connection`] reports down during an outage).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.conn.is_closed()
    }
}

#[async_trait]
impl MessageSender for Endpoint {
    async fn send(&self, envelope: Envelope, channel: Option<ChannelId>) -> Result<()> {
        Endpoint::send(self, envelope, channel).await
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn is_closed(&self) -> bool {
        Endpoint::is_closed(self)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("source", &self.source)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("pending_waiters", &self.waiters.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockConnection;
    use serde_json::json;

    fn endpoint_over(conn: &Arc<MockConnection>) -> Endpoint {
        Endpoint::new(conn.clone() as Arc<dyn Connection>, EndpointConfig::default())
    }

    #[tokio::test]
    async fn test_send_stamps_channel() {
        let conn = MockConnection::new();
        let endpoint = endpoint_over(&conn);

        let env = Envelope::event("net.up", "device", None);
        endpoint.send(env, Some("chan-1".into())).await.unwrap();

        let sent = conn.sent_envelopes();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel_id(), Some("chan-1"));
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let conn = MockConnection::new();
        let endpoint = endpoint_over(&conn);

        endpoint.close().await.unwrap();
        let err = endpoint
            .send(Envelope::event("net.up", "device", None), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EndpointClosed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let conn = MockConnection::new();
        let endpoint = endpoint_over(&conn);

        assert!(!endpoint.is_closed());
        for _ in 0..3 {
            endpoint.close().await.unwrap();
            assert!(endpoint.is_closed());
        }
        assert_eq!(conn.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_send_and_await_requires_request_id() {
        let conn = MockConnection::new();
        let endpoint = endpoint_over(&conn);

        let err = endpoint
            .send_and_await(Envelope::event("a", "api", None), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingRequestId));
    }

    #[tokio::test]
    async fn test_failed_write_deregisters_waiter() {
        let conn = MockConnection::new();
        let endpoint = endpoint_over(&conn);
        conn.set_down(true);

        let err = endpoint
            .send_and_await(
                Envelope::request("camera.list", "api", None),
                Duration::from_millis(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(endpoint.waiters.is_empty());
    }

    #[tokio::test]
    async fn test_send_response_mirrors_request() {
        let conn = MockConnection::new();
        let endpoint = endpoint_over(&conn);

        let request = Envelope::request_with_id("camera.list", "api", "r-7", None)
            .with_channel_id("chan-3");
        endpoint.send_response(&request, Some(json!(["front"]))).await.unwrap();

        let sent = conn.sent_envelopes();
        assert_eq!(sent[0].reply_to(), Some("r-7"));
        assert_eq!(sent[0].action(), "camera.list");
        assert_eq!(sent[0].channel_id(), Some("chan-3"));
        assert_eq!(sent[0].source(), "device");
    }

    #[tokio::test]
    async fn test_reply_helpers_reject_non_requests() {
        let conn = MockConnection::new();
        let endpoint = endpoint_over(&conn);

        let event = Envelope::event("a", "api", None);
        assert!(matches!(
            endpoint.send_response(&event, None).await,
            Err(Error::UnsupportedMessage { .. })
        ));
        assert!(matches!(
            endpoint.send_error(&event, ErrorDetail::new("X", "y")).await,
            Err(Error::UnsupportedMessage { .. })
        ));
    }
}
