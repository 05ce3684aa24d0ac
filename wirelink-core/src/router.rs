//! Action routing for inbound requests.
//!
//! A [`Router`] maps action names to handlers and wraps them in middleware:
//! the global stack first (outermost in registration order), then any
//! per-route middleware (outermost first in source order). Handlers receive
//! a [`Request`] view of the envelope and a [`Responder`] that sends at most
//! one reply through the owning endpoint.
//!
//! Registration is expected to complete before serving begins; misuse at
//! registration time (empty or duplicate action names) panics, while
//! dispatch never does. A handler that fails without replying gets an error
//! envelope synthesized from its error; a handler that panics gets a
//! best-effort `INTERNAL_ERROR` reply and the serve loop stays live.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, trace, warn};

use crate::endpoint::MessageSender;
use crate::envelope::{Envelope, EnvelopeKind, ErrorDetail};
use crate::error::{Error, Result};
use crate::types::{codes, ActionName, ChannelId, RequestId};

/// Future returned by a handler invocation.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A registered action handler.
pub type Handler = Arc<dyn Fn(Request, Responder) -> HandlerFuture + Send + Sync>;

/// A function transforming a handler into a handler.
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Wrap an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Request, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |request, responder| Box::pin(f(request, responder)))
}

/// Wrap a closure into a [`Middleware`].
pub fn middleware<F>(f: F) -> Middleware
where
    F: Fn(Handler) -> Handler + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Decoded view of an inbound request envelope handed to handlers.
#[derive(Debug, Clone)]
pub struct Request {
    action: ActionName,
    channel_id: Option<ChannelId>,
    request_id: RequestId,
    payload: Option<Value>,
}

impl Request {
    fn from_envelope(envelope: Envelope) -> Result<Self> {
        match envelope {
            Envelope::Request { action, request_id, channel_id, payload, .. } => {
                Ok(Self { action, channel_id, request_id, payload })
            }
            other => Err(Error::UnsupportedMessage { kind: other.kind().to_string() }),
        }
    }

    /// Operation name.
    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Logical channel selector, if any.
    #[must_use]
    pub fn channel_id(&self) -> Option<&str> {
        self.channel_id.as_deref()
    }

    /// The request's correlation id.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Raw opaque payload, if any.
    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Decode the payload into a typed value.
    ///
    /// # Errors
    /// [`Error::Handler`] with code `INVALID_PARAMETERS` when the payload is
    /// absent or does not match `T`; returned as-is from a handler, the
    /// router turns it into the corresponding error reply.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self
            .payload
            .clone()
            .ok_or_else(|| Error::handler(codes::INVALID_PARAMETERS, "request has no payload"))?;
        serde_json::from_value(payload).map_err(|e| {
            Error::handler(codes::INVALID_PARAMETERS, format!("invalid payload: {e}"))
        })
    }
}

/// Reply capability handed to handlers: at most one success or error reply
/// per request. The first reply wins; later attempts are logged and ignored.
#[derive(Clone)]
pub struct Responder {
    sender: Arc<dyn MessageSender>,
    action: ActionName,
    channel_id: Option<ChannelId>,
    request_id: RequestId,
    replied: Arc<AtomicBool>,
}

impl Responder {
    fn new(sender: Arc<dyn MessageSender>, request: &Request) -> Self {
        Self {
            sender,
            action: request.action.clone(),
            channel_id: request.channel_id.clone(),
            request_id: request.request_id.clone(),
            replied: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Send a success reply.
    ///
    /// # Errors
    /// Propagates the send error; the reply slot stays consumed either way.
    pub async fn ok(&self, payload: Option<Value>) -> Result<()> {
        if self.replied.swap(true, Ordering::SeqCst) {
            warn!(action = self.action.as_str(), "reply already sent, dropping response");
            return Ok(());
        }
        let mut envelope = Envelope::response(
            self.action.clone(),
            self.sender.source().to_owned(),
            self.request_id.clone(),
            payload,
        );
        if let Some(channel) = &self.channel_id {
            envelope.set_channel_id(channel.clone());
        }
        self.sender.send(envelope, None).await
    }

    /// Send an error reply.
    ///
    /// # Errors
    /// Propagates the send error; the reply slot stays consumed either way.
    pub async fn error(&self, detail: ErrorDetail) -> Result<()> {
        if self.replied.swap(true, Ordering::SeqCst) {
            warn!(action = self.action.as_str(), "reply already sent, dropping error reply");
            return Ok(());
        }
        let mut envelope = Envelope::error(
            self.action.clone(),
            self.sender.source().to_owned(),
            self.request_id.clone(),
            detail,
        );
        if let Some(channel) = &self.channel_id {
            envelope.set_channel_id(channel.clone());
        }
        self.sender.send(envelope, None).await
    }

    /// Whether a reply has already been sent for this request.
    #[must_use]
    pub fn has_replied(&self) -> bool {
        self.replied.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("action", &self.action)
            .field("request_id", &self.request_id)
            .field("replied", &self.has_replied())
            .finish_non_exhaustive()
    }
}

/// Registry of action handlers with global and per-route middleware.
#[derive(Default)]
pub struct Router {
    routes: HashMap<ActionName, Handler>,
    global: Vec<Middleware>,
}

impl Router {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware to the global stack. Globals wrap every route,
    /// outermost in registration order.
    pub fn layer(&mut self, mw: Middleware) -> &mut Self {
        self.global.push(mw);
        self
    }

    /// Register a handler for an action.
    ///
    /// # Panics
    /// Panics on an empty action name or a duplicate registration; route
    /// entries are never mutated once registered.
    pub fn handle(&mut self, action: impl Into<ActionName>, handler: Handler) -> &mut Self {
        let action = action.into();
        assert!(!action.is_empty(), "action name must not be empty");
        assert!(
            self.routes.insert(action.clone(), handler).is_none(),
            "handler already registered for action '{action}'"
        );
        self
    }

    /// Register a handler wrapped in per-route middleware, applied with
    /// left-to-right wrapping (first in the list is outermost).
    ///
    /// # Panics
    /// Same registration rules as [`Router::handle`].
    pub fn handle_with(
        &mut self,
        action: impl Into<ActionName>,
        middleware: Vec<Middleware>,
        handler: Handler,
    ) -> &mut Self {
        let mut wrapped = handler;
        for mw in middleware.iter().rev() {
            wrapped = mw(wrapped);
        }
        self.handle(action, wrapped)
    }

    /// Register a payload-to-payload handler: the closure's `Ok` payload
    /// becomes a success reply, its error an error reply.
    ///
    /// # Panics
    /// Same registration rules as [`Router::handle`].
    pub fn handle_fn<F, Fut>(&mut self, action: impl Into<ActionName>, f: F) -> &mut Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        self.handle(
            action,
            handler(move |request: Request, responder: Responder| {
                let fut = f(request.payload().cloned());
                async move {
                    let payload = fut.await?;
                    responder.ok(payload).await
                }
            }),
        )
    }

    /// Number of registered routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn compose(&self, base: Handler) -> Handler {
        let mut chain = base;
        for mw in self.global.iter().rev() {
            chain = mw(chain);
        }
        chain
    }

    /// Dispatch one inbound request envelope to its handler.
    ///
    /// Unknown actions get a `HANDLER_NOT_FOUND` error reply. A handler
    /// error after a sent reply is logged (first reply wins); one without a
    /// reply is turned into an error envelope. Panics are caught and
    /// answered with `INTERNAL_ERROR`.
    ///
    /// # Errors
    /// [`Error::UnsupportedMessage`] for non-request envelopes (those are
    /// observed through the inbound channel, never routed), and any failure
    /// to transmit a synthesized reply.
    pub async fn dispatch(
        &self,
        sender: Arc<dyn MessageSender>,
        envelope: Envelope,
    ) -> Result<()> {
        let request = Request::from_envelope(envelope)?;
        let responder = Responder::new(sender, &request);
        let action = request.action.clone();

        let Some(route) = self.routes.get(&action) else {
            warn!(action = action.as_str(), "no handler registered");
            return responder
                .error(ErrorDetail::new(
                    codes::HANDLER_NOT_FOUND,
                    format!("no handler registered for action '{action}'"),
                ))
                .await;
        };
        let chain = self.compose(route.clone());

        match AssertUnwindSafe(chain(request, responder.clone())).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                if responder.has_replied() {
                    warn!(
                        action = action.as_str(),
                        error = %e,
                        "handler failed after replying, first reply wins"
                    );
                    Ok(())
                } else {
                    responder
                        .error(ErrorDetail::new(e.error_code(), e.error_message()))
                        .await
                }
            }
            Err(_) => {
                error!(action = action.as_str(), "handler panicked");
                if responder.has_replied() {
                    Ok(())
                } else {
                    responder
                        .error(ErrorDetail::new(
                            codes::INTERNAL_ERROR,
                            format!("handler for '{action}' panicked"),
                        ))
                        .await
                }
            }
        }
    }

    /// Drain an inbound stream, dispatching each request on its own task.
    ///
    /// Non-request envelopes are observed at trace level and dropped; an
    /// application that wants to consume them should drain the inbound
    /// channel itself and call [`Router::dispatch`] for the requests.
    /// Returns when the stream ends or `shutdown` fires.
    ///
    /// # Errors
    /// Currently infallible; the `Result` mirrors the other long-running
    /// loops so callers can treat them uniformly.
    pub async fn serve(
        self: Arc<Self>,
        sender: Arc<dyn MessageSender>,
        mut inbound: mpsc::Receiver<Envelope>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                signal = shutdown.recv() => {
                    if matches!(signal, Err(broadcast::error::RecvError::Lagged(_))) {
                        continue;
                    }
                    trace!("shutdown signalled, stopping router");
                    return Ok(());
                }
                envelope = inbound.recv() => {
                    let Some(envelope) = envelope else {
                        trace!("inbound channel closed, stopping router");
                        return Ok(());
                    };
                    if envelope.kind() == EnvelopeKind::Request {
                        let router = self.clone();
                        let sender = sender.clone();
                        tokio::spawn(async move {
                            if let Err(e) = router.dispatch(sender, envelope).await {
                                warn!(error = %e, "request dispatch failed");
                            }
                        });
                    } else {
                        trace!(
                            kind = %envelope.kind(),
                            action = envelope.action(),
                            "observed non-request envelope"
                        );
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.len())
            .field("global_middleware", &self.global.len())
            .finish()
    }
}
