//! Transport capability consumed by the endpoint.
//!
//! The runtime does not open sockets itself. It drives any duplex
//! frame-oriented transport (typically a WebSocket) through this trait, and
//! trusts it: security negotiation, authentication, and reconnection are
//! connection-layer concerns. A reconnecting implementation should report
//! `is_closed() == true` while the link is down and `false` once it is
//! usable again; the queued layer watches that transition to trigger replay.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// A duplex frame transport.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Write one whole frame. Writes are atomic per frame: concurrent
    /// senders may interleave frames but never bytes within a frame.
    ///
    /// # Errors
    /// [`crate::Error::NotConnected`] when the link is down; other transport
    /// faults as [`crate::Error::Transport`].
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Receive the next inbound frame, or `None` once the transport has
    /// closed. Intended for a single reader (the endpoint's listen loop).
    async fn recv(&self) -> Option<Bytes>;

    /// Close the transport. Idempotent.
    ///
    /// # Errors
    /// Returns a transport error if teardown fails; the transport must still
    /// count as closed afterwards.
    async fn close(&self) -> Result<()>;

    /// Whether the transport is currently unusable.
    fn is_closed(&self) -> bool;
}
