//! # Wirelink Core
//!
//! Bidirectional, framed messaging runtime for duplex byte-stream transports
//! (typically a WebSocket).
//!
//! This crate provides the building blocks for a device/API messaging link:
//! - Four-kind message envelopes (`request`, `response`, `error`, `event`)
//!   with a canonical JSON wire form
//! - A validating parser and envelope writer
//! - A connection-scoped [`endpoint::Endpoint`] with reply correlation and
//!   per-request timeouts
//! - A [`router::Router`] dispatching inbound requests through middleware to
//!   registered action handlers
//! - A [`queue::QueuedEndpoint`] that preserves outbound messages across
//!   short disconnects with age, retry, capacity, and priority policies
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use wirelink_core::prelude::*;
//! use wirelink_core::test_utils::MockConnection;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> wirelink_core::Result<()> {
//! let conn = MockConnection::new();
//! let endpoint = Arc::new(Endpoint::new(conn.clone(), EndpointConfig::with_source("api")));
//!
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//! let listener = {
//!     let endpoint = endpoint.clone();
//!     tokio::spawn(async move { endpoint.listen(shutdown_rx).await })
//! };
//!
//! // Play the peer: answer the request once it shows up on the wire.
//! let peer = conn.clone();
//! tokio::spawn(async move {
//!     loop {
//!         if let Some(request) = peer.sent_envelopes().first().cloned() {
//!             peer.inject_envelope(&Envelope::response(
//!                 request.action(),
//!                 "device",
//!                 request.request_id().unwrap(),
//!                 None,
//!             ));
//!             break;
//!         }
//!         tokio::time::sleep(Duration::from_millis(2)).await;
//!     }
//! });
//!
//! let request = Envelope::request("camera.list", "api", None);
//! let reply = endpoint.send_and_await(request, Duration::from_secs(1)).await?;
//! assert_eq!(reply.source(), "device");
//!
//! endpoint.close().await?;
//! listener.await.expect("listener task")?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod codec;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod queue;
pub mod router;
pub mod test_utils;
pub mod types;

pub use config::{EndpointConfig, QueueConfig};
pub use connection::Connection;
pub use endpoint::{Endpoint, MessageSender};
pub use envelope::{Envelope, EnvelopeKind, ErrorDetail};
pub use error::{Error, Result};
pub use queue::{QueueStats, QueuedEndpoint};
pub use router::{Request, Responder, Router};

/// Re-export of commonly used types for convenience.
pub mod prelude {
    pub use crate::codec::{encode, parse};
    pub use crate::config::{EndpointConfig, QueueConfig};
    pub use crate::connection::Connection;
    pub use crate::endpoint::{Endpoint, MessageSender};
    pub use crate::envelope::{Envelope, EnvelopeKind, ErrorDetail};
    pub use crate::error::{Error, Result};
    pub use crate::queue::{QueueStats, QueuedEndpoint};
    pub use crate::router::{handler, middleware, Request, Responder, Router};
    pub use crate::types::{codes, SOURCE_API, SOURCE_DEVICE};
    pub use bytes::Bytes;
    pub use serde_json::Value;
}
