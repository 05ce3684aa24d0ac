//! Envelope model: the four message kinds exchanged over a link.
//!
//! Every frame on the wire is one envelope, tagged by its `type` field:
//! `request`, `response`, `error`, or `event`. All kinds share the header
//! fields `action`, `source`, and optional `channel_id`; requests carry a
//! `request_id`, replies echo it as `reply_to`, and error envelopes carry a
//! nested [`ErrorDetail`]. Payloads are opaque JSON values; consumers decode
//! them per action with [`serde_json::from_value`] or through
//! [`crate::router::Request::decode_payload`].
//!
//! Omitted optional fields are omitted on the wire (never `null`), and
//! unknown fields are ignored on decode. Decoders accept the legacy
//! `session_id` spelling of `channel_id`; encoders always emit `channel_id`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{ActionName, ChannelId, RequestId, SourceTag};

/// Discriminant of an [`Envelope`], matching the wire `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    /// A request expecting exactly one reply.
    Request,
    /// A successful reply to a request.
    Response,
    /// A failed reply to a request.
    Error,
    /// A fire-and-forget notification.
    Event,
}

impl EnvelopeKind {
    /// Wire spelling of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Error => "error",
            Self::Event => "event",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nested error object carried by error envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Application error code (see [`crate::types::codes`]).
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Optional structured details; numeric codes may ride here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorDetail {
    /// Create an error detail without structured details.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), details: None }
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A single typed message transmitted over the transport.
///
/// Immutable after creation apart from [`Envelope::set_channel_id`], which
/// the endpoint uses to stamp a channel at send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// A request expecting exactly one reply correlated by `request_id`.
    Request {
        /// Operation name.
        action: ActionName,
        /// Sender identity tag.
        source: SourceTag,
        /// Unique id echoed by the peer as `reply_to`.
        request_id: RequestId,
        /// Logical channel selector.
        #[serde(default, skip_serializing_if = "Option::is_none", alias = "session_id")]
        channel_id: Option<ChannelId>,
        /// Opaque per-action payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// A successful reply to a request.
    Response {
        /// Operation name, mirrored from the request.
        action: ActionName,
        /// Sender identity tag.
        source: SourceTag,
        /// `request_id` of the originating request.
        reply_to: RequestId,
        /// Logical channel selector, echoed from the request.
        #[serde(default, skip_serializing_if = "Option::is_none", alias = "session_id")]
        channel_id: Option<ChannelId>,
        /// Opaque per-action payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// A failed reply to a request.
    Error {
        /// Operation name, mirrored from the request.
        action: ActionName,
        /// Sender identity tag.
        source: SourceTag,
        /// `request_id` of the originating request.
        reply_to: RequestId,
        /// Logical channel selector, echoed from the request.
        #[serde(default, skip_serializing_if = "Option::is_none", alias = "session_id")]
        channel_id: Option<ChannelId>,
        /// What went wrong.
        error: ErrorDetail,
    },
    /// A fire-and-forget notification.
    Event {
        /// Operation name.
        action: ActionName,
        /// Sender identity tag.
        source: SourceTag,
        /// Logical channel selector.
        #[serde(default, skip_serializing_if = "Option::is_none", alias = "session_id")]
        channel_id: Option<ChannelId>,
        /// Opaque per-action payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

impl Envelope {
    /// Build a request with a freshly generated `request_id`.
    #[must_use]
    pub fn request(
        action: impl Into<ActionName>,
        source: impl Into<SourceTag>,
        payload: Option<Value>,
    ) -> Self {
        Self::request_with_id(action, source, Uuid::new_v4().to_string(), payload)
    }

    /// Build a request with a caller-chosen `request_id`.
    #[must_use]
    pub fn request_with_id(
        action: impl Into<ActionName>,
        source: impl Into<SourceTag>,
        request_id: impl Into<RequestId>,
        payload: Option<Value>,
    ) -> Self {
        Self::Request {
            action: action.into(),
            source: source.into(),
            request_id: request_id.into(),
            channel_id: None,
            payload,
        }
    }

    /// Build a response replying to `reply_to`.
    #[must_use]
    pub fn response(
        action: impl Into<ActionName>,
        source: impl Into<SourceTag>,
        reply_to: impl Into<RequestId>,
        payload: Option<Value>,
    ) -> Self {
        Self::Response {
            action: action.into(),
            source: source.into(),
            reply_to: reply_to.into(),
            channel_id: None,
            payload,
        }
    }

    /// Build an error envelope replying to `reply_to`.
    #[must_use]
    pub fn error(
        action: impl Into<ActionName>,
        source: impl Into<SourceTag>,
        reply_to: impl Into<RequestId>,
        error: ErrorDetail,
    ) -> Self {
        Self::Error {
            action: action.into(),
            source: source.into(),
            reply_to: reply_to.into(),
            channel_id: None,
            error,
        }
    }

    /// Build a fire-and-forget event.
    #[must_use]
    pub fn event(
        action: impl Into<ActionName>,
        source: impl Into<SourceTag>,
        payload: Option<Value>,
    ) -> Self {
        Self::Event { action: action.into(), source: source.into(), channel_id: None, payload }
    }

    /// The envelope's kind discriminant.
    #[must_use]
    pub const fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Request { .. } => EnvelopeKind::Request,
            Self::Response { .. } => EnvelopeKind::Response,
            Self::Error { .. } => EnvelopeKind::Error,
            Self::Event { .. } => EnvelopeKind::Event,
        }
    }

    /// Operation name.
    #[must_use]
    pub fn action(&self) -> &str {
        match self {
            Self::Request { action, .. }
            | Self::Response { action, .. }
            | Self::Error { action, .. }
            | Self::Event { action, .. } => action,
        }
    }

    /// Sender identity tag.
    #[must_use]
    pub fn source(&self) -> &str {
        match self {
            Self::Request { source, .. }
            | Self::Response { source, .. }
            | Self::Error { source, .. }
            | Self::Event { source, .. } => source,
        }
    }

    /// Logical channel selector, if any.
    #[must_use]
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            Self::Request { channel_id, .. }
            | Self::Response { channel_id, .. }
            | Self::Error { channel_id, .. }
            | Self::Event { channel_id, .. } => channel_id.as_deref(),
        }
    }

    /// Stamp (or override) the channel selector.
    pub fn set_channel_id(&mut self, channel: impl Into<ChannelId>) {
        match self {
            Self::Request { channel_id, .. }
            | Self::Response { channel_id, .. }
            | Self::Error { channel_id, .. }
            | Self::Event { channel_id, .. } => *channel_id = Some(channel.into()),
        }
    }

    /// Builder-style variant of [`Envelope::set_channel_id`].
    #[must_use]
    pub fn with_channel_id(mut self, channel: impl Into<ChannelId>) -> Self {
        self.set_channel_id(channel);
        self
    }

    /// `request_id`, for request envelopes.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Request { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    /// `reply_to`, for response and error envelopes.
    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        match self {
            Self::Response { reply_to, .. } | Self::Error { reply_to, .. } => Some(reply_to),
            _ => None,
        }
    }

    /// Opaque payload, for kinds that carry one.
    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Request { payload, .. }
            | Self::Response { payload, .. }
            | Self::Event { payload, .. } => payload.as_ref(),
            Self::Error { .. } => None,
        }
    }

    /// Nested error object, for error envelopes.
    #[must_use]
    pub fn error_detail(&self) -> Option<&ErrorDetail> {
        match self {
            Self::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Whether this envelope answers a request (response or error kind).
    #[must_use]
    pub const fn is_reply(&self) -> bool {
        matches!(self, Self::Response { .. } | Self::Error { .. })
    }
}
