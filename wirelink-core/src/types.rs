//! Common types shared across the wirelink runtime.

/// Operation name carried by every envelope (e.g. `camera.list`).
///
/// Actions are opaque routing keys; the runtime never interprets their
/// structure beyond prefix matching in the queue's criticality check.
pub type ActionName = String;

/// Sender identity tag carried by every envelope (e.g. `device`, `api`).
pub type SourceTag = String;

/// Unique id chosen by the sender of a request; echoed by the peer as
/// `reply_to` on responses and errors.
pub type RequestId = String;

/// Optional logical session/channel selector, echoed on replies.
pub type ChannelId = String;

/// Well-known source tag for the device side of a link.
pub const SOURCE_DEVICE: &str = "device";

/// Well-known source tag for the API side of a link.
pub const SOURCE_API: &str = "api";

/// Application-level error codes carried in the `error.code` wire field.
///
/// The runtime only ever emits `HANDLER_NOT_FOUND`, `INTERNAL_ERROR`, and
/// `TIMEOUT` on its own; the rest are conventions for handlers. Integer
/// HTTP-like codes may ride inside `error.details` if a caller needs them.
pub mod codes {
    /// The request envelope was malformed at the application layer.
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    /// An unexpected failure occurred while handling the request.
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    /// The backing service is temporarily unable to handle the request.
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    /// The operation did not complete within its deadline.
    pub const TIMEOUT: &str = "TIMEOUT";
    /// The caller is not allowed to perform the operation.
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    /// The request payload failed validation.
    pub const INVALID_PARAMETERS: &str = "INVALID_PARAMETERS";
    /// The addressed entity does not exist.
    pub const NOT_FOUND: &str = "NOT_FOUND";
    /// No handler is registered for the requested action.
    pub const HANDLER_NOT_FOUND: &str = "HANDLER_NOT_FOUND";
}
