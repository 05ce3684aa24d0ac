//! JSON wire codec: frame bytes to typed envelopes and back.
//!
//! [`parse`] validates the envelope contract before committing to a variant:
//! the `type` discriminant first, then the shared `action`/`source` header,
//! then the kind-specific required fields. The frame text is decoded once
//! into a [`Value`] tree; the typed envelope is built from that tree rather
//! than re-parsing the bytes.

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::envelope::Envelope;
use crate::error::{Error, Result};

/// Parse one frame into a typed envelope.
///
/// # Errors
/// Returns the most specific protocol error for the first contract violation
/// found: [`Error::MissingType`] / [`Error::InvalidType`] for the
/// discriminant, [`Error::MissingAction`] for the header, then
/// [`Error::MissingRequestId`], [`Error::MissingReplyTo`], or
/// [`Error::MissingError`] per kind. Structural failures map to
/// [`Error::Decode`].
pub fn parse(frame: &[u8]) -> Result<Envelope> {
    let value: Value = serde_json::from_slice(frame)
        .map_err(|e| Error::decode(format!("frame is not valid JSON: {e}")))?;
    let map = value
        .as_object()
        .ok_or_else(|| Error::decode("frame is not a JSON object"))?;

    let kind: String = match map.get("type") {
        None | Some(Value::Null) => return Err(Error::MissingType),
        Some(Value::String(s)) => s.clone(),
        Some(other) => return Err(Error::InvalidType { value: other.to_string() }),
    };
    if !matches!(kind.as_str(), "request" | "response" | "error" | "event") {
        return Err(Error::InvalidType { value: kind });
    }

    if !field_is_set(map, "action") {
        return Err(Error::MissingAction);
    }
    if !field_is_set(map, "source") {
        return Err(Error::decode("missing required 'source' field"));
    }

    match kind.as_str() {
        "request" => {
            if !field_is_set(map, "request_id") {
                return Err(Error::MissingRequestId);
            }
        }
        "response" => {
            if !field_is_set(map, "reply_to") {
                return Err(Error::MissingReplyTo);
            }
        }
        "error" => {
            if !field_is_set(map, "reply_to") {
                return Err(Error::MissingReplyTo);
            }
            if !field_is_set(map, "error") {
                return Err(Error::MissingError);
            }
        }
        _ => {}
    }

    serde_json::from_value(value)
        .map_err(|e| Error::decode(format!("failed to decode {kind} envelope: {e}")))
}

/// Encode an envelope into a single wire frame.
///
/// # Errors
/// Returns [`Error::Encode`] if serialization fails (e.g. a payload value
/// that cannot be represented as JSON).
pub fn encode(envelope: &Envelope) -> Result<Bytes> {
    serde_json::to_vec(envelope)
        .map(Bytes::from)
        .map_err(|e| Error::encode(e.to_string()))
}

/// A field counts as set when it is present, non-null, and, for strings,
/// non-empty.
fn field_is_set(map: &Map<String, Value>, key: &str) -> bool {
    match map.get(key) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeKind, ErrorDetail};
    use serde_json::json;

    fn parse_json(value: Value) -> Result<Envelope> {
        parse(&serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn test_parse_request() {
        let env = parse_json(json!({
            "type": "request",
            "action": "camera.list",
            "source": "api",
            "request_id": "req-123",
            "payload": {"page": 2},
        }))
        .unwrap();
        assert_eq!(env.kind(), EnvelopeKind::Request);
        assert_eq!(env.request_id(), Some("req-123"));
        assert_eq!(env.payload(), Some(&json!({"page": 2})));
    }

    #[test]
    fn test_parse_response() {
        let env = parse_json(json!({
            "type": "response",
            "action": "camera.list",
            "source": "device",
            "reply_to": "req-123",
        }))
        .unwrap();
        assert_eq!(env.kind(), EnvelopeKind::Response);
        assert_eq!(env.reply_to(), Some("req-123"));
        assert!(env.payload().is_none());
    }

    #[test]
    fn test_parse_error_envelope() {
        let env = parse_json(json!({
            "type": "error",
            "action": "camera.switch",
            "source": "device",
            "reply_to": "req-9",
            "error": {"code": "NOT_FOUND", "message": "no such camera"},
        }))
        .unwrap();
        let detail = env.error_detail().unwrap();
        assert_eq!(detail.code, "NOT_FOUND");
        assert!(detail.details.is_none());
    }

    #[test]
    fn test_parse_event() {
        let env = parse_json(json!({
            "type": "event",
            "action": "battery.low",
            "source": "device",
            "channel_id": "chan-1",
        }))
        .unwrap();
        assert_eq!(env.kind(), EnvelopeKind::Event);
        assert_eq!(env.channel_id(), Some("chan-1"));
    }

    #[test]
    fn test_missing_type() {
        let err = parse_json(json!({"action": "a", "source": "api"})).unwrap_err();
        assert!(matches!(err, Error::MissingType));

        let err =
            parse_json(json!({"type": null, "action": "a", "source": "api"})).unwrap_err();
        assert!(matches!(err, Error::MissingType));
    }

    #[test]
    fn test_invalid_type() {
        let err = parse_json(json!({"type": "ping", "action": "a", "source": "api"}))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidType { value } if value == "ping"));

        let err =
            parse_json(json!({"type": 3, "action": "a", "source": "api"})).unwrap_err();
        assert!(matches!(err, Error::InvalidType { .. }));
    }

    #[test]
    fn test_missing_action() {
        let err = parse_json(json!({"type": "event", "source": "device"})).unwrap_err();
        assert!(matches!(err, Error::MissingAction));

        // Empty strings do not satisfy a required field.
        let err = parse_json(json!({"type": "event", "action": "", "source": "device"}))
            .unwrap_err();
        assert!(matches!(err, Error::MissingAction));
    }

    #[test]
    fn test_missing_source() {
        let err = parse_json(json!({"type": "event", "action": "a.b"})).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn test_missing_request_id() {
        let err = parse_json(json!({"type": "request", "action": "a", "source": "api"}))
            .unwrap_err();
        assert!(matches!(err, Error::MissingRequestId));
    }

    #[test]
    fn test_missing_reply_to() {
        let err = parse_json(json!({"type": "response", "action": "a", "source": "api"}))
            .unwrap_err();
        assert!(matches!(err, Error::MissingReplyTo));

        let err = parse_json(json!({
            "type": "error",
            "action": "a",
            "source": "api",
            "error": {"code": "X", "message": "y"},
        }))
        .unwrap_err();
        assert!(matches!(err, Error::MissingReplyTo));
    }

    #[test]
    fn test_missing_error_object() {
        let err = parse_json(json!({
            "type": "error",
            "action": "a",
            "source": "api",
            "reply_to": "r-1",
        }))
        .unwrap_err();
        assert!(matches!(err, Error::MissingError));
    }

    #[test]
    fn test_not_json() {
        assert!(matches!(parse(b"not json"), Err(Error::Decode { .. })));
        assert!(matches!(parse(b"[1,2,3]"), Err(Error::Decode { .. })));
        assert!(matches!(parse(b""), Err(Error::Decode { .. })));
    }

    #[test]
    fn test_roundtrip_field_equality() {
        let envelopes = vec![
            Envelope::request_with_id("camera.list", "api", "r-1", Some(json!({"a": [1, 2]})))
                .with_channel_id("chan-7"),
            Envelope::response("camera.list", "device", "r-1", None),
            Envelope::error(
                "camera.switch",
                "device",
                "r-2",
                ErrorDetail::new("NOT_FOUND", "gone").with_details(json!(404)),
            ),
            Envelope::event("net.up", "device", Some(json!("online"))),
        ];
        for env in envelopes {
            let decoded = parse(&encode(&env).unwrap()).unwrap();
            assert_eq!(env, decoded);
        }
    }

    mod robustness {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Arbitrary bytes must never panic the parser.
            #[test]
            fn parse_never_panics(frame in proptest::collection::vec(any::<u8>(), 0..256)) {
                let _ = parse(&frame);
            }

            // Any JSON object either parses into a valid envelope or errors.
            #[test]
            fn parsed_envelopes_are_well_formed(
                kind in prop_oneof![
                    Just("request"), Just("response"), Just("error"), Just("event"),
                    Just("bogus"),
                ],
                action in proptest::option::of("[a-z.]{0,8}"),
                id in proptest::option::of("[a-z0-9-]{0,8}"),
            ) {
                let mut obj = serde_json::Map::new();
                obj.insert("type".into(), json!(kind));
                obj.insert("source".into(), json!("device"));
                if let Some(a) = action {
                    obj.insert("action".into(), json!(a));
                }
                if let Some(id) = id {
                    obj.insert("request_id".into(), json!(id.clone()));
                    obj.insert("reply_to".into(), json!(id));
                }
                if let Ok(env) = parse(&serde_json::to_vec(&Value::Object(obj)).unwrap()) {
                    prop_assert!(!env.action().is_empty());
                    prop_assert!(!env.source().is_empty());
                    match env.kind() {
                        EnvelopeKind::Request => prop_assert!(!env.request_id().unwrap().is_empty()),
                        EnvelopeKind::Response => prop_assert!(!env.reply_to().unwrap().is_empty()),
                        EnvelopeKind::Error | EnvelopeKind::Event => {}
                    }
                }
            }
        }
    }
}
