//! Upgrades retired message shapes to the shape that replaced them.
//!
//! Older trackers are still in the field, so their messages keep their
//! codes and decode into the `*Deprecated` structs.  Everything past the
//! codec works on the current shapes only.

use crate::{JsException, Message, NetworkRequest, SessionEnd};

/// Metadata attached to exceptions from trackers that did not send any.
const EMPTY_METADATA: &str = "{}";

/// Map a deprecated message to its successor; any other message is
/// returned unchanged, which makes this idempotent.
pub fn normalize(message: Message) -> Message {
    match message {
        Message::SessionEndDeprecated(old) => Message::SessionEnd(SessionEnd {
            timestamp: old.timestamp,
            encryption_key: String::new(),
        }),
        Message::JsExceptionDeprecated(old) => Message::JsException(JsException {
            name: old.name,
            message: old.message,
            payload: old.payload,
            metadata: EMPTY_METADATA.to_string(),
        }),
        Message::FetchDeprecated(old) => Message::NetworkRequest(NetworkRequest {
            kind: "fetch".to_string(),
            method: old.method,
            url: old.url,
            request: old.request,
            response: old.response,
            status: old.status,
            timestamp: old.timestamp,
            duration: old.duration,
        }),
        other => other,
    }
}

/// Returns true for shapes that `normalize` rewrites.
pub fn is_deprecated(message: &Message) -> bool {
    matches!(
        message,
        Message::SessionEndDeprecated(_)
            | Message::JsExceptionDeprecated(_)
            | Message::FetchDeprecated(_)
    )
}
