//! JSON wire codec shared by every publisher and handler.
//!
//! Field names are camelCase and enums travel as their variant names; both are
//! fixed by the `serde` attributes on the message types, so this module only
//! owns the encoding calls and the error type.

use crate::message::Message;
use thiserror::Error;

/// Content type stamped on every outgoing transport message.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Longest body excerpt included in diagnostics.
const PREVIEW_LIMIT: usize = 512;

/// Errors from encoding or decoding message bodies.
#[derive(Error, Debug)]
pub enum CodecError {
    /// A message could not be encoded.
    #[error("Failed to encode {message_type}: {source}")]
    Encode {
        /// Type of the message being encoded.
        message_type: &'static str,
        /// Underlying serializer error.
        #[source]
        source: serde_json::Error,
    },

    /// A body could not be decoded into the expected type.
    #[error("Failed to decode {message_type}: {source}")]
    Decode {
        /// Type the body was decoded as.
        message_type: &'static str,
        /// Underlying deserializer error.
        #[source]
        source: serde_json::Error,
    },
}

/// Encode a message as a JSON body.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the message cannot be serialized.
pub fn encode<M: Message>(message: &M) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(message).map_err(|source| CodecError::Encode {
        message_type: message.message_type(),
        source,
    })
}

/// Decode a JSON body into a message of type `M`.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] if the body is not valid JSON for `M`.
pub fn decode<M: Message>(body: &[u8]) -> Result<M, CodecError> {
    serde_json::from_slice(body).map_err(|source| CodecError::Decode {
        message_type: M::TYPE,
        source,
    })
}

/// Printable excerpt of a body, for logging malformed payloads.
///
/// Never fails: invalid UTF-8 is replaced and long bodies are truncated.
#[must_use]
pub fn body_preview(body: &[u8]) -> String {
    let end = body.len().min(PREVIEW_LIMIT);
    let mut preview = String::from_utf8_lossy(&body[..end]).into_owned();
    if body.len() > PREVIEW_LIMIT {
        preview.push('…');
    }
    preview
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::message::{NotifyOfFatalFailure, OrderScoped};

    #[test]
    fn decode_error_names_the_target_type() {
        let error = decode::<NotifyOfFatalFailure>(b"not json").unwrap_err();
        assert!(error.to_string().starts_with("Failed to decode NotifyOfFatalFailure"));
    }

    #[test]
    fn encoded_body_decodes_to_same_command() {
        let mut command = NotifyOfFatalFailure::default();
        command.order.order_id = Some("ABC123".to_string());

        let body = encode(&command).unwrap();
        let decoded: NotifyOfFatalFailure = decode(&body).unwrap();

        assert_eq!(decoded, command);
        assert!(!decoded.is_empty());
    }

    #[test]
    fn preview_handles_binary_and_long_bodies() {
        assert_eq!(body_preview(&[0xff, b'a']), "\u{fffd}a");

        let long = vec![b'x'; PREVIEW_LIMIT + 10];
        let preview = body_preview(&long);
        assert!(preview.ends_with('…'));
        assert_eq!(preview.chars().count(), PREVIEW_LIMIT + 1);
    }
}
