//! Mapping between transport envelopes and Kafka records.
//!
//! Kafka has no native envelope metadata, so the fields travel as record
//! headers:
//!
//! | Header | Envelope field |
//! |---|---|
//! | `content-type` | `content_type` |
//! | `correlation-id` | `correlation_id` (also the record key) |
//! | `message-id` | `message_id` |
//! | `defer-until` | `scheduled_enqueue_time_utc`, RFC 3339 |
//! | `delivery-count` | deliveries made before this record was produced |

use chrono::{DateTime, Utc};
use order_fulfillment_core::transport::TransportMessage;
use rdkafka::message::{Header, Headers, OwnedHeaders};
use std::time::Duration;

/// Content type header name.
pub const CONTENT_TYPE: &str = "content-type";
/// Correlation id header name.
pub const CORRELATION_ID: &str = "correlation-id";
/// Message id header name.
pub const MESSAGE_ID: &str = "message-id";
/// Deferred visibility header name.
pub const DEFER_UNTIL: &str = "defer-until";
/// Previous delivery count header name.
pub const DELIVERY_COUNT: &str = "delivery-count";

/// Kafka topic for a logical channel name.
///
/// `/` becomes `.` and characters Kafka does not allow in topic names are
/// dropped, so `submit-order/$DeadLetterQueue` maps to
/// `submit-order.DeadLetterQueue`.
#[must_use]
pub fn topic_name(channel: &str) -> String {
    channel
        .chars()
        .filter_map(|c| match c {
            '/' => Some('.'),
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') => Some(c),
            _ => None,
        })
        .collect()
}

/// Record headers carrying `message`'s envelope fields.
#[must_use]
pub fn to_headers(message: &TransportMessage, previous_deliveries: u32) -> OwnedHeaders {
    let count = previous_deliveries.to_string();
    let headers = OwnedHeaders::new_with_capacity(5)
        .insert(Header {
            key: CONTENT_TYPE,
            value: Some(message.content_type.as_str()),
        })
        .insert(Header {
            key: CORRELATION_ID,
            value: Some(message.correlation_id.as_str()),
        })
        .insert(Header {
            key: MESSAGE_ID,
            value: Some(message.message_id.as_str()),
        })
        .insert(Header {
            key: DELIVERY_COUNT,
            value: Some(count.as_str()),
        });

    match message.scheduled_enqueue_time_utc {
        Some(at) => {
            let at = at.to_rfc3339();
            headers.insert(Header {
                key: DEFER_UNTIL,
                value: Some(at.as_str()),
            })
        }
        None => headers,
    }
}

/// Envelope fields read back from record headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvelopeHeaders {
    /// Body content type.
    pub content_type: Option<String>,
    /// Correlation id.
    pub correlation_id: Option<String>,
    /// Message id.
    pub message_id: Option<String>,
    /// Instant before which the record must not be handled.
    pub defer_until: Option<DateTime<Utc>>,
    /// Deliveries made before this record was produced.
    pub previous_deliveries: u32,
}

impl EnvelopeHeaders {
    /// Read the envelope headers. Unknown headers are ignored and unreadable
    /// values count as absent.
    #[must_use]
    pub fn read<H: Headers>(headers: &H) -> Self {
        let mut envelope = Self::default();

        for header in headers.iter() {
            let Some(value) = header
                .value
                .and_then(|bytes| std::str::from_utf8(bytes).ok())
            else {
                continue;
            };

            match header.key {
                CONTENT_TYPE => envelope.content_type = Some(value.to_string()),
                CORRELATION_ID => envelope.correlation_id = Some(value.to_string()),
                MESSAGE_ID => envelope.message_id = Some(value.to_string()),
                DEFER_UNTIL => {
                    envelope.defer_until = DateTime::parse_from_rfc3339(value)
                        .ok()
                        .map(|at| at.with_timezone(&Utc));
                }
                DELIVERY_COUNT => envelope.previous_deliveries = value.parse().unwrap_or_default(),
                _ => {}
            }
        }

        envelope
    }

    /// How long to hold the record back at `now`, if at all.
    #[must_use]
    pub fn remaining_deferral(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.defer_until
            .and_then(|at| (at - now).to_std().ok())
            .filter(|wait| !wait.is_zero())
    }

    /// Rebuild the envelope of a received record.
    #[must_use]
    pub fn to_message(&self, body: Vec<u8>) -> TransportMessage {
        TransportMessage {
            body,
            content_type: self.content_type.clone().unwrap_or_default(),
            correlation_id: self.correlation_id.clone().unwrap_or_default(),
            message_id: self.message_id.clone().unwrap_or_default(),
            scheduled_enqueue_time_utc: None,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::TimeDelta;

    fn message(defer: Option<DateTime<Utc>>) -> TransportMessage {
        TransportMessage {
            body: b"{}".to_vec(),
            content_type: "application/json".to_string(),
            correlation_id: "corr-1".to_string(),
            message_id: "msg-1".to_string(),
            scheduled_enqueue_time_utc: defer,
        }
    }

    #[test]
    fn channel_names_become_legal_topics() {
        assert_eq!(topic_name("process-order"), "process-order");
        assert_eq!(
            topic_name("submit-order/$DeadLetterQueue"),
            "submit-order.DeadLetterQueue"
        );
        assert_eq!(topic_name("a b:c"), "abc");
    }

    #[test]
    fn headers_carry_the_envelope() {
        let at = DateTime::parse_from_rfc3339("2025-01-01T00:00:16Z")
            .unwrap()
            .with_timezone(&Utc);

        let read = EnvelopeHeaders::read(&to_headers(&message(Some(at)), 2));

        assert_eq!(read.content_type.as_deref(), Some("application/json"));
        assert_eq!(read.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(read.message_id.as_deref(), Some("msg-1"));
        assert_eq!(read.defer_until, Some(at));
        assert_eq!(read.previous_deliveries, 2);
    }

    #[test]
    fn immediate_messages_have_no_deferral() {
        let read = EnvelopeHeaders::read(&to_headers(&message(None), 0));
        assert_eq!(read.defer_until, None);
        assert_eq!(read.remaining_deferral(Utc::now()), None);
    }

    #[test]
    fn deferral_counts_down_to_nothing() {
        let now = Utc::now();
        let headers = EnvelopeHeaders {
            defer_until: Some(now + TimeDelta::seconds(5)),
            ..EnvelopeHeaders::default()
        };

        assert_eq!(headers.remaining_deferral(now), Some(Duration::from_secs(5)));
        assert_eq!(headers.remaining_deferral(now + TimeDelta::seconds(6)), None);
    }

    #[test]
    fn unreadable_values_are_ignored() {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: DELIVERY_COUNT,
                value: Some("many"),
            })
            .insert(Header {
                key: DEFER_UNTIL,
                value: Some("tomorrow"),
            });

        let read = EnvelopeHeaders::read(&headers);
        assert_eq!(read.previous_deliveries, 0);
        assert_eq!(read.defer_until, None);
    }
}
