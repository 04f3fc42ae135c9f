//! Correlation id propagation for pipeline logging.
//!
//! Each delivery is handled inside a `handle_command` span. The span starts
//! with the correlation id from the broker envelope and is updated once the
//! command is decoded, since the command's own id takes precedence. Every log
//! line emitted while handling inherits the field from the span.
//!
//! Recording into a span cannot fail and never changes control flow.

use tracing::Span;

/// Pick the correlation id for a delivery.
///
/// The message's own id wins. The envelope's id is the fallback. Empty
/// strings count as absent.
#[must_use]
pub fn resolve_correlation_id(message: Option<&str>, envelope: Option<&str>) -> Option<String> {
    message
        .filter(|id| !id.is_empty())
        .or_else(|| envelope.filter(|id| !id.is_empty()))
        .map(str::to_string)
}

/// Span covering the handling of one delivery.
#[must_use]
pub fn handling_span(command_type: &'static str, channel: &str, message_id: Option<&str>) -> Span {
    tracing::info_span!(
        "handle_command",
        command_type,
        channel,
        message_id = message_id.unwrap_or_default(),
        correlation_id = tracing::field::Empty,
    )
}

/// Attach `correlation_id` to `span`, leaving the span unchanged when absent.
pub fn record_correlation_id(span: &Span, correlation_id: Option<&str>) {
    if let Some(id) = correlation_id.filter(|id| !id.is_empty()) {
        span.record("correlation_id", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_correlation_wins() {
        assert_eq!(
            resolve_correlation_id(Some("message"), Some("envelope")).as_deref(),
            Some("message")
        );
    }

    #[test]
    fn envelope_is_fallback() {
        assert_eq!(
            resolve_correlation_id(None, Some("envelope")).as_deref(),
            Some("envelope")
        );
        assert_eq!(
            resolve_correlation_id(Some(""), Some("envelope")).as_deref(),
            Some("envelope")
        );
        assert_eq!(resolve_correlation_id(None, Some("")), None);
    }

    #[test]
    fn logging_inside_span_carries_correlation() {
        let subscriber = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let span = handling_span("ProcessOrder", "process-order", Some("id-1"));
            record_correlation_id(&span, Some("corr-1"));
            record_correlation_id(&span, None);

            let _entered = span.enter();
            tracing::info!("inside span");
        });
    }
}
