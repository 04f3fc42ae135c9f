//! Scripted domain collaborators.
//!
//! [`ScriptedDomain`] implements every domain port. Each operation answers from
//! its own [`ScriptedResponses`]: queued responses first, then a fallback that
//! defaults to success. Every call is recorded with its arguments.

#![allow(clippy::missing_panics_doc)]

use order_fulfillment_core::domain::{
    Notifier, OperationError, OperationFuture, OrderProcessor, OrderSubmitter,
};
use order_fulfillment_core::operation::{DependencyEmulation, OperationResult};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Response of a scripted operation.
pub type ScriptedResponse = Result<OperationResult, OperationError>;

/// Arguments of one recorded call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordedCall {
    /// Partner code passed to the operation.
    pub partner_code: String,
    /// Order id passed to the operation.
    pub order_id: String,
    /// Correlation id passed to the operation.
    pub correlation_id: Option<String>,
    /// Dead-letter location, for dead-letter notifications.
    pub location: Option<String>,
    /// Number of assets, for order processing.
    pub asset_count: usize,
    /// Whether emulation results were passed.
    pub emulated: bool,
}

#[derive(Default)]
struct Script {
    queued: VecDeque<ScriptedResponse>,
    fallback: Option<ScriptedResponse>,
    calls: Vec<RecordedCall>,
}

/// Responses and call log for one operation.
#[derive(Default)]
pub struct ScriptedResponses {
    script: Mutex<Script>,
}

impl ScriptedResponses {
    /// Answer the next unanswered call with `response`.
    pub fn push(&self, response: ScriptedResponse) {
        self.lock().queued.push_back(response);
    }

    /// Answer calls with `response` once the queued responses run out.
    pub fn always(&self, response: ScriptedResponse) {
        self.lock().fallback = Some(response);
    }

    /// Calls made so far, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Number of calls made so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    fn answer(&self, call: RecordedCall) -> ScriptedResponse {
        let mut script = self.lock();
        script.calls.push(call);
        script
            .queued
            .pop_front()
            .or_else(|| script.fallback.clone())
            .unwrap_or_else(|| Ok(OperationResult::success("scripted".to_string())))
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Domain collaborators that answer from scripts.
#[derive(Default)]
pub struct ScriptedDomain {
    /// Responses of [`OrderProcessor::process_order`].
    pub processing: ScriptedResponses,
    /// Responses of [`OrderSubmitter::submit_order_for_production`].
    pub submission: ScriptedResponses,
    /// Responses of [`Notifier::notify_of_order_failure`].
    pub failure_notification: ScriptedResponses,
    /// Responses of [`Notifier::notify_dead_letter_message`].
    pub dead_letter_notification: ScriptedResponses,
}

impl ScriptedDomain {
    /// Collaborators that succeed at everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn call(partner_code: &str, order_id: &str, correlation_id: Option<&str>) -> RecordedCall {
    RecordedCall {
        partner_code: partner_code.to_string(),
        order_id: order_id.to_string(),
        correlation_id: correlation_id.map(str::to_string),
        ..RecordedCall::default()
    }
}

impl OrderProcessor for ScriptedDomain {
    fn process_order<'a>(
        &'a self,
        partner_code: &'a str,
        order_id: &'a str,
        assets: &'a HashMap<String, String>,
        emulation: Option<&'a DependencyEmulation>,
        correlation_id: Option<&'a str>,
    ) -> OperationFuture<'a> {
        let response = self.processing.answer(RecordedCall {
            asset_count: assets.len(),
            emulated: emulation.is_some(),
            ..call(partner_code, order_id, correlation_id)
        });
        Box::pin(async move { response })
    }
}

impl OrderSubmitter for ScriptedDomain {
    fn submit_order_for_production<'a>(
        &'a self,
        partner_code: &'a str,
        order_id: &'a str,
        emulation: Option<&'a DependencyEmulation>,
        correlation_id: Option<&'a str>,
    ) -> OperationFuture<'a> {
        let response = self.submission.answer(RecordedCall {
            emulated: emulation.is_some(),
            ..call(partner_code, order_id, correlation_id)
        });
        Box::pin(async move { response })
    }
}

impl Notifier for ScriptedDomain {
    fn notify_of_order_failure<'a>(
        &'a self,
        partner_code: &'a str,
        order_id: &'a str,
        correlation_id: Option<&'a str>,
    ) -> OperationFuture<'a> {
        let response = self
            .failure_notification
            .answer(call(partner_code, order_id, correlation_id));
        Box::pin(async move { response })
    }

    fn notify_dead_letter_message<'a>(
        &'a self,
        location: &'a str,
        partner_code: &'a str,
        order_id: &'a str,
        correlation_id: Option<&'a str>,
    ) -> OperationFuture<'a> {
        let response = self.dead_letter_notification.answer(RecordedCall {
            location: Some(location.to_string()),
            ..call(partner_code, order_id, correlation_id)
        });
        Box::pin(async move { response })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn queued_responses_come_before_fallback() {
        let domain = ScriptedDomain::new();
        domain
            .submission
            .push(Ok(OperationResult::retriable_failure("busy")));
        domain
            .submission
            .always(Err(OperationError::Unexpected("boom".to_string())));

        let first = domain
            .submit_order_for_production("P", "O", None, Some("c"))
            .await
            .unwrap();
        assert!(!first.is_success());

        let second = domain.submit_order_for_production("P", "O", None, None).await;
        assert!(second.is_err());

        let calls = domain.submission.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].correlation_id.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn unscripted_operations_succeed() {
        let domain = ScriptedDomain::new();
        let result = domain
            .notify_dead_letter_message("q/$DeadLetterQueue", "P", "O", None)
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(
            domain.dead_letter_notification.calls()[0].location.as_deref(),
            Some("q/$DeadLetterQueue")
        );
    }
}
