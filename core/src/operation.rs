//! Results reported by domain operations.
//!
//! Domain collaborators answer with an [`OperationResult`], a loosely-typed
//! record that tolerates the `Unknown` states a wire payload may carry. Before
//! the pipeline branches, a result is normalized into a [`HandlingOutcome`],
//! which is also what an unexpected error turns into. Both failure channels
//! therefore reach the same retry/escalate decision.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known failure reasons.
pub mod failure_reason {
    /// An unexpected error was raised while performing the operation.
    pub const EXCEPTION_OCCURRED: &str = "An exception occurred.";

    /// The order could not be found in pending storage.
    pub const PENDING_ORDER_NOT_FOUND: &str = "The order was not found in pending storage.";
}

/// Whether an operation succeeded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// Not reported.
    #[default]
    Unknown,
    /// The operation succeeded.
    Success,
    /// The operation failed.
    Failure,
}

/// Whether a failed operation may be attempted again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recoverability {
    /// Not reported.
    #[default]
    Unknown,
    /// Trying again may succeed.
    Retriable,
    /// Trying again will not help.
    Final,
}

/// The result of a domain operation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperationResult<T = String> {
    /// Whether the operation succeeded.
    pub outcome: Outcome,
    /// Short machine-oriented explanation. Not meant for end users.
    pub reason: Option<String>,
    /// Whether a failure may be retried.
    pub recoverable: Recoverability,
    /// Operation-specific result data.
    pub payload: T,
}

impl<T> OperationResult<T> {
    /// A successful result carrying `payload`.
    #[must_use]
    pub const fn success(payload: T) -> Self {
        Self {
            outcome: Outcome::Success,
            reason: None,
            recoverable: Recoverability::Unknown,
            payload,
        }
    }

    /// Whether the operation succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

impl<T: Default> OperationResult<T> {
    /// A failure that may be retried.
    #[must_use]
    pub fn retriable_failure(reason: impl Into<String>) -> Self {
        Self::failure(reason, Recoverability::Retriable)
    }

    /// A failure that must not be retried.
    #[must_use]
    pub fn final_failure(reason: impl Into<String>) -> Self {
        Self::failure(reason, Recoverability::Final)
    }

    /// The result used when an unexpected error was raised.
    #[must_use]
    pub fn exception() -> Self {
        Self::retriable_failure(failure_reason::EXCEPTION_OCCURRED)
    }

    fn failure(reason: impl Into<String>, recoverable: Recoverability) -> Self {
        Self {
            outcome: Outcome::Failure,
            reason: Some(reason.into()),
            recoverable,
            payload: T::default(),
        }
    }
}

/// Canned results for operations with external dependencies.
///
/// Carried on commands so a test harness can drive the workers without
/// reaching real partner systems.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DependencyEmulation {
    /// Result of retrieving the order details.
    pub order_details: Option<OperationResult>,
    /// Result of building the production order message.
    pub create_order_message: Option<OperationResult>,
    /// Result of submitting the order for production.
    pub order_submission: Option<OperationResult>,
}

/// How a single handling attempt ended, before retry policy is applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlingOutcome<T = String> {
    /// The operation succeeded.
    Success(T),
    /// The operation failed and may be attempted again.
    RetriableFailure(String),
    /// The operation failed and must not be attempted again.
    FinalFailure(String),
}

impl<T> HandlingOutcome<T> {
    /// The outcome used for an unexpected error.
    #[must_use]
    pub fn exception() -> Self {
        Self::RetriableFailure(failure_reason::EXCEPTION_OCCURRED.to_string())
    }

    /// Whether this is a success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Whether this failure bypasses the retry budget.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::FinalFailure(_))
    }

    /// Failure reason, if this is a failure.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::RetriableFailure(reason) | Self::FinalFailure(reason) => Some(reason),
        }
    }
}

impl<T> From<OperationResult<T>> for HandlingOutcome<T> {
    /// Anything short of a reported success is a failure, and only an explicit
    /// `Final` makes it non-retriable.
    fn from(result: OperationResult<T>) -> Self {
        if result.outcome == Outcome::Success {
            return Self::Success(result.payload);
        }

        let reason = result
            .reason
            .unwrap_or_else(|| format!("The operation reported {:?}.", result.outcome));

        match result.recoverable {
            Recoverability::Final => Self::FinalFailure(reason),
            Recoverability::Retriable | Recoverability::Unknown => Self::RetriableFailure(reason),
        }
    }
}

impl<T> fmt::Display for HandlingOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(_) => f.write_str("success"),
            Self::RetriableFailure(reason) => write!(f, "retriable failure: {reason}"),
            Self::FinalFailure(reason) => write!(f, "final failure: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn enums_serialize_by_name() {
        let result = OperationResult::<String>::final_failure("gone");
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["outcome"], "Failure");
        assert_eq!(json["recoverable"], "Final");
        assert_eq!(json["reason"], "gone");
        assert_eq!(json["payload"], "");
    }

    #[test]
    fn exception_result_is_retriable() {
        let result = OperationResult::<String>::exception();
        assert_eq!(result.outcome, Outcome::Failure);
        assert_eq!(result.recoverable, Recoverability::Retriable);
        assert_eq!(result.reason.as_deref(), Some(failure_reason::EXCEPTION_OCCURRED));
    }

    #[test]
    fn normalizes_success() {
        let outcome: HandlingOutcome = OperationResult::success("staging/key".to_string()).into();
        assert_eq!(outcome, HandlingOutcome::Success("staging/key".to_string()));
    }

    #[test]
    fn only_explicit_final_is_final() {
        let final_failure: HandlingOutcome = OperationResult::<String>::final_failure("bad").into();
        assert!(final_failure.is_final());

        let unknown: HandlingOutcome = OperationResult::<String>::default().into();
        assert!(matches!(unknown, HandlingOutcome::RetriableFailure(_)));

        let success_marked_final = OperationResult {
            outcome: Outcome::Success,
            recoverable: Recoverability::Final,
            ..OperationResult::success(String::new())
        };
        assert!(HandlingOutcome::from(success_marked_final).is_success());
    }

    #[test]
    fn missing_reason_is_filled_in() {
        let outcome: HandlingOutcome = OperationResult::<String> {
            outcome: Outcome::Failure,
            ..OperationResult::default()
        }
        .into();
        assert_eq!(outcome.reason(), Some("The operation reported Failure."));
    }
}
