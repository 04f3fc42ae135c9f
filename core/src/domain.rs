//! Domain collaborators invoked by the pipeline.
//!
//! The pipeline knows these operations only by signature. Each returns an
//! [`OperationResult`] for failures the collaborator understands, or an
//! [`OperationError`] for anything it did not anticipate. The pipeline treats
//! the latter like a retriable failure.

use crate::operation::{DependencyEmulation, OperationResult};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Unexpected failure raised by a domain collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// A dependency of the operation could not be reached.
    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Anything else.
    #[error("Operation failed unexpectedly: {0}")]
    Unexpected(String),
}

/// Future returned by domain operations.
pub type OperationFuture<'a, T = String> =
    Pin<Box<dyn Future<Output = Result<OperationResult<T>, OperationError>> + Send + 'a>>;

/// Prepares received orders for production.
pub trait OrderProcessor: Send + Sync {
    /// Process an order. On success the payload identifies the staged order.
    fn process_order<'a>(
        &'a self,
        partner_code: &'a str,
        order_id: &'a str,
        assets: &'a HashMap<String, String>,
        emulation: Option<&'a DependencyEmulation>,
        correlation_id: Option<&'a str>,
    ) -> OperationFuture<'a>;
}

/// Hands processed orders to the production system.
pub trait OrderSubmitter: Send + Sync {
    /// Submit a processed order for production.
    fn submit_order_for_production<'a>(
        &'a self,
        partner_code: &'a str,
        order_id: &'a str,
        emulation: Option<&'a DependencyEmulation>,
        correlation_id: Option<&'a str>,
    ) -> OperationFuture<'a>;
}

/// Tells operators about orders that could not be fulfilled.
pub trait Notifier: Send + Sync {
    /// Report that an order failed permanently.
    fn notify_of_order_failure<'a>(
        &'a self,
        partner_code: &'a str,
        order_id: &'a str,
        correlation_id: Option<&'a str>,
    ) -> OperationFuture<'a>;

    /// Report that a message for an order ended up on a dead-letter channel.
    fn notify_dead_letter_message<'a>(
        &'a self,
        location: &'a str,
        partner_code: &'a str,
        order_id: &'a str,
        correlation_id: Option<&'a str>,
    ) -> OperationFuture<'a>;
}
