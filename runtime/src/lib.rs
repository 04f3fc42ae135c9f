//! # Order Fulfillment Runtime
//!
//! Handling machinery for the order fulfillment workers.
//!
//! This crate turns deliveries from a transport into domain operations and
//! the messages that follow from them.
//!
//! ## Core Components
//!
//! - **Command pipeline**: decode, invoke the domain, then chain, retry or escalate ([`pipeline`])
//! - **Retry scheduler**: deferred republishing with exponential backoff and jitter ([`retry`])
//! - **Workflows**: the per-command parts of the pipeline ([`workflows`])
//! - **Dead-letter handler**: reports messages the broker gave up on ([`dead_letter`])
//! - **Dispatcher**: bounded concurrent handling of a delivery stream ([`dispatcher`])
//!
//! ## Example
//!
//! ```ignore
//! use order_fulfillment_runtime::{Dispatcher, FulfillmentConfig, FulfillmentWorkers};
//!
//! let config = FulfillmentConfig::from_env()?;
//! let environment = standard_environment(&config, &transport, clock, None)?;
//! let workers = FulfillmentWorkers::build(&environment, &services, &config.channels)?;
//!
//! let handler = workers.handler_for(&config.channels.process_order).unwrap();
//! Dispatcher::new(config.max_concurrency).run(deliveries, handler).await;
//! ```

/// Worker configuration from the environment
pub mod config;

/// Correlation id propagation into tracing spans
pub mod correlation;

/// Dead-letter channel handler
pub mod dead_letter;

/// Bounded concurrent dispatch of deliveries
pub mod dispatcher;

/// Record of completed deliveries for duplicate suppression
pub mod ledger;

/// Prometheus metrics for observability
pub mod metrics;

/// The command handling state machine
pub mod pipeline;

/// Publishers by message type
pub mod registry;

/// Retry logic with exponential backoff
pub mod retry;

/// Binding of channels to handlers
pub mod workers;

/// Per-command workflows
pub mod workflows;

pub use config::{ConfigError, FulfillmentConfig};
pub use dead_letter::DeadLetterHandler;
pub use dispatcher::{DispatchSummary, Dispatcher};
pub use ledger::{DeliveryKey, DeliveryLedger, InMemoryDeliveryLedger};
pub use pipeline::{
    CommandPipeline, CommandWorkflow, DeliveryHandler, Disposition, HandlerError,
    PipelineEnvironment,
};
pub use registry::{PublisherRegistry, RegistryError};
pub use retry::{CommandRetryThresholds, RetryScheduler};
pub use workers::{DomainServices, FulfillmentWorkers, standard_environment};
