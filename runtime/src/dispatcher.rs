//! Concurrent delivery dispatch.
//!
//! The [`Dispatcher`] pulls deliveries from a transport stream and hands each
//! one to a [`DeliveryHandler`] on its own task. A semaphore bounds how many
//! deliveries are in flight; reading from the stream pauses while the bound is
//! reached.
//!
//! A delivery the handler fails on is abandoned, giving it back to the broker
//! for redelivery or dead-lettering.

use crate::pipeline::{DeliveryHandler, Disposition};
use futures::{Stream, StreamExt};
use order_fulfillment_core::transport::{Delivery, TransportError};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

/// Default number of deliveries handled at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// What happened to one dispatched delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatched {
    /// The handler settled it.
    Handled(Disposition),
    /// The handler failed and the delivery was given back.
    Failed,
}

/// Totals for one [`Dispatcher::run`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Deliveries the handler settled.
    pub handled: usize,
    /// Deliveries the handler failed on.
    pub failed: usize,
    /// Errors yielded by the stream instead of deliveries.
    pub receive_errors: usize,
    /// Handler tasks that panicked.
    pub panicked: usize,
}

impl DispatchSummary {
    fn absorb(&mut self, joined: Result<Dispatched, JoinError>) {
        match joined {
            Ok(Dispatched::Handled(_)) => self.handled += 1,
            Ok(Dispatched::Failed) => self.failed += 1,
            Err(error) => {
                tracing::error!(error = %error, "A delivery handler task panicked");
                self.panicked += 1;
            }
        }
    }
}

/// Runs a handler over a stream of deliveries.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    max_concurrency: usize,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

impl Dispatcher {
    /// Create a dispatcher handling up to `max_concurrency` deliveries at once.
    #[must_use]
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Maximum deliveries in flight.
    #[must_use]
    pub const fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Handle every delivery `deliveries` yields, then wait for the stragglers.
    ///
    /// Returns once the stream ends and every started handler has finished.
    /// Wrap the stream (for example with `take_until`) to stop an endless one.
    pub async fn run<S, D>(&self, deliveries: S, handler: Arc<dyn DeliveryHandler>) -> DispatchSummary
    where
        S: Stream<Item = Result<D, TransportError>> + Send,
        D: Delivery + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        let mut summary = DispatchSummary::default();
        let mut deliveries = std::pin::pin!(deliveries);

        while let Some(received) = deliveries.next().await {
            let delivery = match received {
                Ok(delivery) => delivery,
                Err(error) => {
                    tracing::error!(error = %error, "Failed to receive a delivery");
                    summary.receive_errors += 1;
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let handler = Arc::clone(&handler);
            tasks.spawn(async move {
                let dispatched = dispatch(handler.as_ref(), &delivery).await;
                drop(permit);
                dispatched
            });

            while let Some(joined) = tasks.try_join_next() {
                summary.absorb(joined);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            summary.absorb(joined);
        }

        tracing::info!(
            handled = summary.handled,
            failed = summary.failed,
            receive_errors = summary.receive_errors,
            "Delivery stream ended"
        );
        summary
    }
}

/// Handle one delivery, giving it back to the broker if handling fails.
pub async fn dispatch(handler: &dyn DeliveryHandler, delivery: &dyn Delivery) -> Dispatched {
    match handler.handle(delivery).await {
        Ok(disposition) => Dispatched::Handled(disposition),
        Err(error) => {
            if error.is_escalation() {
                tracing::debug!(channel = delivery.channel(), "Delivery escalated; returning it to the broker");
            } else {
                tracing::error!(channel = delivery.channel(), error = %error, "Delivery handling failed");
            }

            if let Err(error) = delivery.abandon().await {
                tracing::warn!(channel = delivery.channel(), error = %error, "Failed to abandon delivery");
            }
            Dispatched::Failed
        }
    }
}
