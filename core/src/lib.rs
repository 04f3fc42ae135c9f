//! # Order Fulfillment Core
//!
//! Message model and messaging contracts for the order fulfillment pipeline.
//!
//! This crate provides the pieces every worker shares:
//! - The command/event envelope ([`message`]) and the concrete order messages
//! - The result contract returned by domain operations ([`operation`])
//! - The publisher contract and its channel-backed implementation ([`publisher`])
//! - The narrow transport contract publishers and handlers reach the broker through ([`transport`])
//! - The JSON wire codec ([`codec`]) and the logical channel names ([`channels`])
//! - The domain collaborator ports invoked by the pipeline ([`domain`])
//!
//! ## Message Flow
//!
//! ```text
//! ┌──────────────┐   publish    ┌───────────────┐   deliver   ┌──────────────┐
//! │   Producer   │─────────────▶│   Transport   │────────────▶│   Pipeline   │
//! └──────────────┘              └───────────────┘             └──────┬───────┘
//!                                       ▲                            │
//!                                       │  follow-on / retry / event │
//!                                       └────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use order_fulfillment_core::message::{OrderScoped, ProcessOrder, SubmitOrderForProduction};
//!
//! let mut process = ProcessOrder::default();
//! process.order.partner_code = Some("SQUIRE".to_string());
//! process.order.order_id = Some("ABC123".to_string());
//!
//! let submit: SubmitOrderForProduction = process.derive_command();
//! assert_eq!(submit.order.order_id.as_deref(), Some("ABC123"));
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;

pub mod channels;
pub mod codec;
pub mod domain;
pub mod message;
pub mod operation;
pub mod publisher;
pub mod transport;

/// Environment module - Injected dependencies shared by the pipeline
///
/// Time is the only ambient dependency the messaging layer reads directly;
/// everything else is passed in as a trait object so tests can substitute it.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait for time operations
    ///
    /// Abstracts over system time so retry instants and synthesized
    /// messages can be tested deterministically.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Clock backed by the system's wall time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
