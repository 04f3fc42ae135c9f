//! Logical channel names used by the fulfillment workers.
//!
//! These are names, not transport addresses. A transport maps them to its own
//! addressing (the Kafka transport, for example, sanitizes them into topic names).

use serde::{Deserialize, Serialize};

/// Channel carrying [`ProcessOrder`](crate::message::ProcessOrder) commands.
pub const PROCESS_ORDER: &str = "process-order";

/// Channel carrying [`SubmitOrderForProduction`](crate::message::SubmitOrderForProduction) commands.
pub const SUBMIT_ORDER: &str = "submit-order";

/// Channel carrying [`NotifyOfFatalFailure`](crate::message::NotifyOfFatalFailure) commands.
pub const NOTIFY_FATAL_FAILURE: &str = "notify-fulfillment-failure";

/// Channel carrying every [`FulfillmentEvent`](crate::message::FulfillmentEvent).
pub const EVENTS: &str = "fulfillment-events";

/// Suffix that turns a channel name into its dead-letter channel name.
pub const DEAD_LETTER_SUFFIX: &str = "/$DeadLetterQueue";

/// Name of the dead-letter channel belonging to `channel`.
#[must_use]
pub fn dead_letter(channel: &str) -> String {
    format!("{channel}{DEAD_LETTER_SUFFIX}")
}

/// Whether `channel` is a dead-letter channel.
#[must_use]
pub fn is_dead_letter(channel: &str) -> bool {
    channel.ends_with(DEAD_LETTER_SUFFIX)
}

/// The set of channel names a deployment uses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelNames {
    /// Process-order command channel.
    pub process_order: String,
    /// Submit-for-production command channel.
    pub submit_order: String,
    /// Fatal-failure notification command channel.
    pub notify_fatal_failure: String,
    /// Event channel.
    pub events: String,
}

impl ChannelNames {
    /// The command channels, in pipeline order.
    #[must_use]
    pub fn command_channels(&self) -> [&str; 3] {
        [
            self.process_order.as_str(),
            self.submit_order.as_str(),
            self.notify_fatal_failure.as_str(),
        ]
    }

    /// Dead-letter channels of the command channels.
    #[must_use]
    pub fn dead_letter_channels(&self) -> Vec<String> {
        self.command_channels()
            .into_iter()
            .map(dead_letter)
            .collect()
    }
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self {
            process_order: PROCESS_ORDER.to_string(),
            submit_order: SUBMIT_ORDER.to_string(),
            notify_fatal_failure: NOTIFY_FATAL_FAILURE.to_string(),
            events: EVENTS.to_string(),
        }
    }
}
