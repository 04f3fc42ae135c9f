//! Commands and events exchanged between fulfillment workers.
//!
//! Every message carries a [`MessageHeader`]. Commands add an attempt counter
//! ([`CommandHeader`]) and order-scoped messages add an [`OrderContext`]. The
//! headers are flattened on the wire, so a `ProcessOrder` serializes as a single
//! camelCase JSON object:
//!
//! ```text
//! {
//!   "id": "5f0c…",
//!   "occurredTimeUtc": "2025-01-01T00:00:00Z",
//!   "correlationId": "abc",
//!   "currentUser": null,
//!   "previousAttemptsToHandleCount": 0,
//!   "partnerCode": "SQUIRE",
//!   "orderId": "ABC123",
//!   "assets": { "front": "https://…" },
//!   "emulation": null
//! }
//! ```
//!
//! All structs deserialize with defaults for absent fields. A payload that is
//! valid JSON but not a command of the expected shape therefore decodes to an
//! empty message, which [`OrderScoped::is_empty`] detects.

use crate::operation::DependencyEmulation;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use uuid::Uuid;

/// Envelope fields shared by every command and event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageHeader {
    /// Unique identifier assigned by the producer.
    pub id: Uuid,
    /// When the command or event was generated.
    pub occurred_time_utc: DateTime<Utc>,
    /// Ordering hint among messages produced close together.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i32>,
    /// Identifier linking every message of one logical request.
    pub correlation_id: Option<String>,
    /// Acting principal, absent for system-generated messages.
    pub current_user: Option<String>,
    /// Set by a consumer on local receipt. Diagnostic only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_received_time_utc: Option<DateTime<Utc>>,
}

/// Envelope fields shared by every command.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandHeader {
    /// Common message fields.
    #[serde(flatten)]
    pub message: MessageHeader,
    /// Number of earlier attempts to handle this command.
    ///
    /// Only the retry scheduler changes this value, and only upward.
    pub previous_attempts_to_handle_count: u32,
}

/// Order identity carried by order-scoped commands and events.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderContext {
    /// Partner that submitted the order.
    pub partner_code: Option<String>,
    /// Partner-assigned order identifier.
    pub order_id: Option<String>,
}

/// Behavior shared by every message type.
pub trait Message: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Stable type name, used for registry lookup, logging and metric labels.
    const TYPE: &'static str;

    /// Envelope fields.
    fn header(&self) -> &MessageHeader;

    /// Mutable envelope fields.
    fn header_mut(&mut self) -> &mut MessageHeader;

    /// Type name of this particular message.
    ///
    /// Differs from [`Message::TYPE`] only for unions of several message types.
    fn message_type(&self) -> &'static str {
        Self::TYPE
    }

    /// Message identifier.
    fn id(&self) -> Uuid {
        self.header().id
    }

    /// Correlation identifier, if one was assigned.
    fn correlation_id(&self) -> Option<&str> {
        self.header().correlation_id.as_deref()
    }
}

/// A message requesting that an action be performed.
pub trait Command: Message {
    /// Command envelope fields.
    fn command_header(&self) -> &CommandHeader;

    /// Mutable command envelope fields.
    fn command_header_mut(&mut self) -> &mut CommandHeader;

    /// Number of earlier attempts to handle this command.
    fn previous_attempts(&self) -> u32 {
        self.command_header().previous_attempts_to_handle_count
    }
}

/// A message announcing that something already happened.
pub trait Event: Message {}

/// A message that belongs to a specific partner order.
pub trait OrderScoped: Message {
    /// Order identity.
    fn order(&self) -> &OrderContext;

    /// Mutable order identity.
    fn order_mut(&mut self) -> &mut OrderContext;

    /// Whether the message carries neither an identifier nor an order id.
    ///
    /// This is how a payload of the wrong shape shows up after decoding.
    fn is_empty(&self) -> bool {
        self.header().id.is_nil()
            && self
                .order()
                .order_id
                .as_deref()
                .is_none_or(str::is_empty)
    }

    /// Create a command for the same order.
    ///
    /// See [`OrderScoped::derive_command_with`].
    #[must_use]
    fn derive_command<C>(&self) -> C
    where
        C: Command + OrderScoped + Default,
    {
        derive_child(self, |_| {})
    }

    /// Create a command for the same order, then let the caller adjust it.
    ///
    /// The child gets a fresh id, the current time, and copies of the
    /// correlation id, current user, partner code and order id. `mutate` runs
    /// after those copies, so it can override any of them.
    #[must_use]
    fn derive_command_with<C>(&self, mutate: impl FnOnce(&mut C)) -> C
    where
        C: Command + OrderScoped + Default,
    {
        derive_child(self, mutate)
    }

    /// Create an event for the same order.
    #[must_use]
    fn derive_event<E>(&self) -> E
    where
        E: Event + OrderScoped + Default,
    {
        derive_child(self, |_| {})
    }

    /// Create an event for the same order, then let the caller adjust it.
    #[must_use]
    fn derive_event_with<E>(&self, mutate: impl FnOnce(&mut E)) -> E
    where
        E: Event + OrderScoped + Default,
    {
        derive_child(self, mutate)
    }
}

fn derive_child<P, M>(parent: &P, mutate: impl FnOnce(&mut M)) -> M
where
    P: OrderScoped,
    M: OrderScoped + Default,
{
    let mut child = M::default();

    let header = child.header_mut();
    header.id = Uuid::new_v4();
    header.occurred_time_utc = Utc::now();
    header.correlation_id.clone_from(&parent.header().correlation_id);
    header.current_user.clone_from(&parent.header().current_user);

    child.order_mut().clone_from(parent.order());

    mutate(&mut child);
    child
}

macro_rules! order_command {
    ($name:ident) => {
        impl Message for $name {
            const TYPE: &'static str = stringify!($name);

            fn header(&self) -> &MessageHeader {
                &self.command.message
            }

            fn header_mut(&mut self) -> &mut MessageHeader {
                &mut self.command.message
            }
        }

        impl Command for $name {
            fn command_header(&self) -> &CommandHeader {
                &self.command
            }

            fn command_header_mut(&mut self) -> &mut CommandHeader {
                &mut self.command
            }
        }

        impl OrderScoped for $name {
            fn order(&self) -> &OrderContext {
                &self.order
            }

            fn order_mut(&mut self) -> &mut OrderContext {
                &mut self.order
            }
        }
    };
}

macro_rules! order_event {
    ($($name:ident),+ $(,)?) => {
        $(
            #[doc = concat!("The `", stringify!($name), "` order event.")]
            #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
            #[serde(rename_all = "camelCase", default)]
            pub struct $name {
                /// Envelope fields.
                #[serde(flatten)]
                pub header: MessageHeader,
                /// Order identity.
                #[serde(flatten)]
                pub order: OrderContext,
            }

            impl Message for $name {
                const TYPE: &'static str = stringify!($name);

                fn header(&self) -> &MessageHeader {
                    &self.header
                }

                fn header_mut(&mut self) -> &mut MessageHeader {
                    &mut self.header
                }
            }

            impl Event for $name {}

            impl OrderScoped for $name {
                fn order(&self) -> &OrderContext {
                    &self.order
                }

                fn order_mut(&mut self) -> &mut OrderContext {
                    &mut self.order
                }
            }

            impl From<$name> for FulfillmentEvent {
                fn from(event: $name) -> Self {
                    Self::$name(event)
                }
            }
        )+

        /// Every event published on the fulfillment event channel.
        ///
        /// Encoded with an `eventType` discriminator next to the event's own fields.
        #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(tag = "eventType")]
        pub enum FulfillmentEvent {
            $(
                #[doc = concat!("See [`", stringify!($name), "`].")]
                $name($name),
            )+
        }

        impl FulfillmentEvent {
            fn inner_header(&self) -> &MessageHeader {
                match self {
                    $(Self::$name(event) => &event.header,)+
                }
            }

            fn inner_header_mut(&mut self) -> &mut MessageHeader {
                match self {
                    $(Self::$name(event) => &mut event.header,)+
                }
            }

            /// Order identity of the wrapped event.
            #[must_use]
            pub const fn order(&self) -> &OrderContext {
                match self {
                    $(Self::$name(event) => &event.order,)+
                }
            }

            fn inner_type(&self) -> &'static str {
                match self {
                    $(Self::$name(_) => $name::TYPE,)+
                }
            }
        }
    };
}

/// Triggers processing of a newly received order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessOrder {
    /// Command envelope fields.
    #[serde(flatten)]
    pub command: CommandHeader,
    /// Order identity.
    #[serde(flatten)]
    pub order: OrderContext,
    /// Assets associated with the order, keyed by name.
    pub assets: HashMap<String, String>,
    /// Canned results for external dependencies, for isolated testing.
    pub emulation: Option<DependencyEmulation>,
}

order_command!(ProcessOrder);

/// Triggers submission of a processed order for production.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubmitOrderForProduction {
    /// Command envelope fields.
    #[serde(flatten)]
    pub command: CommandHeader,
    /// Order identity.
    #[serde(flatten)]
    pub order: OrderContext,
    /// Canned results for external dependencies, for isolated testing.
    pub emulation: Option<DependencyEmulation>,
}

order_command!(SubmitOrderForProduction);

/// Requests that operators be told an order could not be fulfilled.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotifyOfFatalFailure {
    /// Command envelope fields.
    #[serde(flatten)]
    pub command: CommandHeader,
    /// Order identity.
    #[serde(flatten)]
    pub order: OrderContext,
}

order_command!(NotifyOfFatalFailure);

/// Any order command, read with only the shared fields.
///
/// Used where the concrete command type is unknown, such as when draining a
/// dead-letter channel that may hold any of the order commands.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderCommand {
    /// Command envelope fields.
    #[serde(flatten)]
    pub command: CommandHeader,
    /// Order identity.
    #[serde(flatten)]
    pub order: OrderContext,
}

order_command!(OrderCommand);

order_event!(
    OrderReceived,
    OrderProcessed,
    OrderProcessingFailed,
    OrderSubmitted,
    OrderSubmissionFailed,
    NotificationSent,
    NotificationFailed,
);

impl Message for FulfillmentEvent {
    const TYPE: &'static str = "FulfillmentEvent";

    fn header(&self) -> &MessageHeader {
        self.inner_header()
    }

    fn header_mut(&mut self) -> &mut MessageHeader {
        self.inner_header_mut()
    }

    fn message_type(&self) -> &'static str {
        self.inner_type()
    }
}

impl Event for FulfillmentEvent {}
