//! Client and relay wire messages (NIP-01, NIP-42).
//!
//! Every message is a JSON array whose first element names the command.
//! Client → relay:
//! - `["EVENT", <event>]`
//! - `["REQ", <sub_id>, <filter>, ...]`
//! - `["CLOSE", <sub_id>]`
//! - `["AUTH", <event>]`
//!
//! Relay → client:
//! - `["EVENT", <sub_id>, <event>]`
//! - `["OK", <event_id>, <accepted>, <message>]`
//! - `["EOSE", <sub_id>]`
//! - `["CLOSED", <sub_id>, <message>]`
//! - `["NOTICE", <message>]`
//! - `["AUTH", <challenge>]`

use crate::event::Event;
use crate::filter::Filter;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

/// Maximum length of a subscription id.
pub const MAX_SUBSCRIPTION_ID_LEN: usize = 64;

/// Errors from parsing a client message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// The text is not valid JSON.
    #[error("could not parse message as JSON")]
    NotJson,
    /// The JSON value is not a non-empty array led by a command string.
    #[error("message must be an array starting with a command")]
    NotCommand,
    /// The command is not one this relay understands.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    /// The subscription id is empty or too long.
    #[error("subscription id must be 1-64 characters")]
    BadSubscriptionId,
    /// The event object could not be decoded.
    #[error("malformed event: {0}")]
    BadEvent(String),
    /// A filter object could not be decoded.
    #[error("malformed filter: {0}")]
    BadFilter(String),
    /// The array has the wrong number of elements for its command.
    #[error("wrong number of elements for {0}")]
    Arity(&'static str),
}

/// A message received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Publish an event.
    Event(Box<Event>),
    /// Open (or replace) a subscription.
    Req {
        /// Connection-scoped subscription id.
        sub_id: String,
        /// One or more filters, OR-ed together.
        filters: Vec<Filter>,
    },
    /// Cancel a subscription.
    Close {
        /// Subscription id to cancel.
        sub_id: String,
    },
    /// Answer an authentication challenge.
    Auth(Box<Event>),
}

fn sub_id(value: Option<&Value>) -> Result<String, MessageError> {
    match value.and_then(Value::as_str) {
        Some(id) if !id.is_empty() && id.chars().count() <= MAX_SUBSCRIPTION_ID_LEN => {
            Ok(id.to_string())
        }
        _ => Err(MessageError::BadSubscriptionId),
    }
}

fn event(value: Value) -> Result<Box<Event>, MessageError> {
    serde_json::from_value(value)
        .map(Box::new)
        .map_err(|e| MessageError::BadEvent(e.to_string()))
}

impl ClientMessage {
    /// Parses a client message from WebSocket text.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] if the text is not a well-formed command.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(text).map_err(|_| MessageError::NotJson)?;
        let Value::Array(mut items) = value else {
            return Err(MessageError::NotCommand);
        };
        let command = match items.first() {
            Some(Value::String(cmd)) => cmd.clone(),
            _ => return Err(MessageError::NotCommand),
        };

        match command.as_str() {
            "EVENT" => {
                if items.len() != 2 {
                    return Err(MessageError::Arity("EVENT"));
                }
                Ok(Self::Event(event(items.swap_remove(1))?))
            }
            "AUTH" => {
                if items.len() != 2 {
                    return Err(MessageError::Arity("AUTH"));
                }
                Ok(Self::Auth(event(items.swap_remove(1))?))
            }
            "CLOSE" => {
                if items.len() != 2 {
                    return Err(MessageError::Arity("CLOSE"));
                }
                Ok(Self::Close {
                    sub_id: sub_id(items.get(1))?,
                })
            }
            "REQ" => {
                if items.len() < 3 {
                    return Err(MessageError::Arity("REQ"));
                }
                let sub_id = sub_id(items.get(1))?;
                let filters = items
                    .drain(2..)
                    .map(|f| {
                        serde_json::from_value(f).map_err(|e| MessageError::BadFilter(e.to_string()))
                    })
                    .collect::<Result<Vec<Filter>, _>>()?;
                Ok(Self::Req { sub_id, filters })
            }
            other => Err(MessageError::UnknownCommand(other.to_string())),
        }
    }

    /// Command name, used as a metrics label.
    #[must_use]
    pub const fn command(&self) -> &'static str {
        match self {
            Self::Event(_) => "EVENT",
            Self::Req { .. } => "REQ",
            Self::Close { .. } => "CLOSE",
            Self::Auth(_) => "AUTH",
        }
    }
}

/// A message sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// An event matching one of the client's subscriptions.
    Event {
        /// Subscription the event matched.
        sub_id: String,
        /// The event.
        event: Arc<Event>,
    },
    /// Result of publishing an event.
    Ok {
        /// Id of the published event.
        event_id: String,
        /// Whether the event was accepted.
        accepted: bool,
        /// `prefix: detail` message, empty on plain success.
        message: String,
    },
    /// End of stored events for a subscription.
    Eose {
        /// Subscription id.
        sub_id: String,
    },
    /// The relay ended a subscription.
    Closed {
        /// Subscription id.
        sub_id: String,
        /// `prefix: detail` reason.
        message: String,
    },
    /// Human-readable notice.
    Notice(String),
    /// Authentication challenge.
    Auth {
        /// Random challenge string.
        challenge: String,
    },
}

impl RelayMessage {
    /// Builds an `OK` message with a `prefix: detail` reason.
    #[must_use]
    pub fn ok(event_id: &str, accepted: bool, prefix: &str, detail: &str) -> Self {
        let message = if prefix.is_empty() {
            detail.to_string()
        } else {
            format!("{prefix}: {detail}")
        };
        Self::Ok {
            event_id: event_id.to_string(),
            accepted,
            message,
        }
    }

    /// Serializes the message to WebSocket text.
    #[must_use]
    pub fn to_json(&self) -> String {
        let value = match self {
            Self::Event { sub_id, event } => json!(["EVENT", sub_id, event.as_ref()]),
            Self::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            Self::Eose { sub_id } => json!(["EOSE", sub_id]),
            Self::Closed { sub_id, message } => json!(["CLOSED", sub_id, message]),
            Self::Notice(message) => json!(["NOTICE", message]),
            Self::Auth { challenge } => json!(["AUTH", challenge]),
        };
        value.to_string()
    }

    /// Command name, used as a metrics label.
    #[must_use]
    pub const fn command(&self) -> &'static str {
        match self {
            Self::Event { .. } => "EVENT",
            Self::Ok { .. } => "OK",
            Self::Eose { .. } => "EOSE",
            Self::Closed { .. } => "CLOSED",
            Self::Notice(_) => "NOTICE",
            Self::Auth { .. } => "AUTH",
        }
    }
}
