//! Event bodies, frames and the chat event catalogue
//!
//! Every payload that crosses the wire is a JSON object carrying a string
//! `eventType` tag plus event-specific fields. [`EventBody`] is the typed
//! envelope both sides use: the server builds one before fanout, the client
//! decodes one per inbound frame and routes it by exact tag match.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EventError;
use crate::types::{ConnectionId, DIRECT_CHANNEL};

const EVENT_TYPE_FIELD: &str = "eventType";

// =============================================================================
// Envelope
// =============================================================================

/// A JSON object body with a validated `eventType` tag
#[derive(Debug, Clone, PartialEq)]
pub struct EventBody {
    event_type: String,
    data: Map<String, Value>,
}

impl EventBody {
    /// Build a body from an event type and an object of extra fields.
    ///
    /// `Value::Null` is accepted as "no extra fields".
    pub fn new(event_type: impl Into<String>, fields: Value) -> Result<Self, EventError> {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(EventError::MissingEventType);
        }

        let mut data = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(EventError::NotAnObject),
        };
        data.insert(EVENT_TYPE_FIELD.to_string(), Value::String(event_type.clone()));

        Ok(Self { event_type, data })
    }

    /// Build a body from any serializable value that already carries `eventType`
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, EventError> {
        Self::from_value(serde_json::to_value(value)?)
    }

    /// Validate a decoded JSON value as an event body
    pub fn from_value(value: Value) -> Result<Self, EventError> {
        let Value::Object(data) = value else {
            return Err(EventError::NotAnObject);
        };

        let event_type = match data.get(EVENT_TYPE_FIELD) {
            Some(Value::String(tag)) if !tag.trim().is_empty() => tag.clone(),
            _ => return Err(EventError::MissingEventType),
        };

        Ok(Self { event_type, data })
    }

    /// Parse frame data text into a body
    pub fn parse(text: &str) -> Result<Self, EventError> {
        Self::from_value(serde_json::from_str(text)?)
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The full JSON object, `eventType` included
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.data.clone())
    }

    /// Decode the body into a concrete payload type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        Ok(serde_json::from_value(self.to_value())?)
    }

    pub fn to_json(&self) -> String {
        // Serializing a Map<String, Value> cannot fail
        serde_json::to_string(&self.data).unwrap_or_default()
    }
}

// =============================================================================
// Addressing
// =============================================================================

/// Where an event goes: a whole group, or exactly one connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Target {
    Group(String),
    Connection(ConnectionId),
}

impl Target {
    /// SSE event name used when delivering to this target
    pub fn channel(&self) -> &str {
        match self {
            Target::Group(group) => group,
            Target::Connection(_) => DIRECT_CHANNEL,
        }
    }
}

/// A published event: one target plus one body
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub target: Target,
    pub body: EventBody,
}

impl Event {
    pub fn to_group(group: impl Into<String>, body: EventBody) -> Self {
        Self {
            target: Target::Group(group.into()),
            body,
        }
    }

    pub fn to_connection(id: ConnectionId, body: EventBody) -> Self {
        Self {
            target: Target::Connection(id),
            body,
        }
    }

    pub fn frame(&self) -> Frame {
        Frame::new(self.target.channel(), self.body.to_json())
    }
}

/// One SSE frame: an event name and its data text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub channel: String,
    pub data: String,
}

impl Frame {
    pub fn new(channel: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            data: data.into(),
        }
    }
}

// =============================================================================
// Chat events
// =============================================================================

/// A connection id paired with the display name it joined under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedUser {
    pub connection_id: ConnectionId,
    pub user_name: String,
}

/// Events the chat layer emits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum ChatEvent {
    /// First frame on every connection
    #[serde(rename_all = "camelCase")]
    ConnectionResponse { connection_id: ConnectionId },

    /// Current members of a group, sent to the group after each join
    #[serde(rename_all = "camelCase")]
    JoinGroupBroadcast { connected_users: Vec<ConnectedUser> },

    /// A chat message
    MessageResponseDto { user: String, message: String },

    /// Direct poke from another user
    #[serde(rename_all = "camelCase")]
    PokeResponseDto { poked_by: String },

    /// A member's connection closed
    #[serde(rename_all = "camelCase")]
    UserLeftResponseDto {
        connection_id: ConnectionId,
        message: String,
    },
}

impl ChatEvent {
    pub fn body(&self) -> Result<EventBody, EventError> {
        EventBody::from_serialize(self)
    }
}
