//! Broker-facing value types shared by the transport seam and the channel API.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

/// A single value in an argument or header table.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Table(FieldTable),
    Array(Vec<FieldValue>),
}

/// Broker-specific arguments (`x-message-ttl`, `x-dead-letter-exchange`, ...)
/// and message headers.
pub type FieldTable = BTreeMap<String, FieldValue>;

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

/// Exchange routing type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Headers,
    #[default]
    Topic,
    /// A plugin-provided type such as `x-delayed-message`.
    Custom(String),
}

impl ExchangeKind {
    /// Returns the type name as sent on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Custom(kind) => kind,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata attached to a publishing or a delivery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    pub headers: FieldTable,
    /// MIME content type
    pub content_type: Option<String>,
    /// MIME content encoding
    pub content_encoding: Option<String>,
    /// Transient (1) or persistent (2)
    pub delivery_mode: Option<u8>,
    /// 0 to 9
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    /// Address to reply to (e.g. an RPC reply queue)
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds, as a string
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<SystemTime>,
    /// Application message type name
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}

/// An outbound message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Publishing {
    pub properties: Properties,
    pub body: Vec<u8>,
}

impl Publishing {
    /// Creates a publishing with default properties.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            properties: Properties::default(),
            body: body.into(),
        }
    }

    /// Replaces the properties.
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }
}

/// Routing flags for a publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishFlags {
    /// Return the message if it cannot be routed to any queue.
    pub mandatory: bool,
    /// Return the message if it cannot be delivered to a consumer immediately.
    pub immediate: bool,
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: Properties,
    pub body: Vec<u8>,
}

/// Result of a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Queue {
    /// The queue name; server-generated when declared with an empty name.
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A publisher confirm for one publishing on a confirm-mode channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub delivery_tag: u64,
    pub ack: bool,
}
