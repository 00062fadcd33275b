//! Declaration and consumption requests recorded for replay.
//!
//! Each spec is a plain value: build it with `new` and override fields with
//! struct update syntax.
//!
//! ```
//! use resilient_amqp::{ExchangeDeclareSpec, ExchangeKind};
//!
//! let spec = ExchangeDeclareSpec {
//!     kind: ExchangeKind::Fanout,
//!     durable: false,
//!     ..ExchangeDeclareSpec::new("audit")
//! };
//! assert_eq!(spec.name, "audit");
//! ```
//!
//! Sinks are caller-owned. The registry holds a sender handle so it can report
//! on every replay but never closes it; a sink whose receiver was dropped is
//! skipped.

use tokio::sync::mpsc;

use crate::error::Error;
use crate::message::{Confirmation, Delivery, ExchangeKind, FieldTable, Queue};

/// Caller-owned endpoint for asynchronous results, errors and messages.
pub type Sink<T> = mpsc::Sender<T>;

/// Declare an exchange.
#[derive(Debug, Clone)]
pub struct ExchangeDeclareSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
    pub arguments: FieldTable,
    /// Receives [`Error::DeclareFailure`] whenever this declare fails.
    pub error_sink: Option<Sink<Error>>,
}

impl ExchangeDeclareSpec {
    /// A durable topic exchange.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
            internal: false,
            no_wait: false,
            arguments: FieldTable::new(),
            error_sink: None,
        }
    }
}

/// Declare a queue.
#[derive(Debug, Clone)]
pub struct QueueDeclareSpec {
    /// Empty asks the broker to generate a name.
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub arguments: FieldTable,
    /// Receives the declared queue's metadata after every successful declare.
    pub result_sink: Option<Sink<Queue>>,
    /// Receives [`Error::DeclareFailure`] whenever this declare fails.
    pub error_sink: Option<Sink<Error>>,
}

impl QueueDeclareSpec {
    /// A non-durable, auto-deleted queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            auto_delete: true,
            exclusive: false,
            no_wait: false,
            arguments: FieldTable::new(),
            result_sink: None,
            error_sink: None,
        }
    }
}

/// Bind a queue to an exchange.
#[derive(Debug, Clone)]
pub struct QueueBindSpec {
    pub queue: String,
    pub routing_key: String,
    pub exchange: String,
    pub no_wait: bool,
    pub arguments: FieldTable,
    /// Receives [`Error::DeclareFailure`] whenever this bind fails.
    pub error_sink: Option<Sink<Error>>,
}

impl QueueBindSpec {
    pub fn new(
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        exchange: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            routing_key: routing_key.into(),
            exchange: exchange.into(),
            no_wait: false,
            arguments: FieldTable::new(),
            error_sink: None,
        }
    }
}

/// Start a consumer whose deliveries are forwarded into `delivery_sink`.
#[derive(Debug, Clone)]
pub struct ConsumeSpec {
    pub queue: String,
    /// Consumer tag; empty asks the broker to generate one.
    pub consumer: String,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
    pub arguments: FieldTable,
    pub delivery_sink: Sink<Delivery>,
    /// Receives [`Error::ConsumeFailure`] whenever starting the consumer fails.
    pub error_sink: Option<Sink<Error>>,
}

impl ConsumeSpec {
    /// An auto-acking consumer with a broker-generated tag.
    pub fn new(queue: impl Into<String>, delivery_sink: Sink<Delivery>) -> Self {
        Self {
            queue: queue.into(),
            consumer: String::new(),
            auto_ack: true,
            exclusive: false,
            no_local: false,
            no_wait: false,
            arguments: FieldTable::new(),
            delivery_sink,
            error_sink: None,
        }
    }
}

/// Forward publisher confirms of every bound channel into `sink`.
#[derive(Debug, Clone)]
pub(crate) struct ConfirmSubscription {
    pub(crate) sink: Sink<Confirmation>,
}
