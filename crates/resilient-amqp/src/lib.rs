//! Self-healing AMQP connections.
//!
//! A [`Connection`] keeps one broker session alive in the background. When the
//! session drops, it redials with exponential backoff and replays, on every
//! [`ChannelContext`], the exchanges, queues, bindings, consumers and confirm
//! subscriptions that were declared through it, so applications never have to
//! re-issue their setup.
//!
//! # Features
//!
//! - **Reconnect with backoff**: 1s doubling up to 10s by default, reset after
//!   every successful connect
//! - **Topology replay**: declarations are recorded per channel and replayed in
//!   dependency order (exchanges, queues, bindings, consumers, confirms)
//! - **Stable handles**: consumers keep receiving into the same sink across
//!   reconnects
//! - **No hidden queueing**: publishing while disconnected fails immediately
//!   with [`Error::NotConnected`]
//! - **Request/reply**: [`ChannelContext::publish_and_wait_for_reply`] with
//!   correlation ids and a timeout
//! - **Error fanout**: lifecycle errors go to every sink registered with
//!   [`Connection::notify_error`]
//! - **Event system**: connect, failure, disconnect and bind events through
//!   [`ConnectionConfig`] callbacks
//!
//! # Examples
//!
//! ```rust
//! use resilient_amqp::mock::MockBroker;
//! use resilient_amqp::{
//!     ConnectionConfig, Connection, ConsumeSpec, ExchangeDeclareSpec, QueueBindSpec,
//!     QueueDeclareSpec,
//! };
//! use tokio::sync::mpsc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> resilient_amqp::Result<()> {
//! let broker = MockBroker::new();
//! let config = ConnectionConfig::builder()
//!     .name("orders")
//!     .on_disconnected(|error| eprintln!("lost broker session: {error:?}"))
//!     .build();
//! let connection = Connection::dial_with_config(broker.connector(), config);
//!
//! let channel = connection.channel().await;
//! channel.declare_exchange(ExchangeDeclareSpec::new("orders")).await;
//! channel.declare_queue(QueueDeclareSpec::new("orders.billing")).await;
//! channel
//!     .bind_queue(QueueBindSpec::new("orders.billing", "order.*", "orders"))
//!     .await;
//!
//! let (deliveries, mut inbox) = mpsc::channel(64);
//! channel
//!     .consume(ConsumeSpec::new("orders.billing", deliveries))
//!     .await;
//!
//! // every declaration above is replayed after each reconnect
//! # let _ = &mut inbox;
//! connection.close().await
//! # }
//! ```
//!
//! With the `lapin` feature, `Connection::dial_url` and friends connect to a
//! real broker.

mod channel;
mod config;
mod connection;
mod error;
mod events;
mod fanout;
mod forward;
mod message;
mod policy;
mod registry;
mod rpc;
mod spec;
mod state;
pub mod transport;

pub mod mock;

#[cfg(feature = "lapin")]
mod lapin_transport;

pub use channel::ChannelContext;
pub use config::{ConnectionConfig, ConnectionConfigBuilder};
pub use connection::Connection;
pub use error::{BrokerError, Error, Result};
pub use events::ConnectionEvent;
pub use message::{
    Confirmation, Delivery, ExchangeKind, FieldTable, FieldValue, Properties, PublishFlags,
    Publishing, Queue,
};
pub use policy::{ExponentialBackoff, ReconnectPolicy};
pub use rpc::{ReplyRequest, DEFAULT_REPLY_TIMEOUT};
pub use spec::{ConsumeSpec, ExchangeDeclareSpec, QueueBindSpec, QueueDeclareSpec, Sink};
pub use state::{ConnectionState, ReconnectState};

#[cfg(feature = "lapin")]
pub use lapin_transport::AmqpConnector;

pub use resilient_amqp_core::{EventListener, EventListeners, FnListener, LifecycleEvent};

#[cfg(feature = "metrics")]
static METRICS_INIT: std::sync::Once = std::sync::Once::new();

#[cfg(feature = "metrics")]
pub(crate) fn describe_metrics() {
    use metrics::{describe_counter, describe_gauge};

    METRICS_INIT.call_once(|| {
        describe_counter!(
            "amqp_connect_attempts_total",
            "Total number of connect attempts by outcome"
        );
        describe_counter!(
            "amqp_disconnects_total",
            "Total number of live sessions lost"
        );
        describe_counter!(
            "amqp_specs_replayed_total",
            "Total number of declarations replayed onto fresh channels"
        );
        describe_counter!(
            "amqp_publish_total",
            "Total number of publishes by outcome"
        );
        describe_gauge!(
            "amqp_connection_state",
            "Current connection state (0=connecting, 1=connected, 2=disconnected, 3=closed)"
        );
    });
}
