//! The seam between the resilience layer and an AMQP client library.
//!
//! Everything on the wire is delegated to implementations of these traits.
//! The supervisor only needs to dial, learn about unexpected closes, open
//! channels and pass declarations through unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::oneshot;

use crate::error::BrokerError;
use crate::message::{Confirmation, Delivery, PublishFlags, Publishing, Queue};
use crate::spec::{ConsumeSpec, ExchangeDeclareSpec, QueueBindSpec, QueueDeclareSpec};

/// Resolves with the close reason when a session dies unexpectedly.
///
/// A session closed on purpose drops the sender without a value.
pub type CloseNotification = oneshot::Receiver<BrokerError>;

/// Dials new sessions. Called once per connect attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn Session>, BrokerError>;
}

/// One live broker session (an AMQP connection).
#[async_trait]
pub trait Session: Send + Sync + 'static {
    async fn open_channel(&self) -> Result<Arc<dyn SessionChannel>, BrokerError>;

    /// Subscribes to the unexpected-close notification.
    fn notify_close(&self) -> CloseNotification;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// One underlying channel on a live session.
#[async_trait]
pub trait SessionChannel: Send + Sync + 'static {
    async fn exchange_declare(&self, spec: &ExchangeDeclareSpec) -> Result<(), BrokerError>;

    async fn queue_declare(&self, spec: &QueueDeclareSpec) -> Result<Queue, BrokerError>;

    async fn queue_bind(&self, spec: &QueueBindSpec) -> Result<(), BrokerError>;

    /// Starts a consumer. The stream ends when the consumer is cancelled or
    /// the session goes away.
    async fn consume(
        &self,
        spec: &ConsumeSpec,
    ) -> Result<BoxStream<'static, Delivery>, BrokerError>;

    async fn cancel(&self, consumer_tag: &str, no_wait: bool) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        flags: PublishFlags,
        message: Publishing,
    ) -> Result<(), BrokerError>;

    /// Puts the channel into publisher-confirm mode.
    async fn confirm_select(&self, no_wait: bool) -> Result<(), BrokerError>;

    /// Subscribes to publisher confirms for this channel. The stream ends with
    /// the channel.
    fn confirmations(&self) -> BoxStream<'static, Confirmation>;
}
