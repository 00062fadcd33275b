//! Scripted in-memory broker for tests.
//!
//! [`MockBroker`] implements the transport traits without a network. Tests
//! script failures (dials, declares, consumes, publishes), sever the live
//! session on demand, inject deliveries, and inspect every call in order.
//!
//! ```
//! use resilient_amqp::mock::{Call, MockBroker};
//! use resilient_amqp::{Connection, ExchangeDeclareSpec};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let broker = MockBroker::new();
//! let connection = Connection::dial_blocking(broker.connector()).await.unwrap();
//! let channel = connection.channel().await;
//! channel.declare_exchange(ExchangeDeclareSpec::new("events")).await;
//!
//! assert_eq!(broker.declarations(), vec![Call::ExchangeDeclare("events".into())]);
//! connection.close().await.unwrap();
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::BrokerError;
use crate::message::{Confirmation, Delivery, Properties, PublishFlags, Publishing, Queue};
use crate::spec::{ConsumeSpec, ExchangeDeclareSpec, QueueBindSpec, QueueDeclareSpec};
use crate::transport::{CloseNotification, Connector, Session, SessionChannel};

/// One observed transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Dial,
    OpenChannel,
    ConfirmSelect,
    ExchangeDeclare(String),
    QueueDeclare(String),
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Consume {
        queue: String,
        consumer: String,
    },
    Cancel(String),
    Publish {
        exchange: String,
        routing_key: String,
    },
    CloseSession,
}

impl Call {
    fn is_declaration(&self) -> bool {
        matches!(
            self,
            Call::ExchangeDeclare(_) | Call::QueueDeclare(_) | Call::QueueBind { .. } | Call::Consume { .. }
        )
    }
}

/// A message accepted by the mock broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub flags: PublishFlags,
    pub message: Publishing,
}

/// Produces deliveries in response to a publish: `(queue, delivery)` pairs.
pub type PublishHook = Box<dyn Fn(&PublishedMessage) -> Vec<(String, Delivery)> + Send>;

/// Builds a delivery carrying a correlation id, as an RPC server would reply.
pub fn reply(correlation_id: &str, body: impl Into<Vec<u8>>) -> Delivery {
    Delivery {
        properties: Properties {
            correlation_id: Some(correlation_id.to_string()),
            content_type: Some("application/json".to_string()),
            ..Properties::default()
        },
        body: body.into(),
        ..Delivery::default()
    }
}

/// Handle to a scripted broker. Clones share state.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    calls: Vec<Call>,
    published: Vec<PublishedMessage>,
    dial_times: Vec<Instant>,
    dial_failures: VecDeque<BrokerError>,
    channel_failures: usize,
    failing_declares: HashMap<String, BrokerError>,
    failing_consumes: HashMap<String, BrokerError>,
    failing_publish: Option<BrokerError>,
    publish_hook: Option<PublishHook>,
    sessions: Vec<SessionSlot>,
    consumers: Vec<ConsumerSlot>,
    confirm_subscribers: Vec<ConfirmSlot>,
    next_channel: usize,
    next_generated: usize,
}

struct SessionSlot {
    id: usize,
    open: bool,
    closer: Option<oneshot::Sender<BrokerError>>,
}

struct ConsumerSlot {
    session: usize,
    queue: String,
    tag: String,
    deliveries: UnboundedSender<Delivery>,
}

struct ConfirmSlot {
    session: usize,
    channel: usize,
    confirms: UnboundedSender<Confirmation>,
}

impl BrokerState {
    fn session_open(&self, id: usize) -> bool {
        self.sessions.iter().any(|s| s.id == id && s.open)
    }

    fn teardown(&mut self, id: usize) {
        if let Some(slot) = self.sessions.iter_mut().find(|s| s.id == id) {
            slot.open = false;
        }
        self.consumers.retain(|c| c.session != id);
        self.confirm_subscribers.retain(|c| c.session != id);
    }

    fn route(&mut self, queue: &str, mut delivery: Delivery) -> bool {
        self.consumers.retain(|c| !c.deliveries.is_closed());
        let Some(consumer) = self.consumers.iter().find(|c| c.queue == queue) else {
            return false;
        };
        delivery.consumer_tag = consumer.tag.clone();
        consumer.deliveries.unbounded_send(delivery).is_ok()
    }

    fn generate(&mut self, prefix: &str) -> String {
        self.next_generated += 1;
        format!("{}-{}", prefix, self.next_generated)
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a connector dialing this broker.
    pub fn connector(&self) -> MockConnector {
        MockConnector {
            broker: self.clone(),
        }
    }

    /// Makes the next `count` dials fail with "connection refused".
    pub fn fail_dials(&self, count: usize) {
        let mut state = self.lock();
        for _ in 0..count {
            state
                .dial_failures
                .push_back(BrokerError::new("connection refused"));
        }
    }

    /// Makes the next `count` channel opens fail, on any session.
    pub fn fail_open_channels(&self, count: usize) {
        self.lock().channel_failures += count;
    }

    /// Makes every declare of the exchange or queue `name` fail until healed.
    pub fn fail_declare(&self, name: &str, error: BrokerError) {
        self.lock().failing_declares.insert(name.to_string(), error);
    }

    pub fn heal_declare(&self, name: &str) {
        self.lock().failing_declares.remove(name);
    }

    /// Makes every consume on `queue` fail until healed.
    pub fn fail_consume(&self, queue: &str, error: BrokerError) {
        self.lock()
            .failing_consumes
            .insert(queue.to_string(), error);
    }

    pub fn heal_consume(&self, queue: &str) {
        self.lock().failing_consumes.remove(queue);
    }

    /// Makes publishes fail with `error`, or succeed again with `None`.
    pub fn fail_publishes(&self, error: Option<BrokerError>) {
        self.lock().failing_publish = error;
    }

    /// Runs `hook` after every accepted publish and routes what it returns.
    pub fn on_publish<F>(&self, hook: F)
    where
        F: Fn(&PublishedMessage) -> Vec<(String, Delivery)> + Send + 'static,
    {
        self.lock().publish_hook = Some(Box::new(hook));
    }

    /// Kills the most recent open session as a network failure would.
    ///
    /// Returns false if no session was open.
    pub fn sever(&self) -> bool {
        let mut state = self.lock();
        let Some(slot) = state.sessions.iter_mut().rev().find(|s| s.open) else {
            return false;
        };
        let id = slot.id;
        let closer = slot.closer.take();
        state.teardown(id);
        if let Some(closer) = closer {
            let _ = closer.send(BrokerError::with_code(320, "CONNECTION_FORCED"));
        }
        true
    }

    /// Closes the most recent open session cleanly from the broker side,
    /// without a close reason.
    pub fn hang_up(&self) -> bool {
        let mut state = self.lock();
        let Some(slot) = state.sessions.iter_mut().rev().find(|s| s.open) else {
            return false;
        };
        let id = slot.id;
        slot.closer = None;
        state.teardown(id);
        true
    }

    /// Routes `delivery` to the first live consumer of `queue`.
    ///
    /// Returns false when nobody consumes the queue.
    pub fn deliver(&self, queue: &str, delivery: Delivery) -> bool {
        self.lock().route(queue, delivery)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Declare, bind and consume calls in order.
    pub fn declarations(&self) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.is_declaration())
            .cloned()
            .collect()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn dial_count(&self) -> usize {
        self.lock().dial_times.len()
    }

    /// When each dial happened, on the tokio clock.
    pub fn dial_times(&self) -> Vec<Instant> {
        self.lock().dial_times.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.iter().filter(|s| s.open).count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .consumers
            .iter()
            .filter(|c| c.queue == queue && !c.deliveries.is_closed())
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MockBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MockBroker")
            .field("calls", &state.calls.len())
            .field("sessions", &state.sessions.len())
            .field("consumers", &state.consumers.len())
            .finish()
    }
}

/// [`Connector`] for a [`MockBroker`].
#[derive(Clone, Debug)]
pub struct MockConnector {
    broker: MockBroker,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn Session>, BrokerError> {
        let mut state = self.broker.lock();
        state.calls.push(Call::Dial);
        state.dial_times.push(Instant::now());
        if let Some(error) = state.dial_failures.pop_front() {
            return Err(error);
        }

        let id = state.sessions.len();
        state.sessions.push(SessionSlot {
            id,
            open: true,
            closer: None,
        });

        Ok(Arc::new(MockSession {
            id,
            broker: self.broker.clone(),
        }))
    }
}

struct MockSession {
    id: usize,
    broker: MockBroker,
}

#[async_trait]
impl Session for MockSession {
    async fn open_channel(&self) -> Result<Arc<dyn SessionChannel>, BrokerError> {
        let mut state = self.broker.lock();
        if !state.session_open(self.id) {
            return Err(BrokerError::with_code(504, "session closed"));
        }
        state.calls.push(Call::OpenChannel);
        if state.channel_failures > 0 {
            state.channel_failures -= 1;
            return Err(BrokerError::with_code(504, "CHANNEL_ERROR"));
        }
        state.next_channel += 1;

        Ok(Arc::new(MockChannel {
            session: self.id,
            channel: state.next_channel,
            broker: self.broker.clone(),
            confirm: AtomicBool::new(false),
            delivery_tags: AtomicU64::new(0),
        }))
    }

    fn notify_close(&self) -> CloseNotification {
        let (closer, notification) = oneshot::channel();
        let mut state = self.broker.lock();
        if let Some(slot) = state.sessions.iter_mut().find(|s| s.id == self.id && s.open) {
            slot.closer = Some(closer);
        }
        notification
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.calls.push(Call::CloseSession);
        if let Some(slot) = state.sessions.iter_mut().find(|s| s.id == self.id) {
            // a clean close drops the notifier without a reason
            slot.closer = None;
        }
        state.teardown(self.id);
        Ok(())
    }
}

struct MockChannel {
    session: usize,
    channel: usize,
    broker: MockBroker,
    confirm: AtomicBool,
    delivery_tags: AtomicU64,
}

impl MockChannel {
    fn lock_open(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        let state = self.broker.lock();
        if state.session_open(self.session) {
            Ok(state)
        } else {
            Err(BrokerError::with_code(504, "channel closed"))
        }
    }
}

#[async_trait]
impl SessionChannel for MockChannel {
    async fn exchange_declare(&self, spec: &ExchangeDeclareSpec) -> Result<(), BrokerError> {
        let mut state = self.lock_open()?;
        state.calls.push(Call::ExchangeDeclare(spec.name.clone()));
        match state.failing_declares.get(&spec.name) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn queue_declare(&self, spec: &QueueDeclareSpec) -> Result<Queue, BrokerError> {
        let mut state = self.lock_open()?;
        state.calls.push(Call::QueueDeclare(spec.name.clone()));
        if let Some(error) = state.failing_declares.get(&spec.name) {
            return Err(error.clone());
        }

        let name = if spec.name.is_empty() {
            state.generate("amq.gen")
        } else {
            spec.name.clone()
        };
        let consumer_count = state.consumers.iter().filter(|c| c.queue == name).count();
        Ok(Queue {
            name,
            message_count: 0,
            consumer_count: consumer_count as u32,
        })
    }

    async fn queue_bind(&self, spec: &QueueBindSpec) -> Result<(), BrokerError> {
        let mut state = self.lock_open()?;
        state.calls.push(Call::QueueBind {
            queue: spec.queue.clone(),
            exchange: spec.exchange.clone(),
            routing_key: spec.routing_key.clone(),
        });
        Ok(())
    }

    async fn consume(
        &self,
        spec: &ConsumeSpec,
    ) -> Result<BoxStream<'static, Delivery>, BrokerError> {
        let mut state = self.lock_open()?;
        state.calls.push(Call::Consume {
            queue: spec.queue.clone(),
            consumer: spec.consumer.clone(),
        });
        if let Some(error) = state.failing_consumes.get(&spec.queue) {
            return Err(error.clone());
        }

        let tag = if spec.consumer.is_empty() {
            state.generate("ctag")
        } else {
            spec.consumer.clone()
        };
        let (deliveries, stream) = unbounded();
        state.consumers.push(ConsumerSlot {
            session: self.session,
            queue: spec.queue.clone(),
            tag,
            deliveries,
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str, _no_wait: bool) -> Result<(), BrokerError> {
        let mut state = self.lock_open()?;
        state.calls.push(Call::Cancel(consumer_tag.to_string()));
        state
            .consumers
            .retain(|c| !(c.session == self.session && c.tag == consumer_tag));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        flags: PublishFlags,
        message: Publishing,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock_open()?;
        if let Some(error) = &state.failing_publish {
            return Err(error.clone());
        }
        state.calls.push(Call::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });

        let published = PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            flags,
            message,
        };
        state.published.push(published.clone());

        if self.confirm.load(Ordering::Acquire) {
            let confirmation = Confirmation {
                delivery_tag: self.delivery_tags.fetch_add(1, Ordering::AcqRel) + 1,
                ack: true,
            };
            for slot in &state.confirm_subscribers {
                if slot.session == self.session && slot.channel == self.channel {
                    let _ = slot.confirms.unbounded_send(confirmation);
                }
            }
        }

        let routed = state
            .publish_hook
            .as_ref()
            .map(|hook| hook(&published))
            .unwrap_or_default();
        for (queue, delivery) in routed {
            state.route(&queue, delivery);
        }
        Ok(())
    }

    async fn confirm_select(&self, _no_wait: bool) -> Result<(), BrokerError> {
        let mut state = self.lock_open()?;
        state.calls.push(Call::ConfirmSelect);
        self.confirm.store(true, Ordering::Release);
        Ok(())
    }

    fn confirmations(&self) -> BoxStream<'static, Confirmation> {
        let (confirms, stream) = unbounded();
        let mut state = self.broker.lock();
        if state.session_open(self.session) {
            state.confirm_subscribers.push(ConfirmSlot {
                session: self.session,
                channel: self.channel,
                confirms,
            });
        }
        stream.boxed()
    }
}
