//! A durable channel handle over a churning underlying channel.

use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::forward::spawn_forwarder;
use crate::message::{Confirmation, Properties, PublishFlags, Publishing};
use crate::registry::{Spec, SpecRegistry};
use crate::spec::{
    ConfirmSubscription, ConsumeSpec, ExchangeDeclareSpec, QueueBindSpec, QueueDeclareSpec, Sink,
};
use crate::transport::{Session, SessionChannel};

/// One logical channel of a [`Connection`](crate::Connection).
///
/// Declarations made through this handle are recorded and replayed, in
/// dependency order, every time the connection establishes a new session.
/// While the channel is bound they also take effect immediately.
///
/// Cloning is cheap; clones share the same registry and underlying channel.
#[derive(Clone)]
pub struct ChannelContext {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: usize,
    connection_name: String,
    /// `Some(no_wait)` when every bind must enable publisher confirms.
    confirm_mode: Option<bool>,
    confirm_buffer: usize,
    state: Mutex<ChannelState>,
    /// Snapshot of `state.live`; publishes read it without waiting for a
    /// replay in progress.
    publisher: RwLock<Option<Arc<dyn SessionChannel>>>,
}

struct ChannelState {
    live: Option<Arc<dyn SessionChannel>>,
    registry: SpecRegistry,
    /// Cancelled on unbind; forwarders spawned during this bind watch it.
    bind: CancellationToken,
}

impl ChannelContext {
    pub(crate) fn new(
        id: usize,
        connection_name: impl Into<String>,
        confirm_mode: Option<bool>,
        confirm_buffer: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id,
                connection_name: connection_name.into(),
                confirm_mode,
                confirm_buffer,
                state: Mutex::new(ChannelState {
                    live: None,
                    registry: SpecRegistry::new(),
                    bind: CancellationToken::new(),
                }),
                publisher: RwLock::new(None),
            }),
        }
    }

    /// Position of this channel within its connection.
    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Returns true while a live underlying channel is attached.
    pub fn is_bound(&self) -> bool {
        self.inner
            .publisher
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Number of specs recorded so far.
    pub async fn spec_count(&self) -> usize {
        self.inner.state.lock().await.registry.len()
    }

    /// Declares an exchange now (if bound) and on every future bind.
    ///
    /// Failures are reported only through `spec.error_sink`.
    pub async fn declare_exchange(&self, spec: ExchangeDeclareSpec) {
        self.record(Spec::Exchange(spec)).await;
    }

    /// Declares a queue now (if bound) and on every future bind.
    ///
    /// Each successful declare delivers the queue's metadata to
    /// `spec.result_sink`; failures go to `spec.error_sink`.
    pub async fn declare_queue(&self, spec: QueueDeclareSpec) {
        self.record(Spec::Queue(spec)).await;
    }

    /// Binds a queue to an exchange now (if bound) and on every future bind.
    pub async fn bind_queue(&self, spec: QueueBindSpec) {
        self.record(Spec::Binding(spec)).await;
    }

    /// Starts consuming now (if bound) and again after every rebind.
    ///
    /// Deliveries from each underlying consumer are forwarded into
    /// `spec.delivery_sink` until that consumer's session goes away.
    pub async fn consume(&self, spec: ConsumeSpec) {
        self.record(Spec::Consumer(spec)).await;
    }

    /// Returns a receiver fed with publisher confirms from every underlying
    /// channel this context is bound to from now on.
    ///
    /// Confirms only flow on channels created with
    /// [`Connection::channel_with_confirm`](crate::Connection::channel_with_confirm).
    pub async fn register_confirm_subscription(&self) -> mpsc::Receiver<Confirmation> {
        let (sink, confirms) = mpsc::channel(self.inner.confirm_buffer);
        self.record(Spec::Confirm(ConfirmSubscription { sink })).await;
        confirms
    }

    /// Publishes a message on the current underlying channel.
    ///
    /// Publishes are never queued: an unbound channel fails immediately with
    /// [`Error::NotConnected`] without touching the broker.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        flags: PublishFlags,
        message: Publishing,
    ) -> Result<()> {
        let live = self.live()?;
        let outcome = live
            .publish(exchange, routing_key, flags, message)
            .await
            .map_err(Error::PublishFailure);

        #[cfg(feature = "metrics")]
        metrics::counter!(
            "amqp_publish_total",
            "connection" => self.inner.connection_name.clone(),
            "outcome" => if outcome.is_ok() { "success" } else { "failure" }
        )
        .increment(1);

        outcome
    }

    /// Serializes `payload` as JSON and publishes it with content type
    /// `application/json`.
    pub async fn publish_json<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        flags: PublishFlags,
        payload: &T,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.publish_json_with_properties(
            exchange,
            routing_key,
            flags,
            payload,
            Properties::default(),
        )
        .await
    }

    /// Like [`publish_json`](Self::publish_json), carrying the given
    /// properties. The content type is always `application/json`.
    pub async fn publish_json_with_properties<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        flags: PublishFlags,
        payload: &T,
        mut properties: Properties,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        if !self.is_bound() {
            return Err(Error::NotConnected);
        }
        let body = serde_json::to_vec(payload)?;
        properties.content_type = Some(JSON_CONTENT_TYPE.to_string());

        self.publish(exchange, routing_key, flags, Publishing { properties, body })
            .await
    }

    pub(crate) fn live(&self) -> Result<Arc<dyn SessionChannel>> {
        self.inner
            .publisher
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::NotConnected)
    }

    /// Returns the live channel with a token that is cancelled when either
    /// the caller cancels it or this channel unbinds.
    pub(crate) async fn scoped(&self) -> Result<(Arc<dyn SessionChannel>, CancellationToken)> {
        // fail fast instead of waiting out a replay in progress
        self.live()?;
        let state = self.inner.state.lock().await;
        let live = state.live.clone().ok_or(Error::NotConnected)?;
        Ok((live, state.bind.child_token()))
    }

    /// Opens a fresh underlying channel on `session` and replays every spec.
    ///
    /// The first failing spec aborts the replay; its error has already been
    /// reported to that spec's own error sink. Returns the number of specs
    /// replayed.
    pub(crate) async fn bind(&self, session: &Arc<dyn Session>) -> Result<usize> {
        let mut state = self.inner.state.lock().await;
        self.detach(&mut state);

        let live = session.open_channel().await.map_err(Error::ChannelFailure)?;
        if let Some(no_wait) = self.inner.confirm_mode {
            live.confirm_select(no_wait)
                .await
                .map_err(Error::ChannelFailure)?;
        }

        let bind = CancellationToken::new();
        // stops forwarders from a replay that fails or is dropped midway
        let abandon = bind.clone().drop_guard();
        let mut replayed = 0;
        for spec in state.registry.replay_order() {
            if let Err(err) = apply(&live, spec, &bind).await {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    connection = %self.inner.connection_name,
                    channel = self.inner.id,
                    spec = spec.kind().as_str(),
                    replayed,
                    error = %err,
                    "replay aborted"
                );

                return Err(err);
            }
            replayed += 1;
        }

        #[cfg(feature = "metrics")]
        metrics::counter!(
            "amqp_specs_replayed_total",
            "connection" => self.inner.connection_name.clone()
        )
        .increment(replayed as u64);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            connection = %self.inner.connection_name,
            channel = self.inner.id,
            replayed,
            "channel bound"
        );

        abandon.disarm();
        state.live = Some(Arc::clone(&live));
        state.bind = bind;
        *self
            .inner
            .publisher
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(live);

        Ok(replayed)
    }

    /// Drops the underlying channel and stops this bind's forwarders.
    pub(crate) async fn unbind(&self) {
        let mut state = self.inner.state.lock().await;
        self.detach(&mut state);
    }

    fn detach(&self, state: &mut ChannelState) {
        *self
            .inner
            .publisher
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        state.live = None;
        state.bind.cancel();
    }

    async fn record(&self, spec: Spec) {
        let mut guard = self.inner.state.lock().await;
        let ChannelState {
            live,
            registry,
            bind,
        } = &mut *guard;

        let spec = registry.push(spec);
        if let Some(live) = live {
            if let Err(_err) = apply(live, spec, bind).await {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    connection = %self.inner.connection_name,
                    channel = self.inner.id,
                    spec = spec.kind().as_str(),
                    error = %_err,
                    "spec failed on live channel"
                );
            }
        }
    }
}

impl std::fmt::Debug for ChannelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelContext")
            .field("id", &self.inner.id)
            .field("connection", &self.inner.connection_name)
            .field("bound", &self.is_bound())
            .field("confirm_mode", &self.inner.confirm_mode.is_some())
            .finish()
    }
}

pub(crate) const JSON_CONTENT_TYPE: &str = "application/json";

async fn apply(
    live: &Arc<dyn SessionChannel>,
    spec: &Spec,
    bind: &CancellationToken,
) -> Result<()> {
    match spec {
        Spec::Exchange(s) => match live.exchange_declare(s).await {
            Ok(()) => Ok(()),
            Err(e) => Err(report(&s.error_sink, Error::DeclareFailure(e)).await),
        },
        Spec::Queue(s) => match live.queue_declare(s).await {
            Ok(queue) => {
                if let Some(sink) = &s.result_sink {
                    let _ = sink.send(queue).await;
                }
                Ok(())
            }
            Err(e) => Err(report(&s.error_sink, Error::DeclareFailure(e)).await),
        },
        Spec::Binding(s) => match live.queue_bind(s).await {
            Ok(()) => Ok(()),
            Err(e) => Err(report(&s.error_sink, Error::DeclareFailure(e)).await),
        },
        Spec::Consumer(s) => match live.consume(s).await {
            Ok(deliveries) => {
                spawn_forwarder(
                    deliveries,
                    s.delivery_sink.clone(),
                    bind.clone(),
                    "deliveries",
                );
                Ok(())
            }
            Err(e) => Err(report(&s.error_sink, Error::ConsumeFailure(e)).await),
        },
        Spec::Confirm(s) => {
            spawn_forwarder(live.confirmations(), s.sink.clone(), bind.clone(), "confirms");
            Ok(())
        }
    }
}

async fn report(sink: &Option<Sink<Error>>, error: Error) -> Error {
    if let Some(sink) = sink {
        let _ = sink.send(error.clone()).await;
    }
    error
}
