//! The connection supervisor: one logical session over an unreliable
//! transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::channel::ChannelContext;
use crate::config::ConnectionConfig;
use crate::error::{BrokerError, Error, Result};
use crate::events::ConnectionEvent;
use crate::fanout::ErrorFanout;
use crate::spec::Sink;
use crate::state::{ConnectionState, ReconnectState};
use crate::transport::{CloseNotification, Connector, Session};

/// A supervised broker connection.
///
/// A background task keeps one session alive: it dials, binds every channel
/// created through [`channel`](Self::channel) (replaying their recorded
/// topology), waits for the session to die, and dials again with backoff.
/// Errors it recovers from are reported to sinks registered with
/// [`notify_error`](Self::notify_error).
///
/// Cloning is cheap. When the last clone is dropped the supervisor stops,
/// unbinds every channel and closes the live session in the background;
/// [`close`](Self::close) does the same and waits for it.
///
/// # Examples
///
/// ```
/// use resilient_amqp::mock::MockBroker;
/// use resilient_amqp::{Connection, ExchangeDeclareSpec, PublishFlags, Publishing};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> resilient_amqp::Result<()> {
/// let broker = MockBroker::new();
/// let connection = Connection::dial_blocking(broker.connector()).await?;
///
/// let channel = connection.channel().await;
/// channel.declare_exchange(ExchangeDeclareSpec::new("orders")).await;
/// channel
///     .publish("orders", "created", PublishFlags::default(), Publishing::new("{}"))
///     .await?;
///
/// connection.close().await
/// # }
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
    _stop_on_drop: Arc<DropGuard>,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    shared: Mutex<Shared>,
    shutdown: CancellationToken,
    /// The supervisor task; taken by the first `close`. It yields the
    /// outcome of closing the last session.
    task: Mutex<Option<JoinHandle<Result<()>>>>,
    state: ReconnectState,
    /// Asks the supervisor to drop the live session and redial.
    rebind: Notify,
}

#[derive(Default)]
struct Shared {
    session: Option<Arc<dyn Session>>,
    channels: Vec<ChannelContext>,
    fanout: ErrorFanout,
}

/// What a successful connect hands back to the supervisor loop.
struct Established {
    closed: CloseNotification,
    bound: Vec<(usize, usize)>,
}

/// Why the supervisor stopped waiting on a live session.
enum Lost {
    /// The session closed under us; `None` for a clean broker-side close.
    Closed(Option<BrokerError>),
    /// A channel failed to bind to the live session, which is still open.
    ChannelFailed,
}

impl Connection {
    /// Starts supervising a connection with the default configuration and
    /// returns without waiting for the first session.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dial<C: Connector>(connector: C) -> Self {
        Self::dial_with_config(connector, ConnectionConfig::default())
    }

    /// Like [`dial`](Self::dial) with an explicit configuration.
    pub fn dial_with_config<C: Connector>(connector: C, config: ConnectionConfig) -> Self {
        let connection = Self::new(Arc::new(connector), config);
        connection.spawn_supervisor(None);
        connection
    }

    /// Dials once and waits for the result before starting supervision.
    ///
    /// A failed first dial is returned as [`Error::DialFailure`] and nothing
    /// keeps running in the background.
    pub async fn dial_blocking<C: Connector>(connector: C) -> Result<Self> {
        Self::dial_blocking_with_config(connector, ConnectionConfig::default()).await
    }

    /// Like [`dial_blocking`](Self::dial_blocking) with an explicit
    /// configuration.
    pub async fn dial_blocking_with_config<C: Connector>(
        connector: C,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let connection = Self::new(Arc::new(connector), config);
        match connection.inner.connect().await {
            Ok(established) => {
                connection.inner.connected(&established);
                connection.spawn_supervisor(Some(established.closed));
                Ok(connection)
            }
            Err(err) => {
                connection.inner.shutdown.cancel();
                connection.inner.state.mark_closed();
                Err(err)
            }
        }
    }

    fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            _stop_on_drop: Arc::new(shutdown.clone().drop_guard()),
            inner: Arc::new(Inner {
                config,
                connector,
                shared: Mutex::new(Shared::default()),
                shutdown,
                task: Mutex::new(None),
                state: ReconnectState::new(),
                rebind: Notify::new(),
            }),
        }
    }

    fn spawn_supervisor(&self, established: Option<CloseNotification>) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(inner.supervise(established));
        // nobody else can hold the lock before dial returns
        if let Ok(mut task) = self.inner.task.try_lock() {
            *task = Some(handle);
        }
    }

    /// Creates a new channel owned by this connection.
    ///
    /// If a session is live the channel is bound right away; otherwise it
    /// starts unbound and is bound by the next successful connect. A failed
    /// immediate bind is reported to the error sinks and the whole session
    /// is replaced, as after any other failed connect.
    pub async fn channel(&self) -> ChannelContext {
        self.register_channel(None).await
    }

    /// Creates a channel that puts every underlying channel it is bound to
    /// into publisher-confirm mode before replaying its topology.
    pub async fn channel_with_confirm(&self, no_wait: bool) -> ChannelContext {
        self.register_channel(Some(no_wait)).await
    }

    async fn register_channel(&self, confirm_mode: Option<bool>) -> ChannelContext {
        let inner = &self.inner;
        let mut shared = inner.shared.lock().await;
        let channel = ChannelContext::new(
            shared.channels.len(),
            inner.config.name(),
            confirm_mode,
            inner.config.confirm_buffer(),
        );
        shared.channels.push(channel.clone());

        let Some(session) = shared.session.clone() else {
            return channel;
        };
        match channel.bind(&session).await {
            Ok(replayed) => {
                drop(shared);
                inner.emit_channel_bound(channel.id(), replayed);
            }
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    connection = %inner.config.name(),
                    channel = channel.id(),
                    error = %err,
                    "new channel failed to bind, replacing session"
                );

                let fanout = shared.fanout.clone();
                drop(shared);
                fanout.broadcast(&err).await;
                inner.rebind.notify_one();
            }
        }
        channel
    }

    /// Registers a sink for connection lifecycle errors and returns it.
    ///
    /// Every dial failure and unexpected session close is sent to every
    /// registered sink, in registration order. Sends wait for capacity, so
    /// keep each sink drained.
    pub async fn notify_error(&self, sink: Sink<Error>) -> Sink<Error> {
        self.inner.shared.lock().await.fanout.register(sink.clone());
        sink
    }

    /// Stops the supervisor and waits for it to exit. On its way out the
    /// supervisor unbinds every channel and closes the live session, if there
    /// is one, including a session it was still binding.
    ///
    /// Closing is terminal. Calling it again returns `Ok(())` immediately.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        inner.shutdown.cancel();

        let mut task = inner.task.lock().await;
        if inner.state.state() == ConnectionState::Closed {
            return Ok(());
        }
        let released = match task.take() {
            Some(handle) => match handle.await {
                Ok(released) => released,
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(connection = %inner.config.name(), error = %_err, "supervisor task failed");
                    inner.release().await
                }
            },
            None => inner.release().await,
        };
        inner.state.mark_closed();
        inner.record_state();

        #[cfg(feature = "tracing")]
        tracing::info!(connection = %inner.config.name(), "connection closed");

        inner.config.event_listeners.emit(&ConnectionEvent::Closed {
            connection_name: inner.config.name().to_string(),
            timestamp: Instant::now(),
        });

        released
    }

    /// Returns the supervisor's current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.state()
    }

    /// Consecutive failed connect attempts since the last successful one.
    pub fn attempts(&self) -> u32 {
        self.inner.state.attempts()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Returns the connection's configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.config.name())
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}

impl Inner {
    /// Runs until shutdown, then releases whatever is still held.
    async fn supervise(self: Arc<Self>, established: Option<CloseNotification>) -> Result<()> {
        self.run(established).await;
        self.release().await
    }

    async fn run(&self, mut established: Option<CloseNotification>) {
        loop {
            let closed = match established.take() {
                Some(closed) => closed,
                None => {
                    let dialed = tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return,
                        dialed = self.dial() => dialed,
                    };
                    let outcome = match dialed {
                        Ok(session) => {
                            let bound = tokio::select! {
                                biased;
                                _ = self.shutdown.cancelled() => None,
                                bound = self.bind_all(&session) => Some(bound),
                            };
                            let Some(bound) = bound else {
                                // release closes it along with the channels
                                self.shared.lock().await.session = Some(session);
                                return;
                            };
                            bound
                        }
                        Err(err) => Err(err),
                    };
                    match outcome {
                        Ok(established) => {
                            self.connected(&established);
                            established.closed
                        }
                        Err(err) => {
                            let delay = self.connect_failed(err).await;
                            tokio::select! {
                                biased;
                                _ = self.shutdown.cancelled() => return,
                                _ = tokio::time::sleep(delay) => continue,
                            }
                        }
                    }
                }
            };

            let lost = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                reason = closed => Lost::Closed(reason.ok()),
                _ = self.rebind.notified() => Lost::ChannelFailed,
            };
            self.disconnect(lost).await;
        }
    }

    /// Dials a session and binds every channel to it.
    async fn connect(&self) -> Result<Established> {
        let session = self.dial().await?;
        self.bind_all(&session).await
    }

    async fn dial(&self) -> Result<Arc<dyn Session>> {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            connection = %self.config.name(),
            attempt = self.state.attempts() + 1,
            "dialing"
        );

        self.connector.connect().await.map_err(Error::DialFailure)
    }

    /// Binds every channel to a freshly dialed session and makes it the live
    /// one.
    ///
    /// If any channel fails to bind, channels bound so far are unbound and
    /// the session is closed, so all channels stay on the same side.
    async fn bind_all(&self, session: &Arc<dyn Session>) -> Result<Established> {
        let closed = session.notify_close();

        let mut shared = self.shared.lock().await;
        let mut bound = Vec::with_capacity(shared.channels.len());
        let mut failure = None;
        for channel in &shared.channels {
            match channel.bind(session).await {
                Ok(replayed) => bound.push((channel.id(), replayed)),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let Some(err) = failure else {
            shared.session = Some(Arc::clone(session));
            return Ok(Established { closed, bound });
        };
        for channel in &shared.channels {
            channel.unbind().await;
        }
        drop(shared);
        if let Err(_close_err) = session.close().await {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %_close_err, "closing half-bound session failed");
        }
        Err(err)
    }

    /// Unbinds every channel and closes the live session, if any.
    async fn release(&self) -> Result<()> {
        let session = {
            let mut shared = self.shared.lock().await;
            for channel in &shared.channels {
                channel.unbind().await;
            }
            shared.session.take()
        };

        match session {
            Some(session) => session.close().await.map_err(Error::TransportClosed),
            None => Ok(()),
        }
    }

    fn connected(&self, established: &Established) {
        self.state.mark_connected();
        self.record_state();

        #[cfg(feature = "metrics")]
        metrics::counter!(
            "amqp_connect_attempts_total",
            "connection" => self.config.name().to_string(),
            "outcome" => "success"
        )
        .increment(1);

        #[cfg(feature = "tracing")]
        tracing::info!(
            connection = %self.config.name(),
            channels = established.bound.len(),
            "connected"
        );

        self.config.event_listeners.emit(&ConnectionEvent::Connected {
            connection_name: self.config.name().to_string(),
            timestamp: Instant::now(),
            channels: established.bound.len(),
        });
        for &(channel_id, replayed) in &established.bound {
            self.emit_channel_bound(channel_id, replayed);
        }
    }

    /// Reports a failed connect and returns how long to wait before the next.
    async fn connect_failed(&self, err: Error) -> Duration {
        let attempt = self.state.record_failure();
        let delay = self.config.policy().delay_for_attempt(attempt - 1);
        self.record_state();

        #[cfg(feature = "metrics")]
        metrics::counter!(
            "amqp_connect_attempts_total",
            "connection" => self.config.name().to_string(),
            "outcome" => "failure"
        )
        .increment(1);

        #[cfg(feature = "tracing")]
        tracing::warn!(
            connection = %self.config.name(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "connect failed, backing off"
        );

        let fanout = self.shared.lock().await.fanout.clone();
        fanout.broadcast(&err).await;

        self.config.event_listeners.emit(&ConnectionEvent::ConnectFailed {
            connection_name: self.config.name().to_string(),
            timestamp: Instant::now(),
            attempt,
            delay,
            error: err,
        });

        delay
    }

    /// Reports a lost session, then unbinds every channel from it.
    async fn disconnect(&self, lost: Lost) {
        let (error, replaced) = match lost {
            Lost::Closed(reason) => (reason.map(Error::TransportClosed), false),
            Lost::ChannelFailed => (None, true),
        };

        let (fanout, session) = {
            let mut shared = self.shared.lock().await;
            (shared.fanout.clone(), shared.session.take())
        };
        if let Some(err) = &error {
            fanout.broadcast(err).await;
        }

        {
            let shared = self.shared.lock().await;
            for channel in &shared.channels {
                channel.unbind().await;
            }
        }
        if let (true, Some(session)) = (replaced, session) {
            if let Err(_err) = session.close().await {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %_err, "closing replaced session failed");
            }
        }
        self.state.mark_disconnected();
        self.record_state();

        #[cfg(feature = "metrics")]
        metrics::counter!(
            "amqp_disconnects_total",
            "connection" => self.config.name().to_string()
        )
        .increment(1);

        #[cfg(feature = "tracing")]
        match &error {
            Some(err) => tracing::warn!(connection = %self.config.name(), error = %err, "session lost"),
            None if replaced => tracing::info!(connection = %self.config.name(), "replacing session after channel failure"),
            None => tracing::info!(connection = %self.config.name(), "session closed by broker"),
        }

        self.config.event_listeners.emit(&ConnectionEvent::Disconnected {
            connection_name: self.config.name().to_string(),
            timestamp: Instant::now(),
            error,
        });
    }

    fn emit_channel_bound(&self, channel_id: usize, replayed: usize) {
        self.config.event_listeners.emit(&ConnectionEvent::ChannelBound {
            connection_name: self.config.name().to_string(),
            timestamp: Instant::now(),
            channel_id,
            replayed,
        });
    }

    fn record_state(&self) {
        #[cfg(feature = "metrics")]
        metrics::gauge!(
            "amqp_connection_state",
            "connection" => self.config.name().to_string()
        )
        .set(self.state.state().encode() as f64);
    }
}
