use std::time::Duration;

use resilient_amqp_core::events::{EventListener, EventListeners, FnListener};

use crate::error::Error;
use crate::events::ConnectionEvent;
use crate::policy::ReconnectPolicy;

/// Configuration for a supervised connection.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub(crate) name: String,
    pub(crate) policy: ReconnectPolicy,
    pub(crate) confirm_buffer: usize,
    pub(crate) event_listeners: EventListeners<ConnectionEvent>,
}

impl ConnectionConfig {
    /// Creates a new builder for configuring a connection.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new()
    }

    /// Returns the connection name used in logs, metrics and events.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the reconnection policy.
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Returns the capacity of sinks handed out for confirm subscriptions.
    pub fn confirm_buffer(&self) -> usize {
        self.confirm_buffer
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfigBuilder::new().build()
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("confirm_buffer", &self.confirm_buffer)
            .field("event_listeners", &self.event_listeners.len())
            .finish()
    }
}

/// Builder for [`ConnectionConfig`].
pub struct ConnectionConfigBuilder {
    name: String,
    policy: ReconnectPolicy,
    confirm_buffer: usize,
    event_listeners: EventListeners<ConnectionEvent>,
}

impl ConnectionConfigBuilder {
    /// Creates a new builder with defaults.
    ///
    /// Defaults:
    /// - name: `"<unnamed>"`
    /// - policy: exponential backoff, 1s doubling up to 10s
    /// - confirm_buffer: 1
    pub fn new() -> Self {
        #[cfg(feature = "metrics")]
        crate::describe_metrics();

        Self {
            name: "<unnamed>".to_string(),
            policy: ReconnectPolicy::default(),
            confirm_buffer: 1,
            event_listeners: EventListeners::new(),
        }
    }

    /// Sets the name for this connection (used in logs, metrics and events).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the reconnection policy.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use resilient_amqp::{ConnectionConfig, ReconnectPolicy};
    ///
    /// let config = ConnectionConfig::builder()
    ///     .policy(ReconnectPolicy::exponential(
    ///         Duration::from_millis(250),
    ///         Duration::from_secs(30),
    ///     ))
    ///     .build();
    /// ```
    pub fn policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the capacity of sinks returned by
    /// [`ChannelContext::register_confirm_subscription`](crate::ChannelContext::register_confirm_subscription).
    ///
    /// Values below 1 are raised to 1.
    pub fn confirm_buffer(mut self, capacity: usize) -> Self {
        self.confirm_buffer = capacity.max(1);
        self
    }

    /// Registers a listener for every connection event.
    pub fn event_listener<L>(mut self, listener: L) -> Self
    where
        L: EventListener<ConnectionEvent> + 'static,
    {
        self.event_listeners.add(listener);
        self
    }

    /// Registers a callback when a session is established.
    ///
    /// # Callback Signature
    /// `Fn(usize)` - Called with the number of channels that were bound.
    pub fn on_connected<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let ConnectionEvent::Connected { channels, .. } = event {
                f(*channels);
            }
        }));
        self
    }

    /// Registers a callback when a connect attempt fails.
    ///
    /// # Callback Signature
    /// `Fn(u32, Duration, &Error)` - The consecutive failure count (1 = first
    /// failure), the delay before the next attempt, and the failure.
    ///
    /// # Example
    /// ```rust,no_run
    /// use resilient_amqp::ConnectionConfig;
    ///
    /// let config = ConnectionConfig::builder()
    ///     .name("orders")
    ///     .on_connect_failed(|attempt, delay, error| {
    ///         eprintln!("attempt {attempt} failed ({error}), retrying in {delay:?}");
    ///     })
    ///     .build();
    /// ```
    pub fn on_connect_failed<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, Duration, &Error) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let ConnectionEvent::ConnectFailed {
                attempt,
                delay,
                error,
                ..
            } = event
            {
                f(*attempt, *delay, error);
            }
        }));
        self
    }

    /// Registers a callback when the live session is lost.
    ///
    /// The error is `None` when the broker closed the session cleanly.
    pub fn on_disconnected<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&Error>) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let ConnectionEvent::Disconnected { error, .. } = event {
                f(error.as_ref());
            }
        }));
        self
    }

    /// Registers a callback when a channel is (re)bound.
    ///
    /// # Callback Signature
    /// `Fn(usize, usize)` - The channel id and the number of specs replayed.
    pub fn on_channel_bound<F>(mut self, f: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let ConnectionEvent::ChannelBound {
                channel_id,
                replayed,
                ..
            } = event
            {
                f(*channel_id, *replayed);
            }
        }));
        self
    }

    /// Builds the `ConnectionConfig`.
    pub fn build(self) -> ConnectionConfig {
        ConnectionConfig {
            name: self.name,
            policy: self.policy,
            confirm_buffer: self.confirm_buffer,
            event_listeners: self.event_listeners,
        }
    }
}

impl Default for ConnectionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
