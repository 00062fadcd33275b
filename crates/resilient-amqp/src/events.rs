use std::time::{Duration, Instant};

use resilient_amqp_core::events::LifecycleEvent;

use crate::error::Error;

/// Events emitted by a connection's supervisor.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A session was established and every channel replayed its specs.
    Connected {
        connection_name: String,
        timestamp: Instant,
        channels: usize,
    },
    /// A connect attempt failed; the supervisor will redial after `delay`.
    ConnectFailed {
        connection_name: String,
        timestamp: Instant,
        attempt: u32,
        delay: Duration,
        error: Error,
    },
    /// The live session was lost.
    Disconnected {
        connection_name: String,
        timestamp: Instant,
        error: Option<Error>,
    },
    /// A channel was bound to a fresh underlying channel.
    ChannelBound {
        connection_name: String,
        timestamp: Instant,
        channel_id: usize,
        replayed: usize,
    },
    /// The connection was closed by the application.
    Closed {
        connection_name: String,
        timestamp: Instant,
    },
}

impl LifecycleEvent for ConnectionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ConnectionEvent::Connected { .. } => "connected",
            ConnectionEvent::ConnectFailed { .. } => "connect_failed",
            ConnectionEvent::Disconnected { .. } => "disconnected",
            ConnectionEvent::ChannelBound { .. } => "channel_bound",
            ConnectionEvent::Closed { .. } => "closed",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            ConnectionEvent::Connected { timestamp, .. }
            | ConnectionEvent::ConnectFailed { timestamp, .. }
            | ConnectionEvent::Disconnected { timestamp, .. }
            | ConnectionEvent::ChannelBound { timestamp, .. }
            | ConnectionEvent::Closed { timestamp, .. } => *timestamp,
        }
    }

    fn connection_name(&self) -> &str {
        match self {
            ConnectionEvent::Connected {
                connection_name, ..
            }
            | ConnectionEvent::ConnectFailed {
                connection_name, ..
            }
            | ConnectionEvent::Disconnected {
                connection_name, ..
            }
            | ConnectionEvent::ChannelBound {
                connection_name, ..
            }
            | ConnectionEvent::Closed {
                connection_name, ..
            } => connection_name,
        }
    }
}
