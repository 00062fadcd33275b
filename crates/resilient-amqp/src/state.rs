//! Connection state tracking shared between the supervisor and handles.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle state of a [`Connection`](crate::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Dialing, or waiting out a backoff delay.
    Connecting,

    /// A session is live and every channel is bound.
    Connected,

    /// The session was lost; channels are unbound until the next dial succeeds.
    Disconnected,

    /// `close` was called. Terminal.
    Closed,
}

impl ConnectionState {
    fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        }
    }

    pub(crate) fn encode(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Disconnected => 2,
            ConnectionState::Closed => 3,
        }
    }

    fn decode(encoded: u8) -> Self {
        match encoded {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnected,
            _ => ConnectionState::Closed,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, lock-free view of the supervisor's progress.
#[derive(Clone)]
pub struct ReconnectState {
    state: Arc<AtomicU8>,

    /// Consecutive failed connect attempts since the last success.
    attempts: Arc<AtomicU32>,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(ConnectionState::Connecting.encode())),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::decode(self.state.load(Ordering::Acquire))
    }

    /// Consecutive failed connect attempts since the last successful one.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        // Closed is terminal
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (ConnectionState::decode(current) != ConnectionState::Closed)
                    .then_some(state.encode())
            });
    }

    pub(crate) fn record_failure(&self) -> u32 {
        self.set_state(ConnectionState::Connecting);
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn mark_connected(&self) {
        self.set_state(ConnectionState::Connected);
        self.attempts.store(0, Ordering::Release);
    }

    pub(crate) fn mark_disconnected(&self) {
        self.set_state(ConnectionState::Disconnected);
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed.encode(), Ordering::Release);
    }
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReconnectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectState")
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}
