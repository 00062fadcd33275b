//! Error types for resilient connections.

use std::sync::Arc;
use std::time::Duration;

/// A fault reported by the underlying broker client.
///
/// Cheap to clone so that one failure can be handed to every registered sink.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct BrokerError {
    code: Option<u16>,
    message: String,
}

impl BrokerError {
    /// Creates an error without a protocol reply code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Creates an error carrying the broker's reply code (e.g. 404, 406).
    pub fn with_code(code: u16, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    /// Returns the broker reply code, if one was reported.
    pub fn code(&self) -> Option<u16> {
        self.code
    }

    /// Returns the error text.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors surfaced by connections, channels and the request/reply helper.
///
/// `DialFailure` and `TransportClosed` are only ever delivered to sinks
/// registered with [`Connection::notify_error`](crate::Connection::notify_error);
/// the supervisor recovers from them on its own.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Establishing a session with the broker failed.
    #[error("dial failed: {0}")]
    DialFailure(BrokerError),

    /// The live session was closed by the broker or the network.
    #[error("transport closed: {0}")]
    TransportClosed(BrokerError),

    /// Opening or configuring an underlying channel failed during bind.
    #[error("channel setup failed: {0}")]
    ChannelFailure(BrokerError),

    /// The channel has no live session right now.
    #[error("channel is not connected")]
    NotConnected,

    /// An exchange declare, queue declare or queue bind was rejected.
    #[error("declare failed: {0}")]
    DeclareFailure(BrokerError),

    /// Starting a consumer was rejected.
    #[error("consume failed: {0}")]
    ConsumeFailure(BrokerError),

    /// The broker client refused the publishing.
    #[error("publish failed: {0}")]
    PublishFailure(BrokerError),

    /// No matching reply arrived in time.
    #[error("timed out after {0:?} waiting for a reply")]
    TimedOut(Duration),

    /// A JSON payload could not be encoded or decoded.
    #[error("payload codec error: {0}")]
    Codec(Arc<serde_json::Error>),
}

impl Error {
    /// Returns true for errors the supervisor retries on its own.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::DialFailure(_) | Error::TransportClosed(_))
    }

    /// Returns the underlying broker fault, if there is one.
    pub fn broker_error(&self) -> Option<&BrokerError> {
        match self {
            Error::DialFailure(e)
            | Error::TransportClosed(e)
            | Error::ChannelFailure(e)
            | Error::DeclareFailure(e)
            | Error::ConsumeFailure(e)
            | Error::PublishFailure(e) => Some(e),
            Error::NotConnected | Error::TimedOut(_) | Error::Codec(_) => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(Arc::new(err))
    }
}

/// Result type for resilient connection operations.
pub type Result<T> = std::result::Result<T, Error>;
