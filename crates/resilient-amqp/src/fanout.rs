//! Broadcast of connection lifecycle errors to caller-registered sinks.

use crate::error::Error;
use crate::spec::Sink;

/// Ordered set of error sinks.
///
/// Delivery is unbuffered from the fanout's point of view: each send waits
/// until that sink accepts the error, so a full sink delays every sink after
/// it and the supervisor itself.
#[derive(Debug, Clone, Default)]
pub(crate) struct ErrorFanout {
    sinks: Vec<Sink<Error>>,
}

impl ErrorFanout {
    #[cfg(test)]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&mut self, sink: Sink<Error>) {
        self.sinks.push(sink);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Sends `error` to every sink in registration order.
    ///
    /// Sinks whose receiver has been dropped are skipped. Returns how many
    /// sinks accepted the error.
    pub(crate) async fn broadcast(&self, error: &Error) -> usize {
        let mut delivered = 0;
        for (index, sink) in self.sinks.iter().enumerate() {
            match sink.send(error.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(sink = index, "error sink dropped, skipping");
                    #[cfg(not(feature = "tracing"))]
                    let _ = index;
                }
            }
        }
        delivered
    }
}
