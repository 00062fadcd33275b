//! Worker tasks that copy items from an underlying subscription into a
//! caller-owned sink.

use futures::stream::{BoxStream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::spec::Sink;

/// Spawns a forwarder that runs until `source` ends, the sink's receiver is
/// dropped, or `bind` is cancelled.
///
/// Sends wait for the sink to accept each item; cancellation interrupts a
/// pending send as well, so an unbind never waits on a slow consumer.
pub(crate) fn spawn_forwarder<T>(
    mut source: BoxStream<'static, T>,
    sink: Sink<T>,
    bind: CancellationToken,
    what: &'static str,
) -> JoinHandle<usize>
where
    T: Send + 'static,
{
    tokio::spawn(async move {
        let mut forwarded = 0usize;
        loop {
            let item = tokio::select! {
                biased;
                _ = bind.cancelled() => break,
                item = source.next() => item,
            };
            let Some(item) = item else { break };

            let sent = tokio::select! {
                biased;
                _ = bind.cancelled() => break,
                sent = sink.send(item) => sent,
            };
            if sent.is_err() {
                break;
            }
            forwarded += 1;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(forwarder = what, forwarded, "forwarder finished");
        #[cfg(not(feature = "tracing"))]
        let _ = what;

        forwarded
    })
}
