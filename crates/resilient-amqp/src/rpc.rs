//! Request/reply over a [`ChannelContext`].
//!
//! The caller names a reply queue; the request is published carrying that
//! queue and a correlation id, and the first reply whose correlation id
//! matches is decoded as the response.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelContext, JSON_CONTENT_TYPE};
use crate::error::{Error, Result};
use crate::forward::spawn_forwarder;
use crate::message::{Properties, PublishFlags, Publishing};
use crate::spec::ConsumeSpec;
use crate::transport::SessionChannel;

/// How long [`ChannelContext::publish_and_wait_for_reply`] waits by default.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Replies buffered between the reply consumer and the waiting caller.
const REPLY_BUFFER: usize = 16;

/// A request published by [`ChannelContext::publish_and_wait_for_reply`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use resilient_amqp::ReplyRequest;
///
/// let payload = serde_json::json!({ "sku": "A-1" });
/// let request = ReplyRequest::new("stock.replies", "rpc", "stock.check", &payload)
///     .correlation_id("req-42")
///     .timeout(Duration::from_secs(2));
///
/// assert_eq!(request.reply_queue(), "stock.replies");
/// ```
#[derive(Debug)]
pub struct ReplyRequest<'a, Req: ?Sized> {
    reply_queue: String,
    correlation_id: Option<String>,
    exchange: String,
    routing_key: String,
    flags: PublishFlags,
    properties: Properties,
    timeout: Duration,
    payload: &'a Req,
}

impl<'a, Req: ?Sized> ReplyRequest<'a, Req> {
    /// Creates a request for `payload`, with replies expected on
    /// `reply_queue` and a 10 second timeout.
    pub fn new(
        reply_queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: &'a Req,
    ) -> Self {
        Self {
            reply_queue: reply_queue.into(),
            correlation_id: None,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            flags: PublishFlags::default(),
            properties: Properties::default(),
            timeout: DEFAULT_REPLY_TIMEOUT,
            payload,
        }
    }

    /// Only replies carrying this correlation id are accepted. Without one,
    /// the first reply on the queue is taken.
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn flags(mut self, flags: PublishFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Extra properties for the request. `reply_to`, `correlation_id` and
    /// the content type are always overwritten.
    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }
}

/// Cancels the scoped reply consumer however the wait ends.
struct ReplyConsumer {
    live: Arc<dyn SessionChannel>,
    tag: String,
    scope: CancellationToken,
}

impl Drop for ReplyConsumer {
    fn drop(&mut self) {
        self.scope.cancel();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let live = Arc::clone(&self.live);
        let tag = std::mem::take(&mut self.tag);
        runtime.spawn(async move {
            if let Err(_err) = live.cancel(&tag, false).await {
                #[cfg(feature = "tracing")]
                tracing::debug!(consumer = %tag, error = %_err, "reply consumer cancel failed");
            }
        });
    }
}

impl ChannelContext {
    /// Publishes `request` as JSON and waits for the matching reply.
    ///
    /// A consumer named `<reply_queue>.consumer` is started on the reply
    /// queue before publishing and cancelled on every exit path. Replies
    /// with a different correlation id are discarded without resetting the
    /// timer.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] if the channel is unbound, or becomes
    ///   unbound before a reply arrives.
    /// - [`Error::ConsumeFailure`] / [`Error::PublishFailure`] straight from
    ///   the broker, without waiting.
    /// - [`Error::TimedOut`] if no matching reply arrives in time.
    /// - [`Error::Codec`] if the request cannot be encoded or the matching
    ///   reply cannot be decoded.
    pub async fn publish_and_wait_for_reply<Req, Resp>(
        &self,
        request: ReplyRequest<'_, Req>,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request.payload)?;
        let (live, scope) = self.scoped().await?;

        let (sink, mut replies) = mpsc::channel(REPLY_BUFFER);
        let spec = ConsumeSpec {
            consumer: format!("{}.consumer", request.reply_queue),
            ..ConsumeSpec::new(request.reply_queue.clone(), sink)
        };
        let deliveries = live
            .consume(&spec)
            .await
            .map_err(Error::ConsumeFailure)?;
        let _consumer = ReplyConsumer {
            live,
            tag: spec.consumer.clone(),
            scope: scope.clone(),
        };
        spawn_forwarder(deliveries, spec.delivery_sink, scope, "replies");

        let mut properties = request.properties;
        properties.reply_to = Some(request.reply_queue.clone());
        properties.correlation_id = request.correlation_id.clone();
        properties.content_type = Some(JSON_CONTENT_TYPE.to_string());
        self.publish(
            &request.exchange,
            &request.routing_key,
            request.flags,
            Publishing { properties, body },
        )
        .await?;

        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);
        loop {
            let delivery = tokio::select! {
                biased;
                delivery = replies.recv() => delivery,
                _ = &mut deadline => return Err(Error::TimedOut(request.timeout)),
            };
            let Some(delivery) = delivery else {
                return Err(Error::NotConnected);
            };

            if let Some(expected) = &request.correlation_id {
                if delivery.properties.correlation_id.as_ref() != Some(expected) {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(
                        reply_queue = %request.reply_queue,
                        expected = %expected,
                        received = ?delivery.properties.correlation_id,
                        "skipping reply for another request"
                    );
                    continue;
                }
            }

            return Ok(serde_json::from_slice(&delivery.body)?);
        }
    }
}
