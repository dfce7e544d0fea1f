//! Event bus abstraction

use super::ResourceEvent;
use crate::error::EngineResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};

/// Pub/sub transport for [`ResourceEvent`]s.
///
/// Implementations must deliver events on one channel in publish order.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Returns the number of subscribers the event reached
    async fn publish(&self, channel: &str, event: ResourceEvent) -> EngineResult<usize>;

    async fn subscribe(&self, channel: &str) -> EngineResult<EventStream>;
}

/// Events of one channel. Dropping the stream detaches the listener.
pub struct EventStream {
    channel: String,
    inner: BoxStream<'static, EngineResult<ResourceEvent>>,
}

impl EventStream {
    pub fn new(channel: impl Into<String>, inner: BoxStream<'static, EngineResult<ResourceEvent>>) -> Self {
        Self {
            channel: channel.into(),
            inner,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<EngineResult<ResourceEvent>> {
        self.inner.next().await
    }

    /// Detach from the channel. Dropping the stream does the same.
    pub fn unsubscribe(self) {
        tracing::trace!(channel = %self.channel, "event stream detached");
    }
}

impl Stream for EventStream {
    type Item = EngineResult<ResourceEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
