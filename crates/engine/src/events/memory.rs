//! In-process event bus built on tokio broadcast channels

use super::{EventBus, EventStream, ResourceEvent};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;

const DEFAULT_CAPACITY: usize = 256;

/// Broadcast hub with one channel per name, created on first subscribe.
///
/// A channel whose last receiver is gone is dropped on the next subscribe
/// or on the first publish that finds it empty.
#[derive(Clone)]
pub struct MemoryEventBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<ResourceEvent>>>>,
    capacity: usize,
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub async fn has_subscribers(&self, channel: &str) -> bool {
        self.subscriber_count(channel).await > 0
    }

    /// Drop channels nobody listens to
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, channel: &str, event: ResourceEvent) -> EngineResult<usize> {
        let sent = match self.channels.read().await.get(channel) {
            Some(sender) => sender.send(event).ok(),
            None => Some(0),
        };
        let delivered = match sent {
            Some(delivered) => delivered,
            // send only fails when there are no receivers
            None => {
                let mut channels = self.channels.write().await;
                if channels.get(channel).is_some_and(|sender| sender.receiver_count() == 0) {
                    channels.remove(channel);
                    tracing::trace!(channel, "idle channel dropped");
                }
                0
            }
        };
        tracing::trace!(channel, delivered, "event published");
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> EngineResult<EventStream> {
        let receiver = {
            let mut channels = self.channels.write().await;
            channels.retain(|_, sender| sender.receiver_count() > 0);
            match channels.get(channel) {
                Some(sender) => sender.subscribe(),
                None => {
                    let (sender, receiver) = broadcast::channel(self.capacity);
                    channels.insert(channel.to_string(), sender);
                    receiver
                }
            }
        };

        let name = channel.to_string();
        let stream = futures::stream::unfold(receiver, move |mut receiver| {
            let name = name.clone();
            async move {
                match receiver.recv().await {
                    Ok(event) => Some((Ok(event), receiver)),
                    Err(RecvError::Closed) => None,
                    Err(RecvError::Lagged(skipped)) => Some((
                        Err(EngineError::Event(format!(
                            "subscriber on '{}' lagged behind by {} events",
                            name, skipped
                        ))),
                        receiver,
                    )),
                }
            }
        });

        Ok(EventStream::new(channel, stream.boxed()))
    }
}
