//! Live subscriptions
//!
//! A subscription owns a background task that listens on one or more event
//! channels, folds relevant events into a current value and emits snapshots
//! of it. Emission can be gated by a debounce (quiet period) or a buffer
//! (fixed window, latest value wins). Channel errors end the subscription
//! and are delivered as the final `Err` item; nothing is retried.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, EventStream, ResourceEvent};
use crate::loading::{BatchLoader, LoaderConfig};
use crate::resource::ResourceRegistry;
use crate::storage::StorageBackend;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::select_all;
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod list;
pub mod resource;

pub use list::ListSubscribeOptions;
pub use resource::SubscribeOptions;

/// Lifecycle of a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Emitting values
    Live,
    /// The entity was deleted; a later create brings it back to `Live`
    Deleted,
    /// Terminal: stopped by the caller
    Unsubscribed,
    /// Terminal: the event channel failed
    Failed(String),
}

impl SubscriptionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Unsubscribed | Self::Failed(_))
    }
}

/// Handle over a live value.
///
/// Dropping the handle unsubscribes.
pub struct Subscription<T> {
    id: Uuid,
    receiver: mpsc::UnboundedReceiver<EngineResult<T>>,
    cancel: CancellationToken,
    state: Arc<RwLock<SubscriptionState>>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next emitted value; `None` once the subscription has ended
    pub async fn next(&mut self) -> Option<EngineResult<T>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.receiver.recv() => item,
        }
    }

    /// Next value if one is already waiting
    pub fn try_next(&mut self) -> Option<EngineResult<T>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.receiver.try_recv().ok()
    }

    /// Stops emission immediately and detaches the listeners. Idempotent.
    pub fn unsubscribe(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let mut state = self.state.write();
        if !state.is_terminal() {
            *state = SubscriptionState::Unsubscribed;
        }
        tracing::debug!(subscription = %self.id, "unsubscribed");
    }

    pub fn state(&self) -> SubscriptionState {
        self.state.read().clone()
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.state.read().is_terminal()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// When folded values are emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Gate {
    Immediate,
    /// Emit once no event has arrived for the period
    Debounce(Duration),
    /// Emit the latest value at the end of each window
    Buffer(Duration),
}

impl Gate {
    /// Debounce wins when both are set
    pub(crate) fn from_options(debounce: Option<Duration>, buffer: Option<Duration>) -> Self {
        match (debounce, buffer) {
            (Some(period), _) => Self::Debounce(period),
            (None, Some(window)) => Self::Buffer(window),
            (None, None) => Self::Immediate,
        }
    }
}

/// Folds events into the value a subscription emits
#[async_trait]
pub(crate) trait Fold: Send + 'static {
    type Output: Clone + Send + 'static;

    fn is_relevant(&self, event: &ResourceEvent) -> bool;

    /// Applies one event; returns whether anything should be emitted
    async fn apply(&mut self, event: ResourceEvent) -> EngineResult<bool>;

    fn snapshot(&self) -> Self::Output;

    fn state_of(&self, _output: &Self::Output) -> SubscriptionState {
        SubscriptionState::Live
    }
}

/// Remembers the last few event ids so an event seen on both the per-entity
/// and the global channel is folded once
struct RecentEvents {
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
    capacity: usize,
}

impl RecentEvents {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn first_sighting(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// Creates and tracks live subscriptions
#[derive(Clone)]
pub struct SubscriptionManager {
    registry: ResourceRegistry,
    storage: Arc<dyn StorageBackend>,
    bus: Arc<dyn EventBus>,
    loader_config: LoaderConfig,
    dedupe_window: usize,
    active: Arc<DashMap<Uuid, CancellationToken>>,
}

impl SubscriptionManager {
    pub fn new(
        registry: ResourceRegistry,
        storage: Arc<dyn StorageBackend>,
        bus: Arc<dyn EventBus>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            storage,
            bus,
            loader_config: LoaderConfig::from(config),
            dedupe_window: *config.get_dedupe_window(),
            active: Arc::new(DashMap::new()),
        }
    }

    /// Subscriptions whose task is still running
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Ends every subscription
    pub fn shutdown(&self) {
        for entry in self.active.iter() {
            entry.value().cancel();
        }
        tracing::info!(subscriptions = self.active.len(), "subscriptions shut down");
    }

    pub(crate) fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub(crate) fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    /// A loader that shares nothing with any request
    pub(crate) fn fresh_loader(&self) -> BatchLoader {
        BatchLoader::new(self.registry.clone(), self.storage.clone(), self.loader_config.clone())
    }

    /// Starts the fold task. `initial`, when given, is the first emission.
    pub(crate) fn start<F: Fold>(
        &self,
        fold: F,
        streams: Vec<EventStream>,
        initial: Option<F::Output>,
        gate: Gate,
    ) -> Subscription<F::Output> {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let state = Arc::new(RwLock::new(match &initial {
            Some(value) => fold.state_of(value),
            None => SubscriptionState::Live,
        }));
        if let Some(value) = initial {
            let _ = sender.send(Ok(value));
        }

        self.active.insert(id, cancel.clone());
        let task = FoldTask {
            id,
            fold,
            sender,
            cancel: cancel.clone(),
            state: state.clone(),
            recent: RecentEvents::new(self.dedupe_window),
            gate,
        };
        let active = self.active.clone();
        tokio::spawn(async move {
            task.run(streams).await;
            active.remove(&id);
        });

        tracing::debug!(subscription = %id, ?gate, "subscription started");
        Subscription {
            id,
            receiver,
            cancel,
            state,
        }
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("active", &self.active.len())
            .field("dedupe_window", &self.dedupe_window)
            .finish_non_exhaustive()
    }
}

struct FoldTask<F: Fold> {
    id: Uuid,
    fold: F,
    sender: mpsc::UnboundedSender<EngineResult<F::Output>>,
    cancel: CancellationToken,
    state: Arc<RwLock<SubscriptionState>>,
    recent: RecentEvents,
    gate: Gate,
}

impl<F: Fold> FoldTask<F> {
    async fn run(mut self, streams: Vec<EventStream>) {
        let mut events = select_all(streams);
        let mut deadline: Option<Instant> = None;

        loop {
            let pending_emit = deadline;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = wait_until(pending_emit) => {
                    deadline = None;
                    if !self.emit() {
                        break;
                    }
                }
                item = events.next() => match item {
                    Some(Ok(event)) => {
                        if !self.recent.first_sighting(event.event_id) || !self.fold.is_relevant(&event) {
                            continue;
                        }
                        tracing::trace!(subscription = %self.id, event = event.event_type(), "folding event");
                        match self.fold.apply(event).await {
                            Ok(false) => {}
                            Ok(true) => match self.gate {
                                Gate::Immediate => {
                                    if !self.emit() {
                                        break;
                                    }
                                }
                                Gate::Debounce(period) => deadline = Some(Instant::now() + period),
                                Gate::Buffer(window) => {
                                    deadline.get_or_insert_with(|| Instant::now() + window);
                                }
                            },
                            Err(err) => {
                                self.fail(err);
                                break;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        self.fail(err);
                        break;
                    }
                    None => {
                        self.fail(EngineError::Subscription("event channel closed".to_string()));
                        break;
                    }
                },
            }
        }
        tracing::debug!(subscription = %self.id, "subscription task finished");
    }

    /// Returns false once nobody is listening
    fn emit(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let value = self.fold.snapshot();
        {
            let mut state = self.state.write();
            if !state.is_terminal() {
                *state = self.fold.state_of(&value);
            }
        }
        self.sender.send(Ok(value)).is_ok()
    }

    fn fail(&self, err: EngineError) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::warn!(subscription = %self.id, error = %err, "subscription failed");
        *self.state.write() = SubscriptionState::Failed(err.to_string());
        let _ = self.sender.send(Err(err));
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_prefers_debounce() {
        let ms = Duration::from_millis;
        assert_eq!(Gate::from_options(Some(ms(5)), Some(ms(9))), Gate::Debounce(ms(5)));
        assert_eq!(Gate::from_options(None, Some(ms(9))), Gate::Buffer(ms(9)));
        assert_eq!(Gate::from_options(None, None), Gate::Immediate);
    }

    #[test]
    fn test_recent_events_window() {
        let mut recent = RecentEvents::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        assert!(recent.first_sighting(a));
        assert!(!recent.first_sighting(a));
        assert!(recent.first_sighting(b));
        assert!(recent.first_sighting(c));
        // `a` fell out of the window
        assert!(recent.first_sighting(a));
    }

    #[test]
    fn test_terminal_states() {
        assert!(SubscriptionState::Unsubscribed.is_terminal());
        assert!(SubscriptionState::Failed("closed".to_string()).is_terminal());
        assert!(!SubscriptionState::Deleted.is_terminal());
    }
}
