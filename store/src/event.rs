//! The reactive event bus (§6 external collaborator): fan-out of events to
//! registered listeners, plus the completion-handle plumbing used to signal
//! "this write is durable" / "this index pass is readable" across tasks.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::entity::{EntityId, Version};

/// The kind of change an [`Event`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Replaced,
    Deleted,
    Reset,
}

/// Distinguishes events fired by a user-caused mutation from events replayed
/// during startup catch-up (registration backfill, index resume).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    User,
    Initialization,
}

/// A handle that resolves once some asynchronous step completes (a batch
/// becoming durable, an index pass becoming readable). Cloning shares the
/// same underlying completion; every clone resolves together.
#[derive(Clone)]
pub struct Completion(Shared<BoxFuture<'static, ()>>);

impl Completion {
    /// Returns an already-resolved completion, for call sites with nothing
    /// to wait on (e.g. a read that never produced a pending write).
    pub fn ready() -> Self {
        let fut: BoxFuture<'static, ()> = Box::pin(async {});
        Completion(fut.shared())
    }

    pub async fn wait(&self) {
        self.0.clone().await
    }
}

pub struct CompletionSender(oneshot::Sender<()>);

impl CompletionSender {
    pub fn resolve(self) {
        let _ = self.0.send(());
    }
}

/// Creates a paired sender/handle: the handle resolves once `resolve` is
/// called on the sender (or the sender is dropped).
pub fn new_completion() -> (CompletionSender, Completion) {
    let (tx, rx) = oneshot::channel::<()>();
    let fut: BoxFuture<'static, ()> = Box::pin(async move {
        let _ = rx.await;
    });
    (CompletionSender(tx), Completion(fut.shared()))
}

/// A change notification published by a class to its downstream listeners.
#[derive(Clone)]
pub struct Event {
    pub kind: EventKind,
    pub source: String,
    pub id: EntityId,
    pub version: Version,
    pub origin: Origin,
    /// The ids of upstream sources that contributed to this update, for
    /// classes derived from more than one source.
    pub sources: HashSet<EntityId>,
    /// The value this id held immediately before the update, when the
    /// publishing class tracks previous values (needed by the indexer to
    /// compute deletions).
    pub previous_value: Option<Value>,
    /// Resolves once the write this event reports is durable.
    pub when_written: Option<Completion>,
    /// When set, a listener reacting to this event must not run its own
    /// `resetCache`/recompute in response — set on the `Reset` events
    /// `Class::invalidate` publishes, since invalidation already is the
    /// reset and carries no real value change to react to.
    pub no_reset: bool,
}

impl Event {
    pub fn new(kind: EventKind, source: impl Into<String>, id: EntityId, version: Version) -> Self {
        Self {
            kind,
            source: source.into(),
            id,
            version,
            origin: Origin::User,
            sources: HashSet::new(),
            previous_value: None,
            when_written: None,
            no_reset: false,
        }
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_previous_value(mut self, value: Option<Value>) -> Self {
        self.previous_value = value;
        self
    }

    pub fn with_when_written(mut self, completion: Completion) -> Self {
        self.when_written = Some(completion);
        self
    }

    pub fn no_reset(mut self) -> Self {
        self.no_reset = true;
        self
    }
}

/// Something that can receive events from a class it subscribed to.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn on_event(&self, event: Event);
}

/// The fan-out point for one class's events. A class calls `publish` after
/// every mutation; downstream classes attach themselves via `notifies`.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn notifies(&self, listener: Arc<dyn Listener>) {
        self.listeners.lock().await.push(listener);
    }

    pub async fn stop_notifies(&self, listener: &Arc<dyn Listener>) {
        self.listeners.lock().await.retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub async fn publish(&self, event: Event) {
        let listeners = self.listeners.lock().await.clone();
        for listener in listeners {
            listener.on_event(event.clone()).await;
        }
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.lock().await.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait]
    impl Listener for Counter {
        async fn on_event(&self, _event: Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn publishes_to_every_registered_listener() {
        let bus = EventBus::new();
        let a = Arc::new(Counter(AtomicUsize::new(0)));
        let b = Arc::new(Counter(AtomicUsize::new(0)));
        bus.notifies(a.clone()).await;
        bus.notifies(b.clone()).await;

        bus.publish(Event::new(EventKind::Added, "widgets", EntityId::num(1), 1)).await;

        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_notifies_removes_only_the_named_listener() {
        let bus = EventBus::new();
        let a: Arc<dyn Listener> = Arc::new(Counter(AtomicUsize::new(0)));
        let b: Arc<dyn Listener> = Arc::new(Counter(AtomicUsize::new(0)));
        bus.notifies(a.clone()).await;
        bus.notifies(b.clone()).await;
        bus.stop_notifies(&a).await;
        assert_eq!(bus.listener_count().await, 1);
    }

    #[tokio::test]
    async fn completion_resolves_all_clones() {
        let (tx, handle) = new_completion();
        let other = handle.clone();
        tx.resolve();
        handle.wait().await;
        other.wait().await;
    }

    #[tokio::test]
    async fn ready_completion_resolves_immediately() {
        Completion::ready().wait().await;
    }
}
