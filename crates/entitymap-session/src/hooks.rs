//! Change events and the hook bus.
//!
//! A unit of work records one [`ChangeEvent`] per create, update and delete
//! into its [`ChangeBuffer`]. On flush the buffer is delivered to every
//! listener of a [`HookRegistry`]:
//!
//! - Delivery is synchronous and in buffer order, over a snapshot of the
//!   listeners taken when delivery starts, so listeners may subscribe or
//!   unsubscribe while an event is being delivered.
//! - A failing or panicking listener does not stop delivery. Every failure
//!   is collected and reported as one `Error::Hook` once all listeners ran.
//!
//! [`HookRegistry::global`] is the process-wide registry. It starts empty and
//! is never cleared implicitly; scoped subscriptions go through
//! [`HookRegistry::with_hook`] or a [`HookGuard`].

use entitymap_core::error::{HookError, ListenerFailure};
use entitymap_core::{Error, IdentityKey, Result};
use serde::Serialize;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Kind of change recorded for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChangeType {
    Created,
    Updated,
    Removed,
}

/// Identifier of one unit of work, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct UnitOfWorkId(u64);

impl UnitOfWorkId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitOfWorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uow-{}", self.0)
    }
}

/// One buffered change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub change_type: ChangeType,
    pub entity: &'static str,
    pub key: IdentityKey,
    pub unit_of_work: UnitOfWorkId,
}

impl ChangeEvent {
    pub fn new(change_type: ChangeType, key: IdentityKey, unit_of_work: UnitOfWorkId) -> Self {
        Self {
            change_type,
            entity: key.entity(),
            key,
            unit_of_work,
        }
    }
}

/// Change events of one flush window, collapsed per key.
///
/// Collapsing rules:
/// - `Created` followed by `Updated` stays `Created`.
/// - Repeated `Updated` events keep the first one.
/// - `Removed` drops every earlier event for the key and is appended at the
///   end. A key created and removed in the same window therefore yields
///   `Removed` only.
/// - `Created` after a buffered `Removed` is appended (delete, then
///   reinsert under the same key).
#[derive(Debug, Clone, Default)]
pub struct ChangeBuffer {
    events: Vec<ChangeEvent>,
}

impl ChangeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event, applying the collapsing rules.
    pub fn record(&mut self, event: ChangeEvent) {
        let last_for_key = self
            .events
            .iter()
            .rev()
            .find(|e| e.key == event.key)
            .map(|e| e.change_type);

        match (event.change_type, last_for_key) {
            (ChangeType::Updated, Some(ChangeType::Created | ChangeType::Updated)) => {
                tracing::trace!(key = %event.key, "Update absorbed by buffered event");
            }
            (ChangeType::Removed, Some(_)) => {
                self.events.retain(|e| e.key != event.key);
                self.events.push(event);
            }
            _ => self.events.push(event),
        }
    }

    pub fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// Handle returned by [`HookRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// A change listener. Returning an error reports a failure without stopping
/// delivery to other listeners.
pub type Listener = Arc<dyn Fn(&ChangeEvent) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    listeners: Vec<(SubscriptionId, Listener)>,
}

/// A set of change listeners. Clones share the same set.
#[derive(Clone, Default)]
pub struct HookRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

impl HookRegistry {
    /// Create an independent, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static HookRegistry {
        static GLOBAL: OnceLock<HookRegistry> = OnceLock::new();
        GLOBAL.get_or_init(HookRegistry::new)
    }

    /// Register a listener.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) -> Result<()> + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.listeners.push((id, listener));
        tracing::debug!(subscription = id.0, "Listener subscribed");
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = inner.listeners.len();
        inner.listeners.retain(|(sid, _)| *sid != id);
        let removed = inner.listeners.len() != before;
        if removed {
            tracing::debug!(subscription = id.0, "Listener unsubscribed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .listeners
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe for as long as the returned guard lives.
    #[must_use = "the listener is unsubscribed when the guard is dropped"]
    pub fn scoped<F>(&self, listener: F) -> HookGuard
    where
        F: Fn(&ChangeEvent) -> Result<()> + Send + Sync + 'static,
    {
        HookGuard {
            registry: self.clone(),
            id: self.subscribe(listener),
        }
    }

    /// Run `body` with `listener` subscribed. The listener is removed when
    /// `body` returns or unwinds.
    pub fn with_hook<F, T>(&self, listener: F, body: impl FnOnce() -> T) -> T
    where
        F: Fn(&ChangeEvent) -> Result<()> + Send + Sync + 'static,
    {
        let _guard = self.scoped(listener);
        body()
    }

    /// Async form of [`HookRegistry::with_hook`]. The listener is also removed
    /// when the future is dropped before completion.
    pub async fn with_hook_async<F, Fut>(&self, listener: F, body: Fut) -> Fut::Output
    where
        F: Fn(&ChangeEvent) -> Result<()> + Send + Sync + 'static,
        Fut: Future,
    {
        let _guard = self.scoped(listener);
        body.await
    }

    /// Deliver `events` in order to the listeners registered right now.
    pub fn deliver(&self, events: &[ChangeEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let snapshot: Vec<(SubscriptionId, Listener)> = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .listeners
            .clone();

        tracing::debug!(
            events = events.len(),
            listeners = snapshot.len(),
            "Delivering change events"
        );

        let mut failures = Vec::new();
        for event in events {
            for (id, listener) in &snapshot {
                let outcome = catch_unwind(AssertUnwindSafe(|| listener(event)));
                let message = match outcome {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e.to_string(),
                    Err(payload) => panic_message(payload.as_ref()),
                };
                tracing::warn!(
                    subscription = id.0,
                    key = %event.key,
                    error = %message,
                    "Change listener failed"
                );
                failures.push(ListenerFailure {
                    subscription: id.0,
                    message,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Hook(HookError {
                events: events.len(),
                failures,
            }))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("listener panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("listener panicked: {s}")
    } else {
        "listener panicked".to_string()
    }
}

/// Unsubscribes its listener when dropped.
#[derive(Debug)]
pub struct HookGuard {
    registry: HookRegistry,
    id: SubscriptionId,
}

impl HookGuard {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        self.registry.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitymap_core::{ColumnDef, EntitySchema};

    static NOTE: EntitySchema =
        EntitySchema::new("note", "notes", &[ColumnDef::new("id").primary_key(true)]);

    fn key(id: i64) -> IdentityKey {
        IdentityKey::single(&NOTE, id).expect("valid key")
    }

    fn event(change_type: ChangeType, id: i64) -> ChangeEvent {
        ChangeEvent::new(change_type, key(id), UnitOfWorkId(1))
    }

    fn kinds(buffer: &ChangeBuffer) -> Vec<(ChangeType, IdentityKey)> {
        buffer
            .events()
            .iter()
            .map(|e| (e.change_type, e.key.clone()))
            .collect()
    }

    #[test]
    fn created_absorbs_updates() {
        let mut buffer = ChangeBuffer::new();
        buffer.record(event(ChangeType::Created, 1));
        buffer.record(event(ChangeType::Updated, 1));
        buffer.record(event(ChangeType::Updated, 1));
        assert_eq!(kinds(&buffer), vec![(ChangeType::Created, key(1))]);
    }

    #[test]
    fn updates_dedupe() {
        let mut buffer = ChangeBuffer::new();
        buffer.record(event(ChangeType::Updated, 1));
        buffer.record(event(ChangeType::Updated, 2));
        buffer.record(event(ChangeType::Updated, 1));
        assert_eq!(
            kinds(&buffer),
            vec![(ChangeType::Updated, key(1)), (ChangeType::Updated, key(2))]
        );
    }

    #[test]
    fn removed_replaces_and_moves_to_end() {
        let mut buffer = ChangeBuffer::new();
        buffer.record(event(ChangeType::Created, 1));
        buffer.record(event(ChangeType::Updated, 2));
        buffer.record(event(ChangeType::Removed, 1));
        assert_eq!(
            kinds(&buffer),
            vec![(ChangeType::Updated, key(2)), (ChangeType::Removed, key(1))]
        );

        buffer.record(event(ChangeType::Created, 1));
        buffer.record(event(ChangeType::Updated, 1));
        assert_eq!(
            kinds(&buffer),
            vec![
                (ChangeType::Updated, key(2)),
                (ChangeType::Removed, key(1)),
                (ChangeType::Created, key(1)),
            ]
        );
    }

    #[test]
    fn delivery_continues_past_failures() {
        let registry = HookRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        registry.subscribe(|_| Err(Error::Custom("first listener refuses".into())));
        registry.subscribe(|_| panic!("second listener explodes"));
        let sink = Arc::clone(&seen);
        registry.subscribe(move |e| {
            sink.lock().expect("lock poisoned").push(e.key.clone());
            Ok(())
        });

        let events = [event(ChangeType::Created, 1), event(ChangeType::Removed, 2)];
        let err = registry.deliver(&events).unwrap_err();

        assert_eq!(*seen.lock().expect("lock poisoned"), vec![key(1), key(2)]);
        match err {
            Error::Hook(h) => {
                assert_eq!(h.events, 2);
                assert_eq!(h.failures.len(), 4);
                assert!(h.failures[1].message.contains("second listener explodes"));
            }
            other => panic!("expected hook error, got {other:?}"),
        }
    }

    #[test]
    fn listeners_can_change_registry_during_delivery() {
        let registry = HookRegistry::new();
        let calls = Arc::new(AtomicU64::new(0));

        let inner_registry = registry.clone();
        let inner_calls = Arc::clone(&calls);
        registry.subscribe(move |_| {
            let counter = Arc::clone(&inner_calls);
            inner_registry.subscribe(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });

        registry
            .deliver(&[event(ChangeType::Created, 1), event(ChangeType::Created, 2)])
            .unwrap();
        // Listeners added mid-delivery only see later deliveries.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn with_hook_unsubscribes_on_panic() {
        let registry = HookRegistry::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            registry.with_hook(|_| Ok(()), || {
                assert_eq!(registry.len(), 1);
                panic!("body failed");
            })
        }));
        assert!(result.is_err());
        assert!(registry.is_empty());

        let value = registry.with_hook(|_| Ok(()), || 42);
        assert_eq!(value, 42);
        assert!(registry.is_empty());
    }

    #[test]
    fn guard_and_unsubscribe() {
        let registry = HookRegistry::new();
        let guard = registry.scoped(|_| Ok(()));
        let id = guard.id();
        assert_eq!(registry.len(), 1);
        drop(guard);
        assert!(!registry.unsubscribe(id));
        assert!(registry.deliver(&[]).is_ok());
    }

    #[test]
    fn events_serialize() {
        let json = serde_json::to_value(event(ChangeType::Updated, 4)).unwrap();
        assert_eq!(json["change_type"], "Updated");
        assert_eq!(json["entity"], "note");
        assert_eq!(json["unit_of_work"], 1);
    }
}
