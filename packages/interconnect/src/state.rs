//! Per-component synchronized state.
//!
//! Each registered component owns one state subject backed by a
//! `tokio::sync::watch` channel. Updates replace the value wholesale and bump
//! the version; subscribers are woken only when the value actually changes.
//!
//! # Guarantees
//!
//! - **Latest value wins**: a slow subscriber sees the most recent value, not
//!   every intermediate one
//! - **No duplicate notifications**: an update equal to the current value
//!   bumps the version but wakes nobody, and a subscription never yields the
//!   same value twice in a row
//! - **Closed on unregister**: dropping the subject ends every subscription

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::core::ComponentId;

/// Current state of one component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub component_id: ComponentId,
    pub value: Value,
    pub version: u64,
    pub last_updated: DateTime<Utc>,
}

/// Result of an accepted replacement.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub previous: Value,
    pub current: StateSnapshot,
    /// False when the new value equals the previous one.
    pub changed: bool,
}

/// Registry of state subjects, one per component.
#[derive(Debug, Default)]
pub struct StateStore {
    subjects: RwLock<HashMap<ComponentId, watch::Sender<StateSnapshot>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ComponentId, watch::Sender<StateSnapshot>>> {
        self.subjects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ComponentId, watch::Sender<StateSnapshot>>> {
        self.subjects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create (or overwrite) the subject for `id`.
    ///
    /// Overwriting drops the previous subject, which closes its subscriptions.
    pub fn create(&self, id: &ComponentId, initial: Value) {
        let snapshot = StateSnapshot {
            component_id: id.clone(),
            value: initial,
            version: 0,
            last_updated: Utc::now(),
        };
        let (sender, _) = watch::channel(snapshot);
        self.write().insert(id.clone(), sender);
    }

    /// Drop the subject for `id`. Returns false if none existed.
    pub fn remove(&self, id: &ComponentId) -> bool {
        self.write().remove(id).is_some()
    }

    pub fn get(&self, id: &ComponentId) -> Option<Value> {
        self.read().get(id).map(|sender| sender.borrow().value.clone())
    }

    pub fn snapshot(&self, id: &ComponentId) -> Option<StateSnapshot> {
        self.read().get(id).map(|sender| sender.borrow().clone())
    }

    /// Replace the value of `id`. Returns `None` if `id` has no subject.
    pub fn replace(&self, id: &ComponentId, value: Value) -> Option<StateChange> {
        let subjects = self.read();
        let sender = subjects.get(id)?;

        let mut previous = Value::Null;
        let changed = sender.send_if_modified(|current| {
            let changed = current.value != value;
            previous = std::mem::replace(&mut current.value, value);
            current.version += 1;
            current.last_updated = Utc::now();
            changed
        });

        let current = sender.borrow().clone();
        Some(StateChange {
            previous,
            current,
            changed,
        })
    }

    /// Subscribe to future changes of `id`.
    pub fn subscribe(&self, id: &ComponentId) -> Option<StateSubscription> {
        // Values sent before subscribing count as already seen
        let receiver = self.read().get(id)?.subscribe();
        let last_seen = receiver.borrow().value.clone();
        Some(StateSubscription {
            receiver,
            last_seen,
        })
    }
}

/// Stream of distinct state values for one component.
///
/// Values replaced while the subscriber is not polling are skipped; the
/// subscriber wakes with the latest one. A latest value equal to the last one
/// yielded is not yielded again.
///
/// Dropping the subscription cancels it.
#[derive(Debug)]
pub struct StateSubscription {
    receiver: watch::Receiver<StateSnapshot>,
    last_seen: Value,
}

impl StateSubscription {
    /// Wait for the next distinct value. `None` once the component unregisters.
    pub async fn changed(&mut self) -> Option<Value> {
        loop {
            self.receiver.changed().await.ok()?;
            let value = self.receiver.borrow_and_update().value.clone();
            if value != self.last_seen {
                self.last_seen = value.clone();
                return Some(value);
            }
        }
    }

    /// Value at the time of the last observed change (or of subscription).
    pub fn current(&self) -> StateSnapshot {
        self.receiver.borrow().clone()
    }

    pub fn into_stream(self) -> impl Stream<Item = Value> + Send {
        stream::unfold(self, |mut subscription| async move {
            let value = subscription.changed().await?;
            Some((value, subscription))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    fn id(raw: &str) -> ComponentId {
        ComponentId::from(raw)
    }

    #[test]
    fn test_replace_bumps_version() {
        let store = StateStore::new();
        store.create(&id("a"), json!({"zoom": 1}));

        let change = store.replace(&id("a"), json!({"zoom": 2})).unwrap();

        assert!(change.changed);
        assert_eq!(change.previous, json!({"zoom": 1}));
        assert_eq!(change.current.version, 1);
        assert_eq!(store.get(&id("a")), Some(json!({"zoom": 2})));
    }

    #[test]
    fn test_replace_unknown_is_none() {
        let store = StateStore::new();
        assert!(store.replace(&id("ghost"), json!(1)).is_none());
        assert!(store.get(&id("ghost")).is_none());
    }

    #[tokio::test]
    async fn test_equal_values_notify_once() {
        let store = StateStore::new();
        store.create(&id("a"), json!(0));
        let mut subscription = store.subscribe(&id("a")).unwrap();

        store.replace(&id("a"), json!(1));
        assert_eq!(subscription.changed().await, Some(json!(1)));

        let repeat = store.replace(&id("a"), json!(1)).unwrap();
        assert!(!repeat.changed);
        assert_eq!(repeat.current.version, 2);

        let next = tokio::time::timeout(Duration::from_millis(30), subscription.changed()).await;
        assert!(next.is_err(), "duplicate value must not notify");
    }

    #[tokio::test]
    async fn test_value_restored_before_poll_is_not_repeated() {
        let store = StateStore::new();
        store.create(&id("a"), json!("A"));
        let mut subscription = store.subscribe(&id("a")).unwrap();

        store.replace(&id("a"), json!("B"));
        assert_eq!(subscription.changed().await, Some(json!("B")));

        // Back to B before the subscriber polls again
        store.replace(&id("a"), json!("A"));
        store.replace(&id("a"), json!("B"));

        let next = tokio::time::timeout(Duration::from_millis(30), subscription.changed()).await;
        assert!(next.is_err(), "B must not be yielded twice in a row");

        store.replace(&id("a"), json!("C"));
        assert_eq!(subscription.changed().await, Some(json!("C")));
    }

    #[tokio::test]
    async fn test_initial_value_is_not_yielded() {
        let store = StateStore::new();
        store.create(&id("a"), json!(0));
        let mut subscription = store.subscribe(&id("a")).unwrap();

        store.replace(&id("a"), json!(1));
        store.replace(&id("a"), json!(0));

        let next = tokio::time::timeout(Duration::from_millis(30), subscription.changed()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn test_subscription_ends_on_remove() {
        let store = StateStore::new();
        store.create(&id("a"), json!(0));
        let subscription = store.subscribe(&id("a")).unwrap();

        store.replace(&id("a"), json!(1));
        store.remove(&id("a"));

        let values: Vec<Value> = subscription.into_stream().collect().await;
        assert_eq!(values, vec![json!(1)]);
    }

    #[tokio::test]
    async fn test_overwrite_closes_old_subscribers() {
        let store = StateStore::new();
        store.create(&id("a"), json!("first"));
        let mut old = store.subscribe(&id("a")).unwrap();

        store.create(&id("a"), json!("second"));

        assert_eq!(old.changed().await, None);
        assert_eq!(store.get(&id("a")), Some(json!("second")));
        assert_eq!(store.snapshot(&id("a")).unwrap().version, 0);
    }

    #[test]
    fn test_subscribe_unknown_is_none() {
        let store = StateStore::new();
        assert!(store.subscribe(&id("ghost")).is_none());
    }
}
