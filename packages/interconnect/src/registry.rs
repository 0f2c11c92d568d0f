//! Registry of currently connected components.
//!
//! Iteration follows registration order, which fixes the order of wildcard
//! fan-out. Re-registering an id replaces its handle in place and keeps its
//! original position.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::component::{Capability, ComponentHandle};
use crate::core::ComponentId;

/// A registered component as seen by the core.
#[derive(Debug, Clone)]
pub struct RegisteredComponent {
    pub handle: ComponentHandle,
    pub registered_at: DateTime<Utc>,
}

/// Outcome of [`ComponentRegistry::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    New,
    Replaced,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<ComponentId, RegisteredComponent>,
    order: Vec<ComponentId>,
}

/// Thread-safe, insertion-ordered component registry.
#[derive(Default)]
pub struct ComponentRegistry {
    inner: RwLock<RegistryInner>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Registry data stays consistent per operation, so a poisoned lock is recovered.
    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, id: ComponentId, handle: ComponentHandle) -> Registration {
        let mut inner = self.write();
        let entry = RegisteredComponent {
            handle,
            registered_at: Utc::now(),
        };
        match inner.entries.insert(id.clone(), entry) {
            Some(_) => Registration::Replaced,
            None => {
                inner.order.push(id);
                Registration::New
            }
        }
    }

    pub fn remove(&self, id: &ComponentId) -> Option<RegisteredComponent> {
        let mut inner = self.write();
        let removed = inner.entries.remove(id)?;
        inner.order.retain(|existing| existing != id);
        Some(removed)
    }

    pub fn lookup(&self, id: &ComponentId) -> Option<ComponentHandle> {
        self.read().entries.get(id).map(|entry| entry.handle.clone())
    }

    pub fn contains(&self, id: &ComponentId) -> bool {
        self.read().entries.contains_key(id)
    }

    pub fn capability_of(&self, id: &ComponentId) -> Option<Capability> {
        self.read()
            .entries
            .get(id)
            .map(|entry| entry.handle.capability().clone())
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> Vec<ComponentId> {
        self.read().order.clone()
    }

    /// Every registered component except `source`, in registration order.
    pub fn others(&self, source: &ComponentId) -> Vec<(ComponentId, Capability)> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter(|id| *id != source)
            .filter_map(|id| {
                inner
                    .entries
                    .get(id)
                    .map(|entry| (id.clone(), entry.handle.capability().clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(raw: &str) -> ComponentId {
        ComponentId::from(raw)
    }

    #[test]
    fn test_insert_preserves_order() {
        let registry = ComponentRegistry::new();
        registry.insert(id("c"), ComponentHandle::new());
        registry.insert(id("a"), ComponentHandle::new());
        registry.insert(id("b"), ComponentHandle::new());

        assert_eq!(registry.ids(), vec![id("c"), id("a"), id("b")]);
    }

    #[test]
    fn test_reinsert_replaces_in_place() {
        let registry = ComponentRegistry::new();
        assert_eq!(
            registry.insert(id("a"), ComponentHandle::new()),
            Registration::New
        );
        registry.insert(id("b"), ComponentHandle::new());

        let replaced = registry.insert(
            id("a"),
            ComponentHandle::new().with_initial_state(json!({"v": 2})),
        );

        assert_eq!(replaced, Registration::Replaced);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec![id("a"), id("b")]);
        assert_eq!(
            registry.lookup(&id("a")).unwrap().initial_state(),
            &json!({"v": 2})
        );
    }

    #[test]
    fn test_remove_unknown_is_none() {
        let registry = ComponentRegistry::new();
        assert!(registry.remove(&id("ghost")).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_others_excludes_source() {
        let registry = ComponentRegistry::new();
        for name in ["orchestrator", "a", "b"] {
            registry.insert(id(name), ComponentHandle::new());
        }

        let others: Vec<_> = registry
            .others(&id("orchestrator"))
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        assert_eq!(others, vec![id("a"), id("b")]);
    }
}
