//! Static routing table between components.
//!
//! Connections are declared once at startup, either in code or from a JSON
//! document:
//!
//! ```json
//! [
//!   {
//!     "source": "design-surface",
//!     "target": "pattern-library",
//!     "eventTypes": ["selection-changed"]
//!   },
//!   { "source": "orchestrator", "target": "*", "eventTypes": ["workflow-started"] }
//! ]
//! ```
//!
//! The table is keyed by source; each source's routes keep declaration order.
//! `bidirectional` is informational only. Use [`Connection::mirrored`] to
//! declare the reverse route explicitly.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{ComponentId, Target};

/// A declarative routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub source: ComponentId,
    pub target: Target,
    pub event_types: BTreeSet<String>,
    #[serde(default)]
    pub bidirectional: bool,
    /// Re-check the access gate for every recipient of this route.
    #[serde(default)]
    pub rbac_required: bool,
}

impl Connection {
    pub fn new<I, S>(
        source: impl Into<ComponentId>,
        target: impl Into<Target>,
        event_types: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source: source.into(),
            target: target.into(),
            event_types: event_types.into_iter().map(Into::into).collect(),
            bidirectional: false,
            rbac_required: false,
        }
    }

    pub fn bidirectional(mut self) -> Self {
        self.bidirectional = true;
        self
    }

    pub fn rbac_required(mut self) -> Self {
        self.rbac_required = true;
        self
    }

    pub fn carries(&self, event_type: &str) -> bool {
        self.event_types.contains(event_type)
    }

    /// The reverse route, or `None` when the target is the wildcard.
    pub fn mirrored(&self) -> Option<Self> {
        let target = self.target.component_id()?;
        Some(Self {
            source: target.clone(),
            target: Target::Component(self.source.clone()),
            event_types: self.event_types.clone(),
            bidirectional: self.bidirectional,
            rbac_required: self.rbac_required,
        })
    }
}

/// Source-keyed connection table.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    routes: RwLock<HashMap<ComponentId, Vec<Connection>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from a JSON array of connections.
    pub fn from_json(raw: &str) -> Result<Self> {
        let connections: Vec<Connection> =
            serde_json::from_str(raw).context("invalid connection table")?;
        let table = Self::new();
        for connection in connections {
            table.add(connection);
        }
        Ok(table)
    }

    pub fn add(&self, connection: Connection) {
        let mut routes = self
            .routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        routes
            .entry(connection.source.clone())
            .or_default()
            .push(connection);
    }

    /// Outgoing routes of `source`, in declaration order.
    pub fn routes_for(&self, source: &ComponentId) -> Vec<Connection> {
        self.routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(source)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of declared connections.
    pub fn len(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_keep_declaration_order() {
        let table = ConnectionTable::new();
        table.add(Connection::new("a", "b", ["ping"]));
        table.add(Connection::new("x", "a", ["ping"]));
        table.add(Connection::new("a", Target::All, ["ping", "pong"]));

        let routes = table.routes_for(&ComponentId::from("a"));
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].target, Target::component("b"));
        assert_eq!(routes[1].target, Target::All);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_unknown_source_has_no_routes() {
        let table = ConnectionTable::new();
        assert!(table.routes_for(&ComponentId::from("nobody")).is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_from_json() {
        let table = ConnectionTable::from_json(
            r#"[
                {"source": "design-surface", "target": "pattern-library",
                 "eventTypes": ["selection-changed"], "bidirectional": true},
                {"source": "orchestrator", "target": "*",
                 "eventTypes": ["workflow-started"], "rbacRequired": true}
            ]"#,
        )
        .unwrap();

        let orchestrator = table.routes_for(&ComponentId::from("orchestrator"));
        assert_eq!(orchestrator[0].target, Target::All);
        assert!(orchestrator[0].rbac_required);

        let surface = table.routes_for(&ComponentId::from("design-surface"));
        assert!(surface[0].bidirectional);
        assert!(surface[0].carries("selection-changed"));
        // No reverse route is generated
        assert!(table
            .routes_for(&ComponentId::from("pattern-library"))
            .is_empty());
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let err = ConnectionTable::from_json("{").unwrap_err();
        assert!(err.to_string().contains("invalid connection table"));
    }

    #[test]
    fn test_mirrored() {
        let forward = Connection::new("a", "b", ["sync"]).bidirectional();
        let reverse = forward.mirrored().unwrap();

        assert_eq!(reverse.source, "b");
        assert_eq!(reverse.target, Target::component("a"));
        assert!(reverse.carries("sync"));

        assert!(Connection::new("a", Target::All, ["sync"]).mirrored().is_none());
    }
}
