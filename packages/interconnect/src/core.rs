//! Core value types carried through the interconnect.
//!
//! # Overview
//!
//! Everything that crosses a component boundary is one of:
//! - [`Event`] = a fact emitted by a component (opaque JSON payload)
//! - [`ActorContext`] = the identity and permissions of whoever asked
//!
//! Components are addressed by [`ComponentId`]; routes and events target
//! either one component or every other registered component ([`Target::All`]).

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle event emitted after a component registers.
pub const COMPONENT_REGISTERED: &str = "component-registered";
/// Lifecycle event emitted after a component unregisters.
pub const COMPONENT_UNREGISTERED: &str = "component-unregistered";
/// Emitted after every accepted state update.
pub const STATE_CHANGED: &str = "state-changed";
/// Emitted by the request correlator.
pub const DATA_REQUEST: &str = "data-request";
/// Emitted by the responding component, carrying the original `requestId`.
pub const DATA_RESPONSE: &str = "data-response";
/// Emitted after each successful workflow step.
pub const WORKFLOW_STEP_COMPLETED: &str = "workflow-step-completed";
/// Emitted when a workflow step is denied or fails.
pub const WORKFLOW_STEP_ERROR: &str = "workflow-step-error";

/// Identifier of a registered component.
///
/// # Example
///
/// ```ignore
/// let id = ComponentId::from("pattern-library");
/// assert_eq!(id.as_str(), "pattern-library");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(String);

impl ComponentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ComponentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl PartialEq<str> for ComponentId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ComponentId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Delivery target of an event or a connection.
///
/// Serialized as the component id, or `"*"` for the wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Target {
    /// A single named component.
    Component(ComponentId),
    /// Every registered component except the emitter.
    All,
}

impl Target {
    pub const WILDCARD: &'static str = "*";

    pub fn component(id: impl Into<ComponentId>) -> Self {
        Target::Component(id.into())
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Target::All)
    }

    /// The named component, if this is not the wildcard.
    pub fn component_id(&self) -> Option<&ComponentId> {
        match self {
            Target::Component(id) => Some(id),
            Target::All => None,
        }
    }
}

impl From<String> for Target {
    fn from(raw: String) -> Self {
        if raw == Target::WILDCARD {
            Target::All
        } else {
            Target::Component(ComponentId(raw))
        }
    }
}

impl From<Target> for String {
    fn from(target: Target) -> String {
        match target {
            Target::Component(id) => id.0,
            Target::All => Target::WILDCARD.to_string(),
        }
    }
}

impl From<ComponentId> for Target {
    fn from(id: ComponentId) -> Self {
        Target::Component(id)
    }
}

impl From<&str> for Target {
    fn from(raw: &str) -> Self {
        Target::from(raw.to_string())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Component(id) => write!(f, "{}", id),
            Target::All => f.write_str(Target::WILDCARD),
        }
    }
}

/// Identity and permissions of the caller, consulted by the access gate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorContext {
    pub actor_id: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl ActorContext {
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// A fact emitted by a component.
///
/// Events are immutable once built. The router hands each recipient a clone
/// whose `target` names that recipient.
///
/// # Example
///
/// ```ignore
/// let event = Event::new("selection-changed", "design-surface")
///     .to("pattern-library")
///     .with_payload(json!({ "nodeId": 7 }));
/// hub.emit(event);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: ComponentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<ActorContext>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<ComponentId>) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            target: None,
            payload: Value::Null,
            timestamp: Utc::now(),
            actor: None,
        }
    }

    pub fn to(mut self, target: impl Into<Target>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_actor(mut self, actor: ActorContext) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_actor_opt(mut self, actor: Option<ActorContext>) -> Self {
        self.actor = actor;
        self
    }

    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }

    /// Clone of this event addressed to a single recipient.
    pub(crate) fn retargeted(&self, recipient: &ComponentId) -> Self {
        let mut event = self.clone();
        event.target = Some(Target::Component(recipient.clone()));
        event
    }
}

/// Identifier correlating a `data-request` with its `data-response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse the `requestId` field of a request or response payload.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        payload
            .get("requestId")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .map(Self)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message carried by a caught panic payload.
pub(crate) fn panic_message(panic_info: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
