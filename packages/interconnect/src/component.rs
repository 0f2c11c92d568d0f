//! Collaborator capabilities and component handles.
//!
//! A UI module participates by registering a [`ComponentHandle`]. The handle
//! carries the module's initial state and, optionally, two capabilities:
//!
//! | Capability           | Invoked by            | On failure                     |
//! |----------------------|-----------------------|--------------------------------|
//! | [`EventHandler`]     | Event router          | Health → `Error`, loop goes on |
//! | [`WorkflowExecutor`] | Workflow coordinator  | Workflow aborts                |
//!
//! The capability set is resolved once, when the handle is built, into a
//! [`Capability`] variant. The core only keeps `Weak` references: the module
//! owns its implementation and a dropped implementation is treated as absent.

use std::fmt;
use std::sync::{Arc, Weak};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{ActorContext, Event};

/// Receives routed events.
///
/// Called synchronously from the emitting task. Long work should be spawned;
/// the router never awaits it.
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one delivered event. `event.target` names this component.
    ///
    /// Errors and panics mark this component's health as `Error` but do not
    /// stop delivery to other recipients.
    fn handle_event(&self, event: &Event) -> Result<()>;
}

/// Executes workflow steps addressed to this component.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync + 'static {
    async fn execute_workflow_step(
        &self,
        action: &str,
        params: Value,
        actor: Option<&ActorContext>,
    ) -> Result<Value>;
}

/// Recorded health of a registered component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Error,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Error => write!(f, "error"),
        }
    }
}

/// Which capabilities a component exposes, decided at registration.
#[derive(Clone, Default)]
pub enum Capability {
    Routable(Weak<dyn EventHandler>),
    WorkflowCapable(Weak<dyn WorkflowExecutor>),
    Both {
        handler: Weak<dyn EventHandler>,
        executor: Weak<dyn WorkflowExecutor>,
    },
    #[default]
    Neither,
}

/// Capability discriminant, for logging and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Routable,
    WorkflowCapable,
    Both,
    Neither,
}

impl Capability {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Capability::Routable(_) => CapabilityKind::Routable,
            Capability::WorkflowCapable(_) => CapabilityKind::WorkflowCapable,
            Capability::Both { .. } => CapabilityKind::Both,
            Capability::Neither => CapabilityKind::Neither,
        }
    }

    /// The event handler, if declared and still alive.
    pub fn event_handler(&self) -> Option<Arc<dyn EventHandler>> {
        match self {
            Capability::Routable(handler) | Capability::Both { handler, .. } => handler.upgrade(),
            _ => None,
        }
    }

    /// The workflow executor, if declared and still alive.
    pub fn workflow_executor(&self) -> Option<Arc<dyn WorkflowExecutor>> {
        match self {
            Capability::WorkflowCapable(executor) | Capability::Both { executor, .. } => {
                executor.upgrade()
            }
            _ => None,
        }
    }

    /// Whether the component declared the event-handling capability.
    pub fn is_routable(&self) -> bool {
        matches!(self, Capability::Routable(_) | Capability::Both { .. })
    }

    fn add_handler(self, handler: Weak<dyn EventHandler>) -> Self {
        match self {
            Capability::Neither | Capability::Routable(_) => Capability::Routable(handler),
            Capability::WorkflowCapable(executor) | Capability::Both { executor, .. } => {
                Capability::Both { handler, executor }
            }
        }
    }

    fn add_executor(self, executor: Weak<dyn WorkflowExecutor>) -> Self {
        match self {
            Capability::Neither | Capability::WorkflowCapable(_) => {
                Capability::WorkflowCapable(executor)
            }
            Capability::Routable(handler) | Capability::Both { handler, .. } => {
                Capability::Both { handler, executor }
            }
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind())
    }
}

/// Non-owning reference to a module instance, handed over at registration.
///
/// # Example
///
/// ```ignore
/// let surface = Arc::new(DesignSurface::new());
/// let handle = ComponentHandle::new()
///     .with_initial_state(json!({ "zoom": 1.0 }))
///     .with_event_handler(&surface)
///     .with_workflow_executor(&surface);
/// hub.register("design-surface", handle);
/// ```
#[derive(Clone, Debug)]
pub struct ComponentHandle {
    initial_state: Value,
    capability: Capability,
}

impl ComponentHandle {
    /// Handle with empty initial state and no capabilities.
    pub fn new() -> Self {
        Self {
            initial_state: Value::Object(Default::default()),
            capability: Capability::Neither,
        }
    }

    pub fn with_initial_state(mut self, state: Value) -> Self {
        self.initial_state = state;
        self
    }

    pub fn with_event_handler<H: EventHandler>(mut self, handler: &Arc<H>) -> Self {
        let weak = Arc::downgrade(handler);
        let weak: Weak<dyn EventHandler> = weak;
        self.capability = self.capability.add_handler(weak);
        self
    }

    pub fn with_workflow_executor<X: WorkflowExecutor>(mut self, executor: &Arc<X>) -> Self {
        let weak = Arc::downgrade(executor);
        let weak: Weak<dyn WorkflowExecutor> = weak;
        self.capability = self.capability.add_executor(weak);
        self
    }

    pub fn initial_state(&self) -> &Value {
        &self.initial_state
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }
}

impl Default for ComponentHandle {
    fn default() -> Self {
        Self::new()
    }
}
