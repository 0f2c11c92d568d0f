//! The interconnect facade.
//!
//! [`Interconnect`] wires the registry, connection table, state store,
//! router, request correlator, workflow coordinator and metrics together and
//! exposes them as one API. It is a cheap handle: clone it into every
//! component that needs to emit or request.
//!
//! ```text
//! register ──► Registry + StateStore + Metrics ──► component-registered
//! emit ──────► EventRouter
//! update_state ──► AccessGate ──► StateStore ──► state-changed
//! request ───► RequestCorrelator ──► data-request ... data-response
//! coordinate ► WorkflowCoordinator ──► WorkflowExecutor (direct)
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::access::{AccessGate, AccessPolicy};
use crate::component::{ComponentHandle, HealthStatus};
use crate::config::InterconnectConfig;
use crate::connection::{Connection, ConnectionTable};
use crate::core::{
    ActorContext, ComponentId, Event, COMPONENT_REGISTERED, COMPONENT_UNREGISTERED, STATE_CHANGED,
};
use crate::error::{DeniedOperation, InterconnectError, Result};
use crate::metrics::{MetricsSnapshot, MetricsTracker};
use crate::registry::{ComponentRegistry, Registration};
use crate::request::{DataRequest, RequestCorrelator};
use crate::router::{EmitOutcome, EventRouter, Subscription};
use crate::state::{StateSnapshot, StateStore, StateSubscription};
use crate::workflow::{StepResult, WorkflowCoordinator, WorkflowStatus, WorkflowStep};

struct Inner {
    config: InterconnectConfig,
    registry: Arc<ComponentRegistry>,
    connections: Arc<ConnectionTable>,
    metrics: Arc<MetricsTracker>,
    correlator: Arc<RequestCorrelator>,
    state: StateStore,
    workflows: WorkflowCoordinator,
    router: EventRouter,
}

/// Shared handle to one interconnect instance.
///
/// # Example
///
/// ```ignore
/// let hub = Interconnect::builder()
///     .with_access_policy(PermissionPolicy::new().grant_role("editor", ["emit:*"]))
///     .with_connection(Connection::new("orchestrator", Target::All, ["refresh"]))
///     .build();
///
/// hub.register("orchestrator", ComponentHandle::new());
/// hub.register("panel", ComponentHandle::new().with_event_handler(&panel));
/// hub.emit(Event::new("refresh", "orchestrator"));
/// ```
#[derive(Clone)]
pub struct Interconnect {
    inner: Arc<Inner>,
}

impl Interconnect {
    /// Interconnect with default config, no policy and no connections.
    pub fn new() -> Self {
        InterconnectBuilder::new().build()
    }

    pub fn builder() -> InterconnectBuilder {
        InterconnectBuilder::new()
    }

    pub fn config(&self) -> &InterconnectConfig {
        &self.inner.config
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Register a component (or replace a registered one).
    ///
    /// Replacing resets the state subject and health. Subscribers of the old
    /// state subject see their stream end.
    pub fn register(&self, id: impl Into<ComponentId>, handle: ComponentHandle) -> Registration {
        let id = id.into();
        let initial_state = handle.initial_state().clone();
        let capability = handle.capability().kind();

        let registration = self.inner.registry.insert(id.clone(), handle);
        self.inner.state.create(&id, initial_state);
        match registration {
            Registration::New => self.inner.metrics.component_added(&id),
            Registration::Replaced => {
                warn!(component = %id, "component re-registered, state reset");
                self.inner.metrics.component_replaced(&id);
            }
        }
        info!(component = %id, ?capability, "component registered");

        self.inner.router.emit(
            Event::new(COMPONENT_REGISTERED, id.clone()).with_payload(json!({ "componentId": id })),
        );
        registration
    }

    /// Unregister a component. Returns false if it was not registered.
    pub fn unregister(&self, id: &ComponentId) -> bool {
        let Some(removed) = self.inner.registry.remove(id) else {
            debug!(component = %id, "unregister of unknown component ignored");
            return false;
        };
        self.inner.state.remove(id);
        self.inner.metrics.component_removed(id);
        let registered_for = Utc::now() - removed.registered_at;
        info!(
            component = %id,
            registered_for_ms = registered_for.num_milliseconds(),
            "component unregistered"
        );

        self.inner.router.emit(
            Event::new(COMPONENT_UNREGISTERED, id.clone())
                .with_payload(json!({ "componentId": id })),
        );
        true
    }

    pub fn lookup(&self, id: &ComponentId) -> Option<ComponentHandle> {
        self.inner.registry.lookup(id)
    }

    /// Registered ids in registration order.
    pub fn components(&self) -> Vec<ComponentId> {
        self.inner.registry.ids()
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Fire-and-forget emission. Denials and delivery failures are logged and
    /// counted, never returned.
    pub fn emit(&self, event: Event) {
        let event_type = event.event_type.clone();
        let source = event.source.clone();
        if let EmitOutcome::Routed {
            subscribers: 0,
            delivered: 0,
            failed: 0,
        } = self.inner.router.emit(event)
        {
            debug!(event_type = %event_type, source = %source, "event had no recipients");
        }
    }

    /// Events from `source` whose type is in `event_types` (empty = any).
    pub fn subscribe<I, S>(&self, source: impl Into<ComponentId>, event_types: I) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.router.subscribe(source.into(), event_types)
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.inner.router.subscribe_all()
    }

    pub fn add_connection(&self, connection: Connection) {
        debug!(
            source = %connection.source,
            target = %connection.target,
            event_types = ?connection.event_types,
            "connection added"
        );
        self.inner.connections.add(connection);
    }

    pub fn routes_for(&self, source: &ComponentId) -> Vec<Connection> {
        self.inner.connections.routes_for(source)
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Replace the state of `component_id` and emit `state-changed`.
    ///
    /// A denied update is a logged no-op returning `Ok(())`.
    pub fn update_state(
        &self,
        component_id: &ComponentId,
        value: Value,
        actor: Option<&ActorContext>,
    ) -> Result<()> {
        if !self.inner.router.gate().can_update_state(actor, component_id) {
            self.inner.metrics.record_denial();
            return Ok(());
        }

        let change = self
            .inner
            .state
            .replace(component_id, value)
            .ok_or_else(|| InterconnectError::ComponentNotFound(component_id.clone()))?;
        debug!(
            component = %component_id,
            version = change.current.version,
            changed = change.changed,
            "state updated"
        );

        self.inner.router.emit(
            Event::new(STATE_CHANGED, component_id.clone()).with_payload(json!({
                "componentId": component_id,
                "newState": change.current.value,
                "previousState": change.previous,
            })),
        );
        Ok(())
    }

    /// Like `update_state`, but a denial is returned as `PermissionDenied`.
    pub fn try_update_state(
        &self,
        component_id: &ComponentId,
        value: Value,
        actor: Option<&ActorContext>,
    ) -> Result<()> {
        if !self.inner.router.gate().can_update_state(actor, component_id) {
            self.inner.metrics.record_denial();
            return Err(InterconnectError::PermissionDenied(
                DeniedOperation::UpdateState {
                    component_id: component_id.clone(),
                },
            ));
        }
        self.update_state(component_id, value, None)
    }

    pub fn get_state(&self, component_id: &ComponentId) -> Option<Value> {
        self.inner.state.get(component_id)
    }

    pub fn state_snapshot(&self, component_id: &ComponentId) -> Option<StateSnapshot> {
        self.inner.state.snapshot(component_id)
    }

    /// Distinct future values of `component_id`. `None` if not registered.
    pub fn subscribe_state(&self, component_id: &ComponentId) -> Option<StateSubscription> {
        self.inner.state.subscribe(component_id)
    }

    // =========================================================================
    // Request / response
    // =========================================================================

    /// Ask `target` for data and await its `data-response`.
    ///
    /// `timeout` defaults to the configured request timeout.
    pub async fn request(
        &self,
        source: impl Into<ComponentId>,
        target: impl Into<ComponentId>,
        data_type: &str,
        params: Value,
        actor: Option<ActorContext>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let timeout = timeout.unwrap_or(self.inner.config.request_timeout);
        self.inner
            .correlator
            .request(
                &self.inner.router,
                source.into(),
                target.into(),
                data_type,
                params,
                actor,
                timeout,
            )
            .await
    }

    /// Answer `request` on behalf of `responder`.
    pub fn respond(
        &self,
        responder: impl Into<ComponentId>,
        request: &DataRequest,
        outcome: std::result::Result<Value, String>,
    ) {
        let event = match outcome {
            Ok(data) => request.respond_ok(responder, data),
            Err(message) => request.respond_err(responder, message),
        };
        self.inner.router.emit(event);
    }

    // =========================================================================
    // Workflows
    // =========================================================================

    /// Run `steps` in order, stopping at the first failure.
    pub async fn coordinate(
        &self,
        workflow_id: &str,
        steps: Vec<WorkflowStep>,
        actor: Option<ActorContext>,
    ) -> Result<Vec<StepResult>> {
        self.inner
            .workflows
            .coordinate(&self.inner.router, workflow_id, steps, actor)
            .await
    }

    /// `Running` while executing, then `Completed` or `Failed` for recent runs.
    pub fn workflow_status(&self, workflow_id: &str) -> WorkflowStatus {
        self.inner.workflows.status(workflow_id)
    }

    // =========================================================================
    // Metrics & health
    // =========================================================================

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot(
            self.inner.connections.len(),
            self.inner.correlator.pending_count(),
            self.inner.workflows.active_count(),
        )
    }

    pub fn health_of(&self, id: &ComponentId) -> Option<HealthStatus> {
        self.inner.metrics.health_of(id)
    }

    pub fn health_all(&self) -> BTreeMap<ComponentId, HealthStatus> {
        self.inner.metrics.health_all()
    }

    /// Self-reported health, e.g. `Degraded` while a backing query is slow.
    pub fn report_health(&self, id: &ComponentId, status: HealthStatus) -> Result<()> {
        let previous = self.inner.metrics.health_of(id);
        if !self.inner.metrics.set_health(id, status) {
            return Err(InterconnectError::ComponentNotFound(id.clone()));
        }
        if previous != Some(status) {
            info!(component = %id, %status, "health reported");
        }
        Ok(())
    }
}

impl Default for Interconnect {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Interconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interconnect")
            .field("components", &self.inner.registry.len())
            .field("connections", &self.inner.connections.len())
            .field("router", &self.inner.router)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Interconnect`]. The access policy can only be set here.
#[derive(Default)]
pub struct InterconnectBuilder {
    config: InterconnectConfig,
    policy: Option<Arc<dyn AccessPolicy>>,
    connections: ConnectionTable,
}

impl InterconnectBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: InterconnectConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_access_policy(mut self, policy: impl AccessPolicy) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    pub fn with_shared_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Start from a pre-declared table, e.g. [`ConnectionTable::from_json`].
    pub fn with_connections(mut self, connections: ConnectionTable) -> Self {
        self.connections = connections;
        self
    }

    pub fn with_connection(self, connection: Connection) -> Self {
        self.connections.add(connection);
        self
    }

    pub fn build(self) -> Interconnect {
        let gate = match self.policy {
            Some(policy) => AccessGate::with_policy(policy),
            None => AccessGate::permissive(),
        };
        let registry = Arc::new(ComponentRegistry::new());
        let connections = Arc::new(self.connections);
        let metrics = Arc::new(MetricsTracker::new(
            self.config.rate_window,
            self.config.rate_buckets,
        ));
        let correlator = Arc::new(RequestCorrelator::new());
        let router = EventRouter::new(
            registry.clone(),
            connections.clone(),
            gate,
            metrics.clone(),
            correlator.clone(),
            self.config.event_buffer,
        );

        debug!(
            enforcing = router.gate().is_enforcing(),
            connections = connections.len(),
            "interconnect built"
        );

        Interconnect {
            inner: Arc::new(Inner {
                config: self.config,
                registry,
                connections,
                metrics,
                correlator,
                state: StateStore::new(),
                workflows: WorkflowCoordinator::new(),
                router,
            }),
        }
    }
}
