//! # Interconnect
//!
//! An in-process message bus that lets independently built UI modules
//! exchange events, share state, request data from one another and run
//! multi-step workflows, all behind an access-control gate.
//!
//! ## Core Concepts
//!
//! Modules never call each other directly:
//! - [`Event`] = a fact emitted by a module, routed through declared [`Connection`]s
//! - [`ComponentHandle`] = what a module hands over at registration: initial
//!   state plus optional [`EventHandler`] / [`WorkflowExecutor`] capabilities
//!
//! ## Architecture
//!
//! ```text
//! Module A                                         Module B
//!   │ emit()                                          ▲ handle_event()
//!   ▼                                                 │
//! EventRouter ──► AccessGate ──► ConnectionTable ─────┘
//!   │                                 (A → B | A → *)
//!   ├─► Subscriptions (broadcast)
//!   └─► RequestCorrelator ◄── data-response
//!
//! WorkflowCoordinator ──► AccessGate ──► WorkflowExecutor (direct call)
//! StateStore (watch per module) ──► StateSubscription
//! MetricsTracker ◄── every emission, denial, failed delivery
//! ```
//!
//! ## Guarantees
//!
//! - **Deterministic order**: one emission is delivered in connection-table
//!   order, wildcard recipients in registration order
//! - **Contained failures**: a failing recipient is marked `Error` and skipped,
//!   the emitter never sees it
//! - **Opt-in enforcement**: without a policy or without an actor, every
//!   check passes
//! - **Exactly one outcome per request**: response or timeout, never both
//! - **Fail-fast workflows**: the first failing step aborts the run, with no
//!   rollback of earlier steps
//! - **In-memory only**: nothing is persisted; subscribers that lag skip events
//!
//! ## Example
//!
//! ```ignore
//! use interconnect::{ComponentHandle, Connection, Event, Interconnect, Target, WorkflowStep};
//! use serde_json::json;
//!
//! let hub = Interconnect::builder()
//!     .with_connection(Connection::new("orchestrator", Target::All, ["refresh"]))
//!     .build();
//!
//! let panel = Arc::new(QualityPanel::new(hub.clone()));
//! hub.register("orchestrator", ComponentHandle::new());
//! hub.register("quality-panel", ComponentHandle::new().with_event_handler(&panel));
//!
//! hub.emit(Event::new("refresh", "orchestrator").with_payload(json!({"scope": "all"})));
//!
//! let lineage = hub
//!     .request("quality-panel", "lineage-graph", "upstream", json!({"depth": 2}), None, None)
//!     .await?;
//!
//! hub.coordinate(
//!     "publish-dataset",
//!     vec![
//!         WorkflowStep::new("catalog", "validate"),
//!         WorkflowStep::new("catalog", "publish"),
//!     ],
//!     None,
//! )
//! .await?;
//! ```

// Core modules
mod access;
mod component;
mod config;
mod connection;
mod core;
mod error;
mod hub;
mod metrics;
mod registry;
mod request;
mod router;
mod state;
mod workflow;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export core types
pub use crate::core::{
    ActorContext, ComponentId, Event, RequestId, Target, COMPONENT_REGISTERED,
    COMPONENT_UNREGISTERED, DATA_REQUEST, DATA_RESPONSE, STATE_CHANGED, WORKFLOW_STEP_COMPLETED,
    WORKFLOW_STEP_ERROR,
};

// Re-export error types
pub use crate::error::{
    DeniedOperation, InterconnectError, Result, StepFailureReason, WorkflowFailure,
};

// Re-export facade
pub use hub::{Interconnect, InterconnectBuilder};

pub use access::{AccessGate, AccessPolicy, PermissionPolicy};
pub use component::{
    Capability, CapabilityKind, ComponentHandle, EventHandler, HealthStatus, WorkflowExecutor,
};
pub use config::InterconnectConfig;
pub use connection::{Connection, ConnectionTable};
pub use metrics::{MetricsSnapshot, RateWindow, MAX_RATE_BUCKETS};
pub use registry::Registration;
pub use request::{DataRequest, DEFAULT_REQUEST_TIMEOUT};
pub use router::Subscription;
pub use state::{StateSnapshot, StateSubscription};
pub use workflow::{StepResult, WorkflowStatus, WorkflowStep, FINISHED_RUNS_RETAINED};

// Re-export commonly used external types
pub use async_trait::async_trait;
