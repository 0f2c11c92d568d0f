//! Structured error types surfaced to direct callers.
//!
//! # Propagation
//!
//! > **Delivery-path failures never reach the emitter.**
//!
//! - A recipient whose `handle_event` fails is contained: its health becomes
//!   `Error` and the loop continues. Nothing is returned to `emit`.
//! - Request and workflow failures are returned to the caller of
//!   `request` / `coordinate` as [`InterconnectError`].
//! - A denied `emit` or `update_state` is a logged no-op.
//!
//! Collaborator callbacks return `anyhow::Result`; their errors are reduced
//! to a message before crossing back into this enum.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::core::{ComponentId, RequestId};
use crate::workflow::StepResult;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, InterconnectError>;

/// Operation rejected by the access-control gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeniedOperation {
    Emit {
        event_type: String,
        source: ComponentId,
    },
    UpdateState {
        component_id: ComponentId,
    },
    WorkflowStep {
        component_id: ComponentId,
        action: String,
    },
}

impl fmt::Display for DeniedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeniedOperation::Emit { event_type, source } => {
                write!(f, "emit {} from {}", event_type, source)
            }
            DeniedOperation::UpdateState { component_id } => {
                write!(f, "update state of {}", component_id)
            }
            DeniedOperation::WorkflowStep {
                component_id,
                action,
            } => write!(f, "execute {} on {}", action, component_id),
        }
    }
}

/// Errors returned by the interconnect API.
#[derive(Debug, Error)]
pub enum InterconnectError {
    /// The access-control gate rejected the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(DeniedOperation),

    /// The addressed component is not registered.
    #[error("component not found: {0}")]
    ComponentNotFound(ComponentId),

    /// No matching `data-response` arrived before the deadline.
    #[error("request {request_id} to {target} timed out after {timeout:?}")]
    RequestTimeout {
        request_id: RequestId,
        target: ComponentId,
        timeout: Duration,
    },

    /// The responder answered with an error string.
    #[error("request {request_id} failed: {message}")]
    RequestFailed {
        request_id: RequestId,
        message: String,
    },

    /// A run with the same workflow id is still in flight.
    #[error("workflow {0} is already running")]
    WorkflowAlreadyRunning(String),

    /// A workflow step was denied or failed; remaining steps were skipped.
    #[error(transparent)]
    WorkflowStepFailed(Box<WorkflowFailure>),
}

impl InterconnectError {
    /// Returns true for `RequestTimeout`.
    pub fn is_timeout(&self) -> bool {
        matches!(self, InterconnectError::RequestTimeout { .. })
    }

    /// Returns true for `PermissionDenied`, including a workflow aborted by a denial.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            InterconnectError::PermissionDenied(_) => true,
            InterconnectError::WorkflowStepFailed(failure) => {
                matches!(failure.reason, StepFailureReason::PermissionDenied)
            }
            _ => false,
        }
    }

    /// The workflow failure, if this error aborted a workflow.
    pub fn workflow_failure(&self) -> Option<&WorkflowFailure> {
        match self {
            InterconnectError::WorkflowStepFailed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Why a workflow step did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepFailureReason {
    /// `can_execute_workflow_step` rejected the step.
    PermissionDenied,
    /// The step addressed an unregistered component.
    ComponentNotFound,
    /// The component has no workflow-execution capability.
    NotWorkflowCapable,
    /// The executor returned an error or panicked.
    Failed(String),
}

impl fmt::Display for StepFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepFailureReason::PermissionDenied => write!(f, "permission denied"),
            StepFailureReason::ComponentNotFound => write!(f, "component not found"),
            StepFailureReason::NotWorkflowCapable => {
                write!(f, "component cannot execute workflow steps")
            }
            StepFailureReason::Failed(message) => write!(f, "{}", message),
        }
    }
}

/// Fail-fast report of an aborted workflow.
///
/// `completed` holds the results collected before the failing step, in order.
/// Those steps are not rolled back.
#[derive(Debug, Clone, Error)]
#[error("workflow {workflow_id} failed at step {step_index} ({component_id}/{action}): {reason}")]
pub struct WorkflowFailure {
    pub workflow_id: String,
    pub step_index: usize,
    pub component_id: ComponentId,
    pub action: String,
    pub reason: StepFailureReason,
    pub completed: Vec<StepResult>,
}
