//! Fail-fast multi-step workflows.
//!
//! A workflow is an ordered list of [`WorkflowStep`]s, each addressed to one
//! component's [`WorkflowExecutor`]. Executors are invoked directly, not
//! through the router.
//!
//! ```text
//! Idle ──► Running(0) ──► Running(1) ──► ... ──► Completed
//!              │              │
//!              └──────────────┴──► Failed(step_index)
//! ```
//!
//! Per step:
//! 1. `can_execute_workflow_step(actor, component, action)`
//! 2. resolve the component and its executor
//! 3. run the executor (or spawn it, for detached steps)
//! 4. emit `workflow-step-completed`, or `workflow-step-error` and abort
//!
//! # Guarantees
//!
//! - **Strict order**: step N+1 starts only after step N returned
//! - **Fail fast**: the first failure skips every remaining step
//! - **No rollback**: completed steps stay completed; compensation is the
//!   caller's job
//! - **One run per id**: a second concurrent run with the same id is rejected
//! - **Cancel by drop**: dropping the `coordinate` future stops the run
//!   between steps and releases its status entry
//! - **Bounded history**: the terminal status of recent runs stays queryable

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::component::WorkflowExecutor;
use crate::core::{
    panic_message, ActorContext, ComponentId, Event, WORKFLOW_STEP_COMPLETED, WORKFLOW_STEP_ERROR,
};
use crate::error::{InterconnectError, Result, StepFailureReason, WorkflowFailure};
use crate::router::EventRouter;

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub component_id: ComponentId,
    pub action: String,
    #[serde(default)]
    pub params: Value,
    /// When false the step is spawned and the workflow moves on immediately.
    #[serde(default = "default_wait")]
    pub wait_for_completion: bool,
}

fn default_wait() -> bool {
    true
}

impl WorkflowStep {
    pub fn new(component_id: impl Into<ComponentId>, action: impl Into<String>) -> Self {
        Self {
            component_id: component_id.into(),
            action: action.into(),
            params: Value::Null,
            wait_for_completion: true,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Spawn the step on the current tokio runtime instead of awaiting it.
    ///
    /// Outside a tokio runtime the step fails.
    pub fn detached(mut self) -> Self {
        self.wait_for_completion = false;
        self
    }
}

/// Result of one completed step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_index: usize,
    pub component_id: ComponentId,
    pub action: String,
    /// `None` for detached steps.
    pub output: Option<Value>,
}

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum WorkflowStatus {
    Idle,
    Running { step_index: usize },
    Completed,
    Failed { step_index: usize },
}

/// Number of finished runs whose terminal status is remembered.
pub const FINISHED_RUNS_RETAINED: usize = 64;

/// Status entry of an in-flight run.
///
/// Dropping it while still `Running` (cancel) releases the workflow id. A
/// finished run keeps its terminal status until it is evicted or re-run.
struct RunGuard<'a> {
    coordinator: &'a WorkflowCoordinator,
    workflow_id: String,
    status: WorkflowStatus,
}

impl RunGuard<'_> {
    fn transition(&mut self, status: WorkflowStatus) {
        self.status = status;
        if let Some(mut entry) = self.coordinator.runs.get_mut(&self.workflow_id) {
            *entry = status;
        }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let WorkflowStatus::Running { step_index } = self.status {
            warn!(workflow_id = %self.workflow_id, step_index, "workflow cancelled");
            self.coordinator.runs.remove(&self.workflow_id);
            return;
        }
        self.coordinator.retain_finished(&self.workflow_id);
    }
}

/// Tracks runs and drives their steps.
#[derive(Debug, Default)]
pub struct WorkflowCoordinator {
    runs: DashMap<String, WorkflowStatus>,
    /// Finished run ids, oldest first.
    finished: Mutex<VecDeque<String>>,
}

impl WorkflowCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status of `workflow_id`.
    ///
    /// `Completed` and `Failed` are reported for the last
    /// [`FINISHED_RUNS_RETAINED`] finished runs. Unknown, evicted and
    /// cancelled runs are `Idle`.
    pub fn status(&self, workflow_id: &str) -> WorkflowStatus {
        self.runs
            .get(workflow_id)
            .map(|entry| *entry)
            .unwrap_or(WorkflowStatus::Idle)
    }

    /// Number of runs currently executing.
    pub fn active_count(&self) -> usize {
        self.runs
            .iter()
            .filter(|entry| matches!(*entry.value(), WorkflowStatus::Running { .. }))
            .count()
    }

    fn begin(&self, workflow_id: &str) -> Result<RunGuard<'_>> {
        let initial = WorkflowStatus::Running { step_index: 0 };
        match self.runs.entry(workflow_id.to_string()) {
            Entry::Occupied(occupied)
                if matches!(*occupied.get(), WorkflowStatus::Running { .. }) =>
            {
                Err(InterconnectError::WorkflowAlreadyRunning(workflow_id.to_string()))
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(initial);
                Ok(self.guard(workflow_id, initial))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(initial);
                Ok(self.guard(workflow_id, initial))
            }
        }
    }

    fn guard(&self, workflow_id: &str, status: WorkflowStatus) -> RunGuard<'_> {
        RunGuard {
            coordinator: self,
            workflow_id: workflow_id.to_string(),
            status,
        }
    }

    fn retain_finished(&self, workflow_id: &str) {
        let mut finished = self
            .finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        finished.retain(|id| id != workflow_id);
        finished.push_back(workflow_id.to_string());

        while finished.len() > FINISHED_RUNS_RETAINED {
            if let Some(evicted) = finished.pop_front() {
                // A re-run of the evicted id may already be executing
                self.runs.remove_if(&evicted, |_, status| {
                    !matches!(status, WorkflowStatus::Running { .. })
                });
            }
        }
    }

    /// Run `steps` in order, failing fast.
    ///
    /// Returns one [`StepResult`] per step on success. On failure returns
    /// `WorkflowStepFailed` carrying the results collected so far.
    pub async fn coordinate(
        &self,
        router: &EventRouter,
        workflow_id: &str,
        steps: Vec<WorkflowStep>,
        actor: Option<ActorContext>,
    ) -> Result<Vec<StepResult>> {
        let mut run = self.begin(workflow_id)?;
        info!(workflow_id, steps = steps.len(), "workflow started");

        let mut completed = Vec::with_capacity(steps.len());
        for (step_index, step) in steps.into_iter().enumerate() {
            run.transition(WorkflowStatus::Running { step_index });
            debug!(
                workflow_id,
                step_index,
                component = %step.component_id,
                action = %step.action,
                "workflow step"
            );

            match self
                .run_step(router, workflow_id, step_index, &step, actor.as_ref())
                .await
            {
                Ok(output) => {
                    emit_step_completed(router, workflow_id, step_index, &step, output.as_ref());
                    completed.push(StepResult {
                        step_index,
                        component_id: step.component_id,
                        action: step.action,
                        output,
                    });
                }
                Err(reason) => {
                    run.transition(WorkflowStatus::Failed { step_index });
                    error!(
                        workflow_id,
                        step_index,
                        component = %step.component_id,
                        action = %step.action,
                        error = %reason,
                        "workflow step failed"
                    );
                    emit_step_error(router, workflow_id, step_index, &step, &reason);
                    return Err(InterconnectError::WorkflowStepFailed(Box::new(
                        WorkflowFailure {
                            workflow_id: workflow_id.to_string(),
                            step_index,
                            component_id: step.component_id,
                            action: step.action,
                            reason,
                            completed,
                        },
                    )));
                }
            }
        }

        run.transition(WorkflowStatus::Completed);
        info!(workflow_id, steps = completed.len(), "workflow completed");
        Ok(completed)
    }

    /// `Ok(None)` for a detached step that was spawned.
    async fn run_step(
        &self,
        router: &EventRouter,
        workflow_id: &str,
        step_index: usize,
        step: &WorkflowStep,
        actor: Option<&ActorContext>,
    ) -> std::result::Result<Option<Value>, StepFailureReason> {
        if !router
            .gate()
            .can_execute_workflow_step(actor, &step.component_id, &step.action)
        {
            return Err(StepFailureReason::PermissionDenied);
        }

        let capability = router
            .registry()
            .capability_of(&step.component_id)
            .ok_or(StepFailureReason::ComponentNotFound)?;
        let executor = capability
            .workflow_executor()
            .ok_or(StepFailureReason::NotWorkflowCapable)?;

        if !step.wait_for_completion {
            let runtime = Handle::try_current().map_err(|_| {
                StepFailureReason::Failed("detached steps need a tokio runtime".to_string())
            })?;
            spawn_detached(
                &runtime,
                router.clone(),
                executor,
                workflow_id.to_string(),
                step_index,
                step.clone(),
                actor.cloned(),
            );
            return Ok(None);
        }

        execute(executor.as_ref(), &step.action, step.params.clone(), actor)
            .await
            .map(Some)
            .map_err(StepFailureReason::Failed)
    }
}

/// Run one executor call, turning errors and panics into a message.
async fn execute(
    executor: &dyn WorkflowExecutor,
    action: &str,
    params: Value,
    actor: Option<&ActorContext>,
) -> std::result::Result<Value, String> {
    // AssertUnwindSafe is required because the executor is not UnwindSafe
    let result = AssertUnwindSafe(executor.execute_workflow_step(action, params, actor))
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(err.to_string()),
        Err(panic_info) => Err(format!("executor panicked: {}", panic_message(&*panic_info))),
    }
}

fn spawn_detached(
    runtime: &Handle,
    router: EventRouter,
    executor: Arc<dyn WorkflowExecutor>,
    workflow_id: String,
    step_index: usize,
    step: WorkflowStep,
    actor: Option<ActorContext>,
) {
    runtime.spawn(async move {
        let result = execute(
            executor.as_ref(),
            &step.action,
            step.params.clone(),
            actor.as_ref(),
        )
        .await;

        match result {
            Ok(_) => debug!(
                workflow_id = %workflow_id,
                step_index,
                component = %step.component_id,
                "detached workflow step finished"
            ),
            Err(message) => {
                let reason = StepFailureReason::Failed(message);
                error!(
                    workflow_id = %workflow_id,
                    step_index,
                    component = %step.component_id,
                    action = %step.action,
                    error = %reason,
                    "detached workflow step failed"
                );
                emit_step_error(&router, &workflow_id, step_index, &step, &reason);
            }
        }
    });
}

fn emit_step_completed(
    router: &EventRouter,
    workflow_id: &str,
    step_index: usize,
    step: &WorkflowStep,
    output: Option<&Value>,
) {
    let event = Event::new(WORKFLOW_STEP_COMPLETED, step.component_id.clone()).with_payload(json!({
        "workflowId": workflow_id,
        "stepIndex": step_index,
        "componentId": step.component_id,
        "action": step.action,
        "result": output,
        "detached": !step.wait_for_completion,
    }));
    router.emit(event);
}

fn emit_step_error(
    router: &EventRouter,
    workflow_id: &str,
    step_index: usize,
    step: &WorkflowStep,
    reason: &StepFailureReason,
) {
    let event = Event::new(WORKFLOW_STEP_ERROR, step.component_id.clone()).with_payload(json!({
        "workflowId": workflow_id,
        "stepIndex": step_index,
        "componentId": step.component_id,
        "action": step.action,
        "error": reason.to_string(),
    }));
    router.emit(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessGate, PermissionPolicy};
    use crate::component::ComponentHandle;
    use crate::connection::ConnectionTable;
    use crate::metrics::MetricsTracker;
    use crate::registry::ComponentRegistry;
    use crate::request::RequestCorrelator;
    use crate::testing::{RecordingHandler, ScriptedExecutor};
    use std::time::Duration;

    fn router(gate: AccessGate) -> (EventRouter, Arc<ComponentRegistry>) {
        let registry = Arc::new(ComponentRegistry::new());
        let router = EventRouter::new(
            registry.clone(),
            Arc::new(ConnectionTable::new()),
            gate,
            Arc::new(MetricsTracker::new(Duration::from_secs(1), 10)),
            Arc::new(RequestCorrelator::new()),
            64,
        );
        (router, registry)
    }

    fn add(registry: &ComponentRegistry, id: &str, executor: &Arc<ScriptedExecutor>) {
        registry.insert(
            ComponentId::from(id),
            ComponentHandle::new().with_workflow_executor(executor),
        );
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let (router, registry) = router(AccessGate::permissive());
        let a = Arc::new(ScriptedExecutor::new().with_result("extract", json!({"rows": 10})));
        let b = Arc::new(ScriptedExecutor::new().with_result("load", json!("ok")));
        add(&registry, "a", &a);
        add(&registry, "b", &b);
        let mut events = router.subscribe_all();

        let results = WorkflowCoordinator::new()
            .coordinate(
                &router,
                "etl",
                vec![
                    WorkflowStep::new("a", "extract").with_params(json!({"table": "t"})),
                    WorkflowStep::new("b", "load"),
                ],
                None,
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].output, Some(json!({"rows": 10})));
        assert_eq!(results[1].step_index, 1);
        assert_eq!(a.calls(), vec![("extract".to_string(), json!({"table": "t"}))]);

        let first = events.try_recv().unwrap();
        assert!(first.is(WORKFLOW_STEP_COMPLETED));
        assert_eq!(first.source, "a");
        assert_eq!(first.payload["workflowId"], "etl");
        assert_eq!(events.try_recv().unwrap().payload["stepIndex"], 1);
    }

    #[tokio::test]
    async fn test_failure_skips_remaining_steps() {
        let (router, registry) = router(AccessGate::permissive());
        let a = Arc::new(ScriptedExecutor::new());
        let b = Arc::new(ScriptedExecutor::new().with_failure("publish", "quota exceeded"));
        let c = Arc::new(ScriptedExecutor::new());
        add(&registry, "a", &a);
        add(&registry, "b", &b);
        add(&registry, "c", &c);
        let mut errors = router.subscribe(ComponentId::from("b"), [WORKFLOW_STEP_ERROR]);

        let err = WorkflowCoordinator::new()
            .coordinate(
                &router,
                "wf",
                vec![
                    WorkflowStep::new("a", "prepare"),
                    WorkflowStep::new("b", "publish"),
                    WorkflowStep::new("c", "notify"),
                ],
                None,
            )
            .await
            .unwrap_err();

        let failure = err.workflow_failure().unwrap();
        assert_eq!(failure.step_index, 1);
        assert_eq!(failure.completed.len(), 1);
        assert_eq!(failure.reason, StepFailureReason::Failed("quota exceeded".into()));
        assert_eq!(c.call_count(), 0);
        assert_eq!(errors.try_recv().unwrap().payload["error"], "quota exceeded");
    }

    #[tokio::test]
    async fn test_denied_step_aborts() {
        let policy = PermissionPolicy::new().grant_role("viewer", ["workflow:a:*"]);
        let (router, registry) = router(AccessGate::with_policy(Arc::new(policy)));
        let a = Arc::new(ScriptedExecutor::new());
        let b = Arc::new(ScriptedExecutor::new());
        add(&registry, "a", &a);
        add(&registry, "b", &b);

        let err = WorkflowCoordinator::new()
            .coordinate(
                &router,
                "wf",
                vec![WorkflowStep::new("a", "read"), WorkflowStep::new("b", "purge")],
                Some(ActorContext::new("eve").with_role("viewer")),
            )
            .await
            .unwrap_err();

        assert!(err.is_permission_denied());
        assert_eq!(a.call_count(), 1);
        assert_eq!(b.call_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_component_or_capability() {
        let (router, registry) = router(AccessGate::permissive());
        let handler = Arc::new(RecordingHandler::new());
        registry.insert(
            ComponentId::from("viewer"),
            ComponentHandle::new().with_event_handler(&handler),
        );
        let coordinator = WorkflowCoordinator::new();

        let err = coordinator
            .coordinate(&router, "wf", vec![WorkflowStep::new("ghost", "run")], None)
            .await
            .unwrap_err();
        assert_eq!(
            err.workflow_failure().unwrap().reason,
            StepFailureReason::ComponentNotFound
        );

        let err = coordinator
            .coordinate(&router, "wf", vec![WorkflowStep::new("viewer", "run")], None)
            .await
            .unwrap_err();
        assert_eq!(
            err.workflow_failure().unwrap().reason,
            StepFailureReason::NotWorkflowCapable
        );
    }

    #[tokio::test]
    async fn test_panicking_executor_fails_step() {
        let (router, registry) = router(AccessGate::permissive());
        let a = Arc::new(ScriptedExecutor::new().with_panic("explode"));
        add(&registry, "a", &a);

        let err = WorkflowCoordinator::new()
            .coordinate(&router, "wf", vec![WorkflowStep::new("a", "explode")], None)
            .await
            .unwrap_err();

        match &err.workflow_failure().unwrap().reason {
            StepFailureReason::Failed(message) => assert!(message.contains("panicked")),
            other => panic!("unexpected reason: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_run_with_same_id_is_rejected() {
        let (router, registry) = router(AccessGate::permissive());
        let slow = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(100)));
        add(&registry, "slow", &slow);
        let coordinator = WorkflowCoordinator::new();

        let first = coordinator.coordinate(
            &router,
            "nightly",
            vec![WorkflowStep::new("slow", "run")],
            None,
        );
        let second = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(
                coordinator.status("nightly"),
                WorkflowStatus::Running { step_index: 0 }
            );
            coordinator
                .coordinate(&router, "nightly", vec![WorkflowStep::new("slow", "run")], None)
                .await
        };

        let (first, second) = tokio::join!(first, second);
        assert!(first.is_ok());
        assert!(matches!(
            second,
            Err(InterconnectError::WorkflowAlreadyRunning(id)) if id == "nightly"
        ));
        assert_eq!(coordinator.status("nightly"), WorkflowStatus::Completed);
        assert_eq!(coordinator.active_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_run_releases_id() {
        let (router, registry) = router(AccessGate::permissive());
        let slow = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_secs(5)));
        add(&registry, "slow", &slow);
        let coordinator = WorkflowCoordinator::new();

        let run =
            coordinator.coordinate(&router, "wf", vec![WorkflowStep::new("slow", "run")], None);
        let timed_out = tokio::time::timeout(Duration::from_millis(20), run).await;

        assert!(timed_out.is_err());
        assert_eq!(coordinator.active_count(), 0);
        assert_eq!(coordinator.status("wf"), WorkflowStatus::Idle);
    }

    #[tokio::test]
    async fn test_finished_runs_report_terminal_status() {
        let (router, registry) = router(AccessGate::permissive());
        let a = Arc::new(ScriptedExecutor::new().with_failure("publish", "quota exceeded"));
        add(&registry, "a", &a);
        let coordinator = WorkflowCoordinator::new();

        coordinator
            .coordinate(&router, "ok", vec![WorkflowStep::new("a", "prepare")], None)
            .await
            .unwrap();
        coordinator
            .coordinate(
                &router,
                "broken",
                vec![WorkflowStep::new("a", "prepare"), WorkflowStep::new("a", "publish")],
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(coordinator.status("ok"), WorkflowStatus::Completed);
        assert_eq!(coordinator.status("broken"), WorkflowStatus::Failed { step_index: 1 });
        assert_eq!(coordinator.status("never"), WorkflowStatus::Idle);
        assert_eq!(coordinator.active_count(), 0);

        // A finished id can run again
        coordinator
            .coordinate(&router, "broken", vec![WorkflowStep::new("a", "prepare")], None)
            .await
            .unwrap();
        assert_eq!(coordinator.status("broken"), WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_finished_history_is_bounded() {
        let (router, registry) = router(AccessGate::permissive());
        let a = Arc::new(ScriptedExecutor::new());
        add(&registry, "a", &a);
        let coordinator = WorkflowCoordinator::new();

        for n in 0..=FINISHED_RUNS_RETAINED {
            let workflow_id = format!("run-{}", n);
            coordinator
                .coordinate(&router, &workflow_id, vec![WorkflowStep::new("a", "go")], None)
                .await
                .unwrap();
        }

        assert_eq!(coordinator.status("run-0"), WorkflowStatus::Idle);
        assert_eq!(coordinator.status("run-1"), WorkflowStatus::Completed);
        assert_eq!(
            coordinator.status(&format!("run-{}", FINISHED_RUNS_RETAINED)),
            WorkflowStatus::Completed
        );
        assert_eq!(coordinator.runs.len(), FINISHED_RUNS_RETAINED);
    }

    #[test]
    fn test_detached_step_without_runtime_fails() {
        let (router, registry) = router(AccessGate::permissive());
        let a = Arc::new(ScriptedExecutor::new());
        add(&registry, "a", &a);
        let coordinator = WorkflowCoordinator::new();

        let err = futures::executor::block_on(coordinator.coordinate(
            &router,
            "wf",
            vec![WorkflowStep::new("a", "sync").detached()],
            None,
        ))
        .unwrap_err();

        match &err.workflow_failure().unwrap().reason {
            StepFailureReason::Failed(message) => assert!(message.contains("tokio runtime")),
            other => panic!("unexpected reason: {:?}", other),
        }
        assert_eq!(a.call_count(), 0);
    }

    #[tokio::test]
    async fn test_detached_step_does_not_block() {
        let (router, registry) = router(AccessGate::permissive());
        let slow = Arc::new(
            ScriptedExecutor::new()
                .with_delay(Duration::from_millis(50))
                .with_failure("sync", "remote down"),
        );
        let fast = Arc::new(ScriptedExecutor::new());
        add(&registry, "slow", &slow);
        add(&registry, "fast", &fast);
        let mut errors = router.subscribe(ComponentId::from("slow"), [WORKFLOW_STEP_ERROR]);

        let results = WorkflowCoordinator::new()
            .coordinate(
                &router,
                "wf",
                vec![
                    WorkflowStep::new("slow", "sync").detached(),
                    WorkflowStep::new("fast", "render"),
                ],
                None,
            )
            .await
            .unwrap();

        assert_eq!(results[0].output, None);
        assert_eq!(fast.call_count(), 1);

        // The detached failure surfaces only as an event
        let event = tokio::time::timeout(Duration::from_secs(1), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload["stepIndex"], 0);
        assert_eq!(event.payload["error"], "remote down");
    }

    #[test]
    fn test_step_deserializes_with_defaults() {
        let step: WorkflowStep =
            serde_json::from_value(json!({"componentId": "a", "action": "run"})).unwrap();
        assert!(step.wait_for_completion);
        assert_eq!(step.params, Value::Null);
    }
}
