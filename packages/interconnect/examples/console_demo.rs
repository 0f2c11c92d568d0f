//! Wires a few console modules together and runs one of each interaction.
//!
//! ```text
//! RUST_LOG=info,interconnect=debug cargo run -p interconnect --example console_demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use interconnect::{
    async_trait, ActorContext, ComponentHandle, ComponentId, Connection, DataRequest, Event,
    EventHandler, Interconnect, InterconnectConfig, PermissionPolicy, Target, WorkflowExecutor,
    WorkflowStep, DATA_REQUEST, STATE_CHANGED,
};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Answers `upstream` lookups with a canned lineage.
struct LineageGraph {
    hub: Interconnect,
}

impl EventHandler for LineageGraph {
    fn handle_event(&self, event: &Event) -> Result<()> {
        if let Some(request) = DataRequest::from_event(event) {
            let depth = request.params["depth"].as_u64().unwrap_or(1);
            let upstream: Vec<String> = (1..=depth).map(|d| format!("raw.orders_v{}", d)).collect();
            self.hub
                .respond("lineage-graph", &request, Ok(json!({ "upstream": upstream })));
        }
        Ok(())
    }
}

/// Logs refreshes; reports itself degraded on a stale refresh.
struct QualityPanel {
    hub: Interconnect,
}

impl EventHandler for QualityPanel {
    fn handle_event(&self, event: &Event) -> Result<()> {
        tracing::info!(
            event_type = %event.event_type,
            payload = %event.payload,
            "quality panel received"
        );
        if event.payload["stale"].as_bool() == Some(true) {
            self.hub.report_health(
                &ComponentId::from("quality-panel"),
                interconnect::HealthStatus::Degraded,
            )?;
        }
        Ok(())
    }
}

/// Executes catalog maintenance steps.
struct Catalog;

#[async_trait]
impl WorkflowExecutor for Catalog {
    async fn execute_workflow_step(
        &self,
        action: &str,
        params: Value,
        actor: Option<&ActorContext>,
    ) -> Result<Value> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        match action {
            "validate" => Ok(json!({ "dataset": params["dataset"], "valid": true })),
            "publish" => Ok(json!({
                "dataset": params["dataset"],
                "publishedBy": actor.map(|a| a.actor_id.clone()),
            })),
            other => anyhow::bail!("unknown catalog action {}", other),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,interconnect=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = InterconnectConfig::from_env().context("Failed to load configuration")?;

    let policy = PermissionPolicy::new()
        .grant_role("steward", ["emit:*", "workflow:catalog:*", "state:design-surface"])
        .grant_role("viewer", ["emit:data-request"]);

    let hub = Interconnect::builder()
        .with_config(config)
        .with_access_policy(policy)
        .with_connection(Connection::new("orchestrator", Target::All, ["refresh"]))
        .with_connection(Connection::new("quality-panel", "lineage-graph", [DATA_REQUEST]))
        .build();

    let lineage = Arc::new(LineageGraph { hub: hub.clone() });
    let panel = Arc::new(QualityPanel { hub: hub.clone() });
    let catalog = Arc::new(Catalog);

    hub.register("orchestrator", ComponentHandle::new());
    hub.register("lineage-graph", ComponentHandle::new().with_event_handler(&lineage));
    hub.register("quality-panel", ComponentHandle::new().with_event_handler(&panel));
    hub.register("catalog", ComponentHandle::new().with_workflow_executor(&catalog));
    hub.register(
        "design-surface",
        ComponentHandle::new().with_initial_state(json!({ "zoom": 1.0 })),
    );

    let steward = ActorContext::new("dana").with_role("steward");
    let viewer = ActorContext::new("sam").with_role("viewer");

    // Broadcast
    hub.emit(
        Event::new("refresh", "orchestrator")
            .with_payload(json!({ "scope": "all", "stale": true }))
            .with_actor(steward.clone()),
    );

    // Request / response
    let upstream = hub
        .request(
            "quality-panel",
            "lineage-graph",
            "upstream",
            json!({ "depth": 2 }),
            Some(viewer.clone()),
            None,
        )
        .await?;
    tracing::info!(%upstream, "lineage answered");

    // Shared state
    let mut changes = hub.subscribe("design-surface", [STATE_CHANGED]);
    let surface = ComponentId::from("design-surface");
    hub.update_state(&surface, json!({ "zoom": 1.5 }), Some(&steward))?;
    hub.update_state(&surface, json!({ "zoom": 9.0 }), Some(&viewer))?;
    if let Some(change) = changes.try_recv() {
        tracing::info!(payload = %change.payload, "state changed");
    }
    tracing::info!(state = ?hub.get_state(&surface), "design surface state");

    // Workflow
    let steps = vec![
        WorkflowStep::new("catalog", "validate").with_params(json!({ "dataset": "orders" })),
        WorkflowStep::new("catalog", "publish").with_params(json!({ "dataset": "orders" })),
    ];
    let results = hub.coordinate("publish-orders", steps, Some(steward)).await?;
    tracing::info!(steps = results.len(), "workflow completed");

    let denied = hub
        .coordinate(
            "publish-orders",
            vec![WorkflowStep::new("catalog", "publish")],
            Some(viewer),
        )
        .await;
    if let Err(err) = denied {
        tracing::warn!(error = %err, "workflow rejected");
    }

    let metrics = serde_json::to_string_pretty(&hub.metrics())?;
    println!("{}", metrics);
    Ok(())
}
