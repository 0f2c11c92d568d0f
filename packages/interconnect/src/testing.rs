//! Test doubles for components wired into an interconnect.
//!
//! # Feature Flag
//!
//! Available under `cfg(test)` and with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! interconnect = { path = "../interconnect", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use interconnect::testing::{RecordingHandler, ScriptedExecutor};
//!
//! let panel = Arc::new(RecordingHandler::new());
//! let catalog = Arc::new(ScriptedExecutor::new().with_result("reindex", json!({"ok": true})));
//!
//! hub.register("panel", ComponentHandle::new().with_event_handler(&panel));
//! hub.register("catalog", ComponentHandle::new().with_workflow_executor(&catalog));
//!
//! hub.emit(Event::new("refresh", "catalog"));
//! assert_eq!(panel.count(), 1);
//! ```
//!
//! ## Using `EventLatch` for Fan-Out Tests
//!
//! ```ignore
//! let latch = Arc::new(EventLatch::new(3));
//! let handler = Arc::new(RecordingHandler::new().with_latch(latch.clone()));
//!
//! hub.emit(trigger);
//!
//! tokio::time::timeout(Duration::from_secs(1), latch.await_zero())
//!     .await
//!     .expect("latch timed out");
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::component::{EventHandler, WorkflowExecutor};
use crate::core::{ActorContext, Event};

#[derive(Debug, Clone)]
enum Behavior {
    Succeed,
    Fail(String),
    Panic,
}

/// [`EventHandler`] that records every delivered event.
#[derive(Debug)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
    behavior: Behavior,
    latch: Option<Arc<EventLatch>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::with_behavior(Behavior::Succeed)
    }

    /// Records the event, then returns an error with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_behavior(Behavior::Fail(message.into()))
    }

    /// Records the event, then panics.
    pub fn panicking() -> Self {
        Self::with_behavior(Behavior::Panic)
    }

    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            behavior,
            latch: None,
        }
    }

    /// Decrement `latch` on every delivery.
    pub fn with_latch(mut self, latch: Arc<EventLatch>) -> Self {
        self.latch = Some(latch);
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Delivered events of one type.
    pub fn events_of(&self, event_type: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|event| event.is(event_type))
            .collect()
    }
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for RecordingHandler {
    fn handle_event(&self, event: &Event) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
        if let Some(latch) = &self.latch {
            latch.dec();
        }

        match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(message) => Err(anyhow!("{}", message)),
            Behavior::Panic => panic!("recording handler panicked on {}", event.event_type),
        }
    }
}

/// [`WorkflowExecutor`] with per-action scripted outcomes.
///
/// Unscripted actions succeed and echo `{action, params}`.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    script: HashMap<String, Behavior>,
    results: HashMap<String, Value>,
    delay: Option<Duration>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, action: impl Into<String>, output: Value) -> Self {
        let action = action.into();
        self.script.insert(action.clone(), Behavior::Succeed);
        self.results.insert(action, output);
        self
    }

    pub fn with_failure(mut self, action: impl Into<String>, message: impl Into<String>) -> Self {
        self.script
            .insert(action.into(), Behavior::Fail(message.into()));
        self
    }

    pub fn with_panic(mut self, action: impl Into<String>) -> Self {
        self.script.insert(action.into(), Behavior::Panic);
        self
    }

    /// Sleep before answering every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// `(action, params)` of every call, in order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[async_trait]
impl WorkflowExecutor for ScriptedExecutor {
    async fn execute_workflow_step(
        &self,
        action: &str,
        params: Value,
        _actor: Option<&ActorContext>,
    ) -> Result<Value> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((action.to_string(), params.clone()));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.script.get(action).cloned().unwrap_or(Behavior::Succeed) {
            Behavior::Succeed => Ok(self
                .results
                .get(action)
                .cloned()
                .unwrap_or_else(|| json!({ "action": action, "params": params }))),
            Behavior::Fail(message) => Err(anyhow!("{}", message)),
            Behavior::Panic => panic!("scripted executor panicked on {}", action),
        }
    }
}

/// Countdown latch for awaiting a known number of deliveries.
///
/// Share it through an `Arc`.
#[derive(Debug)]
pub struct EventLatch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl EventLatch {
    pub fn new(expected: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(expected),
            notify: Notify::new(),
        }
    }

    /// # Panics
    ///
    /// Panics if called more times than expected.
    pub fn dec(&self) {
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("EventLatch decremented below zero - more events than expected");
        }
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Wait for the count to reach zero.
    pub async fn await_zero(&self) {
        loop {
            // Register before checking so a concurrent dec is not missed
            let notified = self.notify.notified();
            if self.remaining.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}
