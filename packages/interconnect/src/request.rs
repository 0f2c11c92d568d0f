//! Request/response correlation over the event router.
//!
//! `request` is syntactic sugar over events: it emits a `data-request` and
//! waits for a `data-response` carrying the same `requestId`. It does NOT
//! guarantee that anybody answers; without a response the call times out.
//!
//! # Wire shape
//!
//! ```text
//! data-request  { requestId, dataType, params }          source → target
//! data-response { requestId, data }  |  { requestId, error }   target → source
//! ```
//!
//! # Exactly once
//!
//! Each pending request lives in a map until the first of:
//! - a matching response removes it and fulfils the resolver
//! - the deadline passes and the waiting caller's guard removes it
//!
//! Responses arriving after the deadline are ignored.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::{ActorContext, ComponentId, Event, RequestId, Target, DATA_REQUEST, DATA_RESPONSE};
use crate::error::{DeniedOperation, InterconnectError, Result};
use crate::router::EventRouter;

/// Default deadline for [`RequestCorrelator::request`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type ResponseOutcome = std::result::Result<Value, String>;

struct PendingRequest {
    deadline: Instant,
    resolver: oneshot::Sender<ResponseOutcome>,
}

/// Pending request table, fed by every routed event.
pub struct RequestCorrelator {
    pending: DashMap<RequestId, PendingRequest>,
}

/// Removes the pending entry when the waiting caller finishes or is cancelled.
struct PendingGuard<'a> {
    correlator: &'a RequestCorrelator,
    request_id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.pending.remove(&self.request_id);
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn register(
        &self,
        request_id: RequestId,
        timeout: Duration,
    ) -> (PendingGuard<'_>, oneshot::Receiver<ResponseOutcome>) {
        let (resolver, receiver) = oneshot::channel();
        self.pending.insert(
            request_id,
            PendingRequest {
                deadline: Instant::now() + timeout,
                resolver,
            },
        );
        let guard = PendingGuard {
            correlator: self,
            request_id,
        };
        (guard, receiver)
    }

    /// Resolve a pending request if `event` is its response.
    pub(crate) fn observe(&self, event: &Event) {
        if !event.is(DATA_RESPONSE) {
            return;
        }
        let Some(request_id) = RequestId::from_payload(&event.payload) else {
            debug!(source = %event.source, "data-response without requestId");
            return;
        };
        let Some((_, pending)) = self.pending.remove(&request_id) else {
            debug!(%request_id, "data-response for unknown or finished request");
            return;
        };
        if Instant::now() > pending.deadline {
            debug!(%request_id, "data-response arrived after deadline");
            return;
        }

        let outcome = match event.payload.get("error") {
            Some(Value::String(message)) => Err(message.clone()),
            Some(other) if !other.is_null() => Err(other.to_string()),
            _ => Ok(event.payload.get("data").cloned().unwrap_or(Value::Null)),
        };
        // The caller may have been cancelled in the meantime
        let _ = pending.resolver.send(outcome);
    }

    /// Emit a `data-request` from `source` to `target` and await the response.
    ///
    /// Fails immediately with `ComponentNotFound` when `target` is not
    /// registered and with `PermissionDenied` when the gate would drop the
    /// request event.
    #[allow(clippy::too_many_arguments)]
    pub async fn request(
        &self,
        router: &EventRouter,
        source: ComponentId,
        target: ComponentId,
        data_type: &str,
        params: Value,
        actor: Option<ActorContext>,
        timeout: Duration,
    ) -> Result<Value> {
        if !router.registry().contains(&target) {
            return Err(InterconnectError::ComponentNotFound(target));
        }

        let target_ref = Target::Component(target.clone());
        if !router
            .gate()
            .can_emit(actor.as_ref(), DATA_REQUEST, &source, Some(&target_ref))
        {
            return Err(InterconnectError::PermissionDenied(DeniedOperation::Emit {
                event_type: DATA_REQUEST.to_string(),
                source,
            }));
        }

        let request_id = RequestId::new();
        // Register before emitting so an inline responder cannot race us
        let (_guard, receiver) = self.register(request_id, timeout);

        let event = Event::new(DATA_REQUEST, source.clone())
            .to(target_ref)
            .with_payload(json!({
                "requestId": request_id.to_string(),
                "dataType": data_type,
                "params": params,
            }))
            .with_actor_opt(actor);
        debug!(%request_id, source = %source, target = %target, data_type, "data request");
        router.emit(event);

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(Ok(data))) => Ok(data),
            Ok(Ok(Err(message))) => Err(InterconnectError::RequestFailed {
                request_id,
                message,
            }),
            // Resolver dropped without an answer, or the deadline passed
            Ok(Err(_)) | Err(_) => {
                warn!(%request_id, target = %target, ?timeout, "data request timed out");
                Err(InterconnectError::RequestTimeout {
                    request_id,
                    target,
                    timeout,
                })
            }
        }
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Parsed `data-request`, for responders.
///
/// # Example
///
/// ```ignore
/// fn handle_event(&self, event: &Event) -> anyhow::Result<()> {
///     if let Some(request) = DataRequest::from_event(event) {
///         let data = self.lookup(&request.data_type, &request.params)?;
///         self.hub.emit(request.respond_ok(self.id.clone(), data));
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    pub request_id: RequestId,
    pub requester: ComponentId,
    pub data_type: String,
    pub params: Value,
}

impl DataRequest {
    pub fn from_event(event: &Event) -> Option<Self> {
        if !event.is(DATA_REQUEST) {
            return None;
        }
        Some(Self {
            request_id: RequestId::from_payload(&event.payload)?,
            requester: event.source.clone(),
            data_type: event
                .payload
                .get("dataType")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            params: event.payload.get("params").cloned().unwrap_or(Value::Null),
        })
    }

    /// Successful `data-response` from `responder` back to the requester.
    pub fn respond_ok(&self, responder: impl Into<ComponentId>, data: Value) -> Event {
        self.response(responder, json!({ "requestId": self.request_id.to_string(), "data": data }))
    }

    /// Failed `data-response` carrying an error string.
    pub fn respond_err(
        &self,
        responder: impl Into<ComponentId>,
        error: impl Into<String>,
    ) -> Event {
        self.response(
            responder,
            json!({ "requestId": self.request_id.to_string(), "error": error.into() }),
        )
    }

    fn response(&self, responder: impl Into<ComponentId>, payload: Value) -> Event {
        Event::new(DATA_RESPONSE, responder)
            .to(self.requester.clone())
            .with_payload(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(request_id: RequestId, payload: Value) -> Event {
        let mut payload = payload;
        payload["requestId"] = json!(request_id.to_string());
        Event::new(DATA_RESPONSE, "b").to("a").with_payload(payload)
    }

    #[tokio::test]
    async fn test_observe_resolves_once() {
        let correlator = RequestCorrelator::new();
        let request_id = RequestId::new();
        let (_guard, receiver) = correlator.register(request_id, Duration::from_secs(1));
        assert_eq!(correlator.pending_count(), 1);

        correlator.observe(&response(request_id, json!({"data": {"rows": 3}})));
        // Second response finds nothing to resolve
        correlator.observe(&response(request_id, json!({"data": {"rows": 99}})));

        assert_eq!(receiver.await.unwrap(), Ok(json!({"rows": 3})));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_observe_error_string() {
        let correlator = RequestCorrelator::new();
        let request_id = RequestId::new();
        let (_guard, receiver) = correlator.register(request_id, Duration::from_secs(1));

        correlator.observe(&response(request_id, json!({"error": "no such dataset"})));

        assert_eq!(receiver.await.unwrap(), Err("no such dataset".to_string()));
    }

    #[tokio::test]
    async fn test_guard_releases_pending_entry() {
        let correlator = RequestCorrelator::new();
        {
            let (_guard, _receiver) = correlator.register(RequestId::new(), Duration::from_secs(1));
            assert_eq!(correlator.pending_count(), 1);
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_late_response_is_ignored() {
        let correlator = RequestCorrelator::new();
        let request_id = RequestId::new();
        let (_guard, receiver) = correlator.register(request_id, Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(20)).await;
        correlator.observe(&response(request_id, json!({"data": 1})));

        // The resolver was dropped without sending
        assert!(receiver.await.is_err());
    }

    #[test]
    fn test_unrelated_events_are_ignored() {
        let correlator = RequestCorrelator::new();
        correlator.observe(&Event::new("ping", "a"));
        correlator.observe(&Event::new(DATA_RESPONSE, "a").with_payload(json!({})));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_data_request_roundtrip_helpers() {
        let request_id = RequestId::new();
        let event = Event::new(DATA_REQUEST, "quality-panel")
            .to("lineage-graph")
            .with_payload(json!({
                "requestId": request_id.to_string(),
                "dataType": "upstream",
                "params": {"depth": 2},
            }));

        let request = DataRequest::from_event(&event).unwrap();
        assert_eq!(request.request_id, request_id);
        assert_eq!(request.requester, "quality-panel");
        assert_eq!(request.data_type, "upstream");

        let reply = request.respond_ok("lineage-graph", json!(["a", "b"]));
        assert!(reply.is(DATA_RESPONSE));
        assert_eq!(reply.target, Some(Target::component("quality-panel")));
        assert_eq!(RequestId::from_payload(&reply.payload), Some(request_id));
        assert_eq!(reply.payload["data"], json!(["a", "b"]));

        let failure = request.respond_err("lineage-graph", "denied");
        assert_eq!(failure.payload["error"], "denied");

        assert!(DataRequest::from_event(&Event::new("ping", "a")).is_none());
    }
}
