//! Event router: gate, local subscribers, connection-table delivery.
//!
//! ```text
//! emit(event)
//!     │
//!     ├─► AccessGate.can_emit ── denied ──► drop (warn + denied_total)
//!     │
//!     ├─► broadcast ──► Subscriptions (filtered by source/type)
//!     ├─► RequestCorrelator.observe (data-response)
//!     │
//!     └─► routes_for(source)
//!             ├─ target "*"  ──► every other component, registry order
//!             └─ target id   ──► that component, if registered
//!                                   │
//!                                   ▼
//!                           EventHandler.handle_event
//!                           (Err / panic → health Error, continue)
//! ```
//!
//! # Guarantees
//!
//! - **Isolation**: a failing recipient never blocks the others and never
//!   surfaces to the emitter
//! - **Deterministic order per emission**: connection-table order, then
//!   registry order for wildcards
//! - **Re-entrant**: no lock is held while a handler runs, so handlers may
//!   emit, update state or answer requests
//! - **At-most-once for subscribers**: lagging subscriptions skip events

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::stream::{self, Stream};
use smallvec::SmallVec;
use tokio::sync::broadcast;
use tracing::{debug, error, trace, warn};

use crate::access::AccessGate;
use crate::component::Capability;
use crate::connection::ConnectionTable;
use crate::core::{panic_message, ComponentId, Event, Target};
use crate::metrics::MetricsTracker;
use crate::registry::ComponentRegistry;
use crate::request::RequestCorrelator;

/// What happened to one emission. Internal; `emit` callers never see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EmitOutcome {
    Denied,
    Routed {
        subscribers: usize,
        delivered: usize,
        failed: usize,
    },
}

struct Recipient {
    id: ComponentId,
    capability: Capability,
}

/// Dispatcher shared by every part of the interconnect.
#[derive(Clone)]
pub struct EventRouter {
    registry: Arc<ComponentRegistry>,
    connections: Arc<ConnectionTable>,
    gate: AccessGate,
    metrics: Arc<MetricsTracker>,
    correlator: Arc<RequestCorrelator>,
    sender: broadcast::Sender<Arc<Event>>,
}

impl EventRouter {
    pub(crate) fn new(
        registry: Arc<ComponentRegistry>,
        connections: Arc<ConnectionTable>,
        gate: AccessGate,
        metrics: Arc<MetricsTracker>,
        correlator: Arc<RequestCorrelator>,
        capacity: usize,
    ) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            registry,
            connections,
            gate,
            metrics,
            correlator,
            sender,
        }
    }

    pub(crate) fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub(crate) fn gate(&self) -> &AccessGate {
        &self.gate
    }

    /// Route one event. See the module docs for the algorithm.
    pub(crate) fn emit(&self, event: Event) -> EmitOutcome {
        let target = event.target.as_ref();
        if !self
            .gate
            .can_emit(event.actor.as_ref(), &event.event_type, &event.source, target)
        {
            self.metrics.record_denial();
            return EmitOutcome::Denied;
        }

        self.metrics.record_event();
        let event = Arc::new(event);

        // Subscribers are enqueued before any handler runs
        let subscribers = self.sender.send(event.clone()).unwrap_or(0);
        self.correlator.observe(&event);

        let recipients = self.resolve_recipients(&event);
        let mut delivered = 0;
        let mut failed = 0;
        for recipient in &recipients {
            match self.deliver(recipient, &event) {
                Some(true) => delivered += 1,
                Some(false) => failed += 1,
                None => {}
            }
        }

        trace!(
            event_type = %event.event_type,
            source = %event.source,
            subscribers,
            delivered,
            failed,
            "event routed"
        );

        EmitOutcome::Routed {
            subscribers,
            delivered,
            failed,
        }
    }

    fn resolve_recipients(&self, event: &Event) -> SmallVec<[Recipient; 4]> {
        let mut recipients = SmallVec::new();

        for connection in self.connections.routes_for(&event.source) {
            if !connection.carries(&event.event_type) {
                continue;
            }

            let candidates = match &connection.target {
                Target::All => self.registry.others(&event.source),
                Target::Component(id) => match self.registry.capability_of(id) {
                    Some(capability) => vec![(id.clone(), capability)],
                    None => {
                        debug!(
                            source = %event.source,
                            target = %id,
                            event_type = %event.event_type,
                            "route target not registered"
                        );
                        Vec::new()
                    }
                },
            };

            for (id, capability) in candidates {
                if connection.rbac_required && !self.recipient_allowed(event, &id) {
                    continue;
                }
                recipients.push(Recipient { id, capability });
            }
        }

        recipients
    }

    fn recipient_allowed(&self, event: &Event, recipient: &ComponentId) -> bool {
        let target = Target::Component(recipient.clone());
        let allowed = self.gate.can_emit(
            event.actor.as_ref(),
            &event.event_type,
            &event.source,
            Some(&target),
        );
        if !allowed {
            self.metrics.record_denial();
        }
        allowed
    }

    /// `Some(true)` delivered, `Some(false)` failed, `None` not routable.
    fn deliver(&self, recipient: &Recipient, event: &Event) -> Option<bool> {
        let Some(handler) = recipient.capability.event_handler() else {
            if recipient.capability.is_routable() {
                debug!(component = %recipient.id, "event handler dropped, skipping delivery");
            }
            return None;
        };

        let addressed = event.retargeted(&recipient.id);
        let result = catch_unwind(AssertUnwindSafe(|| handler.handle_event(&addressed)));

        let failure = match result {
            Ok(Ok(())) => return Some(true),
            Ok(Err(err)) => err.to_string(),
            Err(panic_info) => format!("panic: {}", panic_message(&*panic_info)),
        };

        error!(
            component = %recipient.id,
            event_type = %event.event_type,
            source = %event.source,
            error = %failure,
            "event delivery failed"
        );
        self.metrics.record_delivery_failure(&recipient.id);
        Some(false)
    }

    /// Subscribe to events emitted by `source`.
    ///
    /// An empty `event_types` set matches every type.
    pub fn subscribe<I, S>(&self, source: ComponentId, event_types: I) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Subscription {
            receiver: self.sender.subscribe(),
            source: Some(source),
            event_types: event_types.into_iter().map(Into::into).collect(),
        }
    }

    /// Subscribe to every accepted event, regardless of source.
    pub fn subscribe_all(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            source: None,
            event_types: BTreeSet::new(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("subscriber_count", &self.subscriber_count())
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

/// Filtered stream of emitted events. Dropping it cancels the subscription.
pub struct Subscription {
    receiver: broadcast::Receiver<Arc<Event>>,
    source: Option<ComponentId>,
    event_types: BTreeSet<String>,
}

impl Subscription {
    pub fn matches(&self, event: &Event) -> bool {
        let source_ok = self.source.as_ref().map_or(true, |s| *s == event.source);
        let type_ok = self.event_types.is_empty() || self.event_types.contains(&event.event_type);
        source_ok && type_ok
    }

    /// Next matching event, or `None` once the interconnect is dropped.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "subscription lagged, events were skipped");
                    continue;
                }
            }
        }
    }

    /// Next matching event already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(lagged = n, "subscription lagged, events were skipped");
                    continue;
                }
                Err(_) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<Event>> + Send {
        stream::unfold(self, |mut subscription| async move {
            let event = subscription.recv().await?;
            Some((event, subscription))
        })
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("source", &self.source)
            .field("event_types", &self.event_types)
            .finish()
    }
}
