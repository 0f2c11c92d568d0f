//! Throughput and health tracking.
//!
//! Updated as a side effect of registration, routing and delivery. Callers
//! only read [`MetricsSnapshot`]s.
//!
//! # Rate estimation
//!
//! `events_per_second` comes from a fixed ring of time buckets covering the
//! last window (1 s in 10 buckets by default). Recording is O(1) and the
//! estimator allocates nothing after construction.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::component::HealthStatus;
use crate::core::ComponentId;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    slot: u64,
    count: u64,
}

/// Upper bound on the number of rate buckets.
pub const MAX_RATE_BUCKETS: usize = 1000;

/// Sliding-window event counter.
#[derive(Debug)]
pub struct RateWindow {
    origin: Instant,
    bucket_width: Duration,
    buckets: Vec<Bucket>,
}

impl RateWindow {
    /// `window` is split into `buckets` equal slots, clamped to
    /// `1..=MAX_RATE_BUCKETS`.
    pub fn new(window: Duration, buckets: usize) -> Self {
        let buckets = buckets.clamp(1, MAX_RATE_BUCKETS);
        let divisor = u32::try_from(buckets).unwrap_or(u32::MAX);
        let bucket_width = (window / divisor).max(Duration::from_millis(1));
        Self {
            origin: Instant::now(),
            bucket_width,
            buckets: vec![Bucket::default(); buckets],
        }
    }

    fn slot_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin);
        (elapsed.as_nanos() / self.bucket_width.as_nanos()) as u64
    }

    pub fn record_at(&mut self, now: Instant) {
        let slot = self.slot_at(now);
        let len = self.buckets.len() as u64;
        let bucket = &mut self.buckets[(slot % len) as usize];
        if bucket.slot != slot {
            bucket.slot = slot;
            bucket.count = 0;
        }
        bucket.count += 1;
    }

    /// Events recorded within the window ending at `now`.
    pub fn count_at(&self, now: Instant) -> u64 {
        let current = self.slot_at(now);
        let len = self.buckets.len() as u64;
        self.buckets
            .iter()
            .filter(|bucket| bucket.count > 0 && current.saturating_sub(bucket.slot) < len)
            .map(|bucket| bucket.count)
            .sum()
    }

    /// Events per second over the window ending at `now`.
    pub fn rate_at(&self, now: Instant) -> f64 {
        let len = u32::try_from(self.buckets.len()).unwrap_or(u32::MAX);
        let window = self.bucket_width.saturating_mul(len);
        self.count_at(now) as f64 / window.as_secs_f64()
    }
}

/// Read-only view returned by `metrics()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_components: usize,
    pub active_connections: usize,
    pub events_per_second: f64,
    pub component_health: BTreeMap<ComponentId, HealthStatus>,
    pub events_total: u64,
    pub denied_total: u64,
    pub delivery_failures_total: u64,
    pub pending_requests: usize,
    pub active_workflows: usize,
}

/// Process-wide counters and per-component health.
#[derive(Debug)]
pub struct MetricsTracker {
    rate: Mutex<RateWindow>,
    total_components: AtomicUsize,
    events_total: AtomicU64,
    denied_total: AtomicU64,
    delivery_failures_total: AtomicU64,
    health: DashMap<ComponentId, HealthStatus>,
}

impl MetricsTracker {
    pub fn new(window: Duration, buckets: usize) -> Self {
        Self {
            rate: Mutex::new(RateWindow::new(window, buckets)),
            total_components: AtomicUsize::new(0),
            events_total: AtomicU64::new(0),
            denied_total: AtomicU64::new(0),
            delivery_failures_total: AtomicU64::new(0),
            health: DashMap::new(),
        }
    }

    pub fn component_added(&self, id: &ComponentId) {
        self.total_components.fetch_add(1, Ordering::AcqRel);
        self.health.insert(id.clone(), HealthStatus::Healthy);
    }

    /// Re-registration keeps the count and resets health.
    pub fn component_replaced(&self, id: &ComponentId) {
        self.health.insert(id.clone(), HealthStatus::Healthy);
    }

    pub fn component_removed(&self, id: &ComponentId) {
        if self.health.remove(id).is_some() {
            // remove() succeeding means a matching add happened
            let _ = self
                .total_components
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }

    pub fn record_event(&self) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        let mut rate = self.rate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rate.record_at(Instant::now());
    }

    pub fn record_denial(&self) {
        self.denied_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_failure(&self, id: &ComponentId) {
        self.delivery_failures_total.fetch_add(1, Ordering::Relaxed);
        self.set_health(id, HealthStatus::Error);
    }

    /// Set health for a registered component. Unknown ids are ignored.
    pub fn set_health(&self, id: &ComponentId, status: HealthStatus) -> bool {
        match self.health.get_mut(id) {
            Some(mut entry) => {
                *entry = status;
                true
            }
            None => false,
        }
    }

    pub fn health_of(&self, id: &ComponentId) -> Option<HealthStatus> {
        self.health.get(id).map(|entry| *entry)
    }

    pub fn health_all(&self) -> BTreeMap<ComponentId, HealthStatus> {
        self.health
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn events_per_second(&self) -> f64 {
        let rate = self.rate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rate.rate_at(Instant::now())
    }

    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    pub fn denied_total(&self) -> u64 {
        self.denied_total.load(Ordering::Relaxed)
    }

    pub fn delivery_failures_total(&self) -> u64 {
        self.delivery_failures_total.load(Ordering::Relaxed)
    }

    pub fn total_components(&self) -> usize {
        self.total_components.load(Ordering::Acquire)
    }

    /// Snapshot combining tracker counters with values owned elsewhere.
    pub fn snapshot(
        &self,
        active_connections: usize,
        pending_requests: usize,
        active_workflows: usize,
    ) -> MetricsSnapshot {
        MetricsSnapshot {
            total_components: self.total_components(),
            active_connections,
            events_per_second: self.events_per_second(),
            component_health: self.health_all(),
            events_total: self.events_total(),
            denied_total: self.denied_total(),
            delivery_failures_total: self.delivery_failures_total(),
            pending_requests,
            active_workflows,
        }
    }
}
