//! Process-wide counters.
//!
//! All counters are atomics so the hot paths never take a lock. The
//! fixed set covers the broker and transports; filters record their
//! own counters under dotted names (`pii_redactor.redactions.email`)
//! in the dynamic table, which `GET /filters/metrics` snapshots.

use dashmap::DashMap;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct Metrics {
    started_at: Instant,
    pub messages_from_clients: AtomicU64,
    pub messages_from_upstream: AtomicU64,
    pub responses_delivered: AtomicU64,
    pub notifications_broadcast: AtomicU64,
    pub discovery_short_circuits: AtomicU64,
    pub registry_misses: AtomicU64,
    pub request_timeouts: AtomicU64,
    pub filter_drops: AtomicU64,
    pub filter_blocks: AtomicU64,
    pub filter_transforms: AtomicU64,
    pub queue_dropped: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub child_restarts: AtomicU64,
    pub frame_errors: AtomicU64,
    pub http_rejected_in_flight: AtomicU64,
    pub http_rejected_too_large: AtomicU64,
    filter_counters: DashMap<String, AtomicU64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            messages_from_clients: AtomicU64::new(0),
            messages_from_upstream: AtomicU64::new(0),
            responses_delivered: AtomicU64::new(0),
            notifications_broadcast: AtomicU64::new(0),
            discovery_short_circuits: AtomicU64::new(0),
            registry_misses: AtomicU64::new(0),
            request_timeouts: AtomicU64::new(0),
            filter_drops: AtomicU64::new(0),
            filter_blocks: AtomicU64::new(0),
            filter_transforms: AtomicU64::new(0),
            queue_dropped: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            child_restarts: AtomicU64::new(0),
            frame_errors: AtomicU64::new(0),
            http_rejected_in_flight: AtomicU64::new(0),
            http_rejected_too_large: AtomicU64::new(0),
            filter_counters: DashMap::new(),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a dotted filter counter, creating it on first use.
    pub fn incr_filter(&self, key: &str) {
        self.filter_counters
            .entry(key.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn filter_counter(&self, key: &str) -> u64 {
        self.filter_counters
            .get(key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Nested snapshot of the per-filter counters only.
    pub fn filter_snapshot(&self) -> Value {
        let mut map = serde_json::Map::new();
        for entry in self.filter_counters.iter() {
            map.insert(entry.key().clone(), json!(entry.value().load(Ordering::Relaxed)));
        }
        Value::Object(map)
    }

    /// Full counter snapshot served at `/metrics`.
    pub fn snapshot(&self) -> Value {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        json!({
            "uptime_s": self.uptime_secs(),
            "messages_from_clients": load(&self.messages_from_clients),
            "messages_from_upstream": load(&self.messages_from_upstream),
            "responses_delivered": load(&self.responses_delivered),
            "notifications_broadcast": load(&self.notifications_broadcast),
            "discovery_short_circuits": load(&self.discovery_short_circuits),
            "registry_misses": load(&self.registry_misses),
            "request_timeouts": load(&self.request_timeouts),
            "filter_drops": load(&self.filter_drops),
            "filter_blocks": load(&self.filter_blocks),
            "filter_transforms": load(&self.filter_transforms),
            "queue_dropped": load(&self.queue_dropped),
            "sessions_opened": load(&self.sessions_opened),
            "sessions_closed": load(&self.sessions_closed),
            "child_restarts": load(&self.child_restarts),
            "frame_errors": load(&self.frame_errors),
            "http_rejected_in_flight": load(&self.http_rejected_in_flight),
            "http_rejected_too_large": load(&self.http_rejected_too_large),
            "filters": self.filter_snapshot(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_counters_create_on_first_use() {
        let metrics = Metrics::new();
        assert_eq!(metrics.filter_counter("pii_redactor.redactions.email"), 0);
        metrics.incr_filter("pii_redactor.redactions.email");
        metrics.incr_filter("pii_redactor.redactions.email");
        assert_eq!(metrics.filter_counter("pii_redactor.redactions.email"), 2);
    }

    #[test]
    fn snapshot_includes_fixed_and_dynamic_counters() {
        let metrics = Metrics::new();
        metrics.filter_blocks.fetch_add(1, Ordering::Relaxed);
        metrics.incr_filter("blacklist.blocks.domain");

        let snap = metrics.snapshot();
        assert_eq!(snap["filter_blocks"], 1);
        assert_eq!(snap["filters"]["blacklist.blocks.domain"], 1);
    }
}
