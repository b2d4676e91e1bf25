//! In-flight request registry.
//!
//! Every client request forwarded upstream is rewritten to carry a
//! bridge-scoped id from a monotonic counter. The registry remembers
//! where the response must go and under which id the client knows the
//! request. Entries leave the table exactly once: on response, on
//! deadline expiry, on child restart, or when the owning session
//! closes.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub bridge_id: u64,
    pub session_id: String,
    pub original_id: Value,
    pub method: String,
    pub submitted_at: Instant,
    pub deadline: Instant,
}

#[derive(Debug)]
pub struct RequestRegistry {
    next_id: AtomicU64,
    pending: DashMap<u64, PendingRequest>,
    /// Ids of fire-and-forget forwards whose responses are thrown
    /// away instead of counting as unresolvable.
    discards: DashMap<u64, ()>,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            discards: DashMap::new(),
        }
    }
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a bridge id for a fire-and-forget forward. The id is
    /// remembered so the upstream answer is discarded quietly.
    pub fn allocate_discard_id(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.discards.insert(id, ());
        id
    }

    /// True when `bridge_id` belongs to a fire-and-forget forward;
    /// the entry is consumed.
    pub fn take_discard(&self, bridge_id: u64) -> bool {
        self.discards.remove(&bridge_id).is_some()
    }

    /// Insert a new entry and return the bridge id assigned to it.
    pub fn register(
        &self,
        session_id: &str,
        original_id: Value,
        method: &str,
        ttl: Duration,
    ) -> u64 {
        let bridge_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        self.pending.insert(
            bridge_id,
            PendingRequest {
                bridge_id,
                session_id: session_id.to_string(),
                original_id,
                method: method.to_string(),
                submitted_at: now,
                deadline: now + ttl,
            },
        );
        bridge_id
    }

    /// Remove and return the entry for an upstream response id.
    pub fn resolve(&self, bridge_id: u64) -> Option<PendingRequest> {
        self.pending.remove(&bridge_id).map(|(_, entry)| entry)
    }

    /// Drain every entry; used when the child restarts and all
    /// in-flight requests must be failed back to their sessions.
    /// Stale discard ids go with them; nothing old will answer.
    pub fn drain_all(&self) -> Vec<PendingRequest> {
        self.discards.clear();
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter_map(|id| self.resolve(id)).collect()
    }

    /// Silently remove entries owned by a closed session.
    pub fn drop_session(&self, session_id: &str) {
        self.pending.retain(|_, entry| entry.session_id != session_id);
    }

    /// Remove and return entries whose deadline has passed.
    pub fn sweep_expired(&self, now: Instant) -> Vec<PendingRequest> {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| *e.key())
            .collect();
        expired.into_iter().filter_map(|id| self.resolve(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bridge_ids_are_unique_and_monotonic() {
        let registry = RequestRegistry::new();
        let a = registry.register("s1", json!("abc"), "foo", Duration::from_secs(60));
        let b = registry.register("s2", json!("abc"), "foo", Duration::from_secs(60));
        assert!(b > a);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn resolve_removes_and_returns_origin() {
        let registry = RequestRegistry::new();
        let id = registry.register("s1", json!(42), "tools/call", Duration::from_secs(60));

        let entry = registry.resolve(id).expect("entry should exist");
        assert_eq!(entry.session_id, "s1");
        assert_eq!(entry.original_id, json!(42));
        assert_eq!(entry.method, "tools/call");

        assert!(registry.resolve(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn sweep_returns_only_expired_entries() {
        let registry = RequestRegistry::new();
        let expired = registry.register("s1", json!(1), "foo", Duration::from_millis(0));
        let live = registry.register("s1", json!(2), "bar", Duration::from_secs(600));

        let swept = registry.sweep_expired(Instant::now() + Duration::from_millis(10));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].bridge_id, expired);
        assert!(registry.resolve(live).is_some());
    }

    #[test]
    fn drop_session_removes_only_that_sessions_entries() {
        let registry = RequestRegistry::new();
        registry.register("gone", json!(1), "foo", Duration::from_secs(60));
        let kept = registry.register("kept", json!(2), "foo", Duration::from_secs(60));

        registry.drop_session("gone");
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve(kept).is_some());
    }

    #[test]
    fn discard_ids_are_consumed_once() {
        let registry = RequestRegistry::new();
        let id = registry.allocate_discard_id();
        assert!(registry.is_empty());
        assert!(registry.take_discard(id));
        assert!(!registry.take_discard(id));
    }

    #[test]
    fn drain_all_empties_the_table() {
        let registry = RequestRegistry::new();
        registry.register("s1", json!(1), "a", Duration::from_secs(60));
        registry.register("s2", json!(2), "b", Duration::from_secs(60));

        let drained = registry.drain_all();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
