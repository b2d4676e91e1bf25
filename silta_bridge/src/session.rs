//! Session store.
//!
//! A session is one logical client: an outbound queue of messages
//! awaiting delivery plus zero or more attached sinks (live SSE or WS
//! writers) draining that queue. The broker is the only writer; sinks
//! are the only readers. Queue mutations are serialized by a per-
//! session mutex, and sinks are woken through a `Notify`.
//!
//! Backpressure policy: beyond `max_queue_depth` the oldest message is
//! dropped (slow-consumer signal); once the cumulative backlog since
//! the last successful drain reaches `hard_cap`, the session is closed
//! with reason `slow_consumer` and every sink sees end-of-stream.

use crate::error::{BridgeError, Result};
use crate::metrics::Metrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 1024;
pub const DEFAULT_HARD_CAP: usize = 2048;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_DETACH_GRACE: Duration = Duration::from_secs(15);

/// Why a session was closed; surfaced in the final `event: end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientRequested,
    IdleTimeout,
    SlowConsumer,
    Detached,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientRequested => "client_requested",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::SlowConsumer => "slow_consumer",
            CloseReason::Detached => "detached",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub user_agent: Option<String>,
    pub remote_addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_queue_depth: usize,
    pub hard_cap: usize,
    pub idle_timeout: Duration,
    pub detach_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            hard_cap: DEFAULT_HARD_CAP,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            detach_grace: DEFAULT_DETACH_GRACE,
        }
    }
}

#[derive(Debug)]
struct QueueState {
    queue: VecDeque<Value>,
    /// Messages dropped since a sink last drained anything; resets on
    /// every pop so only a genuinely stuck consumer accumulates.
    backlog_dropped: usize,
}

pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub priority: String,
    pub client_info: ClientInfo,
    state: Mutex<QueueState>,
    notify: Notify,
    attached: Mutex<HashSet<u64>>,
    detached_since: Mutex<Option<Instant>>,
    last_activity: Mutex<Instant>,
    dropped_total: AtomicU64,
    closed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
}

/// Outcome of a single enqueue, after policy was applied.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    DroppedOldest,
    HardCapExceeded,
}

impl Session {
    fn new(client_info: ClientInfo) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            priority: "normal".to_string(),
            client_info,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                backlog_dropped: 0,
            }),
            notify: Notify::new(),
            attached: Mutex::new(HashSet::new()),
            detached_since: Mutex::new(Some(Instant::now())),
            last_activity: Mutex::new(Instant::now()),
            dropped_total: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock().unwrap()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// Apply queue policy and append. Does not close the session on
    /// hard-cap overflow; the store does that so registry cleanup and
    /// metrics stay in one place.
    fn push(&self, message: Value, config: &SessionConfig) -> EnqueueOutcome {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(message);

        let mut outcome = EnqueueOutcome::Enqueued;
        if state.queue.len() > config.max_queue_depth {
            state.queue.pop_front();
            state.backlog_dropped += 1;
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
            outcome = EnqueueOutcome::DroppedOldest;
        }
        if state.queue.len() + state.backlog_dropped >= config.hard_cap {
            outcome = EnqueueOutcome::HardCapExceeded;
        }
        drop(state);

        self.notify.notify_waiters();
        outcome
    }

    /// Await the next queued message. Returns `None` once the session
    /// is closed; queued-but-undelivered messages are discarded then.
    pub async fn next_message(&self) -> Option<Value> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a notify between
            // the check and the await is not lost.
            notified.as_mut().enable();
            if self.is_closed() {
                return None;
            }
            {
                let mut state = self.state.lock().unwrap();
                if let Some(message) = state.queue.pop_front() {
                    state.backlog_dropped = 0;
                    drop(state);
                    self.touch();
                    return Some(message);
                }
            }
            notified.await;
        }
    }

    fn attach(&self, sink_id: u64) {
        self.attached.lock().unwrap().insert(sink_id);
        *self.detached_since.lock().unwrap() = None;
        self.touch();
    }

    /// Idempotent: detaching a sink twice, or after close, is a no-op.
    fn detach(&self, sink_id: u64) {
        let mut attached = self.attached.lock().unwrap();
        if attached.remove(&sink_id) && attached.is_empty() {
            *self.detached_since.lock().unwrap() = Some(Instant::now());
        }
    }

    pub fn sink_count(&self) -> usize {
        self.attached.lock().unwrap().len()
    }

    fn detached_for(&self) -> Option<Duration> {
        self.detached_since.lock().unwrap().map(|t| t.elapsed())
    }

    fn mark_closed(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.close_reason.lock().unwrap() = Some(reason);
        self.notify.notify_waiters();
        true
    }
}

pub struct SessionStore {
    sessions: DashMap<String, Arc<Session>>,
    config: SessionConfig,
    metrics: Arc<Metrics>,
    next_sink_id: AtomicU64,
}

impl SessionStore {
    pub fn new(config: SessionConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            metrics,
            next_sink_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn create(&self, client_info: ClientInfo) -> Arc<Session> {
        let session = Arc::new(Session::new(client_info));
        info!(session_id = %session.id, "session created");
        self.sessions.insert(session.id.clone(), session.clone());
        self.metrics.sessions_opened.fetch_add(1, Ordering::Relaxed);
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.id.clone()).collect()
    }

    pub fn total_queue_depth(&self) -> usize {
        self.sessions.iter().map(|s| s.queue_depth()).sum()
    }

    /// Register a live sink on a session and hand back its id.
    pub fn attach_sink(&self, session_id: &str) -> Result<u64> {
        let session = self
            .get(session_id)
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?;
        let sink_id = self.next_sink_id.fetch_add(1, Ordering::Relaxed);
        session.attach(sink_id);
        debug!(session_id = %session_id, sink_id, "sink attached");
        Ok(sink_id)
    }

    pub fn detach_sink(&self, session_id: &str, sink_id: u64) {
        if let Some(session) = self.get(session_id) {
            session.detach(sink_id);
            debug!(session_id = %session_id, sink_id, "sink detached");
        }
    }

    /// Append a message for delivery, applying the backpressure
    /// policy. A hard-cap overflow closes the session.
    pub fn enqueue(&self, session_id: &str, message: Value) -> Result<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?;
        if session.is_closed() {
            return Err(BridgeError::SessionClosed(session_id.to_string()));
        }

        match session.push(message, &self.config) {
            EnqueueOutcome::Enqueued => {}
            EnqueueOutcome::DroppedOldest => {
                self.metrics.queue_dropped.fetch_add(1, Ordering::Relaxed);
            }
            EnqueueOutcome::HardCapExceeded => {
                self.metrics.queue_dropped.fetch_add(1, Ordering::Relaxed);
                self.close(session_id, CloseReason::SlowConsumer);
            }
        }
        Ok(())
    }

    /// Close and unregister a session. Idempotent; sinks observe the
    /// closed flag and terminate their streams.
    pub fn close(&self, session_id: &str, reason: CloseReason) {
        if let Some((_, session)) = self.sessions.remove(session_id)
            && session.mark_closed(reason)
        {
            info!(session_id = %session_id, reason = reason.as_str(), "session closed");
            self.metrics.sessions_closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn close_all(&self, reason: CloseReason) {
        let ids: Vec<String> = self.sessions.iter().map(|s| s.id.clone()).collect();
        for id in ids {
            self.close(&id, reason);
        }
    }

    /// Close sessions idle beyond the timeout or detached beyond the
    /// grace period. Returns the ids closed so the caller can scrub
    /// their registry entries.
    pub fn sweep(&self) -> Vec<String> {
        let mut closed = Vec::new();
        let candidates: Vec<Arc<Session>> = self.sessions.iter().map(|s| s.clone()).collect();
        for session in candidates {
            if session.is_closed() {
                continue;
            }
            if session.idle_for() > self.config.idle_timeout {
                self.close(&session.id, CloseReason::IdleTimeout);
                closed.push(session.id.clone());
            } else if session.sink_count() == 0
                && session
                    .detached_for()
                    .is_some_and(|d| d > self.config.detach_grace)
            {
                self.close(&session.id, CloseReason::Detached);
                closed.push(session.id.clone());
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with(config: SessionConfig) -> SessionStore {
        SessionStore::new(config, Arc::new(Metrics::new()))
    }

    #[test]
    fn two_creates_yield_distinct_sessions() {
        let store = store_with(SessionConfig::default());
        let a = store.create(ClientInfo::default());
        let b = store.create(ClientInfo::default());
        assert_ne!(a.id, b.id);
        assert_eq!(store.count(), 2);
    }

    #[tokio::test]
    async fn enqueue_drops_oldest_beyond_depth() {
        let config = SessionConfig {
            max_queue_depth: 3,
            hard_cap: 100,
            ..SessionConfig::default()
        };
        let store = store_with(config);
        let session = store.create(ClientInfo::default());

        for i in 0..5 {
            store.enqueue(&session.id, json!({"n": i})).unwrap();
        }

        assert_eq!(session.queue_depth(), 3);
        assert_eq!(session.dropped_total(), 2);
        // Oldest two were dropped; delivery starts at n == 2.
        assert_eq!(session.next_message().await.unwrap(), json!({"n": 2}));
    }

    #[tokio::test]
    async fn hard_cap_closes_session_as_slow_consumer() {
        let config = SessionConfig {
            max_queue_depth: 4,
            hard_cap: 8,
            ..SessionConfig::default()
        };
        let store = store_with(config);
        let session = store.create(ClientInfo::default());

        for i in 0..10 {
            let _ = store.enqueue(&session.id, json!({"n": i}));
        }

        assert!(session.is_closed());
        assert_eq!(session.close_reason(), Some(CloseReason::SlowConsumer));
        assert!(store.get(&session.id).is_none());
        assert!(session.next_message().await.is_none());
    }

    #[tokio::test]
    async fn draining_resets_the_backlog_counter() {
        let config = SessionConfig {
            max_queue_depth: 4,
            hard_cap: 8,
            ..SessionConfig::default()
        };
        let store = store_with(config);
        let session = store.create(ClientInfo::default());

        // Interleave enqueues with drains; the hard cap never trips.
        for round in 0..20 {
            store.enqueue(&session.id, json!({"round": round})).unwrap();
            let _ = session.next_message().await;
        }
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn next_message_wakes_on_enqueue() {
        let store = Arc::new(store_with(SessionConfig::default()));
        let session = store.create(ClientInfo::default());

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.next_message().await })
        };
        tokio::task::yield_now().await;
        store.enqueue(&session.id, json!({"hello": true})).unwrap();

        let got = waiter.await.unwrap();
        assert_eq!(got.unwrap(), json!({"hello": true}));
    }

    #[test]
    fn detach_is_idempotent_and_tracks_grace() {
        let store = store_with(SessionConfig::default());
        let session = store.create(ClientInfo::default());

        let sink = store.attach_sink(&session.id).unwrap();
        assert_eq!(session.sink_count(), 1);
        assert!(session.detached_for().is_none());

        store.detach_sink(&session.id, sink);
        store.detach_sink(&session.id, sink);
        assert_eq!(session.sink_count(), 0);
        assert!(session.detached_for().is_some());
    }

    #[test]
    fn sweep_closes_detached_sessions_after_grace() {
        let config = SessionConfig {
            detach_grace: Duration::from_millis(0),
            ..SessionConfig::default()
        };
        let store = store_with(config);
        let session = store.create(ClientInfo::default());
        std::thread::sleep(Duration::from_millis(5));

        let closed = store.sweep();
        assert_eq!(closed, vec![session.id.clone()]);
        assert_eq!(session.close_reason(), Some(CloseReason::Detached));
    }

    #[test]
    fn close_is_idempotent() {
        let store = store_with(SessionConfig::default());
        let session = store.create(ClientInfo::default());

        store.close(&session.id, CloseReason::ClientRequested);
        store.close(&session.id, CloseReason::IdleTimeout);
        assert_eq!(session.close_reason(), Some(CloseReason::ClientRequested));
    }
}
