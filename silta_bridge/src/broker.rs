//! The broker: coordinates sessions, registry, filters, catalog, and
//! the supervised child.
//!
//! Two entry points carry all traffic: `route_from_client` (transport
//! ingress) and `route_from_upstream` (child stdout, via the
//! supervisor's event stream). Everything a client ever receives is
//! enqueued on its session and drained by its attached sinks.

use crate::catalog::Catalog;
use crate::child::{ChildHandle, ChildHealth, UpstreamEvent};
use crate::error::{BridgeError, Result};
use crate::filter::{ChainOutcome, Direction, FilterChain};
use crate::metrics::Metrics;
use crate::registry::RequestRegistry;
use crate::rpc;
use crate::session::{CloseReason, SessionStore};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How the bridge treats a client `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializeMode {
    /// Answer locally only.
    Local,
    /// Forward to the child like any other request.
    Forward,
    /// Answer locally and forward fire-and-forget.
    Both,
}

/// What to do with a server-initiated request (`id` + `method` from
/// the child).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRequestPolicy {
    Broadcast,
    Drop,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub request_deadline: Duration,
    pub initialize_mode: InitializeMode,
    pub server_request_policy: ServerRequestPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            request_deadline: Duration::from_secs(60),
            initialize_mode: InitializeMode::Both,
            server_request_policy: ServerRequestPolicy::Broadcast,
        }
    }
}

pub struct Broker {
    pub sessions: Arc<SessionStore>,
    pub registry: Arc<RequestRegistry>,
    pub filters: Arc<FilterChain>,
    pub catalog: Arc<Catalog>,
    child: ChildHandle,
    pub metrics: Arc<Metrics>,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(
        sessions: Arc<SessionStore>,
        registry: Arc<RequestRegistry>,
        filters: Arc<FilterChain>,
        catalog: Arc<Catalog>,
        child: ChildHandle,
        metrics: Arc<Metrics>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            sessions,
            registry,
            filters,
            catalog,
            child,
            metrics,
            config,
        }
    }

    pub fn child_health(&self) -> ChildHealth {
        self.child.health()
    }

    /// Ask the supervisor to stop the child: stdin closes, then the
    /// process is killed after the grace period.
    pub fn shutdown_child(&self) {
        self.child.shutdown();
    }

    /// The capabilities object the bridge itself answers `initialize`
    /// with.
    fn local_capabilities(&self) -> Value {
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": {},
                "prompts": {},
            },
            "serverInfo": {
                "name": "silta_bridge",
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
    }

    /// Ingress from a transport. Any reply the client should see,
    /// including synthesized errors, lands on the session queue.
    pub async fn route_from_client(&self, session_id: &str, message: Value) -> Result<()> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?;
        session.touch();
        self.metrics
            .messages_from_clients
            .fetch_add(1, Ordering::Relaxed);

        if let Err(reason) = rpc::validate_envelope(&message) {
            let id = message.get("id").cloned().unwrap_or(Value::Null);
            self.enqueue(
                session_id,
                rpc::error_response(id, rpc::INVALID_REQUEST, reason, None),
            );
            return Ok(());
        }

        if let Some(method) = rpc::method(&message) {
            if method == "initialize" && self.config.initialize_mode != InitializeMode::Forward {
                return self.handle_initialize(session_id, message).await;
            }
            if Catalog::is_discovery_method(method)
                && let Some(result) = self.catalog.lookup(method)
            {
                debug!(session_id, method, "discovery answered from catalog");
                self.metrics
                    .discovery_short_circuits
                    .fetch_add(1, Ordering::Relaxed);
                let id = message.get("id").cloned().unwrap_or(Value::Null);
                self.enqueue(session_id, rpc::result_response(id, result));
                return Ok(());
            }
        }

        let was_request = rpc::is_request(&message);
        let original_id = message.get("id").cloned().unwrap_or(Value::Null);
        let message = match self.filters.run(Direction::Outbound, session_id, message) {
            ChainOutcome::Deliver(message) => message,
            ChainOutcome::Dropped { filter, reason } => {
                debug!(session_id, %filter, %reason, "outbound message dropped by filter");
                return Ok(());
            }
            ChainOutcome::Blocked { filter, error } => {
                debug!(session_id, %filter, "outbound message blocked by filter");
                if was_request {
                    self.enqueue(
                        session_id,
                        json!({"jsonrpc": "2.0", "id": original_id, "error": error}),
                    );
                }
                return Ok(());
            }
        };

        self.forward(session_id, message).await
    }

    async fn handle_initialize(&self, session_id: &str, message: Value) -> Result<()> {
        let id = message.get("id").cloned().unwrap_or(Value::Null);
        self.enqueue(
            session_id,
            rpc::result_response(id, self.local_capabilities()),
        );

        if self.config.initialize_mode == InitializeMode::Both
            && self.child.health() != ChildHealth::Terminal
        {
            // Fire-and-forget: the child runs its own setup, but the
            // response the client sees is the bridge's. The forwarded
            // copy gets a discard-tracked bridge id, so the child's
            // answer is dropped quietly.
            let mut forwarded = message;
            forwarded["id"] = json!(self.registry.allocate_discard_id());
            match serde_json::to_string(&forwarded) {
                Ok(line) => {
                    let _ = self.child.send_line(line).await;
                }
                Err(e) => warn!("failed to serialize forwarded initialize: {e}"),
            }
        }
        Ok(())
    }

    /// Rewrite ids where needed and hand the message to the child.
    async fn forward(&self, session_id: &str, mut message: Value) -> Result<()> {
        let is_request = rpc::is_request(&message);
        let original_id = message.get("id").cloned().unwrap_or(Value::Null);

        if self.child.health() == ChildHealth::Terminal {
            if is_request {
                self.enqueue(
                    session_id,
                    rpc::error_response(
                        original_id,
                        rpc::UPSTREAM_UNAVAILABLE,
                        "upstream unavailable",
                        None,
                    ),
                );
            }
            return Ok(());
        }

        let mut bridge_id = None;
        if is_request {
            let method = rpc::method(&message).unwrap_or_default().to_string();
            let id = self.registry.register(
                session_id,
                original_id.clone(),
                &method,
                self.config.request_deadline,
            );
            message["id"] = json!(id);
            bridge_id = Some(id);
        }

        let line = serde_json::to_string(&message)?;
        if self.child.send_line(line).await.is_err() {
            if let Some(id) = bridge_id {
                self.registry.resolve(id);
                self.enqueue(
                    session_id,
                    rpc::error_response(
                        original_id,
                        rpc::UPSTREAM_UNAVAILABLE,
                        "upstream unavailable",
                        None,
                    ),
                );
            }
        }
        Ok(())
    }

    /// Ingress from the child's stdout.
    pub async fn route_from_upstream(&self, message: Value) {
        self.metrics
            .messages_from_upstream
            .fetch_add(1, Ordering::Relaxed);

        let has_method = message.get("method").is_some();
        let has_id = !message.get("id").unwrap_or(&Value::Null).is_null();

        match (has_method, has_id) {
            // Response: correlate back to the originating session.
            (false, true) => self.deliver_response(message),
            // Notification: one copy per live session.
            (true, false) => self.broadcast(message),
            // Server-initiated request.
            (true, true) => match self.config.server_request_policy {
                ServerRequestPolicy::Broadcast => self.broadcast(message),
                ServerRequestPolicy::Drop => {
                    debug!("dropping server-initiated request per policy");
                }
            },
            (false, false) => {
                warn!("unclassifiable message from upstream, dropping");
            }
        }
    }

    fn deliver_response(&self, mut message: Value) {
        let Some(bridge_id) = message.get("id").and_then(|i| i.as_u64()) else {
            self.metrics.registry_misses.fetch_add(1, Ordering::Relaxed);
            self.child.mark_unresolvable_response();
            warn!(id = %message["id"], "response with non-bridge id, dropping");
            return;
        };
        if self.registry.take_discard(bridge_id) {
            debug!(bridge_id, "discarding response to fire-and-forget forward");
            return;
        }
        let Some(entry) = self.registry.resolve(bridge_id) else {
            self.metrics.registry_misses.fetch_add(1, Ordering::Relaxed);
            self.child.mark_unresolvable_response();
            warn!(bridge_id, "response for unknown request, dropping");
            return;
        };

        message["id"] = entry.original_id.clone();
        match self
            .filters
            .run(Direction::Inbound, &entry.session_id, message)
        {
            ChainOutcome::Deliver(message) => {
                self.metrics
                    .responses_delivered
                    .fetch_add(1, Ordering::Relaxed);
                self.enqueue(&entry.session_id, message);
            }
            ChainOutcome::Dropped { filter, reason } => {
                debug!(
                    session_id = %entry.session_id,
                    %filter, %reason, "inbound response dropped by filter"
                );
            }
            ChainOutcome::Blocked { filter, error } => {
                debug!(
                    session_id = %entry.session_id,
                    %filter, "inbound response blocked by filter"
                );
                self.enqueue(
                    &entry.session_id,
                    json!({"jsonrpc": "2.0", "id": entry.original_id, "error": error}),
                );
            }
        }
    }

    fn broadcast(&self, message: Value) {
        self.metrics
            .notifications_broadcast
            .fetch_add(1, Ordering::Relaxed);
        for session_id in self.sessions.ids() {
            match self
                .filters
                .run(Direction::Inbound, &session_id, message.clone())
            {
                ChainOutcome::Deliver(copy) => self.enqueue(&session_id, copy),
                ChainOutcome::Dropped { .. } | ChainOutcome::Blocked { .. } => {}
            }
        }
    }

    fn enqueue(&self, session_id: &str, message: Value) {
        if let Err(e) = self.sessions.enqueue(session_id, message) {
            debug!(session_id, "enqueue failed: {e}");
            // The session is gone; whatever it was still waiting for
            // is dropped silently.
            self.registry.drop_session(session_id);
        }
    }

    /// Close a session and scrub its pending requests.
    pub fn close_session(&self, session_id: &str, reason: CloseReason) {
        self.sessions.close(session_id, reason);
        self.registry.drop_session(session_id);
    }

    /// Fail every pending request back to its session.
    pub fn fail_all_pending(&self, code: i32, message: &str) {
        for entry in self.registry.drain_all() {
            self.enqueue(
                &entry.session_id,
                rpc::error_response(entry.original_id, code, message, None),
            );
        }
    }

    /// Consume supervisor events until the channel closes. The
    /// terminal notifier carries `start_failed` so the binary can map
    /// it to the right exit code.
    pub async fn run_upstream_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<UpstreamEvent>,
        terminal_tx: tokio::sync::watch::Sender<Option<bool>>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                UpstreamEvent::Message(message) => self.route_from_upstream(message).await,
                UpstreamEvent::Ready { initialize_result } => {
                    info!("upstream child ready");
                    if let Some(result) = initialize_result {
                        self.catalog.absorb_initialize_result(&result);
                    }
                }
                UpstreamEvent::Restarting => {
                    warn!("upstream child restarting, failing pending requests");
                    self.fail_all_pending(rpc::UPSTREAM_RESTARTED, "upstream restarted");
                }
                UpstreamEvent::Terminal { start_failed } => {
                    warn!(start_failed, "upstream child terminal");
                    self.fail_all_pending(rpc::UPSTREAM_UNAVAILABLE, "upstream unavailable");
                    let _ = terminal_tx.send(Some(start_failed));
                }
            }
        }
    }

    /// Periodic housekeeping: request deadlines and session GC.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                for entry in broker.registry.sweep_expired(Instant::now()) {
                    broker
                        .metrics
                        .request_timeouts
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        session_id = %entry.session_id,
                        method = %entry.method,
                        "request deadline expired"
                    );
                    broker.enqueue(
                        &entry.session_id,
                        rpc::error_response(entry.original_id, rpc::TIMEOUT, "timeout", None),
                    );
                }
                for session_id in broker.sessions.sweep() {
                    broker.registry.drop_session(&session_id);
                }
            }
        })
    }
}
