//! # Silta Bridge
//!
//! A protocol bridge that exposes a long-lived stdio JSON-RPC (MCP)
//! server subprocess over modern network transports: Server-Sent
//! Events, WebSocket, and HTTP POST.
//!
//! ## Architecture
//!
//! *   **Child supervisor**: one upstream subprocess, spawned and
//!     health-checked at boot, restarted with exponential backoff on
//!     crash. All stdin writes go through a single writer task.
//! *   **Broker**: maps many concurrent network sessions onto the one
//!     child, rewriting JSON-RPC ids so responses return to the
//!     session that asked, and broadcasting notifications to all.
//! *   **Discovery short-circuit**: `tools/list`, `resources/list`,
//!     and `prompts/list` are answered from a bridge-held catalog
//!     without waiting on the child.
//! *   **Filter chain**: ordered, named, runtime-toggleable message
//!     transformers with direction awareness, from secret redaction
//!     to the optional content-filter suite (blacklist, HTML
//!     sanitizer, PII redactor, size manager).
//! *   **OAuth metadata surface**: enough of an OAuth 2.1 discovery
//!     document that strict clients will open an SSE session without
//!     a real identity provider.
//!
//! ## Example
//!
//! ```rust,no_run
//! use silta_bridge::config::BridgeConfig;
//! use silta_bridge::child::ChildConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig {
//!         bind_addr: "127.0.0.1:3000".parse().unwrap(),
//!         child: ChildConfig {
//!             command: "my-mcp-server --stdio".to_string(),
//!             ..ChildConfig::default()
//!         },
//!         ..BridgeConfig::default()
//!     };
//!     silta_bridge::run(config).await?;
//!     Ok(())
//! }
//! ```

/// The central coordinator between sessions and the child.
pub mod broker;
/// Discovery catalog answered without the child.
pub mod catalog;
/// Child-process supervision.
pub mod child;
/// Bridge configuration.
pub mod config;
/// Optional content-filter middleware.
pub mod content_filters;
/// Error types for bridge operations.
pub mod error;
/// The message filter chain and its built-in filters.
pub mod filter;
/// Newline-delimited JSON framing over stdio.
pub mod framing;
/// HTTP transport: SSE, WebSocket, POST ingress, control endpoints.
pub mod http;
/// Process-wide counters.
pub mod metrics;
/// No-auth OAuth metadata endpoints.
pub mod oauth;
/// In-flight request registry.
pub mod registry;
/// JSON-RPC envelope helpers.
pub mod rpc;
/// Session store and backpressure policy.
pub mod session;

pub use error::{BridgeError, Result};

use crate::broker::Broker;
use crate::catalog::Catalog;
use crate::config::BridgeConfig;
use crate::content_filters::{ContentFilterConfig, ContentFilterState, register_content_filters};
use crate::filter::{AddBridgeMetaFilter, DirectionMask, FilterChain, RedactSecretsFilter};
use crate::http::{AppState, SharedState};
use crate::metrics::Metrics;
use crate::registry::RequestRegistry;
use crate::session::SessionStore;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};

/// Everything `run` wires together, exposed so embedders and tests
/// can drive the bridge without the binary.
pub struct Bridge {
    pub state: SharedState,
    pub terminal_rx: watch::Receiver<Option<bool>>,
}

/// Assemble a bridge: supervisor, broker, filters, HTTP state.
pub fn build(config: BridgeConfig) -> Result<Bridge> {
    let metrics = Arc::new(Metrics::new());

    if let Some(advertise) = &config.advertise_url {
        url::Url::parse(advertise).map_err(|e| {
            BridgeError::InvalidConfig(format!("invalid advertise url {advertise:?}: {e}"))
        })?;
    }

    let catalog = match &config.tools_config {
        Some(path) => Catalog::load_from_file(path)?,
        None => Catalog::empty(),
    };

    let content_config = match &config.filter_config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            let parsed: ContentFilterConfig = serde_json::from_str(&contents)
                .map_err(|e| BridgeError::InvalidConfig(format!("{}: {e}", path.display())))?;
            Some(parsed)
        }
        None if config.content_filters => Some(ContentFilterConfig::default()),
        None => None,
    };
    let content_state = content_config
        .map(ContentFilterState::new)
        .transpose()?;

    let mut filters = FilterChain::new(metrics.clone()).with_body_logging(config.audit_bodies);
    let secret_patterns = content_state
        .as_ref()
        .map(|s| s.snapshot().config.secret_patterns.clone())
        .unwrap_or_default();
    filters.register(
        Arc::new(RedactSecretsFilter::new(&secret_patterns)),
        true,
        DirectionMask::Both,
    );
    filters.register(
        Arc::new(AddBridgeMetaFilter::new(uuid::Uuid::new_v4().to_string())),
        false,
        DirectionMask::Both,
    );
    if let Some(state) = &content_state {
        register_content_filters(&mut filters, state, &metrics);
    }

    let sessions = Arc::new(SessionStore::new(config.session.clone(), metrics.clone()));
    let registry = Arc::new(RequestRegistry::new());

    let (child, events) = child::spawn_supervisor(config.child.clone(), metrics.clone());
    let broker = Arc::new(Broker::new(
        sessions,
        registry,
        Arc::new(filters),
        Arc::new(catalog),
        child,
        metrics,
        config.broker.clone(),
    ));

    let (terminal_tx, terminal_rx) = watch::channel(None);
    tokio::spawn(broker.clone().run_upstream_loop(events, terminal_tx));
    broker.spawn_sweeper();

    let state = Arc::new(AppState {
        broker,
        in_flight: Semaphore::new(config.max_in_flight),
        config,
        content_state,
    });
    Ok(Bridge { state, terminal_rx })
}

/// Build and serve until SIGINT/SIGTERM.
pub async fn run(config: BridgeConfig) -> Result<()> {
    let bridge = build(config)?;
    http::serve(bridge.state, shutdown_signal()).await
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
