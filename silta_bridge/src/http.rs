//! HTTP transport: SSE stream, WebSocket upgrade, POST ingress, and
//! the health/control/OAuth endpoints.

use crate::broker::Broker;
use crate::child::ChildHealth;
use crate::config::{AuthMode, BridgeConfig};
use crate::content_filters::ContentFilterState;
use crate::error::BridgeError;
use crate::oauth;
use crate::rpc;
use crate::session::{ClientInfo, CloseReason, Session};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State, WebSocketUpgrade, ws},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response, Sse, sse::Event},
    routing::{delete, get, post},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::{Semaphore, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

pub struct AppState {
    pub broker: Arc<Broker>,
    pub config: BridgeConfig,
    pub in_flight: Semaphore,
    pub content_state: Option<ContentFilterState>,
}

pub type SharedState = Arc<AppState>;

pub fn build_router(state: SharedState) -> Router {
    // Axum's implicit body cap (~2 MiB) is below max_message_bytes;
    // raise it past the configured limit, with headroom so the
    // ingress handler's own size check answers with the JSON-RPC
    // error body.
    let body_limit = axum::extract::DefaultBodyLimit::max(state.config.max_message_bytes + 4096);
    Router::new()
        .route("/sse", get(handle_sse))
        .route("/messages", post(handle_messages))
        .route("/ws", get(handle_ws))
        .route("/sessions", post(create_session))
        .route("/sessions/{id}", delete(delete_session))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/filters", get(list_filters))
        .route("/filters/config", post(update_filter_config))
        .route("/filters/metrics", get(filter_metrics))
        .route("/filters/{name}", post(toggle_filter))
        .route("/live", get(live_console))
        .route(
            "/.well-known/oauth-authorization-server",
            get(oauth_authorization_server),
        )
        .route(
            "/.well-known/oauth-protected-resource",
            get(oauth_protected_resource),
        )
        .route("/register", post(register_client))
        .route("/no-registration-required", post(register_client))
        .route("/no-auth-required", get(no_auth_required).post(no_auth_required))
        .layer(body_limit)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves, then close every
/// session and stop the child.
pub async fn serve(
    state: SharedState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(state.config.bind_addr)
        .await
        .map_err(|e| BridgeError::HttpServer(format!("failed to bind: {e}")))?;
    info!("bridge listening on http://{}", state.config.bind_addr);

    let app = build_router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| BridgeError::HttpServer(format!("server error: {e}")))?;

    info!("shutting down: closing sessions and child");
    state.broker.sessions.close_all(CloseReason::Shutdown);
    state.broker.shutdown_child();
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session: Option<String>,
}

fn json_response(status: StatusCode, value: Value) -> Response {
    (status, Json(value)).into_response()
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Option<Response> {
    let expected = state.config.auth.secret.as_deref().unwrap_or("");
    let presented = match state.config.auth.mode {
        AuthMode::None => return None,
        AuthMode::Bearer => headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer ")),
        AuthMode::ApiKey => headers.get("x-api-key").and_then(|v| v.to_str().ok()),
    };
    if presented == Some(expected) {
        None
    } else {
        Some(json_response(
            StatusCode::UNAUTHORIZED,
            json!({"error": "unauthorized"}),
        ))
    }
}

/// Base URL clients should use to reach this bridge: the configured
/// advertise URL, else the request's Host header, else the bind
/// address.
fn advertise_base(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(url) = &state.config.advertise_url {
        return url.trim_end_matches('/').to_string();
    }
    if let Some(host) = headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
        return format!("http://{host}");
    }
    format!("http://{}", state.config.bind_addr)
}

fn client_info(headers: &HeaderMap) -> ClientInfo {
    ClientInfo {
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        remote_addr: None,
    }
}

/// Resolve the session named in the query, or create one.
fn resolve_session(
    state: &AppState,
    query: &SessionQuery,
    headers: &HeaderMap,
) -> Result<Arc<Session>, Response> {
    match &query.session {
        Some(id) => state.broker.sessions.get(id).ok_or_else(|| {
            json_response(StatusCode::NOT_FOUND, json!({"error": "session not found"}))
        }),
        None => Ok(state.broker.sessions.create(client_info(headers))),
    }
}

// --- SSE ---

async fn handle_sse(
    State(state): State<SharedState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response {
    if let Some(denied) = authorize(&state, &headers) {
        return denied;
    }
    let session = match resolve_session(&state, &query, &headers) {
        Ok(session) => session,
        Err(denied) => return denied,
    };
    let sink_id = match state.broker.sessions.attach_sink(&session.id) {
        Ok(id) => id,
        Err(_) => {
            return json_response(StatusCode::NOT_FOUND, json!({"error": "session not found"}));
        }
    };

    let post_url = format!(
        "{}/messages?session={}",
        advertise_base(&state, &headers),
        session.id
    );
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);
    tokio::spawn(sse_pump(state.clone(), session, sink_id, tx, post_url));

    let mut response = Sse::new(ReceiverStream::new(rx)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
    response.headers_mut().insert(
        header::CONNECTION,
        header::HeaderValue::from_static("keep-alive"),
    );
    response
}

/// Drains one session queue into one SSE stream: endpoint event
/// first, then messages, heartbeat comments in between, a final end
/// event when the session closes.
async fn sse_pump(
    state: SharedState,
    session: Arc<Session>,
    sink_id: u64,
    tx: mpsc::Sender<Result<Event, Infallible>>,
    post_url: String,
) {
    let endpoint = Event::default().event("endpoint").data(post_url);
    if tx.send(Ok(endpoint)).await.is_err() {
        state.broker.sessions.detach_sink(&session.id, sink_id);
        return;
    }

    let period = state.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            message = session.next_message() => match message {
                Some(message) => {
                    let event = Event::default().event("message").data(message.to_string());
                    if tx.send(Ok(event)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let reason = session
                        .close_reason()
                        .map(|r| r.as_str())
                        .unwrap_or("closed");
                    let event = Event::default()
                        .event("end")
                        .data(json!({"reason": reason}).to_string());
                    let _ = tx.send(Ok(event)).await;
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if tx.send(Ok(Event::default().comment("heartbeat"))).await.is_err() {
                    break;
                }
            }
        }
    }
    state.broker.sessions.detach_sink(&session.id, sink_id);
}

// --- POST ingress ---

async fn handle_messages(
    State(state): State<SharedState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(denied) = authorize(&state, &headers) {
        return denied;
    }
    let Some(session_id) = query.session else {
        return json_response(
            StatusCode::BAD_REQUEST,
            json!({"error": "missing session query parameter"}),
        );
    };

    let Ok(_permit) = state.in_flight.try_acquire() else {
        state
            .broker
            .metrics
            .http_rejected_in_flight
            .fetch_add(1, Ordering::Relaxed);
        return json_response(StatusCode::TOO_MANY_REQUESTS, json!({"error": "too many requests"}));
    };

    if body.len() > state.config.max_message_bytes {
        state
            .broker
            .metrics
            .http_rejected_too_large
            .fetch_add(1, Ordering::Relaxed);
        return json_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            json!({"error": "message exceeds size limit"}),
        );
    }

    let message: Value = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            debug!("rejecting unparseable message: {e}");
            return json_response(
                StatusCode::BAD_REQUEST,
                rpc::error_response(Value::Null, rpc::PARSE_ERROR, "parse error", None),
            );
        }
    };

    match state.broker.route_from_client(&session_id, message).await {
        Ok(()) => json_response(StatusCode::ACCEPTED, json!({"status": "accepted"})),
        Err(BridgeError::SessionNotFound(_)) => {
            json_response(StatusCode::NOT_FOUND, json!({"error": "session not found"}))
        }
        Err(e) => {
            warn!("failed to route client message: {e}");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": e.to_string()}),
            )
        }
    }
}

// --- WebSocket ---

async fn handle_ws(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response {
    if let Some(denied) = authorize(&state, &headers) {
        return denied;
    }
    let session = match resolve_session(&state, &query, &headers) {
        Ok(session) => session,
        Err(denied) => return denied,
    };
    ws.on_upgrade(move |socket| handle_socket(state, session, socket))
}

async fn handle_socket(state: SharedState, session: Arc<Session>, socket: ws::WebSocket) {
    let sink_id = match state.broker.sessions.attach_sink(&session.id) {
        Ok(id) => id,
        Err(_) => return,
    };
    info!(session_id = %session.id, "websocket connected");

    let (mut sender, mut receiver) = socket.split();
    let period = state.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut missed_pongs = 0u32;

    loop {
        tokio::select! {
            message = session.next_message() => match message {
                Some(message) => {
                    let frame = ws::Message::Text(message.to_string().into());
                    if sender.send(frame).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sender
                        .send(ws::Message::Close(Some(ws::CloseFrame {
                            code: 1001,
                            reason: session
                                .close_reason()
                                .map(|r| r.as_str())
                                .unwrap_or("closed")
                                .into(),
                        })))
                        .await;
                    break;
                }
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(ws::Message::Text(text))) => {
                    match serde_json::from_str::<Value>(&text) {
                        Ok(message) => {
                            if let Err(e) = state
                                .broker
                                .route_from_client(&session.id, message)
                                .await
                            {
                                debug!(session_id = %session.id, "ws route failed: {e}");
                                break;
                            }
                        }
                        Err(_) => {
                            let _ = state.broker.sessions.enqueue(
                                &session.id,
                                rpc::error_response(
                                    Value::Null,
                                    rpc::PARSE_ERROR,
                                    "parse error",
                                    None,
                                ),
                            );
                        }
                    }
                }
                Some(Ok(ws::Message::Pong(_))) => {
                    missed_pongs = 0;
                }
                Some(Ok(ws::Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session_id = %session.id, "websocket error: {e}");
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if missed_pongs >= 2 {
                    warn!(session_id = %session.id, "websocket missed two pongs, disconnecting");
                    break;
                }
                missed_pongs += 1;
                if sender.send(ws::Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.broker.sessions.detach_sink(&session.id, sink_id);
    info!(session_id = %session.id, "websocket disconnected");
}

// --- Session management ---

async fn create_session(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Response {
    if let Some(denied) = authorize(&state, &headers) {
        return denied;
    }
    let session = state.broker.sessions.create(client_info(&headers));
    json_response(StatusCode::OK, json!({"session_id": session.id}))
}

async fn delete_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Some(denied) = authorize(&state, &headers) {
        return denied;
    }
    if state.broker.sessions.get(&id).is_none() {
        return json_response(StatusCode::NOT_FOUND, json!({"error": "session not found"}));
    }
    state.broker.close_session(&id, CloseReason::ClientRequested);
    json_response(StatusCode::OK, json!({"status": "closed"}))
}

// --- Health, metrics, filter control ---

async fn handle_health(State(state): State<SharedState>) -> Response {
    let child_state = state.broker.child_health();
    let status = match child_state {
        ChildHealth::Ready => "ok",
        ChildHealth::Starting | ChildHealth::Degraded => "degraded",
        ChildHealth::Dead | ChildHealth::Terminal => "dead",
    };
    json_response(
        StatusCode::OK,
        json!({
            "status": status,
            "child_state": child_state.as_str(),
            "session_count": state.broker.sessions.count(),
            "pending_requests": state.broker.registry.len(),
            "filter_count": state.broker.filters.len(),
            "queue_depth": state.broker.sessions.total_queue_depth(),
            "uptime_s": state.broker.metrics.uptime_secs(),
            "content_filtering": {
                "enabled": state.content_state.is_some(),
                "filters": state
                    .broker
                    .filters
                    .describe()
                    .iter()
                    .map(|f| f.name.clone())
                    .collect::<Vec<_>>(),
            },
        }),
    )
}

async fn handle_metrics(State(state): State<SharedState>) -> Response {
    json_response(StatusCode::OK, state.broker.metrics.snapshot())
}

async fn list_filters(State(state): State<SharedState>) -> Response {
    json_response(
        StatusCode::OK,
        serde_json::to_value(state.broker.filters.describe()).unwrap_or_default(),
    )
}

#[derive(Debug, Deserialize)]
struct ToggleBody {
    enabled: bool,
}

async fn toggle_filter(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(body): Json<ToggleBody>,
) -> Response {
    if state.broker.filters.set_enabled(&name, body.enabled) {
        info!(filter = %name, enabled = body.enabled, "filter toggled");
        json_response(StatusCode::OK, json!({"name": name, "enabled": body.enabled}))
    } else {
        json_response(StatusCode::NOT_FOUND, json!({"error": "unknown filter"}))
    }
}

async fn update_filter_config(
    State(state): State<SharedState>,
    Json(document): Json<Value>,
) -> Response {
    let Some(content_state) = &state.content_state else {
        return json_response(
            StatusCode::NOT_FOUND,
            json!({"error": "content filtering is not enabled"}),
        );
    };
    match content_state.reload(document) {
        Ok(()) => {
            info!("filter config reloaded");
            json_response(StatusCode::OK, json!({"status": "ok"}))
        }
        Err(e) => json_response(StatusCode::BAD_REQUEST, json!({"error": e.to_string()})),
    }
}

async fn filter_metrics(State(state): State<SharedState>) -> Response {
    json_response(StatusCode::OK, state.broker.metrics.filter_snapshot())
}

// --- OAuth metadata (no-auth mode) ---

async fn oauth_authorization_server(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Response {
    let base = advertise_base(&state, &headers);
    json_response(
        StatusCode::OK,
        serde_json::to_value(oauth::authorization_server_metadata(&base)).unwrap_or_default(),
    )
}

async fn oauth_protected_resource(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Response {
    let base = advertise_base(&state, &headers);
    json_response(StatusCode::OK, oauth::protected_resource_metadata(&base))
}

async fn register_client(body: Bytes) -> Response {
    let parsed = serde_json::from_slice::<Value>(&body).ok();
    json_response(StatusCode::OK, oauth::registration_response(parsed.as_ref()))
}

async fn no_auth_required() -> Response {
    json_response(StatusCode::OK, oauth::no_auth_required_response())
}

// --- Live console ---

const LIVE_CONSOLE: &str = include_str!("live.html");

async fn live_console() -> Html<&'static str> {
    Html(LIVE_CONSOLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn router_serves_health_without_a_network() {
        use tower::util::ServiceExt;

        let app = build_router(Arc::new(test_state(BridgeConfig::default())));
        let request = axum::http::Request::builder()
            .uri("/health")
            .body(axum::body::Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn advertise_url_beats_host_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "proxy.example:8080".parse().unwrap());

        // advertise_base only touches config, so a default state with
        // the field set is enough.
        let config = BridgeConfig {
            advertise_url: Some("https://bridge.example/".to_string()),
            ..BridgeConfig::default()
        };
        let state = test_state(config);
        assert_eq!(advertise_base(&state, &headers), "https://bridge.example");

        let state = test_state(BridgeConfig::default());
        assert_eq!(advertise_base(&state, &headers), "http://proxy.example:8080");
        assert_eq!(
            advertise_base(&state, &HeaderMap::new()),
            "http://127.0.0.1:3000"
        );
    }

    fn test_state(config: BridgeConfig) -> AppState {
        use crate::broker::{Broker, BrokerConfig};
        use crate::catalog::Catalog;
        use crate::child::ChildHandle;
        use crate::filter::FilterChain;
        use crate::metrics::Metrics;
        use crate::registry::RequestRegistry;
        use crate::session::{SessionConfig, SessionStore};

        let metrics = Arc::new(Metrics::new());
        let (child, _stdin_rx, _health) = ChildHandle::test_pair();
        let broker = Arc::new(Broker::new(
            Arc::new(SessionStore::new(SessionConfig::default(), metrics.clone())),
            Arc::new(RequestRegistry::new()),
            Arc::new(FilterChain::new(metrics.clone())),
            Arc::new(Catalog::empty()),
            child,
            metrics,
            BrokerConfig::default(),
        ));
        AppState {
            broker,
            in_flight: Semaphore::new(config.max_in_flight),
            config,
            content_state: None,
        }
    }
}
