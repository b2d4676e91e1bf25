//! Child-process supervisor.
//!
//! Owns the single upstream stdio JSON-RPC server: spawns it, probes
//! it with an `initialize` request, feeds its stdin from one writer
//! task (so write order equals submission order), parses its stdout
//! through the framing codec, and drains stderr to the log. On crash
//! it notifies the broker so pending requests fail fast, then
//! respawns with exponential backoff until the restart budget runs
//! out, after which the bridge serves discovery only.

use crate::error::BridgeError;
use crate::framing::{DEFAULT_MAX_FRAME_BYTES, FrameReader, FrameWriter};
use crate::metrics::Metrics;
use owo_colors::OwoColorize;
use serde_json::{Value, json};
use silta_common::StateMachine;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildHealth {
    Starting,
    Ready,
    Degraded,
    Dead,
    Terminal,
}

impl ChildHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildHealth::Starting => "starting",
            ChildHealth::Ready => "ready",
            ChildHealth::Degraded => "degraded",
            ChildHealth::Dead => "dead",
            ChildHealth::Terminal => "terminal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChildConfig {
    /// Shell command line; run through `sh -c`.
    pub command: String,
    pub working_dir: Option<std::path::PathBuf>,
    pub env: Vec<(String, String)>,
    pub max_frame_bytes: usize,
    pub health_check_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_restarts_per_window: u32,
    pub restart_window: Duration,
    pub degraded_recovery: Duration,
    pub grace_shutdown: Duration,
    /// Echo child I/O to stderr in color (debug aid).
    pub colored_output: bool,
}

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            working_dir: None,
            env: Vec::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            health_check_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_restarts_per_window: 5,
            restart_window: Duration::from_secs(300),
            degraded_recovery: Duration::from_secs(30),
            grace_shutdown: Duration::from_secs(10),
            colored_output: false,
        }
    }
}

/// What the supervisor reports to the broker.
#[derive(Debug)]
pub enum UpstreamEvent {
    /// A parsed message off the child's stdout.
    Message(Value),
    /// Health probe succeeded; the `initialize` result may seed the
    /// discovery catalog.
    Ready { initialize_result: Option<Value> },
    /// The child died; every pending request must be failed.
    Restarting,
    /// No more restarts. `start_failed` distinguishes a child that
    /// never came up from an exhausted restart budget.
    Terminal { start_failed: bool },
}

/// Broker-facing handle to the supervised child.
#[derive(Clone)]
pub struct ChildHandle {
    stdin_tx: mpsc::Sender<String>,
    health: Arc<StateMachine<ChildHealth>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ChildHandle {
    pub fn health(&self) -> ChildHealth {
        self.health.snapshot()
    }

    /// An unresolvable response degrades a ready child, the same
    /// advisory transition as a single framing error.
    pub fn mark_unresolvable_response(&self) {
        self.health.transition(|s| {
            if *s == ChildHealth::Ready {
                *s = ChildHealth::Degraded;
            }
        });
    }

    /// Queue one serialized line for the child's stdin. Lines are
    /// written in submission order by the single writer task.
    pub async fn send_line(&self, line: String) -> crate::error::Result<()> {
        self.stdin_tx
            .send(line)
            .await
            .map_err(|_| BridgeError::ChildUnavailable)
    }

    /// Begin graceful shutdown: stdin closes, then the child is
    /// killed after the grace period.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// A handle wired to nothing, for exercising the broker without a
    /// process: the returned receiver plays the child's stdin and the
    /// state machine lets tests steer health.
    #[cfg(test)]
    pub(crate) fn test_pair() -> (
        Self,
        mpsc::Receiver<String>,
        Arc<StateMachine<ChildHealth>>,
    ) {
        let (stdin_tx, stdin_rx) = mpsc::channel(64);
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let health = Arc::new(StateMachine::new(ChildHealth::Ready));
        (
            Self {
                stdin_tx,
                health: health.clone(),
                shutdown_tx,
            },
            stdin_rx,
            health,
        )
    }
}

/// Spawn the supervisor task. Returns the handle and the event stream
/// the broker consumes.
pub fn spawn_supervisor(
    config: ChildConfig,
    metrics: Arc<Metrics>,
) -> (ChildHandle, mpsc::Receiver<UpstreamEvent>) {
    let (stdin_tx, stdin_rx) = mpsc::channel::<String>(256);
    let (events_tx, events_rx) = mpsc::channel::<UpstreamEvent>(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health = Arc::new(StateMachine::new(ChildHealth::Starting));

    let handle = ChildHandle {
        stdin_tx,
        health: health.clone(),
        shutdown_tx,
    };

    tokio::spawn(supervise(
        config,
        stdin_rx,
        events_tx,
        health,
        metrics,
        shutdown_rx,
    ));

    (handle, events_rx)
}

fn spawn_child(config: &ChildConfig) -> std::io::Result<Child> {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&config.command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        command.current_dir(dir);
    }
    for (key, value) in &config.env {
        command.env(key, value);
    }
    command.spawn()
}

fn probe_request(probe_id: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": probe_id,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {
                "name": "silta_bridge",
                "version": env!("CARGO_PKG_VERSION"),
            },
        },
    })
}

async fn drain_stderr(stderr: tokio::process::ChildStderr, colored_output: bool) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        if colored_output {
            eprintln!("{} {}", "child stderr:".red(), line.red());
        }
        info!(target: "silta_bridge::child_stderr", "{line}");
    }
}

async fn supervise(
    config: ChildConfig,
    mut stdin_rx: mpsc::Receiver<String>,
    events: mpsc::Sender<UpstreamEvent>,
    health: Arc<StateMachine<ChildHealth>>,
    metrics: Arc<Metrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = config.initial_backoff;
    let mut window_start = Instant::now();
    let mut restarts_in_window = 0u32;
    let mut first_attempt = true;

    loop {
        health.transition(|s| *s = ChildHealth::Starting);
        info!(command = %config.command, "spawning upstream child");

        let mut child = match spawn_child(&config) {
            Ok(child) => child,
            Err(e) => {
                error!("failed to spawn child: {e}");
                if first_attempt {
                    health.transition(|s| *s = ChildHealth::Terminal);
                    let _ = events.send(UpstreamEvent::Terminal { start_failed: true }).await;
                    return;
                }
                if !budget_allows(
                    &config,
                    &mut window_start,
                    &mut restarts_in_window,
                ) {
                    health.transition(|s| *s = ChildHealth::Terminal);
                    let _ = events
                        .send(UpstreamEvent::Terminal { start_failed: false })
                        .await;
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.max_backoff);
                continue;
            }
        };

        let stdin = child.stdin.take().expect("child stdin must be piped");
        let stdout = child.stdout.take().expect("child stdout must be piped");
        let stderr = child.stderr.take().expect("child stderr must be piped");
        tokio::spawn(drain_stderr(stderr, config.colored_output));

        let mut writer = FrameWriter::new(stdin);
        let mut reader = FrameReader::new(stdout, config.max_frame_bytes);

        // Startup health probe: the child must answer a well-formed
        // initialize response within the deadline.
        let probe_id = format!("silta-probe-{}", Uuid::new_v4());
        let probe_ok = match writer.write_one(&probe_request(&probe_id)).await {
            Ok(()) => {
                let deadline = tokio::time::sleep(config.health_check_timeout);
                tokio::pin!(deadline);
                let mut result = None;
                loop {
                    tokio::select! {
                        frame = reader.read_one() => match frame {
                            Some(Ok(msg)) => {
                                if msg.get("id").and_then(|i| i.as_str()) == Some(probe_id.as_str()) {
                                    result = Some(msg);
                                    break;
                                }
                                // Startup chatter ahead of the probe
                                // response still reaches the broker.
                                let _ = events.send(UpstreamEvent::Message(msg)).await;
                            }
                            _ => break,
                        },
                        _ = &mut deadline => break,
                    }
                }
                result
            }
            Err(_) => None,
        };

        let Some(probe_response) = probe_ok else {
            warn!("health check failed");
            let _ = child.start_kill();
            let _ = child.wait().await;
            if first_attempt {
                health.transition(|s| *s = ChildHealth::Terminal);
                let _ = events.send(UpstreamEvent::Terminal { start_failed: true }).await;
                return;
            }
            health.transition(|s| *s = ChildHealth::Dead);
            if !budget_allows(&config, &mut window_start, &mut restarts_in_window) {
                health.transition(|s| *s = ChildHealth::Terminal);
                let _ = events
                    .send(UpstreamEvent::Terminal { start_failed: false })
                    .await;
                return;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(config.max_backoff);
            continue;
        };

        first_attempt = false;
        backoff = config.initial_backoff;
        health.transition(|s| *s = ChildHealth::Ready);
        info!("child ready");
        let _ = events
            .send(UpstreamEvent::Ready {
                initialize_result: probe_response.get("result").cloned(),
            })
            .await;

        let mut last_frame_error: Option<Instant> = None;

        // Serving loop: one writer, one reader, one waiter.
        loop {
            tokio::select! {
                queued = stdin_rx.recv() => {
                    // All handles dropped: the bridge is gone.
                    let Some(line) = queued else { return };
                    if config.colored_output {
                        eprintln!("{} {}", "→ child stdin:".cyan(), line.cyan());
                    }
                    debug!(bytes = line.len(), "forwarding line to child stdin");
                    if let Err(e) = writer.write_line(&line).await {
                        error!("failed to write to child stdin: {e}");
                        break;
                    }
                }
                frame = reader.read_one() => {
                    match frame {
                        Some(Ok(msg)) => {
                            if config.colored_output {
                                eprintln!("{} {}", "← child stdout:".green(), msg.to_string().green());
                            }
                            match last_frame_error {
                                Some(at) if at.elapsed() >= config.degraded_recovery => {
                                    last_frame_error = None;
                                    health.transition(|s| {
                                        if *s == ChildHealth::Degraded {
                                            *s = ChildHealth::Ready;
                                        }
                                    });
                                    info!("child recovered from degraded state");
                                }
                                // A degrade the supervisor did not
                                // record came from an unresolvable
                                // response; start the clean clock.
                                None if health.snapshot() == ChildHealth::Degraded => {
                                    last_frame_error = Some(Instant::now());
                                }
                                _ => {}
                            }
                            let _ = events.send(UpstreamEvent::Message(msg)).await;
                        }
                        Some(Err(BridgeError::FrameTooLarge { limit })) => {
                            metrics.frame_errors.fetch_add(1, Ordering::Relaxed);
                            error!(limit, "oversized frame on child stdout, restarting child");
                            break;
                        }
                        Some(Err(e)) => {
                            metrics.frame_errors.fetch_add(1, Ordering::Relaxed);
                            let second = health.transition(|s| match s {
                                ChildHealth::Degraded => true,
                                _ => {
                                    *s = ChildHealth::Degraded;
                                    false
                                }
                            });
                            if second {
                                error!("second framing failure while degraded, restarting child: {e}");
                                break;
                            }
                            warn!("framing error on child stdout, child degraded: {e}");
                            last_frame_error = Some(Instant::now());
                        }
                        None => {
                            warn!("child stdout closed");
                            break;
                        }
                    }
                }
                status = child.wait() => {
                    match status {
                        Ok(status) => warn!(%status, "child exited"),
                        Err(e) => error!("failed to await child: {e}"),
                    }
                    break;
                }
                _ = shutdown_rx.changed() => {
                    if !*shutdown_rx.borrow() {
                        continue;
                    }
                    info!("supervisor shutting down");
                    drop(writer);
                    if tokio::time::timeout(config.grace_shutdown, child.wait())
                        .await
                        .is_err()
                    {
                        warn!("child ignored stdin close, killing");
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                    return;
                }
            }
        }

        // The child is gone or unusable.
        health.transition(|s| *s = ChildHealth::Dead);
        metrics.child_restarts.fetch_add(1, Ordering::Relaxed);
        let _ = child.start_kill();
        let _ = child.wait().await;
        let _ = events.send(UpstreamEvent::Restarting).await;

        if !budget_allows(&config, &mut window_start, &mut restarts_in_window) {
            error!("restart budget exhausted, entering terminal state");
            health.transition(|s| *s = ChildHealth::Terminal);
            let _ = events
                .send(UpstreamEvent::Terminal { start_failed: false })
                .await;
            return;
        }
        info!(backoff_ms = backoff.as_millis() as u64, "restarting child after backoff");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.max_backoff);
    }
}

/// Count a restart attempt against the sliding window.
fn budget_allows(
    config: &ChildConfig,
    window_start: &mut Instant,
    restarts_in_window: &mut u32,
) -> bool {
    if window_start.elapsed() > config.restart_window {
        *window_start = Instant::now();
        *restarts_in_window = 0;
    }
    *restarts_in_window += 1;
    *restarts_in_window <= config.max_restarts_per_window
}
