//! Shared helpers for bridge integration tests: an in-process server
//! on an ephemeral port and a small SSE stream reader.

use futures::StreamExt;
use silta_bridge::config::BridgeConfig;
use silta_bridge::http::SharedState;
use std::time::Duration;

pub struct TestServer {
    pub base: String,
    pub state: SharedState,
}

impl TestServer {
    #[allow(dead_code)]
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }
}

/// Start a bridge wrapping `cat` (echoes every stdin line back) on an
/// ephemeral port. The mutator adjusts the config before startup.
pub async fn spawn_bridge(mutate: impl FnOnce(&mut BridgeConfig)) -> TestServer {
    let mut config = BridgeConfig::default();
    config.child.command = "cat".to_string();
    config.child.health_check_timeout = Duration::from_secs(5);
    config.heartbeat_interval = Duration::from_secs(30);
    mutate(&mut config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test port");
    let addr = listener.local_addr().expect("failed to read local addr");
    config.bind_addr = addr;

    let bridge = silta_bridge::build(config).expect("failed to build bridge");
    let state = bridge.state.clone();
    let app = silta_bridge::http::build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server failed");
    });

    TestServer {
        base: format!("http://{addr}"),
        state,
    }
}

/// One frame off an SSE stream.
#[derive(Debug, PartialEq, Eq)]
#[allow(dead_code)]
pub enum SseFrame {
    Event { name: String, data: String },
    Comment(String),
}

/// Incremental parser over a reqwest byte stream.
pub struct SseReader {
    stream: std::pin::Pin<
        Box<dyn futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>,
    >,
    buffer: String,
}

#[allow(dead_code)]
impl SseReader {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            stream: Box::pin(response.bytes_stream()),
            buffer: String::new(),
        }
    }

    /// Next frame, or None on end of stream / timeout.
    pub async fn next_frame(&mut self) -> Option<SseFrame> {
        tokio::time::timeout(Duration::from_secs(5), self.read_frame())
            .await
            .ok()
            .flatten()
    }

    /// Next named event, skipping heartbeat comments.
    pub async fn next_event(&mut self) -> Option<(String, String)> {
        loop {
            match self.next_frame().await? {
                SseFrame::Event { name, data } => return Some((name, data)),
                SseFrame::Comment(_) => continue,
            }
        }
    }

    async fn read_frame(&mut self) -> Option<SseFrame> {
        loop {
            if let Some(pos) = self.buffer.find("\n\n") {
                let raw = self.buffer[..pos].to_string();
                self.buffer.drain(..pos + 2);
                if let Some(frame) = parse_frame(&raw) {
                    return Some(frame);
                }
                continue;
            }
            let chunk = self.stream.next().await?.ok()?;
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }
}

fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut name = String::new();
    let mut data = Vec::new();
    let mut comment = None;
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            name = rest.trim_start().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix(':') {
            comment = Some(rest.trim_start().to_string());
        }
    }
    if !data.is_empty() || !name.is_empty() {
        Some(SseFrame::Event {
            name,
            data: data.join("\n"),
        })
    } else {
        comment.map(SseFrame::Comment)
    }
}
