use clap::Parser;
#[cfg(feature = "opentelemetry")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "opentelemetry")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "opentelemetry")]
use opentelemetry_sdk::{
    Resource,
    trace::{self as sdktrace, SdkTracerProvider},
};
use silta_bridge::broker::{InitializeMode, ServerRequestPolicy};
use silta_bridge::child::ChildConfig;
use silta_bridge::config::BridgeConfig;
use silta_bridge::session::SessionConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Bridge a stdio MCP server onto SSE, WebSocket, and HTTP POST.
///
/// Wraps one subprocess speaking newline-delimited JSON-RPC on its
/// stdio and serves it to many concurrent network clients, with a
/// runtime-controllable filter chain in both directions.
#[derive(Parser, Debug)]
#[command(name = "silta_bridge")]
#[command(version, about)]
struct Args {
    /// Port to bind the HTTP server.
    #[arg(long)]
    port: u16,

    /// Host to bind the HTTP server.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Shell command that starts the stdio MCP server.
    #[arg(long)]
    cmd: String,

    /// Log verbosity.
    #[arg(long = "log_level", default_value = "INFO",
          value_parser = ["DEBUG", "INFO", "WARN", "ERROR"])]
    log_level: String,

    /// Directory for daily rolling log files; stderr when omitted.
    #[arg(long = "log_location")]
    log_location: Option<PathBuf>,

    /// Log file name prefix inside --log_location.
    #[arg(long = "log_pattern", default_value = "silta_bridge.log")]
    log_pattern: String,

    /// Tools-catalog JSON file for the discovery short-circuit.
    #[arg(long = "tools_config")]
    tools_config: Option<PathBuf>,

    /// Content-filter JSON config; enables the content filters.
    #[arg(long = "filter_config")]
    filter_config: Option<PathBuf>,

    /// Seconds a session may stay idle before it is closed.
    #[arg(long = "session_timeout", default_value_t = 300)]
    session_timeout: u64,

    /// Seconds before an unanswered request fails with a timeout.
    #[arg(long = "request_deadline", default_value_t = 60)]
    request_deadline: u64,

    /// Base URL advertised to clients (behind a reverse proxy).
    #[arg(long)]
    advertise_url: Option<String>,

    /// How to answer a client `initialize`.
    #[arg(long, default_value = "both", value_parser = ["local", "forward", "both"])]
    initialize_mode: String,

    /// What to do with server-initiated requests from the child.
    #[arg(long, default_value = "broadcast", value_parser = ["broadcast", "drop"])]
    server_requests: String,

    /// Seconds between SSE heartbeats / WS pings.
    #[arg(long, default_value_t = 15)]
    heartbeat_interval: u64,

    /// Compose the content filters even without --filter_config.
    #[arg(long)]
    content_filters: bool,

    /// Log filtered message bodies in audit records.
    #[arg(long)]
    audit_bodies: bool,

    /// Echo child stdio to stderr in color (debug aid).
    #[arg(long)]
    colored_output: bool,
}

fn init_tracing(args: &Args) {
    let default_filter = format!(
        "{},silta_bridge={}",
        args.log_level.to_lowercase(),
        args.log_level.to_lowercase()
    );
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or(default_filter),
    );

    if let Some(dir) = &args.log_location {
        let file_appender = tracing_appender::rolling::daily(dir, &args.log_pattern);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Leak the guard so logs are flushed on exit.
        Box::leak(Box::new(guard));

        let subscriber = tracing_subscriber::registry().with(env_filter).with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        );
        #[cfg(feature = "opentelemetry")]
        let subscriber = subscriber.with(init_otel());
        subscriber.init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
        #[cfg(feature = "opentelemetry")]
        let subscriber = subscriber.with(init_otel());
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // Help and version requests are normal exits.
            if e.use_stderr() {
                eprintln!("{e}");
                return std::process::ExitCode::from(1);
            }
            let _ = e.print();
            return std::process::ExitCode::SUCCESS;
        }
    };

    init_tracing(&args);

    let bind_addr = match format!("{}:{}", args.host, args.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("invalid --host/--port: {e}");
            return std::process::ExitCode::from(1);
        }
    };

    let mut config = BridgeConfig {
        bind_addr,
        advertise_url: args.advertise_url.clone(),
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval),
        tools_config: args.tools_config.clone(),
        filter_config: args.filter_config.clone(),
        content_filters: args.content_filters,
        audit_bodies: args.audit_bodies,
        session: SessionConfig {
            idle_timeout: Duration::from_secs(args.session_timeout),
            ..SessionConfig::default()
        },
        child: ChildConfig {
            command: args.cmd.clone(),
            colored_output: args.colored_output,
            ..ChildConfig::default()
        },
        ..BridgeConfig::default()
    };
    config.broker.request_deadline = Duration::from_secs(args.request_deadline);
    config.broker.initialize_mode = args
        .initialize_mode
        .parse::<InitializeMode>()
        .expect("value_parser restricts the input");
    config.broker.server_request_policy = args
        .server_requests
        .parse::<ServerRequestPolicy>()
        .expect("value_parser restricts the input");

    if let Err(e) = config.apply_env() {
        eprintln!("{e}");
        return std::process::ExitCode::from(1);
    }

    tracing::info!("starting silta bridge on {}", config.bind_addr);
    tracing::info!(command = %config.child.command, "wrapping stdio MCP server");

    let bridge = match silta_bridge::build(config) {
        Ok(bridge) => bridge,
        Err(e) => {
            eprintln!("{e}");
            return std::process::ExitCode::from(1);
        }
    };
    let mut terminal_rx = bridge.terminal_rx.clone();
    let state = bridge.state.clone();

    let serve = tokio::spawn(silta_bridge::http::serve(
        state,
        silta_bridge::shutdown_signal(),
    ));

    // A child that never comes up is a startup failure; an exhausted
    // restart budget keeps serving discovery until shutdown, then
    // exits 3.
    let start_failed = async {
        loop {
            if terminal_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
            if matches!(*terminal_rx.borrow(), Some(true)) {
                return;
            }
        }
    };

    tokio::select! {
        result = serve => {
            match result {
                Ok(Ok(())) => {
                    if matches!(*bridge.terminal_rx.borrow(), Some(false)) {
                        return std::process::ExitCode::from(3);
                    }
                    std::process::ExitCode::SUCCESS
                }
                Ok(Err(e)) => {
                    eprintln!("{e}");
                    std::process::ExitCode::from(1)
                }
                Err(e) => {
                    eprintln!("server task panicked: {e}");
                    std::process::ExitCode::from(1)
                }
            }
        }
        _ = start_failed => {
            eprintln!("child process failed to start");
            std::process::ExitCode::from(2)
        }
    }
}

#[cfg(feature = "opentelemetry")]
fn init_otel<S>() -> Option<tracing_opentelemetry::OpenTelemetryLayer<S, sdktrace::Tracer>>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint("http://localhost:4318/v1/traces")
            .build()
            .ok()?;

        let resource = Resource::builder()
            .with_service_name("silta_bridge")
            .build();

        let provider = SdkTracerProvider::builder()
            .with_resource(resource)
            .with_batch_exporter(exporter)
            .build();

        let tracer = provider.tracer("silta_bridge");

        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    }
}

