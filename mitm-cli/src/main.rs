mod logging;
mod observer;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use mitm_core::{CorrelationMap, InterceptEngine, Mode, Observer, Pipeline, SessionStore, SharedAdapter, Transport};
use mitm_transport::{HostStdioAdapter, ProcessAdapter, SseClientAdapter, SseServerAdapter, StreamableHttpClientAdapter, StreamableHttpServerAdapter};
use tokio::sync::Mutex;

#[derive(Parser)]
#[command(name = "mitm-mcp-proxy", version, about = "Interactive man-in-the-middle proxy for JSON-RPC / MCP traffic")]
struct Args {
    /// Transport to proxy.
    #[arg(long, value_enum, default_value_t = TransportKind::Stdio)]
    transport: TransportKind,

    /// Shell command that launches the server, for stdio transport.
    #[arg(long)]
    command: Option<String>,

    /// Address to bind the client-facing endpoint on, for network transports.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Upstream server URL, for network transports.
    #[arg(long)]
    upstream_url: Option<url::Url>,

    /// Where to save the captured session on shutdown.
    #[arg(long)]
    session_out: Option<PathBuf>,

    /// Start in Intercept mode instead of Passthrough.
    #[arg(long)]
    intercept: bool,

    /// Log level/filter directive used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Copy, Clone, ValueEnum)]
enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init(&args.log_level);

    let (client, server, transport, server_command, server_url): (
        SharedAdapter,
        SharedAdapter,
        Transport,
        Option<String>,
        Option<String>,
    ) = match args.transport {
        TransportKind::Stdio => {
            let command = args
                .command
                .clone()
                .context("--command is required for the stdio transport")?;
            let client: SharedAdapter = Arc::new(Mutex::new(HostStdioAdapter::default()));
            let server: SharedAdapter = Arc::new(Mutex::new(ProcessAdapter::spawn(&command).await?));
            (client, server, Transport::Stdio, Some(command), None)
        }
        TransportKind::Sse => {
            let listen = args.listen.context("--listen is required for the sse transport")?;
            let upstream = args
                .upstream_url
                .clone()
                .context("--upstream-url is required for the sse transport")?;
            let client: SharedAdapter = Arc::new(Mutex::new(SseServerAdapter::bind(listen).await?));
            let server: SharedAdapter = Arc::new(Mutex::new(SseClientAdapter::connect(upstream.clone()).await?));
            (client, server, Transport::Sse, None, Some(upstream.to_string()))
        }
        TransportKind::StreamableHttp => {
            let listen = args.listen.context("--listen is required for the streamable-http transport")?;
            let upstream = args
                .upstream_url
                .clone()
                .context("--upstream-url is required for the streamable-http transport")?;
            let client: SharedAdapter = Arc::new(Mutex::new(StreamableHttpServerAdapter::bind(listen).await?));
            let server: SharedAdapter = Arc::new(Mutex::new(StreamableHttpClientAdapter::new(upstream.clone())));
            (client, server, Transport::StreamableHttp, None, Some(upstream.to_string()))
        }
    };

    let session = Arc::new(SessionStore::new(transport, server_command, server_url));
    let intercept = Arc::new(InterceptEngine::new(if args.intercept { Mode::Intercept } else { Mode::Passthrough }));
    let correlation = Arc::new(CorrelationMap::new());
    let tracing_observer: Arc<dyn Observer> = Arc::new(observer::TracingObserver);

    let pipeline = Arc::new(Pipeline::new(session.clone(), intercept, correlation, tracing_observer));

    let run = tokio::spawn({
        let pipeline = pipeline.clone();
        let client = client.clone();
        let server = server.clone();
        async move { pipeline.run(client, server, transport).await }
    });

    tokio::select! {
        result = run => {
            match result {
                Ok(Ok(())) => tracing::info!("pipeline finished"),
                Ok(Err(e)) => tracing::error!(error = %e, "pipeline terminated"),
                Err(e) => tracing::error!(error = %e, "pipeline task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt, shutting down");
        }
    }

    if let Some(path) = &args.session_out {
        session.save(path).await.context("failed to save session")?;
        tracing::info!(path = %path.display(), "session saved");
    }

    Ok(())
}
