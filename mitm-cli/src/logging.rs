//! Layered stderr + rolling-file tracing setup: an ANSI stderr layer for
//! interactive use plus a non-blocking file layer for durable logs,
//! both filtered by the same `EnvFilter`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise global tracing. `default_directive` is used when
/// `RUST_LOG` is unset. Returns the file appender's guard — the caller
/// must keep it alive for the process lifetime or buffered log lines are
/// lost on exit.
pub fn init(default_directive: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let file_appender = tracing_appender::rolling::never(".", "mitm-mcp-proxy.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_ansi(true);
    let file_layer = fmt::layer().with_writer(file_writer).with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}
