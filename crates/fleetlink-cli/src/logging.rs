use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Filter used when `RUST_LOG` is unset: info from fleetlink, warnings from
/// dependencies.
pub const DEFAULT_FILTER: &str = "fleetlink=info,warn";

/// How agent events are rendered on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// One compact line per event, for a terminal.
    Human,
    /// One JSON object per event, for service managers and log shippers.
    Json,
}

/// Install the process-wide subscriber for the agent.
///
/// Events go to stderr so `simulate --json` and `config show` keep stdout
/// clean. The heartbeat loop's structured fields (`destination`,
/// `correlation_id`, `response_id`) become JSON keys in `Json` mode.
pub fn init(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Human => {
            let layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact();
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    }
}
