//! `tracing` subscriber setup.
//!
//! Filtering comes from `MLPIPE_LOG`, then `RUST_LOG`, then a default that
//! depends on verbosity and output format. Logs always go to stderr so they
//! never mix with command output on stdout.

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive for mlpipe.
pub const LOG_ENV: &str = "MLPIPE_LOG";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines alongside the progress bar
    #[default]
    Text,
    /// One JSON object per event; the progress bar is hidden
    Json,
}

/// Default directive when no environment filter is set.
pub fn default_directive(verbose: bool, format: LogFormat) -> &'static str {
    match (verbose, format) {
        (true, _) => "mlpipe=debug",
        (false, LogFormat::Json) => "mlpipe=info",
        (false, LogFormat::Text) => "mlpipe=warn",
    }
}

fn env_filter(verbose: bool, format: LogFormat) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, format)))
}

/// Install the global subscriber. Call once at startup.
pub fn init(verbose: bool, format: LogFormat) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose, format))
        .with_writer(std::io::stderr);

    let installed = match format {
        LogFormat::Text => builder.with_target(false).try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}
