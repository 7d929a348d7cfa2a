use crate::error::{PaymentError, Result};
use std::io::IsTerminal;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;

/// Builds the log filter: `RUST_LOG` when set, otherwise `level` for this
/// crate and warnings for everything else.
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,orderpay={level}")))
}

/// Installs the global subscriber. Logs go to stderr; stdout carries reports.
pub fn init(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(filter(level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init()
        .map_err(|e| PaymentError::Config(format!("failed to install logger: {e}")))
}
