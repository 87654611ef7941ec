//! CLI definitions for xrelay.

use clap::{builder::PossibleValuesParser, Parser, Subcommand};
use std::time::Duration;

use crate::buffer::{DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IDLE_BUFFERS};

/// Default front listen address.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:1080";

/// Parse a duration from a human-readable string.
fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// TCP relay with optional per-leg encrypted framing.
#[derive(Debug, Parser)]
#[command(name = "xrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (debug|info|warn|error)
    #[arg(long, global = true, default_value = "info", value_parser = PossibleValuesParser::new(["debug", "info", "warn", "error"]))]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Accept connections and relay them to the backend
    Serve(ServeArgs),

    /// Show version information
    Version,
}

/// Arguments for the serve subcommand.
#[derive(Debug, Parser)]
pub struct ServeArgs {
    /// Front listen address (e.g., 0.0.0.0:1080 or :1080)
    #[arg(long, alias = "faddr", default_value = DEFAULT_LISTEN)]
    pub listen: String,

    /// Backend TCP address (e.g., 10.0.0.2:22)
    #[arg(long, alias = "baddr")]
    pub backend: String,

    /// Secret for the client-facing leg (empty: plain pass-through)
    #[arg(long, alias = "frc")]
    pub front_secret: Option<String>,

    /// Secret for the backend-facing leg (empty: plain pass-through)
    #[arg(long, alias = "brc")]
    pub back_secret: Option<String>,

    /// Per-read deadline on both legs
    #[arg(long, value_parser = parse_duration, default_value = "300s")]
    pub read_timeout: Duration,

    /// Per-write deadline on both legs
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub write_timeout: Duration,

    /// Relay buffer size in bytes
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Idle relay buffers kept for reuse
    #[arg(long, default_value_t = DEFAULT_MAX_IDLE_BUFFERS)]
    pub max_idle_buffers: usize,
}

/// Build information for version command.
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub built: &'static str,
}

impl BuildInfo {
    /// Returns build information from environment variables or defaults.
    pub fn get() -> Self {
        Self {
            version: option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
            commit: option_env!("XRELAY_COMMIT").unwrap_or("unknown"),
            built: option_env!("XRELAY_BUILD_DATE").unwrap_or("unknown"),
        }
    }

    /// Format version output.
    pub fn format(&self) -> String {
        format!(
            "xrelay version {}\n  commit: {}\n  built:  {}",
            self.version, self.commit, self.built
        )
    }
}
