//! Relay configuration and shared helpers.
//!
//! [`RelayConfig`] is resolved once from the command line before the accept
//! loop starts and is read-only afterwards.

use std::net::SocketAddr;
use std::time::Duration;

use crate::cli::ServeArgs;
use crate::crypto::MAX_MESSAGE_SIZE;
use crate::error::{Error, Result};
use crate::transport::Deadlines;

/// Immutable configuration of one relay process.
#[derive(Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address the front listener binds to.
    pub listen: SocketAddr,
    /// Fixed backend every accepted connection is relayed to.
    pub backend: String,
    /// Secret for the client-facing leg; `None` leaves it unkeyed.
    pub front_secret: Option<String>,
    /// Secret for the backend-facing leg; `None` leaves it unkeyed.
    pub back_secret: Option<String>,
    pub deadlines: Deadlines,
    pub buffer_size: usize,
    pub max_idle_buffers: usize,
}

impl RelayConfig {
    /// Validates command-line arguments into a configuration.
    pub fn from_args(args: &ServeArgs) -> Result<Self> {
        let listen = parse_listen_address(&args.listen)?;
        validate_backend_address(&args.backend)?;

        if args.read_timeout.is_zero() || args.write_timeout.is_zero() {
            return Err(Error::Config("timeouts must be greater than zero".to_string()));
        }
        if args.buffer_size == 0 {
            return Err(Error::Config("buffer size must be greater than zero".to_string()));
        }
        // one buffer of plaintext becomes one sealed message on a keyed leg
        if args.buffer_size > MAX_MESSAGE_SIZE {
            return Err(Error::Config(format!(
                "buffer size {} exceeds the maximum message size {}",
                args.buffer_size, MAX_MESSAGE_SIZE
            )));
        }

        Ok(Self {
            listen,
            backend: args.backend.clone(),
            front_secret: non_empty(&args.front_secret),
            back_secret: non_empty(&args.back_secret),
            deadlines: Deadlines {
                read: args.read_timeout,
                write: args.write_timeout,
            },
            buffer_size: args.buffer_size,
            max_idle_buffers: args.max_idle_buffers,
        })
    }
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("listen", &self.listen)
            .field("backend", &self.backend)
            .field("front_keyed", &self.front_secret.is_some())
            .field("back_keyed", &self.back_secret.is_some())
            .field("deadlines", &self.deadlines)
            .field("buffer_size", &self.buffer_size)
            .field("max_idle_buffers", &self.max_idle_buffers)
            .finish()
    }
}

fn non_empty(secret: &Option<String>) -> Option<String> {
    secret.as_ref().filter(|s| !s.is_empty()).cloned()
}

/// Parses a listen address string into a SocketAddr.
pub fn parse_listen_address(listen: &str) -> Result<SocketAddr> {
    // Handle ":port" format by prepending "0.0.0.0"
    let addr_str = if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    };

    addr_str
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address '{}': {}", listen, e)))
}

/// Checks that a backend address has a host part and a numeric port.
///
/// Host names are left unresolved; they are looked up on every dial.
pub fn validate_backend_address(backend: &str) -> Result<()> {
    let Some(colon_pos) = backend.rfind(':') else {
        return Err(Error::Config(format!(
            "backend address must include port: '{}'",
            backend
        )));
    };

    let host = &backend[..colon_pos];
    let port = &backend[colon_pos + 1..];

    if host.is_empty() || host == "[]" {
        return Err(Error::Config(format!(
            "backend address must include host: '{}'",
            backend
        )));
    }

    port.parse::<u16>()
        .map_err(|_| Error::Config(format!("invalid port in address '{}'", backend)))?;

    Ok(())
}

/// Formats a duration in a human-readable format similar to Go's duration format.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let nanos = d.subsec_nanos();

    if secs == 0 && nanos == 0 {
        return "0s".to_string();
    }

    let mut result = String::new();

    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs_remainder = secs % 60;

    if hours > 0 {
        result.push_str(&format!("{}h", hours));
    }
    if mins > 0 {
        result.push_str(&format!("{}m", mins));
    }
    if secs_remainder > 0 {
        result.push_str(&format!("{}s", secs_remainder));
    } else if nanos > 0 && hours == 0 && mins == 0 {
        let ms = nanos / 1_000_000;
        if ms > 0 {
            result.push_str(&format!("{}ms", ms));
        }
    }

    if result.is_empty() {
        "0s".to_string()
    } else {
        result
    }
}
