//! Error types for xrelay.

use thiserror::Error;

/// Process exit codes for the serve subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Unexpected runtime failure
    Failure = 1,
    /// Invalid command-line configuration
    Config = 2,
    /// Listen failed
    ListenFailed = 10,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

/// Main error type for xrelay.
///
/// Only [`Error::Listen`] and [`Error::Config`] ever reach the process
/// boundary. Every other variant is local to one connection and ends up in a
/// log line.
#[derive(Debug, Error)]
pub enum Error {
    #[error("listen on {addr} failed: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("connect to backend {backend} failed: {source}")]
    Dial {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the exit code for this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::Config(_) => ExitCode::Config,
            Error::Listen { .. } => ExitCode::ListenFailed,
            Error::Accept(_) | Error::Dial { .. } | Error::Io(_) => ExitCode::Failure,
        }
    }
}

/// Result type alias for xrelay operations.
pub type Result<T> = std::result::Result<T, Error>;
