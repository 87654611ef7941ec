//! xrelay - TCP relay with optional per-leg encrypted message framing.
//!
//! Every accepted front connection is paired with a fresh connection to one
//! fixed backend. Each leg is either a plain byte stream or a keyed stream of
//! length-prefixed AES-256-GCM frames, chosen independently per leg.

pub mod bridge;
pub mod buffer;
pub mod cli;
pub mod common;
pub mod crypto;
pub mod error;
pub mod server;
pub mod transport;

pub use bridge::{
    bridge, run_pair, BridgeEnd, BridgeOutcome, Direction, PairEnd, PairOutcome, PairPools,
    RelayCounters,
};
pub use buffer::{BufferPool, PooledBuffer, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IDLE_BUFFERS};
pub use cli::{BuildInfo, Cli, Command, ServeArgs};
pub use common::{format_duration, parse_listen_address, validate_backend_address, RelayConfig};
pub use crypto::{CipherKey, CryptoError, CryptoResult, MessageCipher, MAX_MESSAGE_SIZE};
pub use error::{Error, ExitCode, Result};
pub use server::{run_server, Acceptor, ConnectionState, RelayEngine};
pub use transport::{
    split_leg, Deadlines, KeyedReader, KeyedWriter, LegReader, LegWriter, MessageRead, MessageWrite,
    PlainReader, PlainWriter, TransportError, TransportResult, FRAME_HEADER_SIZE, MAX_FRAME_SIZE,
};
