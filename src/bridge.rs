//! Connection bridge.
//!
//! [`bridge`] copies one direction of a connection pair until the source
//! reaches EOF or either side fails. [`run_pair`] drives both directions of
//! one pair as separate tasks: the first direction to finish wins, the other
//! is aborted, and every stream half is dropped before it returns, which
//! closes both sockets.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinError;

use crate::buffer::BufferPool;
use crate::transport::{MessageRead, MessageWrite, TransportError};

/// Direction of one half of a connection pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend.
    FrontToBack,
    /// Backend to client.
    BackToFront,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::FrontToBack => f.write_str("front->back"),
            Direction::BackToFront => f.write_str("back->front"),
        }
    }
}

/// How a bridge direction stopped.
#[derive(Debug)]
pub enum BridgeEnd {
    /// The source closed its stream.
    Eof,
    /// Reading from the source failed.
    ReadFailed(TransportError),
    /// Writing to the destination failed.
    WriteFailed(TransportError),
}

/// Result of one bridge direction.
#[derive(Debug)]
pub struct BridgeOutcome {
    pub direction: Direction,
    /// Application bytes delivered to the destination.
    pub bytes: u64,
    pub end: BridgeEnd,
}

/// Application bytes relayed per direction for one pair.
#[derive(Debug, Default)]
pub struct RelayCounters {
    front_to_back: AtomicU64,
    back_to_front: AtomicU64,
}

impl RelayCounters {
    fn counter(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::FrontToBack => &self.front_to_back,
            Direction::BackToFront => &self.back_to_front,
        }
    }

    pub fn get(&self, direction: Direction) -> u64 {
        self.counter(direction).load(Ordering::Relaxed)
    }
}

/// Copies messages from `src` to `dst` until EOF or the first error.
///
/// One pooled buffer is held for the whole loop and handed back when this
/// function returns. Each write carries exactly the bytes of one read.
pub async fn bridge<R, W>(
    mut src: R,
    mut dst: W,
    pool: Arc<BufferPool>,
    direction: Direction,
    counters: Arc<RelayCounters>,
) -> BridgeOutcome
where
    R: MessageRead,
    W: MessageWrite,
{
    let mut buf = pool.checkout();
    let mut bytes = 0u64;

    let end = loop {
        let n = match src.read_message(&mut buf[..]).await {
            Ok(0) => break BridgeEnd::Eof,
            Ok(n) => n,
            Err(e) => break BridgeEnd::ReadFailed(e),
        };

        if let Err(e) = dst.write_message(&buf[..n]).await {
            break BridgeEnd::WriteFailed(e);
        }

        bytes += n as u64;
        counters.counter(direction).fetch_add(n as u64, Ordering::Relaxed);
    };

    match &end {
        BridgeEnd::Eof => tracing::debug!(%direction, bytes, "source closed"),
        BridgeEnd::ReadFailed(e) if e.is_timeout() => {
            tracing::warn!(%direction, bytes, error = %e, "read deadline expired")
        }
        BridgeEnd::ReadFailed(e) => tracing::error!(%direction, bytes, error = %e, "read failed"),
        BridgeEnd::WriteFailed(e) => tracing::error!(%direction, bytes, error = %e, "write failed"),
    }

    BridgeOutcome {
        direction,
        bytes,
        end,
    }
}

/// Buffer pools for one pair, keyed by the leg each direction reads from.
///
/// A keyed source needs room for a whole decrypted message, so its reads are
/// usually served by a larger pool than a plain source.
#[derive(Debug, Clone)]
pub struct PairPools {
    /// Pool for reads from the front leg.
    pub front: Arc<BufferPool>,
    /// Pool for reads from the back leg.
    pub back: Arc<BufferPool>,
}

impl PairPools {
    /// Uses one pool for both directions.
    pub fn shared(pool: &Arc<BufferPool>) -> Self {
        Self {
            front: Arc::clone(pool),
            back: Arc::clone(pool),
        }
    }
}

/// Why a connection pair was torn down.
#[derive(Debug)]
pub enum PairEnd {
    /// One direction finished first.
    Finished(BridgeOutcome),
    /// One direction's task panicked or was cancelled unexpectedly.
    Fault { direction: Direction, reason: String },
    /// The relay is shutting down.
    Shutdown,
}

/// Result of running a connection pair.
#[derive(Debug)]
pub struct PairOutcome {
    pub end: PairEnd,
    pub front_to_back: u64,
    pub back_to_front: u64,
}

fn pair_end(direction: Direction, joined: Result<BridgeOutcome, JoinError>) -> PairEnd {
    match joined {
        Ok(outcome) => PairEnd::Finished(outcome),
        Err(e) => {
            tracing::error!(%direction, error = %e, "bridge task failed");
            PairEnd::Fault {
                direction,
                reason: e.to_string(),
            }
        }
    }
}

/// Runs both directions of a connection pair until either one ends.
///
/// The front leg's reader feeds the back leg's writer and vice versa. When
/// this returns, both bridge tasks have terminated and all four halves have
/// been dropped.
pub async fn run_pair<FR, FW, BR, BW>(
    front: (FR, FW),
    back: (BR, BW),
    pools: &PairPools,
    mut shutdown_rx: Option<broadcast::Receiver<()>>,
) -> PairOutcome
where
    FR: MessageRead + 'static,
    FW: MessageWrite + 'static,
    BR: MessageRead + 'static,
    BW: MessageWrite + 'static,
{
    let (front_reader, front_writer) = front;
    let (back_reader, back_writer) = back;
    let counters = Arc::new(RelayCounters::default());

    let mut front_to_back = tokio::spawn(bridge(
        front_reader,
        back_writer,
        Arc::clone(&pools.front),
        Direction::FrontToBack,
        Arc::clone(&counters),
    ));
    let mut back_to_front = tokio::spawn(bridge(
        back_reader,
        front_writer,
        Arc::clone(&pools.back),
        Direction::BackToFront,
        Arc::clone(&counters),
    ));

    // Dropping a JoinHandle does not cancel the task, so the loser is aborted
    // and awaited explicitly.
    let end = tokio::select! {
        joined = &mut front_to_back => {
            back_to_front.abort();
            let _ = (&mut back_to_front).await;
            pair_end(Direction::FrontToBack, joined)
        }
        joined = &mut back_to_front => {
            front_to_back.abort();
            let _ = (&mut front_to_back).await;
            pair_end(Direction::BackToFront, joined)
        }
        _ = async {
            if let Some(ref mut rx) = shutdown_rx {
                let _ = rx.recv().await;
            } else {
                std::future::pending::<()>().await;
            }
        } => {
            front_to_back.abort();
            back_to_front.abort();
            let _ = (&mut front_to_back).await;
            let _ = (&mut back_to_front).await;
            PairEnd::Shutdown
        }
    };

    PairOutcome {
        end,
        front_to_back: counters.get(Direction::FrontToBack),
        back_to_front: counters.get(Direction::BackToFront),
    }
}
