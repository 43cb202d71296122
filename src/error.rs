use std::{io, net::SocketAddr, time::Duration};

use quinn::{ConnectError, ConnectionError, ReadExactError, WriteError};
use thiserror::Error;

/// Everything that can go wrong between a driving client, the broker and its
/// workers.
#[derive(Debug, Error)]
pub enum Error {
    // transport
    #[error("could not start connecting: {0}")]
    Connect(#[from] ConnectError),
    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),
    #[error("stream write failed: {0}")]
    Write(#[from] WriteError),
    #[error("stream read failed: {0}")]
    ReadExact(#[from] ReadExactError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("tls configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
    #[error("could not generate a certificate: {0}")]
    Certificate(#[from] rcgen::RcgenError),

    // framing and decoding
    #[error("could not encode message")]
    CouldNotEncodeMessage,
    #[error("could not decode message")]
    CouldNotDecodeMessage,
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: u64, max: u64 },
    #[error("peer answered with an unexpected message: {0}")]
    UnexpectedResponse(&'static str),
    #[error("peer reported a failure: {0}")]
    Remote(String),

    // workers
    #[error("worker {worker} ({addr}) did not answer within {after:?}")]
    WorkerTimedOut {
        worker: usize,
        addr: SocketAddr,
        after: Duration,
    },
    #[error("call to worker {worker} ({addr}) failed: {source}")]
    WorkerCallFailed {
        worker: usize,
        addr: SocketAddr,
        #[source]
        source: Box<Error>,
    },
    #[error("no workers configured")]
    NoWorkers,
    #[error("not a socket address: {0}")]
    InvalidAddress(String),

    // grids and runs
    #[error("invalid grid: {reason}")]
    InvalidGrid { reason: String },
    #[error(
        "partition {partition} came back with {actual} rows of {actual_width} cells, expected {expected} rows of {expected_width}"
    )]
    PartitionMismatch {
        partition: usize,
        expected: usize,
        actual: usize,
        expected_width: usize,
        actual_width: usize,
    },
    #[error("a run is already in progress at turn {completed_turns}")]
    RunInProgress { completed_turns: u64 },
    #[error("turn {turn} panicked before it could merge")]
    TurnPanicked { turn: u64 },
    #[error("run killed after {completed_turns} turns")]
    Killed { completed_turns: u64 },
    #[error("shutdown in progress")]
    ShutdownInProgress,
}

impl Error {
    pub(crate) fn invalid_grid(reason: impl Into<String>) -> Self {
        Self::InvalidGrid {
            reason: reason.into(),
        }
    }

    /// Returns true if the failure happened on the wire rather than in the
    /// data that was sent over it.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Connect(_)
            | Error::Connection(_)
            | Error::Write(_)
            | Error::ReadExact(_)
            | Error::Io(_)
            | Error::WorkerTimedOut { .. } => true,
            Error::WorkerCallFailed { source, .. } => source.is_transport(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
