//! Error types shared by the coordinator, the transport and the bootstrap layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The listen address could not be bound. Fatal at startup.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Dialing a peer failed.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame codec error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// An outbound call did not complete within its per-call timeout.
    #[error("call to {address} timed out")]
    Timeout { address: String },

    /// The peer closed the connection before acknowledging.
    #[error("connection to {address} closed")]
    Closed { address: String },

    #[error("unexpected response from {address}")]
    UnexpectedResponse { address: String },

    #[error("unexpected inbound {0}")]
    UnexpectedMessage(&'static str),

    /// A peer sent a timestamp that would exhaust our clock.
    #[error("timestamp {0} is out of range")]
    TimestampOutOfRange(u64),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("a critical-section request is already outstanding")]
    AlreadyRequesting,

    #[error("not inside the critical section")]
    NotInCriticalSection,

    #[error("deadline elapsed before access was granted")]
    DeadlineElapsed,
}
