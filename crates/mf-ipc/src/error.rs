//! Transport errors for process channels.

use std::io;

/// Errors raised while spawning or talking to a peer process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `fork(2)` failed.
    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),

    /// The peer process exited, was killed, or became a zombie.
    #[error("peer process {pid} is gone")]
    PeerGone { pid: i32 },

    /// The peer closed its end of the socket.
    #[error("peer closed the channel")]
    Closed,

    /// A message violated the framing or exchange rules.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A forwarded command named a peer the relay does not hold.
    #[error("no peer with id {0}")]
    UnknownPeer(u64),

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
