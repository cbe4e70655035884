use std::io;

use super::codec::CodecError;

/// Errors surfaced by the public client and node API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Empty-after-trim or over the protocol length limit. Reported
    /// synchronously at the API boundary, before anything hits a socket.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Lifecycle misuse: a connect on a client that already holds a live
    /// transport. `ChatClient` is constructed connected and the node
    /// builds a fresh instance per attempt, so nothing in this crate
    /// produces it; the kind is part of the client's public contract.
    #[error("client is already connected")]
    AlreadyConnected,

    #[error("client is not connected")]
    NotConnected,

    /// Any transport failure: connect, read, write, or a stream that
    /// delivered bytes the codec could not make sense of.
    #[error("network error: {0}")]
    Network(#[from] io::Error),
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => Error::Network(e),
            other => Error::Network(io::Error::new(io::ErrorKind::InvalidData, other)),
        }
    }
}
