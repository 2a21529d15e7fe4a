//! Error types shared by the relay, RPC and signer layers.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Socket or connection failure, including a link that has already dropped.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed reply, failed decryption, rejected handshake or bad record.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer answered the request with an `error` field.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("login required")]
    LoginRequired,

    #[error("state error: {0}")]
    State(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Protocol,
    State,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) | Error::Io(_) => ErrorKind::Transport,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Protocol(_) | Error::Remote(_) => ErrorKind::Protocol,
            Error::LoginRequired | Error::State(_) => ErrorKind::State,
        }
    }

    pub(crate) fn protocol(msg: impl std::fmt::Display) -> Self {
        Error::Protocol(msg.to_string())
    }

    pub(crate) fn transport(msg: impl std::fmt::Display) -> Self {
        Error::Transport(msg.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
