//! The crate-wide error type and a few error-domain specific variants.
//!
//! Error kinds follow the taxonomy used throughout the engine: bencode
//! parsing, descriptor parsing, handshake/session errors, piece store
//! errors, and the ambient IO/tracker/timeout/shutdown failures.

use std::{fmt, io};

use crate::PieceIndex;

pub type Result<T> = std::result::Result<T, Error>;

/// All errors that may occur anywhere in the engine.
#[derive(Debug)]
pub enum Error {
    /// The bencode decoder encountered input that does not conform to the
    /// bencode grammar (see `bencode` module docs for the exact taxonomy).
    MalformedBencode(String),
    /// The torrent descriptor is missing a required field or otherwise
    /// doesn't match the expected structure.
    BadDescriptor(String),
    /// The peer handshake's protocol tag or info hash didn't match.
    BadHandshake(String),
    /// We are already connected to this peer id, or the peer id equals our
    /// own.
    DuplicatePeer,
    /// The peer sent a message that violates the post-handshake protocol
    /// (e.g. a bitfield that didn't arrive first, or an unknown message id).
    ProtocolViolation(String),
    /// A `request` or `piece` message referred to an out of range offset or
    /// length, or didn't match the length of the reserved block.
    InvalidBlock,
    /// The referenced piece index does not exist in this torrent.
    InvalidPieceIndex(PieceIndex),
    /// A piece was requested via `read_block` that is not yet verified.
    PieceNotAvailable(PieceIndex),
    /// An IO error occurred reading or writing the torrent file.
    Io(io::Error),
    /// The tracker could not be reached, returned an HTTP error status, or
    /// its response could not be parsed or indicated failure.
    Tracker(String),
    /// A session or a block request timed out.
    Timeout,
    /// The engine is shutting down and the operation was abandoned.
    Shutdown,
    /// An internal channel was disconnected, which only happens as a
    /// consequence of the engine shutting down.
    ChannelClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MalformedBencode(reason) => {
                write!(f, "malformed bencode: {}", reason)
            }
            Error::BadDescriptor(reason) => {
                write!(f, "bad descriptor: {}", reason)
            }
            Error::BadHandshake(reason) => {
                write!(f, "bad handshake: {}", reason)
            }
            Error::DuplicatePeer => write!(f, "duplicate peer"),
            Error::ProtocolViolation(reason) => {
                write!(f, "protocol violation: {}", reason)
            }
            Error::InvalidBlock => write!(f, "invalid block"),
            Error::InvalidPieceIndex(i) => {
                write!(f, "invalid piece index {}", i)
            }
            Error::PieceNotAvailable(i) => {
                write!(f, "piece {} not available", i)
            }
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Tracker(reason) => write!(f, "tracker error: {}", reason),
            Error::Timeout => write!(f, "timed out"),
            Error::Shutdown => write!(f, "shutting down"),
            Error::ChannelClosed => write!(f, "internal channel closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Tracker(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

impl From<tokio::sync::broadcast::error::SendError<PieceIndex>> for Error {
    fn from(_: tokio::sync::broadcast::error::SendError<PieceIndex>) -> Self {
        Error::ChannelClosed
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Io(io::Error::new(io::ErrorKind::Other, e))
    }
}
