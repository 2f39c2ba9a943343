//! Error types for the protocol codecs

use std::io;
use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Bad header: {0}")]
    BadHeader(String),

    #[error("Bad version: {0}")]
    BadVersion(u8),

    #[error("AEAD authentication failed")]
    BadTag,

    #[error("Chunk checksum mismatch")]
    BadChecksum,

    #[error("Bad timestamp: {0}")]
    BadTimestamp(u64),

    #[error("Salt not unique")]
    SaltNotUnique,

    #[error("Packet id not unique")]
    PacketIdNotUnique,

    #[error("Request salt mismatch")]
    BadRequestSalt,

    #[error("Bad client session id")]
    BadClientSessionId,

    #[error("Too many server sessions")]
    TooManyServerSessions,

    #[error("Bad header type: {0}")]
    BadHeaderType(u8),

    #[error("Bad padding")]
    BadPadding,

    #[error("Unknown command: {0}")]
    UnknownCommand(u8),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Peer error: {0}")]
    PeerError(String),

    #[error("Bad length chunk")]
    BadLengthChunk,

    #[error("Invalid key: {0}")]
    Key(String),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    pub fn bad_header<S: Into<String>>(msg: S) -> Self {
        Error::BadHeader(msg.into())
    }

    pub fn key<S: Into<String>>(msg: S) -> Self {
        Error::Key(msg.into())
    }

    pub fn address<S: Into<String>>(msg: S) -> Self {
        Error::Address(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn peer<S: Into<String>>(msg: S) -> Self {
        Error::PeerError(msg.into())
    }

    /// Whether the error is fatal for the whole transport connection.
    ///
    /// Mux sub-stream errors close only the affected stream; everything
    /// else tears the connection down.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::StreamClosed | Error::PeerError(_))
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(inner) => inner,
            Error::StreamClosed => io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()),
            Error::BadTag | Error::BadChecksum => {
                io::Error::new(io::ErrorKind::InvalidData, e.to_string())
            }
            other => io::Error::other(other.to_string()),
        }
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let e = Error::protocol("test error");
        assert!(matches!(e, Error::Protocol(_)));
    }

    #[test]
    fn test_error_display() {
        let e = Error::BadVersion(3);
        assert_eq!(e.to_string(), "Bad version: 3");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::BadTag.is_fatal());
        assert!(Error::SaltNotUnique.is_fatal());
        assert!(!Error::StreamClosed.is_fatal());
        assert!(!Error::peer("remote refused").is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let io_err: io::Error = Error::BadTag.into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);
    }
}
