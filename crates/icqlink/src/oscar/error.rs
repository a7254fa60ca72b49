//! Error types for OSCAR protocol operations.

use std::io;

/// Result type for OSCAR protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during protocol operations.
///
/// None of these abort the session on their own; the client maps them to
/// recovery behavior (drop the frame, tear down one peer, disconnect) and
/// reports outcomes through events.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Frame was shorter than its header claims.
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected length.
        expected: usize,
        /// Actual bytes available.
        actual: usize,
    },

    /// Malformed FLAP, SNAC, TLV or message subtype.
    #[error("parse error: {0}")]
    Parse(String),

    /// Peer violated the protocol (UIN spoofing, bad handshake).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Charset translation map could not be loaded.
    #[error("translation map error: {0}")]
    Translator(String),

    /// Operation requires a logged-in session.
    #[error("not connected")]
    NotConnected,
}

impl Error {
    /// Create a parse error from anything displayable.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }
}
