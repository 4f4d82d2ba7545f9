//! Error types for the SMTP client.

use std::io;

use thiserror::Error;

/// Errors raised while talking to a remote server.
///
/// A well-formed 4xx/5xx reply is not an error at this level: it is returned
/// as a [`Response`](super::Response) for the caller to classify.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The server sent something that is not an SMTP reply.
    #[error("Failed to parse SMTP response: {0}")]
    ParseError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, ClientError>;
