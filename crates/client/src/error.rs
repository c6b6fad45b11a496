//! Error types for the client library.

use thiserror::Error;

/// Result type alias using ClientError.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when using the client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The request could not be sent or the response not read
    #[error("connection error: {0}")]
    Connection(#[from] reqwest::Error),

    /// The server answered with something that is not a valid response body
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected the request outright
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Leader redirects could not be followed
    #[error("redirect error: {0}")]
    Redirect(String),

    /// The statement failed on the server
    #[error("database error: {message}")]
    Database { message: String },
}

impl ClientError {
    /// Returns true if this is a connection error.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ClientError::Connection(_))
    }

    /// Returns true if this is a protocol error.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, ClientError::Protocol(_))
    }

    /// Returns true if the statement itself failed.
    pub fn is_database_error(&self) -> bool {
        matches!(self, ClientError::Database { .. })
    }

    /// HTTP status code, if the server rejected the request.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
