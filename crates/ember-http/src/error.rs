use thiserror::Error;

use crate::status;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error(transparent)]
    Stream(#[from] ember_io::StreamError),
    #[error(transparent)]
    Codec(#[from] ember_io::CodecError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ember_core::error::ConfigError),
    #[error(transparent)]
    Encoding(#[from] ember_core::error::EncodingError),
    #[error("request rejected ({status}): {reason}")]
    Request { status: u16, reason: String },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("{0}")]
    Other(String),
}

impl HttpError {
    pub fn request(status: u16, reason: impl Into<String>) -> HttpError {
        HttpError::Request {
            status,
            reason: reason.into(),
        }
    }

    /// The HTTP status this error maps to on the wire.
    pub fn status(&self) -> u16 {
        match self {
            HttpError::Request { status, .. } => *status,
            HttpError::Session(_) => status::INTERNAL_SERVER_ERROR,
            _ => status::BAD_REQUEST,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Stream(#[from] ember_io::StreamError),
    #[error(transparent)]
    Codec(#[from] ember_io::CodecError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session not found")]
    NotFound,
    #[error("authentication failed")]
    BadMac,
    #[error("session data too big for client-side storage ({0} bytes)")]
    TooBig(usize),
    #[error("parent call failed: {0}")]
    Ppc(#[from] ember_core::error::PpcError),
    #[error("{0}")]
    Other(String),
}
