use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("codec made no progress")]
    Stalled,
    #[error("deflate error: {0}")]
    Gzip(String),
    #[error("cipher error: {0}")]
    Cipher(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("operation not supported by this device: {0}")]
    Unsupported(&'static str),
    #[error("stream is closed")]
    Closed,
}

impl From<nix::Error> for StreamError {
    fn from(e: nix::Error) -> Self {
        StreamError::Io(std::io::Error::from_raw_os_error(e as i32))
    }
}

impl From<StreamError> for std::io::Error {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Io(io) => io,
            other => std::io::Error::other(other.to_string()),
        }
    }
}
