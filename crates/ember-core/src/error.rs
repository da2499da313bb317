use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("bad escape sequence at offset {0}")]
    BadEscape(usize),
    #[error("hex input has odd length {0}")]
    OddHexLength(usize),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("i/o error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("syntax error at line {line}: {reason}")]
    Syntax { line: usize, reason: String },
    #[error("missing required key: {0}")]
    Missing(String),
    #[error("bad value for {key}: {value}")]
    BadValue { key: String, value: String },
}

#[derive(Debug, Error)]
pub enum KlogError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("log device not configured for {0}")]
    WrongSink(&'static str),
    #[error("bad log configuration: {0}")]
    BadConfig(String),
}

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("system error: {0}")]
    Sys(#[from] nix::Error),
    #[error("alarm not found")]
    NotFound,
}

#[derive(Debug, Error)]
pub enum PpcError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed the channel")]
    Closed,
    #[error("frame of {0} bytes exceeds the data size cap")]
    Oversize(usize),
    #[error("bad payload for command {cmd}: {reason}")]
    BadPayload { cmd: u8, reason: String },
    #[error("no handler registered for command {0}")]
    Unhandled(u8),
}
