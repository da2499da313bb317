use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ember_core::error::ConfigError),
    #[error(transparent)]
    Klog(#[from] ember_core::error::KlogError),
    #[error(transparent)]
    Ppc(#[from] ember_core::error::PpcError),
    #[error(transparent)]
    Http(#[from] ember_http::HttpError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("system error: {0}")]
    Sys(#[from] nix::Error),
    #[error("bad configuration: {0}")]
    BadConfig(String),
}
