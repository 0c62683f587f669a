use termsync_terminal::TerminalError;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Terminal(#[from] TerminalError),

    #[error("Client is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ClientError>;
