use std::io;

use thiserror::Error as ThisError;

use crate::config::ConfigError;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("invalid session configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("could not resolve address {host}: {source}")]
    Resolve { host: String, source: io::Error },
    #[error("no usable address found for {0}")]
    NoAddress(String),
    #[error("session has already been started")]
    AlreadyStarted,
    #[error("session has already finished")]
    AlreadyFinished,
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
