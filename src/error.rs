use thiserror::Error;

use crate::config::ConfigError;
use crate::event::event_bus::EventError;
use crate::event::subscription::HandlerError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
