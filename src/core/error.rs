use std::error::Error as StdError;
use thiserror::Error;

pub type RecordingsResult<T> = Result<T, RecordingsError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{message}")]
    Invalid { message: String },
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn with_context<E>(context: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Context {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordingsError {
    #[error("recording '{name}' not found")]
    NotFound { name: String },
    #[error("invalid recording name '{name}'")]
    InvalidName { name: String },
    #[error("recordings io: {0}")]
    Io(#[from] std::io::Error),
}

impl RecordingsError {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn invalid_name(name: impl Into<String>) -> Self {
        Self::InvalidName { name: name.into() }
    }
}

/// Failures of a call through a `RelayHandle`.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay engine is not running")]
    Stopped,
    #[error(transparent)]
    Config(#[from] ConfigError),
}
