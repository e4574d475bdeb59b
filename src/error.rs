//! Error types for outbox-sender.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot initialize queue store at {}: {source}", path.display())]
    StorageInit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection attempt failed: {0}")]
    Connect(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("message refused or not acknowledged: {0}")]
    Nack(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

/// Where in the send pipeline an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Storage,
    Connect,
    Publish,
    Config,
}

impl Error {
    /// The pipeline stage that produced this error.
    ///
    /// Connect and publish failures are recoverable: the entry stays queued.
    pub fn stage(&self) -> Stage {
        match self {
            Error::StorageInit { .. } | Error::Storage(_) | Error::Serialization(_) => {
                Stage::Storage
            }
            Error::Connect(_) => Stage::Connect,
            Error::Publish(_) | Error::Nack(_) => Stage::Publish,
            Error::Config(_) => Stage::Config,
            Error::Other(_) => Stage::Storage,
        }
    }

    /// True when a later drain may succeed without operator action.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.stage(), Stage::Connect | Stage::Publish)
    }

    pub(crate) fn storage_init(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::StorageInit {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
