//! Errors of the connection-manager process.
//!
//! Per-connection operations report [`TpError`] directly, since those errors
//! are what clients see. [`ServerError`] covers process-level failures:
//! loading the configuration, reading the installed manifest, and claiming
//! the manager's bus name.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tpcm_core::TpError;
use tpcm_protocol::ManifestError;

/// Result type for process-level operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors raised while setting up or running a connection manager.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration file did not parse.
    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The configuration parsed but is unusable.
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// A framework error surfaced at process level, for example a bus name
    /// collision when registering the manager.
    #[error(transparent)]
    Telepathy(#[from] TpError),
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
