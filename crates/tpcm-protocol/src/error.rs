//! Manifest error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for manifest operations.
pub type ManifestResult<T> = Result<T, ManifestError>;

/// Errors raised while reading or parsing `.manager` files.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A line is not a group header, comment or `key = value` entry.
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    /// No manifest for the named manager exists on the search path.
    #[error("no manifest found for connection manager {0:?}")]
    NotFound(String),

    /// A descriptor could not be built from the parsed properties.
    #[error("protocol {protocol:?}: {source}")]
    Protocol {
        protocol: String,
        #[source]
        source: tpcm_core::TpError,
    },
}

impl ManifestError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            message: message.into(),
        }
    }
}
