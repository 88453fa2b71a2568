//! Error taxonomy shared by every tpcm crate.
//!
//! Each variant corresponds to one well-known error name on the bus; the
//! message is free text meant for humans and logs.

use thiserror::Error;

use crate::status::StatusReason;

/// Prefix of every wire error name.
pub const ERROR_PREFIX: &str = "org.freedesktop.Telepathy.Error";

/// Errors reported by the connection-manager framework.
///
/// Errors are cheap to clone so that one failure (for example a
/// disconnect) can be delivered to many pending requests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TpError {
    /// Malformed input from a client.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Handle unknown in its repository, or identifier failed normalization.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// The current state does not permit the operation.
    #[error("not available: {0}")]
    NotAvailable(String),

    /// Nothing understands the request.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A client tried to release something it did not hold.
    #[error("not yours: {0}")]
    NotYours(String),

    /// The connection is, or became, disconnected.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// A bus name could not be acquired or was lost.
    #[error("name owner lost: {0}")]
    NameOwnerLost(String),

    /// A peer violated the wire contract.
    #[error("inconsistent: {0}")]
    Inconsistent(String),

    /// The network connection to the service failed.
    #[error("network error: {0}")]
    NetworkError(String),

    /// The service rejected our credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The service refused an operation for lack of permission.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// TLS or another encryption layer failed.
    #[error("encryption error: {0}")]
    EncryptionError(String),
}

impl TpError {
    /// Creates an [`TpError::InvalidArgument`].
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Creates an [`TpError::InvalidHandle`].
    pub fn invalid_handle(msg: impl Into<String>) -> Self {
        Self::InvalidHandle(msg.into())
    }

    /// Creates a [`TpError::NotAvailable`].
    pub fn not_available(msg: impl Into<String>) -> Self {
        Self::NotAvailable(msg.into())
    }

    /// Creates a [`TpError::NotImplemented`].
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }

    /// Creates a [`TpError::NotYours`].
    pub fn not_yours(msg: impl Into<String>) -> Self {
        Self::NotYours(msg.into())
    }

    /// Creates a [`TpError::Disconnected`].
    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::Disconnected(msg.into())
    }

    /// Creates a [`TpError::NameOwnerLost`].
    pub fn name_owner_lost(msg: impl Into<String>) -> Self {
        Self::NameOwnerLost(msg.into())
    }

    /// Creates a [`TpError::Inconsistent`].
    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::Inconsistent(msg.into())
    }

    /// Creates a [`TpError::NetworkError`].
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates a [`TpError::AuthenticationFailed`].
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    /// Short error kind, the last component of the wire name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::InvalidHandle(_) => "InvalidHandle",
            Self::NotAvailable(_) => "NotAvailable",
            Self::NotImplemented(_) => "NotImplemented",
            Self::NotYours(_) => "NotYours",
            Self::Disconnected(_) => "Disconnected",
            Self::NameOwnerLost(_) => "NameOwnerLost",
            Self::Inconsistent(_) => "Inconsistent",
            Self::NetworkError(_) => "NetworkError",
            Self::AuthenticationFailed(_) => "AuthenticationFailed",
            Self::PermissionDenied(_) => "PermissionDenied",
            Self::EncryptionError(_) => "EncryptionError",
        }
    }

    /// The fully qualified error name sent on the bus.
    pub fn dbus_name(&self) -> String {
        format!("{ERROR_PREFIX}.{}", self.kind())
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidArgument(m)
            | Self::InvalidHandle(m)
            | Self::NotAvailable(m)
            | Self::NotImplemented(m)
            | Self::NotYours(m)
            | Self::Disconnected(m)
            | Self::NameOwnerLost(m)
            | Self::Inconsistent(m)
            | Self::NetworkError(m)
            | Self::AuthenticationFailed(m)
            | Self::PermissionDenied(m)
            | Self::EncryptionError(m) => m,
        }
    }

    /// The status-change reason reported when this error aborts a connect.
    pub fn status_reason(&self) -> StatusReason {
        match self {
            Self::NetworkError(_) => StatusReason::NetworkError,
            Self::AuthenticationFailed(_) | Self::PermissionDenied(_) => {
                StatusReason::AuthenticationFailed
            }
            Self::EncryptionError(_) => StatusReason::EncryptionError,
            _ => StatusReason::NoneSpecified,
        }
    }
}

/// Result alias used throughout the framework.
pub type TpResult<T> = Result<T, TpError>;
