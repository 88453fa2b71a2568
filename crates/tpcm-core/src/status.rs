//! Connection status and status-change reasons.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a connection.
///
/// `New` is private: it is reported externally as `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum ConnectionStatus {
    Connecting = 1,
    Connected = 2,
    Disconnected = 3,
    New = 4,
}

impl ConnectionStatus {
    /// Wire value of the internal state.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// The status as clients may see it.
    pub fn external(self) -> ConnectionStatus {
        match self {
            Self::New => Self::Disconnected,
            other => other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::New => "new",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a status change happened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum StatusReason {
    #[default]
    NoneSpecified = 0,
    Requested = 1,
    NetworkError = 2,
    AuthenticationFailed = 3,
    EncryptionError = 4,
    NameInUse = 5,
    CertNotProvided = 6,
    CertUntrusted = 7,
    CertExpired = 8,
    CertNotActivated = 9,
    CertHostnameMismatch = 10,
    CertFingerprintMismatch = 11,
    CertSelfSigned = 12,
    CertOtherError = 13,
}

impl StatusReason {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_exposed_as_disconnected() {
        assert_eq!(ConnectionStatus::New.external(), ConnectionStatus::Disconnected);
        assert_eq!(ConnectionStatus::Connected.external(), ConnectionStatus::Connected);
        assert_eq!(ConnectionStatus::Connecting.as_u32(), 1);
        assert_eq!(ConnectionStatus::Connected.as_u32(), 2);
        assert_eq!(ConnectionStatus::Disconnected.as_u32(), 3);
        assert_eq!(ConnectionStatus::New.as_u32(), 4);
    }

    #[test]
    fn reason_values() {
        assert_eq!(StatusReason::default(), StatusReason::NoneSpecified);
        assert_eq!(StatusReason::Requested.as_u32(), 1);
        assert_eq!(StatusReason::EncryptionError.as_u32(), 4);
    }
}
