//! Connection lifecycle events reported by the protocol layer.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::traits::Credentials;

/// Event emitted by one protocol connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A new pairing token was issued; any previous token is stale.
    PairingCode(String),
    /// Authentication completed.
    Opened { identity: Option<String> },
    /// The socket closed. No further events follow.
    Closed {
        reason: DisconnectReason,
        detail: Option<String>,
    },
    /// The protocol layer changed its key material.
    CredentialsUpdated(Credentials),
}

/// Why a connection dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The device was unlinked. Credentials are useless afterwards.
    LoggedOut,
    /// Another client took over this identity.
    ConnectionReplaced,
    ConnectionClosed,
    ConnectionLost,
    MultideviceMismatch,
    BadSession,
    RestartRequired,
    /// The connection could not be established at all.
    ConnectFailed,
    Other(u16),
}

impl DisconnectReason {
    /// Map a protocol status code.
    #[must_use]
    pub const fn from_status(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            440 => Self::ConnectionReplaced,
            428 => Self::ConnectionClosed,
            408 => Self::ConnectionLost,
            411 => Self::MultideviceMismatch,
            500 => Self::BadSession,
            515 => Self::RestartRequired,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub const fn status(self) -> Option<u16> {
        match self {
            Self::LoggedOut => Some(401),
            Self::ConnectionReplaced => Some(440),
            Self::ConnectionClosed => Some(428),
            Self::ConnectionLost => Some(408),
            Self::MultideviceMismatch => Some(411),
            Self::BadSession => Some(500),
            Self::RestartRequired => Some(515),
            Self::ConnectFailed => None,
            Self::Other(code) => Some(code),
        }
    }

    /// Whether an automatic reconnect should be attempted.
    #[must_use]
    pub const fn is_recoverable(self) -> bool {
        !matches!(self, Self::LoggedOut | Self::ConnectionReplaced)
    }

    /// Whether stored credentials must be discarded.
    #[must_use]
    pub const fn purges_credentials(self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut => f.write_str("logged out"),
            Self::ConnectionReplaced => f.write_str("connection replaced"),
            Self::ConnectionClosed => f.write_str("connection closed"),
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::MultideviceMismatch => f.write_str("multi-device mismatch"),
            Self::BadSession => f.write_str("bad session"),
            Self::RestartRequired => f.write_str("restart required"),
            Self::ConnectFailed => f.write_str("connect failed"),
            Self::Other(code) => write!(f, "status {code}"),
        }
    }
}
