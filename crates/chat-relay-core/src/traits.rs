//! Core traits for credential storage and protocol connections.

use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{ConnectionEvent, RawMessage};

const MAX_SESSION_ID_LEN: usize = 128;

/// Session identifier.
///
/// Doubles as a directory name in file-backed credential stores, so only
/// ASCII alphanumerics, `-`, `_` and `.` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

/// Rejected session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidSessionId {
    #[error("session id must not be empty")]
    Empty,
    #[error("session id exceeds {MAX_SESSION_ID_LEN} characters")]
    TooLong,
    #[error("session id contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("session id must not be a relative path component")]
    Reserved,
}

impl SessionId {
    /// Validate and wrap a raw identifier.
    ///
    /// # Errors
    /// Returns error if the identifier is empty, too long, or not path-safe.
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidSessionId> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(InvalidSessionId::Empty);
        }
        if raw.len() > MAX_SESSION_ID_LEN {
            return Err(InvalidSessionId::TooLong);
        }
        if raw == "." || raw == ".." {
            return Err(InvalidSessionId::Reserved);
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(InvalidSessionId::InvalidChar(c));
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionId {
    type Err = InvalidSessionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for SessionId {
    type Error = InvalidSessionId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// No live connection; either torn down or waiting out a backoff delay.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// A pairing code has been issued and is waiting to be scanned.
    QrReady,
    /// Authenticated and exchanging messages.
    Connected,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::QrReady => "QR_READY",
            Self::Connected => "CONNECTED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted authentication material for one session.
///
/// `keys` is opaque to everything except the protocol layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Whether pairing has completed at least once.
    #[serde(default)]
    pub registered: bool,
    /// Own address once paired.
    #[serde(default)]
    pub me: Option<String>,
    /// Creation timestamp (Unix epoch seconds).
    #[serde(default)]
    pub created_at: i64,
    /// Protocol key material.
    #[serde(default)]
    pub keys: BTreeMap<String, Value>,
}

impl Credentials {
    /// Fresh, unregistered credentials.
    #[must_use]
    pub fn fresh() -> Self {
        Self {
            created_at: chrono::Utc::now().timestamp(),
            ..Self::default()
        }
    }

    /// Mark pairing as complete for the given own address.
    pub fn register(&mut self, me: impl Into<String>) {
        self.registered = true;
        self.me = Some(me.into());
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed credentials for {0}: {1}")]
    Malformed(SessionId, serde_json::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for credential storage backends.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the credentials for a session, creating fresh ones if absent.
    async fn load_or_create(&self, id: &SessionId) -> Result<Credentials, StorageError>;

    /// Persist updated credentials.
    async fn save(&self, id: &SessionId, credentials: &Credentials) -> Result<(), StorageError>;

    /// Delete everything stored for a session. Absent state is not an error.
    async fn purge(&self, id: &SessionId) -> Result<(), StorageError>;

    /// List sessions with stored credentials.
    async fn list(&self) -> Result<Vec<SessionId>, StorageError>;
}

/// Protocol error.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("{0}")]
    Send(String),
    #[error("Logout failed: {0}")]
    Logout(String),
    #[error("Connection closed")]
    Closed,
}

/// Acknowledgement for an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    pub message_id: String,
}

/// Live side of one protocol connection.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Send a text message to an address.
    async fn send_text(&self, to: &str, text: &str) -> Result<SentMessage, ProtocolError>;

    /// Unlink this device from the account.
    async fn logout(&self) -> Result<(), ProtocolError>;

    /// Close the socket without unlinking.
    async fn close(&self);
}

/// One opened protocol connection.
///
/// Lifecycle events and inbound messages arrive on separate streams so that
/// message relay never waits behind state handling.
pub struct Connection {
    pub handle: Arc<dyn ConnectionHandle>,
    pub events: BoxStream<'static, ConnectionEvent>,
    pub messages: BoxStream<'static, RawMessage>,
}

/// Trait for chat protocol connectors.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection for a session using its stored credentials.
    async fn connect(
        &self,
        session_id: &SessionId,
        credentials: Credentials,
    ) -> Result<Connection, ProtocolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_validation() {
        assert!(SessionId::new("bot-42_a.b").is_ok());
        assert_eq!(SessionId::new(""), Err(InvalidSessionId::Empty));
        assert_eq!(SessionId::new(".."), Err(InvalidSessionId::Reserved));
        assert_eq!(
            SessionId::new("../etc"),
            Err(InvalidSessionId::InvalidChar('/'))
        );
        assert_eq!(SessionId::new("a".repeat(129)), Err(InvalidSessionId::TooLong));
    }

    #[test]
    fn test_session_id_deserialize_rejects_invalid() {
        let ok: SessionId = serde_json::from_str("\"s1\"").unwrap();
        assert_eq!(ok.as_str(), "s1");
        assert!(serde_json::from_str::<SessionId>("\"a b\"").is_err());
    }

    #[test]
    fn test_state_wire_names() {
        let json = serde_json::to_string(&SessionState::QrReady).unwrap();
        assert_eq!(json, "\"QR_READY\"");
        assert_eq!(SessionState::Connected.to_string(), "CONNECTED");
    }

    #[test]
    fn test_credentials_tolerate_missing_fields() {
        let creds: Credentials = serde_json::from_str(r#"{"registered":true}"#).unwrap();
        assert!(creds.registered);
        assert!(creds.me.is_none());
        assert!(creds.keys.is_empty());
    }
}
