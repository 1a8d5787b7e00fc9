//! Wire protocol for the control plane.
//!
//! Request fields are optional at the serde level so that a missing field is
//! reported as a 400 with a readable message instead of a body rejection.

use chat_relay_core::{PairingImage, SessionId, SessionState};
use chat_relay_session::SessionInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `POST /init` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub chatbot_id: Option<String>,
}

/// `POST /send` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// `POST /disconnect` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl HealthResponse {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Acknowledgement of an init or disconnect request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
    pub session_id: SessionId,
}

impl ActionResponse {
    #[must_use]
    pub fn ok(session_id: SessionId, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            session_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCodeResponse {
    pub success: bool,
    pub session_id: SessionId,
    pub qr_code: PairingImage,
}

/// Public view of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: SessionId,
    pub status: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<PairingImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chatbot_id: Option<String>,
    #[serde(default)]
    pub reconnect_attempts: u32,
}

impl From<SessionInfo> for SessionView {
    fn from(info: SessionInfo) -> Self {
        Self {
            session_id: info.id,
            status: info.state,
            qr_code: info.pairing_image,
            phone_number: info.phone_hint,
            chatbot_id: info.tenant_hint,
            reconnect_attempts: info.reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: bool,
    pub session: SessionView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub success: bool,
    pub sessions: Vec<SessionView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of every failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
}

impl ErrorBody {
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}
