//! Raw inbound message payloads as delivered by the protocol layer.

use serde::{Deserialize, Serialize};

/// Inbound message envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub key: MessageKey,
    #[serde(default)]
    pub message: Option<MessageContent>,
    /// Unix epoch seconds, `0` if the protocol did not stamp it.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub push_name: Option<String>,
}

/// Addressing for one message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    /// Conversation address.
    pub remote_jid: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub id: String,
    /// Sender inside a group conversation.
    #[serde(default)]
    pub participant: Option<String>,
}

/// Message body; at most one field is normally populated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    #[serde(default)]
    pub conversation: Option<String>,
    #[serde(default)]
    pub extended_text_message: Option<ExtendedText>,
    #[serde(default)]
    pub image_message: Option<MediaMessage>,
    #[serde(default)]
    pub video_message: Option<MediaMessage>,
    #[serde(default)]
    pub document_message: Option<MediaMessage>,
}

/// Quoted or link-preview text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedText {
    #[serde(default)]
    pub text: Option<String>,
}

/// Media message with an optional caption.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMessage {
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
}

impl RawMessage {
    /// Plain text message from `from`, convenient for connectors and tests.
    #[must_use]
    pub fn text(from: impl Into<String>, id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            key: MessageKey {
                remote_jid: from.into(),
                from_me: false,
                id: id.into(),
                participant: None,
            },
            message: Some(MessageContent {
                conversation: Some(body.into()),
                ..MessageContent::default()
            }),
            timestamp: 0,
            push_name: None,
        }
    }
}
