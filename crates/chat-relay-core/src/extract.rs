//! Text extraction and echo filtering for inbound messages.

use crate::{
    IncomingMessage, SessionId,
    message::{MediaMessage, MessageContent, RawMessage},
};

/// Address of the broadcast channel used for status updates.
pub const STATUS_BROADCAST: &str = "status@broadcast";

/// Domain appended to bare phone numbers when addressing users.
pub const USER_DOMAIN: &str = "s.whatsapp.net";

/// Best-effort plain text of a message.
///
/// Priority: direct text, extended text, then image, video and document
/// captions. Empty strings count as absent.
#[must_use]
pub fn extract_text(content: &MessageContent) -> Option<&str> {
    non_empty(content.conversation.as_deref())
        .or_else(|| {
            content
                .extended_text_message
                .as_ref()
                .and_then(|m| non_empty(m.text.as_deref()))
        })
        .or_else(|| caption(content.image_message.as_ref()))
        .or_else(|| caption(content.video_message.as_ref()))
        .or_else(|| caption(content.document_message.as_ref()))
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.is_empty())
}

fn caption(media: Option<&MediaMessage>) -> Option<&str> {
    media.and_then(|m| non_empty(m.caption.as_deref()))
}

/// User part of an address: `15550001111:7@s.whatsapp.net` -> `15550001111`.
#[must_use]
pub fn phone_hint(address: &str) -> Option<&str> {
    let user = address.split(['@', ':']).next().unwrap_or_default();
    (!user.is_empty()).then_some(user)
}

/// Whether a message was sent by this session's own identity.
#[must_use]
pub fn is_echo(raw: &RawMessage, own_identity: Option<&str>) -> bool {
    if raw.key.from_me {
        return true;
    }
    match (own_identity.and_then(phone_hint), phone_hint(&raw.key.remote_jid)) {
        (Some(own), Some(sender)) => own == sender,
        _ => false,
    }
}

/// Turn a bare phone number into a user address; full addresses pass through.
#[must_use]
pub fn normalize_recipient(to: &str) -> String {
    let to = to.trim();
    if to.contains('@') {
        return to.to_string();
    }
    let digits: String = to.chars().filter(char::is_ascii_digit).collect();
    format!("{digits}@{USER_DOMAIN}")
}

/// Convert a raw message into the upstream relay shape.
///
/// Returns `None` for echoes, status broadcasts and messages without text.
#[must_use]
pub fn to_incoming(
    session_id: &SessionId,
    raw: &RawMessage,
    own_identity: Option<&str>,
) -> Option<IncomingMessage> {
    if is_echo(raw, own_identity) || raw.key.remote_jid == STATUS_BROADCAST {
        return None;
    }
    let text = raw.message.as_ref().and_then(extract_text)?;
    let timestamp = if raw.timestamp > 0 {
        raw.timestamp
    } else {
        chrono::Utc::now().timestamp()
    };

    Some(IncomingMessage {
        session_id: session_id.clone(),
        from: raw.key.remote_jid.clone(),
        message: text.to_string(),
        message_id: raw.key.id.clone(),
        timestamp,
    })
}
