//! Upstream notification contract.
//!
//! Notifications are best-effort and at-most-once: implementations must never
//! block the caller on delivery and never surface a delivery failure.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{PairingImage, SessionId};

/// Session lifecycle event, serialized as `{type, sessionId, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum LifecycleEvent {
    Qr {
        session_id: SessionId,
        data: QrData,
    },
    Connected {
        session_id: SessionId,
        data: ConnectedData,
    },
    Disconnected {
        session_id: SessionId,
        data: DisconnectedData,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrData {
    pub qr_code: PairingImage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectedData {
    pub disconnected_at: DateTime<Utc>,
}

impl LifecycleEvent {
    /// Wire name of the event type.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Qr { .. } => "qr",
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
        }
    }

    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        match self {
            Self::Qr { session_id, .. }
            | Self::Connected { session_id, .. }
            | Self::Disconnected { session_id, .. } => session_id,
        }
    }
}

/// Inbound chat message relayed upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub session_id: SessionId,
    pub from: String,
    pub message: String,
    pub message_id: String,
    pub timestamp: i64,
}

/// Trait for upstream notifiers.
///
/// Both required methods must return promptly and must not panic on delivery
/// failure.
pub trait Notifier: Send + Sync {
    /// Deliver a lifecycle event.
    fn notify(&self, event: LifecycleEvent);

    /// Deliver an inbound message.
    fn relay_message(&self, message: IncomingMessage);

    /// A new pairing image is available.
    fn notify_qr(&self, session_id: &SessionId, image: &PairingImage) {
        self.notify(LifecycleEvent::Qr {
            session_id: session_id.clone(),
            data: QrData {
                qr_code: image.clone(),
            },
        });
    }

    /// The session authenticated.
    fn notify_connected(&self, session_id: &SessionId, phone_number: Option<String>) {
        self.notify(LifecycleEvent::Connected {
            session_id: session_id.clone(),
            data: ConnectedData {
                phone_number,
                connected_at: Utc::now(),
            },
        });
    }

    /// The session is gone or abandoned.
    fn notify_disconnected(&self, session_id: &SessionId) {
        self.notify(LifecycleEvent::Disconnected {
            session_id: session_id.clone(),
            data: DisconnectedData {
                disconnected_at: Utc::now(),
            },
        });
    }
}

/// Notifier that keeps everything in memory.
///
/// Useful for tests and for running without an upstream backend.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<LifecycleEvent>>,
    messages: Mutex<Vec<IncomingMessage>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded lifecycle events, in delivery order.
    #[must_use]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot of relayed messages, in delivery order.
    #[must_use]
    pub fn messages(&self) -> Vec<IncomingMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of events of `kind` recorded for a session.
    #[must_use]
    pub fn count(&self, session_id: &SessionId, kind: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.session_id() == session_id && e.kind() == kind)
            .count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: LifecycleEvent) {
        tracing::debug!(kind = event.kind(), session_id = %event.session_id(), "Recorded event");
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn relay_message(&self, message: IncomingMessage) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }
}
