//! In-process protocol connector.
//!
//! Every `connect` call creates a [`LoopbackLink`]: the far end of the
//! connection, through which a test (or the interactive autopilot) issues
//! pairing codes, opens and closes the socket, and delivers messages.
//! Only a manual connector keeps its links; the autopilot owns them otherwise.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chat_relay_core::{
    Connection, ConnectionEvent, ConnectionHandle, Connector, Credentials, DisconnectReason,
    RawMessage, SessionId,
    traits::{ProtocolError, SentMessage},
};
use futures::StreamExt;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

/// Pairing codes issued per connection before the autopilot gives up.
const MAX_PAIRING_CODES: u32 = 5;

#[derive(Debug, Clone, Copy)]
enum Mode {
    Manual,
    Interactive {
        refresh: Duration,
        auto_pair: Option<Duration>,
    },
}

#[derive(Default)]
struct Registry {
    links: Mutex<HashMap<SessionId, Vec<LoopbackLink>>>,
    changed: Notify,
    failures: AtomicU32,
}

/// Connector whose connections live entirely in this process.
#[derive(Clone)]
pub struct LoopbackConnector {
    registry: Arc<Registry>,
    mode: Mode,
}

impl LoopbackConnector {
    /// Connections emit nothing on their own; drive them through their links.
    #[must_use]
    pub fn manual() -> Self {
        Self {
            registry: Arc::default(),
            mode: Mode::Manual,
        }
    }

    /// Connections behave like a device waiting to be paired.
    ///
    /// Paired credentials open immediately. Otherwise a fresh pairing code is
    /// issued every `refresh` until `auto_pair` elapses (the code is
    /// "scanned") or the pairing window expires and the connection drops.
    #[must_use]
    pub fn interactive(refresh: Duration, auto_pair: Option<Duration>) -> Self {
        Self {
            registry: Arc::default(),
            mode: Mode::Interactive { refresh, auto_pair },
        }
    }

    /// Make the next `n` connect calls fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.registry.failures.store(n, Ordering::SeqCst);
    }

    /// Every link created for a session by a manual connector, oldest first.
    #[must_use]
    pub fn links(&self, id: &SessionId) -> Vec<LoopbackLink> {
        self.registry
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of successful connects for a session. Always zero for an
    /// interactive connector.
    #[must_use]
    pub fn connect_count(&self, id: &SessionId) -> usize {
        self.links(id).len()
    }

    /// Wait until the `index`-th connection for a session exists.
    pub async fn wait_for_link(&self, id: &SessionId, index: usize) -> LoopbackLink {
        loop {
            let changed = self.registry.changed.notified();
            if let Some(link) = self.links(id).get(index) {
                return link.clone();
            }
            changed.await;
        }
    }

    fn take_failure(&self) -> bool {
        self.registry
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(
        &self,
        session_id: &SessionId,
        credentials: Credentials,
    ) -> Result<Connection, ProtocolError> {
        if self.take_failure() {
            return Err(ProtocolError::Connect("loopback: injected failure".to_string()));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let wire = Arc::new(Wire::default());

        let link = LoopbackLink {
            session_id: session_id.clone(),
            credentials,
            events: events_tx.clone(),
            messages: messages_tx,
            wire: Arc::clone(&wire),
        };

        match self.mode {
            Mode::Interactive { refresh, auto_pair } => {
                tokio::spawn(autopilot(link, refresh, auto_pair));
            }
            Mode::Manual => {
                self.registry
                    .links
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(session_id.clone())
                    .or_default()
                    .push(link);
                self.registry.changed.notify_waiters();
            }
        }

        Ok(Connection {
            handle: Arc::new(LoopbackHandle {
                events: events_tx,
                wire,
            }),
            events: UnboundedReceiverStream::new(events_rx).boxed(),
            messages: UnboundedReceiverStream::new(messages_rx).boxed(),
        })
    }
}

/// Shared state between a link and its handle.
#[derive(Default)]
struct Wire {
    sent: Mutex<Vec<(String, String)>>,
    send_failure: Mutex<Option<String>>,
    logged_out: AtomicBool,
    closed: AtomicBool,
}

/// Far end of one loopback connection.
#[derive(Clone)]
pub struct LoopbackLink {
    session_id: SessionId,
    credentials: Credentials,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    messages: mpsc::UnboundedSender<RawMessage>,
    wire: Arc<Wire>,
}

impl LoopbackLink {
    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Credentials the connection was opened with.
    #[must_use]
    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn issue_pairing_code(&self, token: impl Into<String>) {
        self.emit(ConnectionEvent::PairingCode(token.into()));
    }

    /// Complete authentication as `identity`, registering the credentials.
    pub fn open(&self, identity: &str) {
        let mut credentials = self.credentials.clone();
        credentials.register(identity);
        self.emit(ConnectionEvent::CredentialsUpdated(credentials));
        self.emit(ConnectionEvent::Opened {
            identity: Some(identity.to_string()),
        });
    }

    pub fn close(&self, reason: DisconnectReason) {
        self.wire.closed.store(true, Ordering::SeqCst);
        self.emit(ConnectionEvent::Closed {
            reason,
            detail: None,
        });
    }

    /// Deliver an inbound message to the session.
    pub fn deliver(&self, message: RawMessage) {
        let _ = self.messages.send(message);
    }

    /// Make subsequent sends fail with `error`.
    pub fn fail_sends(&self, error: impl Into<String>) {
        *self
            .wire
            .send_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error.into());
    }

    /// Messages sent through this connection as `(recipient, text)`.
    #[must_use]
    pub fn sent(&self) -> Vec<(String, String)> {
        self.wire
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn is_logged_out(&self) -> bool {
        self.wire.logged_out.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.wire.closed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: ConnectionEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

struct LoopbackHandle {
    events: mpsc::UnboundedSender<ConnectionEvent>,
    wire: Arc<Wire>,
}

#[async_trait]
impl ConnectionHandle for LoopbackHandle {
    async fn send_text(&self, to: &str, text: &str) -> Result<SentMessage, ProtocolError> {
        if self.wire.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Closed);
        }
        if let Some(error) = self
            .wire
            .send_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(ProtocolError::Send(error));
        }

        self.wire
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((to.to_string(), text.to_string()));

        Ok(SentMessage {
            message_id: Uuid::new_v4().simple().to_string().to_uppercase(),
        })
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        self.wire.logged_out.store(true, Ordering::SeqCst);
        self.wire.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(ConnectionEvent::Closed {
            reason: DisconnectReason::LoggedOut,
            detail: Some("logged out locally".to_string()),
        });
        Ok(())
    }

    async fn close(&self) {
        self.wire.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(ConnectionEvent::Closed {
            reason: DisconnectReason::ConnectionClosed,
            detail: Some("closed locally".to_string()),
        });
    }
}

async fn autopilot(link: LoopbackLink, refresh: Duration, auto_pair: Option<Duration>) {
    if link.credentials.registered {
        let identity = link.credentials.me.clone();
        link.emit(ConnectionEvent::Opened { identity });
        return;
    }

    let pair_at = auto_pair.map(|after| tokio::time::Instant::now() + after);
    for _ in 0..MAX_PAIRING_CODES {
        if link.is_closed() {
            return;
        }
        let token = format!("2@{},loopback", Uuid::new_v4().simple());
        if !link.emit(ConnectionEvent::PairingCode(token)) {
            return;
        }

        match pair_at {
            Some(at) if at <= tokio::time::Instant::now() + refresh => {
                tokio::time::sleep_until(at).await;
                if !link.is_closed() {
                    link.open(&format!("1555{:07}:1@s.whatsapp.net", rand_suffix()));
                }
                return;
            }
            _ => tokio::time::sleep(refresh).await,
        }
    }

    if !link.is_closed() {
        link.wire.closed.store(true, Ordering::SeqCst);
        link.emit(ConnectionEvent::Closed {
            reason: DisconnectReason::ConnectionLost,
            detail: Some("pairing window expired".to_string()),
        });
    }
}

fn rand_suffix() -> u32 {
    u32::try_from(Uuid::new_v4().as_u128() % 10_000_000).unwrap_or_default()
}
