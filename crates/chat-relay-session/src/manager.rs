//! Session manager: the registry of every chat session in this process.
//!
//! All session state lives in one map behind one lock. Connection drivers
//! never touch the map directly; they report events through the
//! `pub(crate)` callbacks below, each stamped with the epoch the driver was
//! spawned with, so a driver that outlives its session cannot mutate a newer
//! session registered under the same id.
//!
//! Credential I/O never runs under the registry lock. Each entry carries its
//! own gate instead, which a purge takes last.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chat_relay_core::{
    ConnectionHandle, Connector, CredentialStore, Credentials, DisconnectReason, Notifier,
    PairingImage, SessionId, SessionState,
    extract::{normalize_recipient, phone_hint},
    traits::{ProtocolError, SentMessage, StorageError},
};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, oneshot};

use crate::{
    ReconnectPolicy,
    connection::{Next, SessionConnection},
};

/// Send error.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session {0} is not connected")]
    NotConnected(SessionId),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result of [`SessionManager::init_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// A connection driver was spawned.
    Started,
    /// A live session already exists; nothing changed.
    AlreadyActive,
}

/// Read-only snapshot of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: SessionState,
    pub pairing_image: Option<PairingImage>,
    pub phone_hint: Option<String>,
    pub tenant_hint: Option<String>,
    pub reconnect_attempts: u32,
}

/// Serializes credential I/O for one session. Holds `true` once purged.
type CredentialGate = Arc<Mutex<bool>>;

struct SessionEntry {
    epoch: u64,
    state: SessionState,
    handle: Option<Arc<dyn ConnectionHandle>>,
    pairing_image: Option<PairingImage>,
    phone_hint: Option<String>,
    tenant_hint: Option<String>,
    attempts: u32,
    /// `None` once the driver has stopped; such entries are dormant.
    interrupt_tx: Option<oneshot::Sender<()>>,
    credential_gate: CredentialGate,
}

impl SessionEntry {
    const fn is_live(&self) -> bool {
        self.interrupt_tx.is_some()
    }

    fn snapshot(&self, id: &SessionId) -> SessionInfo {
        SessionInfo {
            id: id.clone(),
            state: self.state,
            pairing_image: self.pairing_image.clone(),
            phone_hint: self.phone_hint.clone(),
            tenant_hint: self.tenant_hint.clone(),
            reconnect_attempts: self.attempts,
        }
    }

    /// Drop the connection and any cached pairing image.
    fn detach(&mut self) {
        self.state = SessionState::Disconnected;
        self.handle = None;
        self.pairing_image = None;
    }
}

struct Shared {
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    notifier: Arc<dyn Notifier>,
    policy: ReconnectPolicy,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    next_epoch: AtomicU64,
}

/// Session manager for multiplexing chat protocol sessions.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    /// Create a new session manager.
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
        notifier: Arc<dyn Notifier>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                credentials,
                notifier,
                policy,
                sessions: RwLock::new(HashMap::new()),
                next_epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Start a session.
    ///
    /// Returns as soon as the connection driver is spawned; pairing and
    /// authentication progress is observable through [`Self::get_session_info`].
    /// A live session with the same id is left untouched.
    pub async fn init_session(&self, id: SessionId, tenant_hint: Option<String>) -> InitOutcome {
        let (interrupt_tx, interrupt_rx) = oneshot::channel();
        let epoch = self.shared.next_epoch.fetch_add(1, Ordering::Relaxed);

        {
            let mut sessions = self.shared.sessions.write().await;
            if sessions.get(&id).is_some_and(SessionEntry::is_live) {
                tracing::info!(session_id = %id, "Session already active, ignoring init");
                return InitOutcome::AlreadyActive;
            }
            sessions.insert(
                id.clone(),
                SessionEntry {
                    epoch,
                    state: SessionState::Connecting,
                    handle: None,
                    pairing_image: None,
                    phone_hint: None,
                    tenant_hint,
                    attempts: 0,
                    interrupt_tx: Some(interrupt_tx),
                    credential_gate: CredentialGate::default(),
                },
            );
        }

        tracing::info!(session_id = %id, "Initializing session");
        SessionConnection::new(self.clone(), id, epoch).spawn(interrupt_rx);
        InitOutcome::Started
    }

    /// Get the cached pairing image for a session.
    pub async fn get_qr_code(&self, id: &SessionId) -> Option<PairingImage> {
        self.shared
            .sessions
            .read()
            .await
            .get(id)
            .and_then(|s| s.pairing_image.clone())
    }

    /// Get a snapshot of one session.
    pub async fn get_session_info(&self, id: &SessionId) -> Option<SessionInfo> {
        self.shared
            .sessions
            .read()
            .await
            .get(id)
            .map(|s| s.snapshot(id))
    }

    /// Snapshot every known session, in no particular order.
    pub async fn get_all_sessions(&self) -> Vec<SessionInfo> {
        self.shared
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, s)| s.snapshot(id))
            .collect()
    }

    /// Send a text message through a connected session.
    ///
    /// # Errors
    /// Returns `NotFound` without a live connection, `NotConnected` unless the
    /// session is `CONNECTED`, and the protocol error otherwise.
    pub async fn send_message(
        &self,
        id: &SessionId,
        to: &str,
        text: &str,
    ) -> Result<SentMessage, SendError> {
        let handle = {
            let sessions = self.shared.sessions.read().await;
            let entry = sessions
                .get(id)
                .ok_or_else(|| SendError::NotFound(id.clone()))?;
            let handle = entry
                .handle
                .clone()
                .ok_or_else(|| SendError::NotFound(id.clone()))?;
            if entry.state != SessionState::Connected {
                return Err(SendError::NotConnected(id.clone()));
            }
            handle
        };

        let recipient = normalize_recipient(to);
        match handle.send_text(&recipient, text).await {
            Ok(sent) => {
                tracing::debug!(session_id = %id, %recipient, message_id = %sent.message_id, "Message sent");
                Ok(sent)
            }
            Err(e) => {
                tracing::warn!(session_id = %id, %recipient, error = %e, "Send failed");
                Err(e.into())
            }
        }
    }

    /// Tear down a session and delete its credentials.
    ///
    /// Always succeeds. Cancels any pending reconnect, logs the device out
    /// (best effort), and notifies upstream once if the session existed.
    pub async fn disconnect(&self, id: &SessionId) {
        let removed = self.shared.sessions.write().await.remove(id);
        let existed = removed.is_some();
        let gate = removed.as_ref().map(|e| Arc::clone(&e.credential_gate));
        if let Some(mut entry) = removed {
            if let Some(tx) = entry.interrupt_tx.take() {
                let _ = tx.send(());
            }
            if let Some(handle) = entry.handle.take() {
                if let Err(e) = handle.logout().await {
                    tracing::warn!(session_id = %id, state = %entry.state, error = %e, "Logout failed");
                }
            }
            tracing::info!(session_id = %id, "Session disconnected");
        }

        self.purge_credentials(id, gate).await;

        if existed {
            self.shared.notifier.notify_disconnected(id);
        }
    }

    /// Re-initialize every session whose stored credentials are paired.
    ///
    /// # Errors
    /// Returns error if the credential store cannot be listed.
    pub async fn restore(&self) -> Result<usize, StorageError> {
        let mut restored = 0;
        for id in self.shared.credentials.list().await? {
            match self.shared.credentials.load_or_create(&id).await {
                Ok(credentials) if credentials.registered => {
                    if self.init_session(id, None).await == InitOutcome::Started {
                        restored += 1;
                    }
                }
                Ok(_) => tracing::debug!(session_id = %id, "Skipping unpaired credentials"),
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Skipping unreadable credentials"),
            }
        }
        tracing::info!(restored, "Restored sessions");
        Ok(restored)
    }

    /// Stop every driver and close every connection, keeping credentials.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.shared.sessions.write().await.drain().collect();
        for (id, mut entry) in drained {
            if let Some(tx) = entry.interrupt_tx.take() {
                let _ = tx.send(());
            }
            if let Some(handle) = entry.handle.take() {
                handle.close().await;
            }
            tracing::debug!(session_id = %id, "Session closed for shutdown");
        }
    }

    pub(crate) fn connector(&self) -> &Arc<dyn Connector> {
        &self.shared.connector
    }

    pub(crate) fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.shared.notifier
    }

    /// A (re)connect attempt is starting. Returns false if the driver is stale.
    pub(crate) async fn begin_attempt(&self, id: &SessionId, epoch: u64) -> bool {
        let mut sessions = self.shared.sessions.write().await;
        let Some(entry) = current(&mut sessions, id, epoch) else {
            return false;
        };
        entry.state = SessionState::Connecting;
        true
    }

    /// Register the handle of a freshly opened connection.
    pub(crate) async fn attach(
        &self,
        id: &SessionId,
        epoch: u64,
        handle: Arc<dyn ConnectionHandle>,
    ) -> bool {
        let mut sessions = self.shared.sessions.write().await;
        let Some(entry) = current(&mut sessions, id, epoch) else {
            return false;
        };
        entry.handle = Some(handle);
        true
    }

    pub(crate) async fn on_pairing_code(&self, id: &SessionId, epoch: u64, token: &str) {
        let image = match PairingImage::render(token) {
            Ok(image) => image,
            Err(e) => {
                tracing::error!(session_id = %id, error = %e, "Failed to render pairing code");
                // The previous code is superseded even though this one cannot be shown.
                let mut sessions = self.shared.sessions.write().await;
                if let Some(entry) = current(&mut sessions, id, epoch) {
                    entry.state = SessionState::Connecting;
                    entry.pairing_image = None;
                }
                return;
            }
        };

        {
            let mut sessions = self.shared.sessions.write().await;
            let Some(entry) = current(&mut sessions, id, epoch) else {
                return;
            };
            entry.state = SessionState::QrReady;
            entry.pairing_image = Some(image.clone());
        }

        tracing::info!(session_id = %id, "Pairing code issued");
        self.shared.notifier.notify_qr(id, &image);
    }

    pub(crate) async fn on_opened(&self, id: &SessionId, epoch: u64, identity: Option<&str>) {
        let phone = identity.and_then(phone_hint).map(str::to_owned);

        {
            let mut sessions = self.shared.sessions.write().await;
            let Some(entry) = current(&mut sessions, id, epoch) else {
                return;
            };
            entry.state = SessionState::Connected;
            entry.pairing_image = None;
            entry.attempts = 0;
            if phone.is_some() {
                entry.phone_hint.clone_from(&phone);
            }
        }

        tracing::info!(session_id = %id, phone = ?phone, "Session connected");
        self.shared.notifier.notify_connected(id, phone);
    }

    /// Apply the reconnect policy to a closed connection.
    pub(crate) async fn on_closed(
        &self,
        id: &SessionId,
        epoch: u64,
        reason: DisconnectReason,
        detail: Option<&str>,
    ) -> Next {
        let mut sessions = self.shared.sessions.write().await;
        let Some(entry) = current(&mut sessions, id, epoch) else {
            return Next::Stop;
        };
        let previous = entry.state;
        entry.detach();

        if !reason.is_recoverable() {
            entry.interrupt_tx = None;
            let gate = Arc::clone(&entry.credential_gate);
            drop(sessions);
            tracing::warn!(session_id = %id, state = %previous, %reason, ?detail, "Connection closed permanently");
            if reason.purges_credentials() {
                self.purge_credentials(id, Some(gate)).await;
            }
            self.shared.notifier.notify_disconnected(id);
            return Next::Stop;
        }

        entry.attempts += 1;
        if let Some(delay) = self.shared.policy.next_delay(entry.attempts) {
            let attempt = entry.attempts;
            drop(sessions);
            tracing::info!(session_id = %id, state = %previous, %reason, ?detail, ?delay, attempt, "Connection closed, reconnecting");
            Next::Retry(delay)
        } else {
            entry.interrupt_tx = None;
            let attempts = entry.attempts;
            drop(sessions);
            tracing::warn!(session_id = %id, state = %previous, %reason, attempts, "Reconnect attempts exhausted, abandoning session");
            self.shared.notifier.notify_disconnected(id);
            Next::Stop
        }
    }

    /// Load (or create) the credentials a connection attempt starts from.
    ///
    /// Returns `None` if the driver is stale or the session was purged.
    pub(crate) async fn load_credentials(
        &self,
        id: &SessionId,
        epoch: u64,
    ) -> Result<Option<Credentials>, StorageError> {
        let Some(gate) = self.credential_gate(id, epoch).await else {
            return Ok(None);
        };
        let purged = gate.lock().await;
        if *purged {
            return Ok(None);
        }
        self.shared.credentials.load_or_create(id).await.map(Some)
    }

    /// Persist credentials changed by the protocol layer.
    pub(crate) async fn persist_credentials(
        &self,
        id: &SessionId,
        epoch: u64,
        credentials: &Credentials,
    ) {
        let Some(gate) = self.credential_gate(id, epoch).await else {
            return;
        };
        let purged = gate.lock().await;
        if *purged {
            return;
        }
        if let Err(e) = self.shared.credentials.save(id, credentials).await {
            tracing::error!(session_id = %id, error = %e, "Failed to save credentials");
        }
    }

    /// The gate is held for the whole I/O call, so a purge waits for
    /// in-flight loads and saves and none can follow it.
    async fn credential_gate(&self, id: &SessionId, epoch: u64) -> Option<CredentialGate> {
        self.shared
            .sessions
            .read()
            .await
            .get(id)
            .filter(|e| e.epoch == epoch)
            .map(|e| Arc::clone(&e.credential_gate))
    }

    async fn purge_credentials(&self, id: &SessionId, gate: Option<CredentialGate>) {
        let guard = match &gate {
            Some(gate) => {
                let mut purged = gate.lock().await;
                *purged = true;
                Some(purged)
            }
            None => None,
        };
        if let Err(e) = self.shared.credentials.purge(id).await {
            tracing::error!(session_id = %id, error = %e, "Failed to purge credentials");
        }
        drop(guard);
    }
}

fn current<'a>(
    sessions: &'a mut HashMap<SessionId, SessionEntry>,
    id: &SessionId,
    epoch: u64,
) -> Option<&'a mut SessionEntry> {
    sessions.get_mut(id).filter(|e| e.epoch == epoch)
}

#[cfg(all(test, feature = "loopback", feature = "memory"))]
mod tests {
    use std::time::Duration;

    use std::sync::atomic::AtomicBool;

    use chat_relay_core::{RawMessage, RecordingNotifier};
    use tokio::sync::Notify;

    use super::*;
    use crate::{LoopbackConnector, storage::MemoryCredentialStore};

    const IDENTITY: &str = "15550001111:1@s.whatsapp.net";

    struct Harness {
        manager: SessionManager,
        connector: LoopbackConnector,
        store: Arc<MemoryCredentialStore>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness_with(policy: ReconnectPolicy) -> Harness {
        let connector = LoopbackConnector::manual();
        let store = Arc::new(MemoryCredentialStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let manager = SessionManager::new(
            Arc::new(connector.clone()),
            store.clone(),
            notifier.clone(),
            policy,
        );
        Harness {
            manager,
            connector,
            store,
            notifier,
        }
    }

    fn harness() -> Harness {
        harness_with(ReconnectPolicy::default())
    }

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(300), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn wait_for_info(
        manager: &SessionManager,
        id: &SessionId,
        check: impl Fn(&SessionInfo) -> bool,
    ) -> SessionInfo {
        tokio::time::timeout(Duration::from_secs(300), async {
            loop {
                if let Some(info) = manager.get_session_info(id).await {
                    if check(&info) {
                        return info;
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("session never reached expected state")
    }

    async fn wait_for_state(manager: &SessionManager, id: &SessionId, state: SessionState) -> SessionInfo {
        wait_for_info(manager, id, |info| info.state == state).await
    }

    /// Init `id` and complete pairing on its first connection.
    async fn connected(h: &Harness, id: &SessionId) -> crate::LoopbackLink {
        assert_eq!(h.manager.init_session(id.clone(), None).await, InitOutcome::Started);
        let link = h.connector.wait_for_link(id, 0).await;
        link.open(IDENTITY);
        wait_for_state(&h.manager, id, SessionState::Connected).await;
        link
    }

    #[tokio::test]
    async fn test_unknown_session_queries() {
        let h = harness();
        let id = sid("ghost");

        assert!(h.manager.get_qr_code(&id).await.is_none());
        assert!(h.manager.get_session_info(&id).await.is_none());
        assert!(h.manager.get_all_sessions().await.is_empty());
        assert!(matches!(
            h.manager.send_message(&id, "15550002222", "hi").await,
            Err(SendError::NotFound(_))
        ));

        h.manager.disconnect(&id).await;
        assert!(h.notifier.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairing_codes_rotate_until_connected() {
        let h = harness();
        let id = sid("s1");
        h.manager.init_session(id.clone(), Some("acme".into())).await;
        let link = h.connector.wait_for_link(&id, 0).await;

        link.issue_pairing_code("tok1");
        wait_for_state(&h.manager, &id, SessionState::QrReady).await;
        let first = h.manager.get_qr_code(&id).await.unwrap();
        assert!(first.as_data_uri().starts_with("data:image/svg+xml;base64,"));

        link.issue_pairing_code("tok2");
        wait_for_info(&h.manager, &id, |info| {
            info.pairing_image.as_ref().is_some_and(|image| *image != first)
        })
        .await;

        link.open(IDENTITY);
        let info = wait_for_state(&h.manager, &id, SessionState::Connected).await;
        assert!(info.pairing_image.is_none());
        assert!(h.manager.get_qr_code(&id).await.is_none());
        assert_eq!(info.phone_hint.as_deref(), Some("15550001111"));
        assert_eq!(info.tenant_hint.as_deref(), Some("acme"));

        assert_eq!(h.notifier.count(&id, "qr"), 2);
        assert_eq!(h.notifier.count(&id, "connected"), 1);
        let stored = h.store.get(&id).unwrap().unwrap();
        assert!(stored.registered);
        assert_eq!(stored.me.as_deref(), Some(IDENTITY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrenderable_code_clears_previous_image() {
        let h = harness();
        let id = sid("s1");
        h.manager.init_session(id.clone(), None).await;
        let link = h.connector.wait_for_link(&id, 0).await;

        link.issue_pairing_code("tok1");
        wait_for_state(&h.manager, &id, SessionState::QrReady).await;

        link.issue_pairing_code("");
        let info = wait_for_state(&h.manager, &id, SessionState::Connecting).await;
        assert!(info.pairing_image.is_none());
        assert!(h.manager.get_qr_code(&id).await.is_none());
        assert_eq!(h.notifier.count(&id, "qr"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_is_idempotent_while_live() {
        let h = harness();
        let id = sid("s1");
        connected(&h, &id).await;

        assert_eq!(
            h.manager.init_session(id.clone(), None).await,
            InitOutcome::AlreadyActive
        );
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.connector.connect_count(&id), 1);
        assert_eq!(h.manager.get_all_sessions().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recoverable_close_reconnects_and_resets_counter() {
        let h = harness();
        let id = sid("s1");
        let first = connected(&h, &id).await;

        first.close(DisconnectReason::ConnectionLost);
        let second = h.connector.wait_for_link(&id, 1).await;
        let info = h.manager.get_session_info(&id).await.unwrap();
        assert_eq!(info.reconnect_attempts, 1);

        second.open(IDENTITY);
        let info = wait_for_state(&h.manager, &id, SessionState::Connected).await;
        assert_eq!(info.reconnect_attempts, 0);
        assert_eq!(h.notifier.count(&id, "disconnected"), 0);
        assert_eq!(h.notifier.count(&id, "connected"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logged_out_purges_without_retry() {
        let h = harness();
        let id = sid("s1");
        let link = connected(&h, &id).await;

        link.close(DisconnectReason::LoggedOut);
        wait_until(|| h.notifier.count(&id, "disconnected") == 1).await;
        assert!(h.store.get(&id).unwrap().is_none());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.connector.connect_count(&id), 1);
        let info = h.manager.get_session_info(&id).await.unwrap();
        assert_eq!(info.state, SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_keeps_credentials_without_retry() {
        let h = harness();
        let id = sid("s1");
        let link = connected(&h, &id).await;

        link.close(DisconnectReason::ConnectionReplaced);
        wait_until(|| h.notifier.count(&id, "disconnected") == 1).await;
        assert!(h.store.get(&id).unwrap().is_some_and(|c| c.registered));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.connector.connect_count(&id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logged_out_after_recoverable_close_stops() {
        let h = harness();
        let id = sid("s1");
        let first = connected(&h, &id).await;

        first.close(DisconnectReason::ConnectionLost);
        let second = h.connector.wait_for_link(&id, 1).await;
        second.close(DisconnectReason::LoggedOut);

        wait_until(|| h.notifier.count(&id, "disconnected") == 1).await;
        assert!(h.store.get(&id).unwrap().is_none());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.connector.connect_count(&id), 2);
        assert_eq!(h.notifier.count(&id, "disconnected"), 1);
        let info = h.manager.get_session_info(&id).await.unwrap();
        assert_eq!(info.state, SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinit_during_backoff_keeps_counter() {
        let h = harness_with(ReconnectPolicy {
            base_delay: Duration::from_secs(10),
            ..ReconnectPolicy::default()
        });
        let id = sid("s1");
        let link = connected(&h, &id).await;

        link.close(DisconnectReason::ConnectionLost);
        wait_for_info(&h.manager, &id, |info| info.reconnect_attempts == 1).await;

        assert_eq!(
            h.manager.init_session(id.clone(), None).await,
            InitOutcome::AlreadyActive
        );
        let info = h.manager.get_session_info(&id).await.unwrap();
        assert_eq!(info.reconnect_attempts, 1);
        assert_eq!(h.connector.connect_count(&id), 1);

        h.connector.wait_for_link(&id, 1).await;
        assert_eq!(h.connector.connect_count(&id), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dormant_session_can_be_reinitialized() {
        let h = harness();
        let id = sid("s1");
        let link = connected(&h, &id).await;
        link.close(DisconnectReason::LoggedOut);
        wait_until(|| h.notifier.count(&id, "disconnected") == 1).await;

        assert_eq!(h.manager.init_session(id.clone(), None).await, InitOutcome::Started);
        let fresh = h.connector.wait_for_link(&id, 1).await;
        assert!(!fresh.credentials().registered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_logs_out_and_forgets_session() {
        let h = harness();
        let id = sid("s1");
        let link = connected(&h, &id).await;

        h.manager.disconnect(&id).await;
        assert!(link.is_logged_out());
        assert!(h.store.get(&id).unwrap().is_none());
        assert!(h.manager.get_session_info(&id).await.is_none());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.notifier.count(&id, "disconnected"), 1);
        assert_eq!(h.connector.connect_count(&id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let h = harness_with(ReconnectPolicy {
            base_delay: Duration::from_secs(10),
            ..ReconnectPolicy::default()
        });
        let id = sid("s1");
        let link = connected(&h, &id).await;

        link.close(DisconnectReason::ConnectionLost);
        wait_for_info(&h.manager, &id, |info| info.reconnect_attempts == 1).await;

        h.manager.disconnect(&id).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.connector.connect_count(&id), 1);
        assert_eq!(h.notifier.count(&id, "disconnected"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_connected_session() {
        let h = harness();
        let id = sid("s1");
        h.manager.init_session(id.clone(), None).await;
        let link = h.connector.wait_for_link(&id, 0).await;
        link.issue_pairing_code("tok1");
        wait_for_state(&h.manager, &id, SessionState::QrReady).await;

        let err = h.manager.send_message(&id, "15550002222", "hi").await.unwrap_err();
        assert!(matches!(err, SendError::NotConnected(_)));
        assert_eq!(err.to_string(), "Session s1 is not connected");
        assert!(link.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_normalizes_recipient() {
        let h = harness();
        let id = sid("s1");
        let link = connected(&h, &id).await;

        let sent = h
            .manager
            .send_message(&id, "+1 (555) 000-2222", "hello there")
            .await
            .unwrap();
        assert!(!sent.message_id.is_empty());
        assert_eq!(
            link.sent(),
            vec![("15550002222@s.whatsapp.net".to_string(), "hello there".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_surfaces_protocol_errors() {
        let h = harness();
        let id = sid("s1");
        let link = connected(&h, &id).await;
        link.fail_sends("not on network");

        let err = h
            .manager
            .send_message(&id, "15550002222@s.whatsapp.net", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Protocol(ProtocolError::Send(_))));
        assert_eq!(err.to_string(), "not on network");
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_messages_are_relayed_without_echoes() {
        let h = harness();
        let id = sid("s1");
        let link = connected(&h, &id).await;

        link.deliver(RawMessage::text("15559990000@s.whatsapp.net", "M1", "hello"));
        let mut own = RawMessage::text("15550001111@s.whatsapp.net", "M2", "echo");
        link.deliver(own.clone());
        own.key.remote_jid = "15559990000@s.whatsapp.net".into();
        own.key.from_me = true;
        link.deliver(own);
        link.deliver(RawMessage::text("status@broadcast", "M3", "story"));
        link.deliver(RawMessage::text("15559990000@s.whatsapp.net", "M4", "again"));

        wait_until(|| h.notifier.messages().len() == 2).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let messages = h.notifier.messages();
        let ids: Vec<&str> = messages.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, ["M1", "M4"]);
        assert_eq!(messages[0].from, "15559990000@s.whatsapp.net");
        assert_eq!(messages[0].message, "hello");
        assert_eq!(messages[0].session_id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_retried() {
        let h = harness();
        let id = sid("s1");
        h.connector.fail_next_connects(1);
        h.manager.init_session(id.clone(), None).await;

        let link = h.connector.wait_for_link(&id, 0).await;
        assert_eq!(
            h.manager.get_session_info(&id).await.unwrap().reconnect_attempts,
            1
        );
        link.open(IDENTITY);
        wait_for_state(&h.manager, &id, SessionState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_exhaust_then_abandon() {
        let h = harness();
        let id = sid("s1");
        connected(&h, &id).await;

        // The fifth consecutive close abandons the session.
        for index in 0..5 {
            let link = h.connector.wait_for_link(&id, index).await;
            link.close(DisconnectReason::ConnectionLost);
        }

        wait_until(|| h.notifier.count(&id, "disconnected") == 1).await;
        tokio::time::sleep(Duration::from_secs(300)).await;

        assert_eq!(h.connector.connect_count(&id), 5);
        assert_eq!(h.notifier.count(&id, "disconnected"), 1);
        let info = h.manager.get_session_info(&id).await.unwrap();
        assert_eq!(info.state, SessionState::Disconnected);
        assert_eq!(info.reconnect_attempts, 5);
        assert!(h.store.get(&id).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_starts_paired_sessions_only() {
        let h = harness();
        let mut paired = Credentials::fresh();
        paired.register(IDENTITY);
        h.store.save(&sid("paired"), &paired).await.unwrap();
        h.store.save(&sid("unpaired"), &Credentials::fresh()).await.unwrap();

        assert_eq!(h.manager.restore().await.unwrap(), 1);
        assert!(h.manager.get_session_info(&sid("paired")).await.is_some());
        assert!(h.manager.get_session_info(&sid("unpaired")).await.is_none());

        let link = h.connector.wait_for_link(&sid("paired"), 0).await;
        assert!(link.credentials().registered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_connections_and_keeps_credentials() {
        let h = harness();
        let id = sid("s1");
        let link = connected(&h, &id).await;

        h.manager.shutdown().await;
        assert!(link.is_closed());
        assert!(!link.is_logged_out());
        assert!(h.manager.get_all_sessions().await.is_empty());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.connector.connect_count(&id), 1);
        assert_eq!(h.notifier.count(&id, "disconnected"), 0);
        assert!(h.store.get(&id).unwrap().is_some_and(|c| c.registered));
    }

    /// Store whose loads and saves block while stalled, until released.
    struct StallingStore {
        inner: Arc<MemoryCredentialStore>,
        stalled: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl StallingStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: Arc::new(MemoryCredentialStore::new()),
                stalled: AtomicBool::new(false),
                entered: Notify::new(),
                release: Notify::new(),
            })
        }

        async fn gate(&self) {
            if self.stalled.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
        }
    }

    #[async_trait::async_trait]
    impl CredentialStore for StallingStore {
        async fn load_or_create(&self, id: &SessionId) -> Result<Credentials, StorageError> {
            self.gate().await;
            self.inner.load_or_create(id).await
        }

        async fn save(&self, id: &SessionId, credentials: &Credentials) -> Result<(), StorageError> {
            self.gate().await;
            self.inner.save(id, credentials).await
        }

        async fn purge(&self, id: &SessionId) -> Result<(), StorageError> {
            self.inner.purge(id).await
        }

        async fn list(&self) -> Result<Vec<SessionId>, StorageError> {
            self.inner.list().await
        }
    }

    fn stalling_manager(store: &Arc<StallingStore>) -> (SessionManager, LoopbackConnector) {
        let connector = LoopbackConnector::manual();
        let manager = SessionManager::new(
            Arc::new(connector.clone()),
            store.clone(),
            Arc::new(RecordingNotifier::new()),
            ReconnectPolicy::default(),
        );
        (manager, connector)
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_load_leaves_nothing_stored() {
        let store = StallingStore::new();
        let (manager, _connector) = stalling_manager(&store);
        let id = sid("s1");

        store.stalled.store(true, Ordering::SeqCst);
        manager.init_session(id.clone(), None).await;
        store.entered.notified().await;

        let disconnecting = tokio::spawn({
            let manager = manager.clone();
            let id = id.clone();
            async move { manager.disconnect(&id).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.get_session_info(&id).await.is_none());

        store.release.notify_one();
        disconnecting.await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(store.inner.get(&id).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_save_does_not_block_registry() {
        let store = StallingStore::new();
        let (manager, connector) = stalling_manager(&store);
        let first = sid("s1");
        let second = sid("s2");

        manager.init_session(first.clone(), None).await;
        let link = connector.wait_for_link(&first, 0).await;
        store.stalled.store(true, Ordering::SeqCst);
        link.open(IDENTITY);
        store.entered.notified().await;

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            manager.init_session(second.clone(), None),
        )
        .await
        .expect("init blocked behind a credential save");
        assert_eq!(outcome, InitOutcome::Started);
        assert!(manager.get_session_info(&first).await.is_some());

        store.release.notify_one();
        wait_until(|| {
            store
                .inner
                .get(&first)
                .unwrap()
                .is_some_and(|c| c.registered)
        })
        .await;
        wait_for_state(&manager, &first, SessionState::Connected).await;
    }
}
