//! Per-session connection driver.
//!
//! One task per session: open a connection, feed its lifecycle events to the
//! manager, and sleep out the backoff delay the manager hands back on close.
//! Inbound messages are relayed on a separate task so they never wait behind
//! state handling.

use std::{sync::Arc, time::Duration};

use chat_relay_core::{
    Connection, ConnectionEvent, DisconnectReason, Notifier, RawMessage, SessionId, SessionState,
    extract,
    traits::{ProtocolError, StorageError},
};
use futures::{StreamExt, stream::BoxStream};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};

use crate::SessionManager;

/// What the driver does after a connection ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
    Retry(Duration),
    Stop,
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("Credential error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub(crate) struct SessionConnection {
    manager: SessionManager,
    session_id: SessionId,
    epoch: u64,
}

impl SessionConnection {
    pub(crate) const fn new(manager: SessionManager, session_id: SessionId, epoch: u64) -> Self {
        Self {
            manager,
            session_id,
            epoch,
        }
    }

    /// Spawn the driver. It stops when `interrupt_rx` fires or its sender drops.
    pub(crate) fn spawn(self, interrupt_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(interrupt_rx))
    }

    async fn run(self, mut interrupt_rx: oneshot::Receiver<()>) {
        loop {
            if !self.manager.begin_attempt(&self.session_id, self.epoch).await {
                break;
            }
            match self.attempt(&mut interrupt_rx).await {
                Next::Stop => break,
                Next::Retry(delay) => {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = &mut interrupt_rx => break,
                    }
                }
            }
        }
        tracing::debug!(session_id = %self.session_id, "Connection driver stopped");
    }

    async fn open(
        &self,
        interrupt_rx: &mut oneshot::Receiver<()>,
    ) -> Option<Result<(Connection, Option<String>), AttemptError>> {
        // The load is not raced against the interrupt: a purge waits for it.
        let credentials = match self
            .manager
            .load_credentials(&self.session_id, self.epoch)
            .await
        {
            Ok(Some(credentials)) => credentials,
            Ok(None) => return None,
            Err(e) => return Some(Err(e.into())),
        };
        let identity = credentials.me.clone();
        tokio::select! {
            result = self.manager.connector().connect(&self.session_id, credentials) => {
                Some(result.map(|connection| (connection, identity)).map_err(Into::into))
            }
            _ = &mut *interrupt_rx => None,
        }
    }

    async fn attempt(&self, interrupt_rx: &mut oneshot::Receiver<()>) -> Next {
        let Some(opened) = self.open(interrupt_rx).await else {
            return Next::Stop;
        };

        let (connection, identity) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                tracing::error!(
                    session_id = %self.session_id,
                    state = %SessionState::Connecting,
                    error = %e,
                    "Connection attempt failed"
                );
                let detail = e.to_string();
                return self
                    .manager
                    .on_closed(
                        &self.session_id,
                        self.epoch,
                        DisconnectReason::ConnectFailed,
                        Some(&detail),
                    )
                    .await;
            }
        };

        let Connection {
            handle,
            mut events,
            messages,
        } = connection;

        if !self
            .manager
            .attach(&self.session_id, self.epoch, Arc::clone(&handle))
            .await
        {
            handle.close().await;
            return Next::Stop;
        }

        let (identity_tx, identity_rx) = watch::channel(identity);
        let forwarder = spawn_inbound(
            self.session_id.clone(),
            messages,
            identity_rx,
            Arc::clone(self.manager.notifier()),
        );

        let next = loop {
            tokio::select! {
                _ = &mut *interrupt_rx => break Next::Stop,
                event = events.next() => match event {
                    Some(ConnectionEvent::PairingCode(token)) => {
                        self.manager.on_pairing_code(&self.session_id, self.epoch, &token).await;
                    }
                    Some(ConnectionEvent::Opened { identity }) => {
                        if identity.is_some() {
                            identity_tx.send_replace(identity.clone());
                        }
                        self.manager
                            .on_opened(&self.session_id, self.epoch, identity.as_deref())
                            .await;
                    }
                    Some(ConnectionEvent::CredentialsUpdated(credentials)) => {
                        if credentials.me.is_some() {
                            identity_tx.send_replace(credentials.me.clone());
                        }
                        self.manager
                            .persist_credentials(&self.session_id, self.epoch, &credentials)
                            .await;
                    }
                    Some(ConnectionEvent::Closed { reason, detail }) => {
                        break self
                            .manager
                            .on_closed(&self.session_id, self.epoch, reason, detail.as_deref())
                            .await;
                    }
                    None => {
                        break self
                            .manager
                            .on_closed(
                                &self.session_id,
                                self.epoch,
                                DisconnectReason::ConnectionLost,
                                Some("event stream ended"),
                            )
                            .await;
                    }
                },
            }
        };

        forwarder.abort();
        next
    }
}

fn spawn_inbound(
    session_id: SessionId,
    mut messages: BoxStream<'static, RawMessage>,
    identity: watch::Receiver<Option<String>>,
    notifier: Arc<dyn Notifier>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(raw) = messages.next().await {
            let own = identity.borrow().clone();
            match extract::to_incoming(&session_id, &raw, own.as_deref()) {
                Some(message) => notifier.relay_message(message),
                None => tracing::trace!(%session_id, message_id = %raw.key.id, "Skipped inbound message"),
            }
        }
    })
}
