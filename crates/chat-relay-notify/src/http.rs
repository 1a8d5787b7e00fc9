//! HTTP notifier.

use std::{future::Future, sync::Arc, time::Duration};

use chat_relay_core::{IncomingMessage, LifecycleEvent, Notifier, SessionId};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio::runtime::Handle;

use crate::NotifierConfig;

/// Notify error.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Upstream responded with {0}")]
    Status(StatusCode),
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Posts lifecycle events and inbound messages to the upstream backend.
///
/// Every public `Notifier` call returns immediately; delivery runs on a
/// spawned task and failures are logged, never retried.
#[derive(Clone)]
pub struct HttpNotifier {
    client: Client,
    config: Arc<NotifierConfig>,
}

impl HttpNotifier {
    /// Create a notifier.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(config: NotifierConfig) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    #[must_use]
    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    /// Post a JSON body, treating any non-2xx status as failure.
    ///
    /// # Errors
    /// Returns error on timeout, transport failure, or non-success status.
    pub async fn post_json<T>(&self, url: &str, body: &T) -> Result<(), NotifyError>
    where
        T: Serialize + ?Sized,
    {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Status(status))
        }
    }

    /// Deliver a lifecycle event and wait for the outcome.
    ///
    /// # Errors
    /// See [`Self::post_json`].
    pub async fn deliver_event(&self, event: &LifecycleEvent) -> Result<(), NotifyError> {
        self.post_json(&self.config.events_url, event).await
    }

    /// Deliver an inbound message and wait for the outcome.
    ///
    /// # Errors
    /// See [`Self::post_json`].
    pub async fn deliver_message(&self, message: &IncomingMessage) -> Result<(), NotifyError> {
        self.post_json(&self.config.messages_url, message).await
    }

    fn classify(&self, error: reqwest::Error) -> NotifyError {
        if error.is_timeout() {
            NotifyError::Timeout(self.config.timeout)
        } else {
            NotifyError::Request(error)
        }
    }

    fn spawn_logged<F>(&self, kind: &'static str, session_id: SessionId, url: String, delivery: F)
    where
        F: Future<Output = Result<(), NotifyError>> + Send + 'static,
    {
        let Ok(handle) = Handle::try_current() else {
            tracing::warn!(event = kind, %session_id, %url, "No runtime, dropping notification");
            return;
        };

        handle.spawn(async move {
            match delivery.await {
                Ok(()) => tracing::debug!(event = kind, %session_id, %url, "Notification delivered"),
                Err(e) => tracing::warn!(
                    event = kind,
                    %session_id,
                    %url,
                    error = %e,
                    "Notification failed"
                ),
            }
        });
    }
}

impl Notifier for HttpNotifier {
    fn notify(&self, event: LifecycleEvent) {
        let this = self.clone();
        let kind = event.kind();
        let session_id = event.session_id().clone();
        let url = self.config.events_url.clone();
        self.spawn_logged(kind, session_id, url, async move {
            this.deliver_event(&event).await
        });
    }

    fn relay_message(&self, message: IncomingMessage) {
        let this = self.clone();
        let session_id = message.session_id.clone();
        let url = self.config.messages_url.clone();
        self.spawn_logged("message", session_id, url, async move {
            this.deliver_message(&message).await
        });
    }
}
