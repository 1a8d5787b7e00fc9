//! Notifier configuration.

use std::time::Duration;

/// Default per-request timeout for upstream notifications.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upstream endpoints and delivery timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifierConfig {
    /// Receives `qr`, `connected` and `disconnected` events.
    pub events_url: String,
    /// Receives inbound chat messages.
    pub messages_url: String,
    pub timeout: Duration,
}

impl NotifierConfig {
    /// Build URLs from a backend base URL and two paths.
    #[must_use]
    pub fn new(backend_url: &str, events_path: &str, messages_path: &str) -> Self {
        Self {
            events_url: join_url(backend_url, events_path),
            messages_url: join_url(backend_url, messages_path),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
