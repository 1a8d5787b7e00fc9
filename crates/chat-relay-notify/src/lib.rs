//! Fire-and-forget HTTP relay of session events to an upstream backend.
//!
//! Provides:
//! - `HttpNotifier` - `Notifier` implementation posting JSON with a bounded timeout
//! - `NotifierConfig` - Target URLs and timeout

pub mod config;
pub mod http;

pub use config::NotifierConfig;
pub use http::{HttpNotifier, NotifyError};
