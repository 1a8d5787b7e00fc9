//! Core types and capability traits for multiplexed chat protocol sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionId` / `SessionState` - Identity and lifecycle of one session
//! - `Connector` / `ConnectionHandle` - Capability interface to the chat protocol
//! - `CredentialStore` - Durable per-session authentication material
//! - `Notifier` - Best-effort relay of lifecycle and message events
//! - Message extraction and pairing-code rendering

pub mod event;
pub mod extract;
pub mod message;
pub mod notifier;
pub mod pairing;
pub mod traits;

pub use event::{ConnectionEvent, DisconnectReason};
pub use message::RawMessage;
pub use notifier::{IncomingMessage, LifecycleEvent, Notifier, RecordingNotifier};
pub use pairing::PairingImage;
pub use traits::{
    Connection, ConnectionHandle, Connector, CredentialStore, Credentials, SessionId, SessionState,
};
