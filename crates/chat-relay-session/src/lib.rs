//! Session orchestration and credential storage for chat relay.
//!
//! Provides:
//! - `SessionManager` - Registry driving every session's connection lifecycle
//! - `ReconnectPolicy` - Bounded exponential backoff
//! - Credential stores (filesystem, memory)
//! - `LoopbackConnector` - In-process protocol connector (feature: loopback)

pub mod backoff;
mod connection;
pub mod manager;
pub mod storage;

#[cfg(feature = "loopback")]
pub mod loopback;

pub use backoff::ReconnectPolicy;
pub use manager::{InitOutcome, SendError, SessionInfo, SessionManager};

#[cfg(feature = "loopback")]
pub use loopback::{LoopbackConnector, LoopbackLink};
