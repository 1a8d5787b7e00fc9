//! Transport layer for the chat relay control plane.
//!
//! Provides:
//! - Wire protocol (JSON request and response bodies)
//! - HTTP router over a `SessionManager` (feature: http)

pub mod protocol;

#[cfg(feature = "http")]
pub mod error;
#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use error::ApiError;
#[cfg(feature = "http")]
pub use http::router;
pub use protocol::{
    ActionResponse, DisconnectRequest, ErrorBody, HealthResponse, InitRequest, QrCodeResponse,
    SendRequest, SendResponse, SessionView, SessionsResponse, StatusResponse,
};
