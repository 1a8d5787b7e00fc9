//! Server configuration from environment variables.

use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use chat_relay_notify::NotifierConfig;
use chat_relay_session::ReconnectPolicy;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the server binary needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub sessions_dir: PathBuf,
    pub notifier: NotifierConfig,
    pub reconnect: ReconnectPolicy,
    /// Re-open paired sessions found in `sessions_dir` at startup.
    pub restore_sessions: bool,
    /// Pairing code rotation interval of the loopback connector.
    pub qr_refresh: Duration,
    /// Simulated scan delay of the loopback connector; unset means never.
    pub auto_pair: Option<Duration>,
}

impl ServerConfig {
    /// Read configuration from the process environment.
    ///
    /// # Errors
    /// Returns error if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`; unset keys take their defaults.
    ///
    /// # Errors
    /// Returns error if a variable is set to an unparseable value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let millis = |key: &'static str, default: u64| -> Result<Duration, ConfigError> {
            parse(&lookup, key, default).map(Duration::from_millis)
        };

        let notifier = NotifierConfig::new(
            &string("BACKEND_URL", "http://localhost:3000"),
            &string("BACKEND_EVENTS_PATH", "/api/webhooks/session-events"),
            &string("BACKEND_MESSAGES_PATH", "/api/webhooks/messages"),
        )
        .with_timeout(millis("NOTIFY_TIMEOUT_MS", 5_000)?);

        let reconnect = ReconnectPolicy {
            base_delay: millis("RECONNECT_BASE_MS", 1_000)?,
            max_delay: millis("RECONNECT_MAX_DELAY_MS", 30_000)?,
            max_attempts: parse(&lookup, "RECONNECT_MAX_ATTEMPTS", 5)?,
        };

        let auto_pair = match lookup("LOOPBACK_AUTO_PAIR_MS") {
            Some(raw) => Some(Duration::from_millis(parse_value("LOOPBACK_AUTO_PAIR_MS", &raw)?)),
            None => None,
        };

        Ok(Self {
            host: parse(&lookup, "HOST", IpAddr::V4(Ipv4Addr::UNSPECIFIED))?,
            port: parse(&lookup, "PORT", 3001)?,
            sessions_dir: PathBuf::from(string("SESSIONS_DIR", "./sessions")),
            notifier,
            reconnect,
            restore_sessions: parse_flag(&lookup, "RESTORE_SESSIONS", true)?,
            qr_refresh: millis("LOOPBACK_QR_REFRESH_MS", 20_000)?,
            auto_pair,
        })
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    lookup(key).map_or(Ok(default), |raw| parse_value(key, &raw))
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "expected a boolean".to_string(),
        }),
    }
}
