//! Broker configuration parsed from environment variables.
//!
//! Every tunable the broker needs (listening endpoint, grace windows, queue
//! bounds, auth policy) is supplied externally. Missing variables fall back to
//! defaults; present-but-invalid variables are a startup error.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
pub const DEFAULT_PORT: u16 = 5001;
pub const DEFAULT_GRACE_WINDOW_MS: u64 = 10_000;
pub const DEFAULT_ROOM_GRACE_MS: u64 = 30_000;
pub const DEFAULT_MEMBER_BACKLOG: usize = 256;
pub const DEFAULT_RETAINED_EVENTS: usize = 1024;
pub const DEFAULT_IDEMPOTENCY_WINDOW: usize = 4096;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 250;
pub const DEFAULT_EVENT_RATE_LIMIT: usize = 120;
pub const DEFAULT_EVENT_RATE_WINDOW_MS: u64 = 1000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
}

/// Typed broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub listen: SocketAddr,
    /// How long a dropped session may reconnect and resume.
    pub grace_window: Duration,
    /// How long an empty room survives before destruction.
    pub room_grace: Duration,
    /// Maximum undelivered frames per member before forced disconnect.
    pub member_backlog: usize,
    /// Retained raw events per room.
    pub retained_events: usize,
    /// Remembered idempotency keys per room.
    pub idempotency_window: usize,
    pub echo_to_originator: bool,
    pub allow_anonymous: bool,
    /// HMAC key for bearer tokens. `None` means a random per-process key.
    pub auth_secret: Option<String>,
    pub dev_token_issuer: bool,
    pub sweep_interval: Duration,
    pub event_rate_limit: usize,
    pub event_rate_window: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(DEFAULT_LISTEN_ADDR, DEFAULT_PORT),
            grace_window: Duration::from_millis(DEFAULT_GRACE_WINDOW_MS),
            room_grace: Duration::from_millis(DEFAULT_ROOM_GRACE_MS),
            member_backlog: DEFAULT_MEMBER_BACKLOG,
            retained_events: DEFAULT_RETAINED_EVENTS,
            idempotency_window: DEFAULT_IDEMPOTENCY_WINDOW,
            echo_to_originator: false,
            allow_anonymous: true,
            auth_secret: None,
            dev_token_issuer: false,
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            event_rate_limit: DEFAULT_EVENT_RATE_LIMIT,
            event_rate_window: Duration::from_millis(DEFAULT_EVENT_RATE_WINDOW_MS),
        }
    }
}

impl BrokerConfig {
    /// Build typed config from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any variable is present but unparseable, or a
    /// bound that must be positive is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Used by `from_env` and tests.
    ///
    /// # Errors
    ///
    /// See [`BrokerConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let ip: IpAddr = parse_var(&lookup, "LISTEN_ADDR", DEFAULT_LISTEN_ADDR)?;
        let port: u16 = parse_var(&lookup, "PORT", DEFAULT_PORT)?;
        let listen = SocketAddr::new(ip, port);

        let config = Self {
            listen,
            grace_window: Duration::from_millis(parse_var(&lookup, "GRACE_WINDOW_MS", DEFAULT_GRACE_WINDOW_MS)?),
            room_grace: Duration::from_millis(parse_var(&lookup, "ROOM_GRACE_MS", DEFAULT_ROOM_GRACE_MS)?),
            member_backlog: positive(&lookup, "MEMBER_BACKLOG", DEFAULT_MEMBER_BACKLOG)?,
            retained_events: positive(&lookup, "RETAINED_EVENTS", DEFAULT_RETAINED_EVENTS)?,
            idempotency_window: positive(&lookup, "IDEMPOTENCY_WINDOW", DEFAULT_IDEMPOTENCY_WINDOW)?,
            echo_to_originator: parse_bool(&lookup, "ECHO_TO_ORIGINATOR", false)?,
            allow_anonymous: parse_bool(&lookup, "ALLOW_ANONYMOUS", true)?,
            auth_secret: lookup("AUTH_SECRET").filter(|s| !s.trim().is_empty()),
            dev_token_issuer: parse_bool(&lookup, "DEV_TOKEN_ISSUER", false)?,
            sweep_interval: Duration::from_millis(positive(&lookup, "SWEEP_INTERVAL_MS", DEFAULT_SWEEP_INTERVAL_MS)?),
            event_rate_limit: positive(&lookup, "EVENT_RATE_LIMIT", DEFAULT_EVENT_RATE_LIMIT)?,
            event_rate_window: Duration::from_millis(positive(
                &lookup,
                "EVENT_RATE_WINDOW_MS",
                DEFAULT_EVENT_RATE_WINDOW_MS,
            )?),
        };
        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}

fn positive<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
{
    let value = parse_var(lookup, var, default)?;
    if value == T::default() {
        return Err(ConfigError::Zero { var });
    }
    Ok(value)
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid { var, value: raw }),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
