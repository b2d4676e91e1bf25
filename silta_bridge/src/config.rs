//! Bridge configuration: CLI flags, environment variables, and the
//! derived per-component settings.

use crate::broker::{BrokerConfig, InitializeMode, ServerRequestPolicy};
use crate::child::ChildConfig;
use crate::error::{BridgeError, Result};
use crate::framing::DEFAULT_MAX_FRAME_BYTES;
use crate::session::SessionConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 128;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Transport-level authentication mode, from `BRIDGE_AUTH_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    None,
    Bearer,
    ApiKey,
}

impl std::str::FromStr for AuthMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(AuthMode::None),
            "bearer" => Ok(AuthMode::Bearer),
            "apikey" => Ok(AuthMode::ApiKey),
            other => Err(BridgeError::InvalidConfig(format!(
                "unknown auth mode: {other}"
            ))),
        }
    }
}

impl std::str::FromStr for InitializeMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(InitializeMode::Local),
            "forward" => Ok(InitializeMode::Forward),
            "both" => Ok(InitializeMode::Both),
            other => Err(BridgeError::InvalidConfig(format!(
                "unknown initialize mode: {other}"
            ))),
        }
    }
}

impl std::str::FromStr for ServerRequestPolicy {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "broadcast" => Ok(ServerRequestPolicy::Broadcast),
            "drop" => Ok(ServerRequestPolicy::Drop),
            other => Err(BridgeError::InvalidConfig(format!(
                "unknown server-request policy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub secret: Option<String>,
}

impl AuthConfig {
    /// A non-`none` mode with no secret cannot admit anyone.
    pub fn validate(&self) -> Result<()> {
        if self.mode != AuthMode::None && self.secret.as_deref().unwrap_or("").is_empty() {
            return Err(BridgeError::InvalidConfig(
                "BRIDGE_AUTH_SECRET is required for the configured auth mode".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind_addr: SocketAddr,
    /// Base URL advertised in the SSE endpoint event and OAuth
    /// metadata. When unset, the request's Host header is used, then
    /// the bind address.
    pub advertise_url: Option<String>,
    pub auth: AuthConfig,
    pub max_in_flight: usize,
    pub max_message_bytes: usize,
    pub heartbeat_interval: Duration,
    pub tools_config: Option<PathBuf>,
    pub filter_config: Option<PathBuf>,
    /// Compose the content filters even without a filter-config file.
    pub content_filters: bool,
    /// Log filtered message bodies in audit records.
    pub audit_bodies: bool,
    pub session: SessionConfig,
    pub broker: BrokerConfig,
    pub child: ChildConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".parse().unwrap(),
            advertise_url: None,
            auth: AuthConfig::default(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_message_bytes: DEFAULT_MAX_FRAME_BYTES,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            tools_config: None,
            filter_config: None,
            content_filters: false,
            audit_bodies: false,
            session: SessionConfig::default(),
            broker: BrokerConfig::default(),
            child: ChildConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Overlay `BRIDGE_AUTH_MODE`, `BRIDGE_AUTH_SECRET`, and
    /// `BRIDGE_MAX_IN_FLIGHT` from the environment.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(mode) = std::env::var("BRIDGE_AUTH_MODE") {
            self.auth.mode = mode.parse()?;
        }
        if let Ok(secret) = std::env::var("BRIDGE_AUTH_SECRET") {
            self.auth.secret = Some(secret);
        }
        if let Ok(raw) = std::env::var("BRIDGE_MAX_IN_FLIGHT") {
            self.max_in_flight = raw.parse().map_err(|_| {
                BridgeError::InvalidConfig(format!("BRIDGE_MAX_IN_FLIGHT must be an integer: {raw}"))
            })?;
        }
        self.auth.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn auth_mode_parses_the_documented_values() {
        assert_eq!("none".parse::<AuthMode>().unwrap(), AuthMode::None);
        assert_eq!("bearer".parse::<AuthMode>().unwrap(), AuthMode::Bearer);
        assert_eq!("apikey".parse::<AuthMode>().unwrap(), AuthMode::ApiKey);
        assert!("oauth".parse::<AuthMode>().is_err());
    }

    #[test]
    fn policy_enums_parse() {
        assert_eq!(
            "both".parse::<InitializeMode>().unwrap(),
            InitializeMode::Both
        );
        assert_eq!(
            "drop".parse::<ServerRequestPolicy>().unwrap(),
            ServerRequestPolicy::Drop
        );
        assert!("sometimes".parse::<InitializeMode>().is_err());
    }

    #[test]
    fn auth_secret_is_required_for_non_none_modes() {
        let config = AuthConfig {
            mode: AuthMode::Bearer,
            secret: None,
        };
        assert!(config.validate().is_err());

        let config = AuthConfig {
            mode: AuthMode::Bearer,
            secret: Some("s3cret".to_string()),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn env_overlay_reads_the_documented_variables() {
        // SAFETY: test-scoped env mutation, serialized by #[serial].
        unsafe {
            std::env::set_var("BRIDGE_AUTH_MODE", "apikey");
            std::env::set_var("BRIDGE_AUTH_SECRET", "k");
            std::env::set_var("BRIDGE_MAX_IN_FLIGHT", "7");
        }
        let mut config = BridgeConfig::default();
        config.apply_env().unwrap();
        assert_eq!(config.auth.mode, AuthMode::ApiKey);
        assert_eq!(config.auth.secret.as_deref(), Some("k"));
        assert_eq!(config.max_in_flight, 7);
        unsafe {
            std::env::remove_var("BRIDGE_AUTH_MODE");
            std::env::remove_var("BRIDGE_AUTH_SECRET");
            std::env::remove_var("BRIDGE_MAX_IN_FLIGHT");
        }
    }

    #[test]
    #[serial]
    fn bad_max_in_flight_is_rejected() {
        unsafe {
            std::env::set_var("BRIDGE_MAX_IN_FLIGHT", "lots");
        }
        let mut config = BridgeConfig::default();
        assert!(config.apply_env().is_err());
        unsafe {
            std::env::remove_var("BRIDGE_MAX_IN_FLIGHT");
        }
    }
}
