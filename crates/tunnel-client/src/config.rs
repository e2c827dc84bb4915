//! Client configuration

use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tunnel_connection::{ReconnectConfig, TcpTransportConfig};

/// Default broker address
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:19917";

/// Tunnel client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker address as `host:port`
    pub server_addr: String,
    /// How long a request waits for its acknowledgement
    #[serde(with = "tunnel_connection::duration_ms")]
    pub ack_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// Settings for the default TCP transport
    pub transport: TcpTransportConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            ack_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            transport: TcpTransportConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.server_addr.is_empty() {
            return Err(ClientError::ConfigError(
                "server_addr is required".to_string(),
            ));
        }
        if self.ack_timeout.is_zero() {
            return Err(ClientError::ConfigError(
                "ack_timeout must be greater than zero".to_string(),
            ));
        }
        if self.reconnect.initial_backoff.is_zero() {
            return Err(ClientError::ConfigError(
                "initial_backoff must be greater than zero".to_string(),
            ));
        }
        let multiplier = self.reconnect.multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ClientError::ConfigError(format!(
                "backoff multiplier must be finite and at least 1.0, got {}",
                self.reconnect.multiplier
            )));
        }
        Ok(())
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn server_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.server_addr = addr.into();
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.config.reconnect.initial_backoff = backoff;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.reconnect.multiplier = multiplier;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.transport.idle_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.transport.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ClientConfig, ClientError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
