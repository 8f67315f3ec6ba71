//! Configuration using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults
//! 2. An optional TOML file (missing files are ignored)
//! 3. Environment variables prefixed with `SCOPE_`, nested keys split on `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! SCOPE_SERVER__HOST=scope-host.local
//! SCOPE_CLIENT__TIMEOUT_MS=30000
//! SCOPE_STAND__PORT=/dev/ttyUSB1
//! ```
//!
//! # Example
//!
//! ```no_run
//! use scope_control::config::ScopeConfig;
//!
//! let config = ScopeConfig::load_from("scope.toml")?;
//! println!("RPC server at {}", config.server.rpc_addr());
//! # Ok::<(), scope_control::error::ScopeError>(())
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, ScopeError};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// Where the scope server listens
    #[serde(default)]
    pub server: ServerConfig,
    /// RPC client timing
    #[serde(default)]
    pub client: ClientConfig,
    /// Serial connection to the microscope stand
    #[serde(default)]
    pub stand: StandConfig,
}

/// Server addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host name or IP address of the scope server
    pub host: String,
    /// Request/reply socket
    pub rpc_port: u16,
    /// Interrupt PUSH socket
    pub interrupt_port: u16,
    /// Heartbeat PUB socket
    pub heartbeat_port: u16,
}

/// RPC client behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Deadline for a single call
    pub timeout_ms: u64,
    /// How long each wait for a reply blocks before re-checking the deadline
    /// and heartbeat state
    pub poll_interval_ms: u64,
    /// Heartbeat check interval; 0 disables the heartbeat monitor
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before the server is considered dead
    pub max_missed: u32,
    /// Open the interrupt channel on connect
    pub interrupt: bool,
}

/// Leica stand serial port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandConfig {
    /// Serial device path (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Line speed
    pub baud_rate: u32,
    /// Per-read timeout; bounds how quickly the receiver thread notices shutdown
    pub read_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            rpc_port: 6000,
            interrupt_port: 6001,
            heartbeat_port: 6002,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            poll_interval_ms: 500,
            heartbeat_interval_ms: 1_000,
            max_missed: 3,
            interrupt: true,
        }
    }
}

impl Default for StandConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            read_timeout_ms: 100,
        }
    }
}

impl ServerConfig {
    /// ZeroMQ endpoint of the request socket.
    pub fn rpc_addr(&self) -> String {
        format!("tcp://{}:{}", self.host, self.rpc_port)
    }

    /// ZeroMQ endpoint of the interrupt socket.
    pub fn interrupt_addr(&self) -> String {
        format!("tcp://{}:{}", self.host, self.interrupt_port)
    }

    /// ZeroMQ endpoint of the heartbeat socket.
    pub fn heartbeat_addr(&self) -> String {
        format!("tcp://{}:{}", self.host, self.heartbeat_port)
    }
}

impl ClientConfig {
    /// Per-call reply deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// How long one reply poll waits.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `None` when the heartbeat is disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }
}

impl StandConfig {
    /// Serial read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl ScopeConfig {
    /// Load defaults, then `path` (if it exists), then `SCOPE_*` environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(ScopeConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCOPE_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Load from defaults and environment only.
    pub fn from_env() -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(ScopeConfig::default()))
            .merge(Env::prefixed("SCOPE_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work together.
    pub fn validate(&self) -> AppResult<()> {
        if self.server.host.trim().is_empty() {
            return Err(ScopeError::Configuration("server.host must not be empty".into()));
        }
        let ports = [
            self.server.rpc_port,
            self.server.interrupt_port,
            self.server.heartbeat_port,
        ];
        if ports[0] == ports[1] || ports[0] == ports[2] || ports[1] == ports[2] {
            return Err(ScopeError::Configuration(format!(
                "server ports must be distinct, got rpc={} interrupt={} heartbeat={}",
                ports[0], ports[1], ports[2]
            )));
        }
        if self.client.timeout_ms == 0 {
            return Err(ScopeError::Configuration("client.timeout_ms must be > 0".into()));
        }
        if self.client.poll_interval_ms == 0 {
            return Err(ScopeError::Configuration(
                "client.poll_interval_ms must be > 0".into(),
            ));
        }
        if self.client.max_missed == 0 {
            return Err(ScopeError::Configuration("client.max_missed must be > 0".into()));
        }
        if self.stand.read_timeout_ms == 0 {
            return Err(ScopeError::Configuration(
                "stand.read_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ScopeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.server.rpc_addr(), "tcp://127.0.0.1:6000");
        assert_eq!(config.client.heartbeat_interval(), Some(Duration::from_secs(1)));
    }

    #[test]
    #[serial]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
host = "scope-host"
rpc_port = 7000
interrupt_port = 7001
heartbeat_port = 7002

[client]
timeout_ms = 2500
poll_interval_ms = 100
heartbeat_interval_ms = 0
max_missed = 5
interrupt = false
"#
        )
        .unwrap();

        let config = ScopeConfig::load_from(file.path()).unwrap();
        assert_eq!(config.server.heartbeat_addr(), "tcp://scope-host:7002");
        assert_eq!(config.client.timeout(), Duration::from_millis(2500));
        assert_eq!(config.client.heartbeat_interval(), None);
        // untouched section keeps its defaults
        assert_eq!(config.stand.baud_rate, 115_200);
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("SCOPE_CLIENT__TIMEOUT_MS", "1234");
        let config = ScopeConfig::load_from("does-not-exist.toml");
        std::env::remove_var("SCOPE_CLIENT__TIMEOUT_MS");

        assert_eq!(config.unwrap().client.timeout_ms, 1234);
    }

    #[test]
    fn test_colliding_ports_rejected() {
        let mut config = ScopeConfig::default();
        config.server.heartbeat_port = config.server.rpc_port;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("distinct"));
    }

    #[test]
    fn test_zero_max_missed_rejected() {
        let mut config = ScopeConfig::default();
        config.client.max_missed = 0;
        assert!(matches!(config.validate(), Err(ScopeError::Configuration(_))));
    }
}
