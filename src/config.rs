//! Layered settings using Figment.
//!
//! Settings are merged from, lowest priority first:
//! 1. built-in defaults
//! 2. a TOML file, if one is given
//! 3. environment variables prefixed with `NURDCTRL_`, with `__` separating
//!    sections, e.g. `NURDCTRL_CLIENT__READ_TIMEOUT_MS=2000`
//!
//! # Example
//! ```no_run
//! use nurdctrl::config::Settings;
//!
//! let settings = Settings::load(None)?;
//! let client = settings.client_config();
//! # Ok::<(), nurdctrl::error::CtrlError>(())
//! ```
//!
//! ```toml
//! [client]
//! default_port = 23546
//! connect_timeout_ms = 3000
//! read_timeout_ms = 10000
//!
//! [logging]
//! level = "debug"
//! format = "compact"
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::client::address::DEFAULT_CONTROL_PORT;
use crate::client::ClientConfig;
use crate::error::{CtrlError, CtrlResult};
use crate::logging::{parse_log_level, LogFormat};
use crate::network::DEFAULT_MAX_FRAME_BYTES;
use crate::server::ServerConfig;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "NURDCTRL_";

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Control client settings
    #[serde(default)]
    pub client: ClientSettings,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Settings for the bundled demo controller
    #[serde(default)]
    pub server: ServerSettings,
}

/// Control client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Port used when the host string has none
    #[serde(default = "default_port")]
    pub default_port: u16,
    /// Resolve + connect deadline in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Request send deadline in milliseconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
    /// Response deadline in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Largest accepted response body in bytes
    #[serde(default = "default_max_frame")]
    pub max_frame_bytes: u32,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default)]
    pub format: LogFormat,
    /// Whether to log span open/close events
    #[serde(default)]
    pub span_events: bool,
}

/// Demo controller settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

// Default value functions
fn default_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_write_timeout() -> u64 {
    5000
}

fn default_read_timeout() -> u64 {
    10000
}

fn default_max_frame() -> u32 {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_bind() -> String {
    format!("127.0.0.1:{DEFAULT_CONTROL_PORT}")
}

fn default_idle_timeout() -> u64 {
    60
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            default_port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            write_timeout_ms: default_write_timeout(),
            read_timeout_ms: default_read_timeout(),
            max_frame_bytes: default_max_frame(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            span_events: false,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Settings {
    /// Provider chain without extracting.
    #[must_use]
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Loads and validates settings.
    ///
    /// An explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> CtrlResult<Self> {
        if let Some(path) = path {
            if !path.is_file() {
                return Err(CtrlError::Configuration(format!(
                    "config file '{}' not found",
                    path.display()
                )));
            }
        }
        let settings: Settings = Self::figment(path).extract()?;
        settings.validate().map_err(CtrlError::Configuration)?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        parse_log_level(&self.logging.level)?;

        let timeouts = [
            ("connect_timeout_ms", self.client.connect_timeout_ms),
            ("write_timeout_ms", self.client.write_timeout_ms),
            ("read_timeout_ms", self.client.read_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(format!("Invalid {name} 0. Timeouts must be finite and non-zero"));
            }
        }

        if self.client.default_port == 0 {
            return Err("Invalid default_port 0".to_string());
        }

        if self.client.max_frame_bytes < 1024 {
            return Err(format!(
                "Invalid max_frame_bytes {}. Must be at least 1024",
                self.client.max_frame_bytes
            ));
        }

        if self.server.idle_timeout_secs == 0 {
            return Err("Invalid idle_timeout_secs 0".to_string());
        }

        Ok(())
    }

    /// Client timeouts and limits.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_millis(self.client.connect_timeout_ms),
            write_timeout: Duration::from_millis(self.client.write_timeout_ms),
            read_timeout: Duration::from_millis(self.client.read_timeout_ms),
            max_frame_bytes: self.client.max_frame_bytes,
        }
    }

    /// Demo server limits.
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            idle_timeout: Duration::from_secs(self.server.idle_timeout_secs),
            ..ServerConfig::default()
        }
    }
}
