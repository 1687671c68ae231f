//! Controller addresses and host/port normalization.
//!
//! The command-line tool takes a bare host the way the readout tools always
//! did, optionally with a port:
//!
//! - `daq-vme01` → `daq-vme01:23546`
//! - `10.0.0.5:4000` → `10.0.0.5:4000`
//! - `[::1]:4000` → IPv6 loopback, port 4000
//! - `tcp://daq-vme01` is accepted as well
//!
//! # Example
//!
//! ```
//! use nurdctrl::client::address::ControllerAddress;
//!
//! let addr = ControllerAddress::parse("daq-vme01")?;
//! assert_eq!(addr.host(), "daq-vme01");
//! assert_eq!(addr.port(), 23546);
//! # Ok::<(), nurdctrl::client::address::AddressError>(())
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use url::{Host, Url};

/// Default control port of the readout controller.
pub const DEFAULT_CONTROL_PORT: u16 = 23546;

/// Default controller host when none is configured.
pub const DEFAULT_CONTROLLER_HOST: &str = "localhost";

/// Schemes accepted in front of the host.
const SCHEMES: [&str; 2] = ["tcp", "nurdctrl"];

/// Validated controller address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControllerAddress {
    /// Host name or IP literal, without brackets.
    host: String,
    port: u16,
    /// Original input string (for display/debugging)
    original: String,
}

impl ControllerAddress {
    /// Parse and normalize a controller address.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        Self::parse_with_default_port(input, DEFAULT_CONTROL_PORT)
    }

    /// Like [`ControllerAddress::parse`] with a configured fallback port.
    pub fn parse_with_default_port(input: &str, default_port: u16) -> Result<Self, AddressError> {
        let url = normalize_address(input)?;
        let host = match url.host() {
            Some(Host::Domain(name)) if !name.is_empty() => name.to_ascii_lowercase(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(AddressError::MissingHost),
        };
        Ok(Self {
            host,
            port: url.port().unwrap_or(default_port),
            original: input.trim().to_string(),
        })
    }

    /// Host name or IP literal.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the original input string before normalization.
    #[must_use]
    pub fn original(&self) -> &str {
        &self.original
    }

    /// Same host, different port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl fmt::Display for ControllerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl Default for ControllerAddress {
    fn default() -> Self {
        Self {
            host: DEFAULT_CONTROLLER_HOST.to_string(),
            port: DEFAULT_CONTROL_PORT,
            original: DEFAULT_CONTROLLER_HOST.to_string(),
        }
    }
}

impl std::str::FromStr for ControllerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Address validation error with user-friendly messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// Input was empty or whitespace-only
    EmptyInput,
    /// Host/port parsing failed
    InvalidAddress(String),
    /// No host was found
    MissingHost,
    /// Unsupported scheme (only tcp/nurdctrl allowed)
    UnsupportedScheme(String),
    /// Paths, queries and credentials have no meaning here
    UnexpectedComponent(String),
}

impl std::error::Error for AddressError {}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyInput => write!(f, "Address cannot be empty"),
            Self::InvalidAddress(e) => write!(f, "Invalid address: {e}"),
            Self::MissingHost => write!(f, "Address must include a host"),
            Self::UnsupportedScheme(s) => write!(f, "Unsupported scheme '{s}' (use tcp)"),
            Self::UnexpectedComponent(c) => write!(f, "Unexpected {c} in controller address"),
        }
    }
}

/// Normalize a controller address string into a URL.
///
/// - Adds the `tcp://` scheme if missing
/// - Trims whitespace
/// - Rejects paths, queries, fragments and credentials
pub fn normalize_address(input: &str) -> Result<Url, AddressError> {
    let input = input.trim();

    if input.is_empty() {
        return Err(AddressError::EmptyInput);
    }

    let with_scheme = if input.contains("://") {
        input.to_string()
    } else {
        format!("tcp://{input}")
    };

    let url = Url::parse(&with_scheme).map_err(|e| AddressError::InvalidAddress(e.to_string()))?;

    let scheme = url.scheme().to_lowercase();
    if !SCHEMES.contains(&scheme.as_str()) {
        return Err(AddressError::UnsupportedScheme(scheme));
    }

    if url.host().is_none() {
        return Err(AddressError::MissingHost);
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(AddressError::UnexpectedComponent("credentials".into()));
    }
    if !(url.path().is_empty() || url.path() == "/") {
        return Err(AddressError::UnexpectedComponent(format!(
            "path '{}'",
            url.path()
        )));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(AddressError::UnexpectedComponent("query".into()));
    }

    Ok(url)
}
