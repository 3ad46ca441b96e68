//! Connection and timeout configuration for remote runners

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RunError;

/// Connection information for SSH
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Host address
    pub host: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username
    pub user: String,
}

fn default_port() -> u16 {
    22
}

impl ConnectionInfo {
    /// Create new connection info
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: user.into(),
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Build connection info from a `host[:port]` address
    ///
    /// Bracketed IPv6 literals (`[::1]:2222`) are accepted.
    ///
    /// # Errors
    /// Returns `RunError::ConfigError` for an empty host or an invalid port
    pub fn parse_address(address: &str, user: impl Into<String>) -> Result<Self, RunError> {
        let (host, port) = split_address(address)?;
        if host.is_empty() {
            return Err(RunError::ConfigError(format!("missing host in `{address}`")));
        }

        let info = Self::new(host, user);
        Ok(match port {
            Some(port) => info.with_port(port),
            None => info,
        })
    }

    /// `host:port` form used in log messages
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn split_address(address: &str) -> Result<(&str, Option<u16>), RunError> {
    let parse_port = |port: &str| {
        port.parse::<u16>()
            .map_err(|_| RunError::ConfigError(format!("invalid port in `{address}`")))
    };

    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| RunError::ConfigError(format!("unterminated `[` in `{address}`")))?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host, Some(parse_port(port)?))),
            None if tail.is_empty() => Ok((host, None)),
            None => Err(RunError::ConfigError(format!("invalid address `{address}`"))),
        };
    }

    match address.split_once(':') {
        // More than one colon without brackets is a bare IPv6 literal
        Some((_, rest)) if rest.contains(':') => Ok((address, None)),
        Some((host, port)) => Ok((host, Some(parse_port(port)?))),
        None => Ok((address, None)),
    }
}

/// Timeouts applied to an SSH transport
///
/// A zero duration means "no bound". Durations are written as integer
/// milliseconds in configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Bound on dialing the TCP connection
    #[serde(rename = "connection_timeout_ms", with = "duration_ms", default)]
    pub connection_timeout: Duration,
    /// Write deadline during handshake and command dispatch
    #[serde(rename = "send_timeout_ms", with = "duration_ms", default)]
    pub send_timeout: Duration,
    /// Read deadline during handshake and command dispatch
    #[serde(rename = "receive_timeout_ms", with = "duration_ms", default)]
    pub receive_timeout: Duration,
    /// SSH keepalive interval
    #[serde(rename = "keepalive_ms", with = "duration_ms", default)]
    pub keepalive: Duration,
}

impl Timeouts {
    /// Set the dial timeout
    #[must_use]
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the write deadline used while connecting and dispatching
    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set the read deadline used while connecting and dispatching
    #[must_use]
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Set the keepalive interval
    #[must_use]
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval;
        self
    }

    /// Keepalive interval, `None` when disabled
    #[must_use]
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (!self.keepalive.is_zero()).then_some(self.keepalive)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
