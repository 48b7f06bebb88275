//! Network addresses of streaming hosts.

use core::{
    fmt,
    net::{IpAddr, Ipv6Addr},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// Port a host serves its status endpoint on unless told otherwise.
pub const DEFAULT_HTTP_PORT: u16 = 47989;

/// A host name or IP literal together with a port.
///
/// Two addresses are the same probe target only if both fields are byte-identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
}

/// Errors produced when parsing a [`HostAddress`] from user input.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum AddressParseError {
    #[error("Address is empty")]
    Empty,
    #[error("Malformed address '{0}'")]
    Malformed(String),
    #[error("Invalid port in address '{0}'")]
    InvalidPort(String),
}

impl HostAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The address as an IP literal, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .ok()
    }

    /// Whether the address can only be reached from inside the local network
    /// (RFC 1918, link-local, loopback, IPv6 unique-local).
    ///
    /// Host names are never considered site-local since we can't tell without resolving them.
    pub fn is_site_local(&self) -> bool {
        match self.ip() {
            Some(IpAddr::V4(v4)) => v4.is_private() || v4.is_link_local() || v4.is_loopback(),
            Some(IpAddr::V6(v6)) => {
                v6.is_loopback() || v6.is_unique_local() || v6.is_unicast_link_local()
            }
            None => false,
        }
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(port: &str, input: &str) -> Result<u16, AddressParseError> {
    port.parse()
        .map_err(|_| AddressParseError::InvalidPort(input.to_owned()))
}

impl FromStr for HostAddress {
    type Err = AddressParseError;

    /// Accepts `host`, `host:port`, `[v6]`, `[v6]:port` and bare IPv6 literals.
    /// A missing port falls back to [`DEFAULT_HTTP_PORT`].
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AddressParseError::Empty);
        }

        if let Some(rest) = trimmed.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| AddressParseError::Malformed(trimmed.to_owned()))?;
            if host.is_empty() {
                return Err(AddressParseError::Malformed(trimmed.to_owned()));
            }
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port, trimmed)?,
                None if tail.is_empty() => DEFAULT_HTTP_PORT,
                None => return Err(AddressParseError::Malformed(trimmed.to_owned())),
            };
            return Ok(Self::new(host, port));
        }

        if trimmed.parse::<Ipv6Addr>().is_ok() {
            return Ok(Self::new(trimmed, DEFAULT_HTTP_PORT));
        }

        match trimmed.rsplit_once(':') {
            Some((host, _)) if host.is_empty() => {
                Err(AddressParseError::Malformed(trimmed.to_owned()))
            }
            Some((host, port)) => Ok(Self::new(host, parse_port(port, trimmed)?)),
            None => Ok(Self::new(trimmed, DEFAULT_HTTP_PORT)),
        }
    }
}
