//! `host[:port]` endpoint parsing.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::{MigrateError, Result};

/// Default memcached port used when the endpoint omits one.
pub const DEFAULT_PORT: u16 = 11211;

/// A resolvable `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    /// Parse `host`, `host:port` or `[v6-addr]:port`.
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Usage` when the host is empty or the port does
    /// not parse.
    pub fn parse(spec: &str) -> Result<Self> {
        let bad = || MigrateError::usage(format!("Invalid host:port: {spec}"));

        let (host, port) = if let Some(rest) = spec.strip_prefix('[') {
            // [v6]:port or [v6]
            let (host, tail) = rest.split_once(']').ok_or_else(bad)?;
            match tail.strip_prefix(':') {
                Some(p) => (host, Some(p)),
                None if tail.is_empty() => (host, None),
                None => return Err(bad()),
            }
        } else if let Some((host, p)) = spec.rsplit_once(':') {
            (host, Some(p))
        } else {
            (spec, None)
        };

        if host.is_empty() {
            return Err(bad());
        }
        let port = match port {
            Some(p) => p.parse().map_err(|_| bad())?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Resolve to the first usable socket address.
    ///
    /// # Errors
    ///
    /// Returns the resolver error, or `Io(NotFound)` if the name resolves to
    /// nothing.
    pub fn resolve(&self) -> Result<SocketAddr> {
        let mut addrs = (self.host.as_str(), self.port).to_socket_addrs()?;
        addrs.next().ok_or_else(|| {
            MigrateError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address for {self}"),
            ))
        })
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
