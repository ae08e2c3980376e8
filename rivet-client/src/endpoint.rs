//! Remote service addresses.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Address of a remote RPC service: a host and port, or a local socket path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Inet { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    pub fn inet(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Inet {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix(path.into())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Inet { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Endpoint::Inet { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Error parsing an [`Endpoint`].
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid endpoint '{input}': {reason}")]
pub struct EndpointParseError {
    input: String,
    reason: &'static str,
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    /// Parses `host:port`, `[v6]:port`, `unix:/path` or a bare path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| EndpointParseError {
            input: s.to_string(),
            reason,
        };

        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(err("empty socket path"));
            }
            return Ok(Endpoint::unix(path));
        }
        if s.starts_with('/') || !s.contains(':') {
            if s.is_empty() {
                return Err(err("empty address"));
            }
            return Ok(Endpoint::unix(s));
        }

        let (host, port) = s.rsplit_once(':').ok_or_else(|| err("missing port"))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(err("empty host"));
        }
        let port = port.parse::<u16>().map_err(|_| err("invalid port"))?;
        Ok(Endpoint::inet(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inet() {
        assert_eq!(
            "localhost:9090".parse::<Endpoint>().unwrap(),
            Endpoint::inet("localhost", 9090)
        );
        assert_eq!(
            "[::1]:9090".parse::<Endpoint>().unwrap(),
            Endpoint::inet("::1", 9090)
        );
    }

    #[test]
    fn test_parse_unix() {
        assert_eq!(
            "/var/run/svc.sock".parse::<Endpoint>().unwrap(),
            Endpoint::unix("/var/run/svc.sock")
        );
        assert_eq!(
            "unix:/tmp/svc.sock".parse::<Endpoint>().unwrap(),
            Endpoint::unix("/tmp/svc.sock")
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!("host:notaport".parse::<Endpoint>().is_err());
        assert!(":9090".parse::<Endpoint>().is_err());
        assert!("".parse::<Endpoint>().is_err());
        assert!("unix:".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Endpoint::inet("127.0.0.1", 80).to_string(), "127.0.0.1:80");
        assert_eq!(Endpoint::inet("::1", 80).to_string(), "[::1]:80");
        assert_eq!(Endpoint::unix("/tmp/s").to_string(), "unix:/tmp/s");
    }
}
