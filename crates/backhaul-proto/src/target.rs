//! Plain-proxy target validation
//!
//! Agents may advertise a target address for byte-level pass-through. The
//! target string is untrusted input: only plain-HTTP loopback destinations
//! are accepted, so a misconfigured or compromised agent cannot point the
//! relay at an arbitrary network destination.

use std::fmt;
use thiserror::Error;
use url::{Host, Url};

/// Validation errors for agent-advertised proxy targets
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("invalid target URL: {0}")]
    Invalid(String),

    #[error("unsupported scheme '{0}' (only http is allowed)")]
    UnsupportedScheme(String),

    #[error("target host '{0}' is not loopback")]
    HostNotAllowed(String),

    #[error("target must not carry credentials")]
    CredentialsNotAllowed,

    #[error("target must not carry a path or query")]
    PathNotAllowed,
}

/// A validated loopback proxy target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    host: String,
    port: u16,
}

impl ProxyTarget {
    /// Parse and validate an agent-advertised target.
    ///
    /// Accepts only `http://<loopback>:<port>` with an optional bare trailing
    /// slash; everything else is rejected.
    pub fn parse(raw: &str) -> Result<Self, TargetError> {
        let url = Url::parse(raw).map_err(|e| TargetError::Invalid(e.to_string()))?;

        if url.scheme() != "http" {
            return Err(TargetError::UnsupportedScheme(url.scheme().to_string()));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(TargetError::CredentialsNotAllowed);
        }
        if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
            return Err(TargetError::PathNotAllowed);
        }

        let host = match url.host() {
            Some(Host::Domain(name)) if name.eq_ignore_ascii_case("localhost") => {
                "localhost".to_string()
            }
            Some(Host::Ipv4(ip)) if ip.is_loopback() => ip.to_string(),
            Some(Host::Ipv6(ip)) if ip.is_loopback() => format!("[{}]", ip),
            Some(other) => return Err(TargetError::HostNotAllowed(other.to_string())),
            None => return Err(TargetError::Invalid("missing host".to_string())),
        };

        let port = url
            .port_or_known_default()
            .ok_or_else(|| TargetError::Invalid("missing port".to_string()))?;

        Ok(Self { host, port })
    }

    /// "host:port" form suitable for a TCP connect
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_localhost() {
        let target = ProxyTarget::parse("http://localhost:3000").unwrap();
        assert_eq!(target.authority(), "localhost:3000");
        assert_eq!(target.port(), 3000);
        assert_eq!(target.to_string(), "http://localhost:3000");
    }

    #[test]
    fn test_accepts_loopback_ips() {
        let v4 = ProxyTarget::parse("http://127.0.0.1:8080").unwrap();
        assert_eq!(v4.authority(), "127.0.0.1:8080");

        let v6 = ProxyTarget::parse("http://[::1]:8080").unwrap();
        assert_eq!(v6.authority(), "[::1]:8080");
    }

    #[test]
    fn test_accepts_trailing_slash() {
        let target = ProxyTarget::parse("http://localhost:3000/").unwrap();
        assert_eq!(target.authority(), "localhost:3000");
    }

    #[test]
    fn test_default_port_applies() {
        let target = ProxyTarget::parse("http://localhost").unwrap();
        assert_eq!(target.port(), 80);
    }

    #[test]
    fn test_rejects_non_loopback_hosts() {
        assert_eq!(
            ProxyTarget::parse("http://example.com:80"),
            Err(TargetError::HostNotAllowed("example.com".to_string()))
        );
        assert!(matches!(
            ProxyTarget::parse("http://192.168.1.10:8080"),
            Err(TargetError::HostNotAllowed(_))
        ));
        assert!(matches!(
            ProxyTarget::parse("http://[2001:db8::1]:8080"),
            Err(TargetError::HostNotAllowed(_))
        ));
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert_eq!(
            ProxyTarget::parse("https://localhost:443"),
            Err(TargetError::UnsupportedScheme("https".to_string()))
        );
        assert!(matches!(
            ProxyTarget::parse("ftp://localhost:21"),
            Err(TargetError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_rejects_paths_and_credentials() {
        assert_eq!(
            ProxyTarget::parse("http://localhost:3000/admin"),
            Err(TargetError::PathNotAllowed)
        );
        assert_eq!(
            ProxyTarget::parse("http://localhost:3000/?q=1"),
            Err(TargetError::PathNotAllowed)
        );
        assert_eq!(
            ProxyTarget::parse("http://user:pw@localhost:3000"),
            Err(TargetError::CredentialsNotAllowed)
        );
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            ProxyTarget::parse("not a url"),
            Err(TargetError::Invalid(_))
        ));
        assert!(matches!(
            ProxyTarget::parse(""),
            Err(TargetError::Invalid(_))
        ));
    }
}
