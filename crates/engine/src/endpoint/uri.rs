//! Minimal SIP URI representation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default SIP port assumed when a URI carries none.
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// A parsed `sip:` URI, reduced to the parts call routing needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    pub user: String,
    pub host: String,
    pub port: Option<u16>,
}

impl SipUri {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// The explicit port, or 5060 when the URI carries none.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SIP_PORT)
    }
}

/// Reasons a URI string failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SipUriError {
    #[error("missing sip: scheme")]
    MissingScheme,
    #[error("empty host")]
    EmptyHost,
    #[error("invalid port {0:?}")]
    InvalidPort(String),
}

impl FromStr for SipUri {
    type Err = SipUriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("sip:")
            .ok_or(SipUriError::MissingScheme)?;
        // URI parameters are irrelevant for routing.
        let rest = rest.split(';').next().unwrap_or(rest);

        let (user, host_part) = match rest.split_once('@') {
            Some((user, host)) => (user.to_string(), host),
            None => (String::new(), rest),
        };

        let (host, port) = match host_part.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str
                    .parse::<u16>()
                    .map_err(|_| SipUriError::InvalidPort(port_str.to_string()))?;
                (host.to_string(), Some(port))
            }
            None => (host_part.to_string(), None),
        };

        if host.is_empty() {
            return Err(SipUriError::EmptyHost);
        }

        Ok(Self { user, host, port })
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sip:")?;
        if !self.user.is_empty() {
            write!(f, "{}@", self.user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let uri: SipUri = "sip:alice@10.0.0.1:5062".parse().unwrap();
        assert_eq!(uri.user, "alice");
        assert_eq!(uri.host, "10.0.0.1");
        assert_eq!(uri.port, Some(5062));
    }

    #[test]
    fn parses_without_user_or_port() {
        let uri: SipUri = "sip:example.com".parse().unwrap();
        assert_eq!(uri.user, "");
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port_or_default(), DEFAULT_SIP_PORT);
    }

    #[test]
    fn strips_uri_parameters() {
        let uri: SipUri = "sip:bob@host:5070;transport=udp".parse().unwrap();
        assert_eq!(uri.port, Some(5070));
    }

    #[test]
    fn rejects_missing_scheme() {
        assert_eq!(
            "alice@host".parse::<SipUri>(),
            Err(SipUriError::MissingScheme)
        );
    }

    #[test]
    fn rejects_bad_port() {
        assert!(matches!(
            "sip:a@h:70000".parse::<SipUri>(),
            Err(SipUriError::InvalidPort(_))
        ));
    }

    #[test]
    fn round_trips_display() {
        for s in ["sip:alice@host:5062", "sip:host", "sip:bob@host"] {
            let uri: SipUri = s.parse().unwrap();
            assert_eq!(uri.to_string(), s);
        }
    }
}
