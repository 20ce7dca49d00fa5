//! Outbound destination addresses.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Destination of an outbound connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    /// Literal socket address.
    Ip(SocketAddr),
    /// Hostname to be resolved at dial time.
    Domain(String, u16),
}

impl TargetAddr {
    /// Parse `host:port`, `[v6]:port` or `v4:port`.
    ///
    /// When the port is absent, `default_port` is used; without a default the
    /// authority is rejected.
    pub fn parse_authority(s: &str, default_port: Option<u16>) -> Option<Self> {
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, rest) = rest.split_once(']')?;
            let port = match rest {
                "" => default_port?,
                rest => rest.strip_prefix(':')?.parse().ok()?,
            };
            // Brackets are only valid around IPv6 literals
            host.parse::<Ipv6Addr>().ok()?;
            (host, port)
        } else {
            match s.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => (host, port.parse().ok()?),
                Some(_) => return None,
                None => (s, default_port?),
            }
        };

        if host.is_empty() {
            return None;
        }

        Some(match host.parse::<IpAddr>() {
            Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => TargetAddr::Domain(host.to_string(), port),
        })
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Value for a `Host` header (port omitted when it equals `default_port`).
    pub fn host_header(&self, default_port: u16) -> String {
        let host = match self {
            TargetAddr::Ip(SocketAddr::V6(addr)) => format!("[{}]", addr.ip()),
            TargetAddr::Ip(SocketAddr::V4(addr)) => addr.ip().to_string(),
            TargetAddr::Domain(host, _) => host.clone(),
        };
        if self.port() == default_port {
            host
        } else {
            format!("{}:{}", host, self.port())
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}
