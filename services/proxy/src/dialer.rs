//! Outbound dialing with a rotating IPv6 source address.
//!
//! Every dial draws a fresh source address from the configured
//! [`AddressPool`], binds it (ephemeral port) and connects to the target.
//! Each call is a single attempt; retrying is left to the caller.

use std::fmt;
use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::time::Duration;

use egress6_networking::AddressPool;
use thiserror::Error;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::target::TargetAddr;

/// Transport used for an outbound attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from a single outbound attempt.
#[derive(Debug, Error)]
pub enum DialError {
    /// Hostname lookup failed.
    #[error("resolve {target}: {error}")]
    Resolve {
        target: String,
        #[source]
        error: io::Error,
    },

    /// Target has no IPv6 address to connect to.
    #[error("no IPv6 address for {target}")]
    NoIpv6Route { target: String },

    /// Source address could not be bound locally.
    #[error("bind source [{local}]:0: {error}")]
    Bind {
        local: Ipv6Addr,
        #[source]
        error: io::Error,
    },

    /// Remote connect failed.
    #[error("connect {target} via {local}: {error}")]
    Connect {
        target: String,
        local: Ipv6Addr,
        #[source]
        error: io::Error,
    },

    /// Connect did not finish within the deadline.
    #[error("connect {target} via {local}: timed out after {elapsed:?}")]
    Timeout {
        target: String,
        local: Ipv6Addr,
        elapsed: Duration,
    },
}

impl DialError {
    /// Closest `io::ErrorKind` for protocol-level error mapping.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            DialError::Resolve { error, .. }
            | DialError::Bind { error, .. }
            | DialError::Connect { error, .. } => error.kind(),
            DialError::NoIpv6Route { .. } => io::ErrorKind::HostUnreachable,
            DialError::Timeout { .. } => io::ErrorKind::TimedOut,
        }
    }
}

/// Dialer tuning knobs.
#[derive(Debug, Clone, Default)]
pub struct DialerConfig {
    /// Deadline for a single connect (none by default).
    pub connect_timeout: Option<Duration>,
    /// Set IPV6_FREEBIND so addresses of a routed block need not be
    /// assigned to a local interface (Linux only).
    pub freebind: bool,
}

/// One outbound dial: drawn source, destination and protocol.
#[derive(Debug, Clone)]
pub struct OutboundAttempt {
    pub source: Ipv6Addr,
    pub target: TargetAddr,
    pub network: Network,
}

impl OutboundAttempt {
    /// Local bind address: the drawn source with an ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::V6(SocketAddrV6::new(self.source, 0, 0, 0))
    }
}

/// Dialer that binds a freshly drawn source address before every connect.
#[derive(Debug, Clone)]
pub struct EgressDialer {
    pool: AddressPool,
    config: DialerConfig,
}

impl EgressDialer {
    /// Create a dialer with default configuration.
    pub fn new(pool: AddressPool) -> Self {
        Self::with_config(pool, DialerConfig::default())
    }

    /// Create a dialer with custom configuration.
    pub fn with_config(pool: AddressPool, config: DialerConfig) -> Self {
        Self { pool, config }
    }

    /// Address pool source addresses are drawn from.
    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    /// Dial using the configured connect timeout.
    pub async fn dial(&self, target: &TargetAddr) -> Result<TcpStream, DialError> {
        self.dial_timeout(target, self.config.connect_timeout).await
    }

    /// Dial with an explicit deadline. Dropping the future cancels the attempt.
    pub async fn dial_timeout(
        &self,
        target: &TargetAddr,
        deadline: Option<Duration>,
    ) -> Result<TcpStream, DialError> {
        let attempt = OutboundAttempt {
            source: self.pool.next_address(),
            target: target.clone(),
            network: Network::Tcp,
        };

        debug!(
            target = %attempt.target,
            source = %attempt.source,
            network = %attempt.network,
            "Dialing target via egress address"
        );

        match deadline {
            Some(limit) => match timeout(limit, self.connect(&attempt)).await {
                Ok(result) => result,
                Err(_) => Err(DialError::Timeout {
                    target: attempt.target.to_string(),
                    local: attempt.source,
                    elapsed: limit,
                }),
            },
            None => self.connect(&attempt).await,
        }
    }

    async fn connect(&self, attempt: &OutboundAttempt) -> Result<TcpStream, DialError> {
        let remote = resolve_v6(&attempt.target).await?;

        let bind_err = |error| DialError::Bind {
            local: attempt.source,
            error,
        };

        let socket = TcpSocket::new_v6().map_err(bind_err)?;
        if self.config.freebind {
            set_freebind(&socket).map_err(bind_err)?;
        }
        socket.bind(attempt.local_addr()).map_err(bind_err)?;

        socket
            .connect(remote)
            .await
            .map_err(|error| DialError::Connect {
                target: attempt.target.to_string(),
                local: attempt.source,
                error,
            })
    }
}

/// Resolve a target to its first IPv6 socket address.
async fn resolve_v6(target: &TargetAddr) -> Result<SocketAddr, DialError> {
    match target {
        TargetAddr::Ip(addr @ SocketAddr::V6(_)) => Ok(*addr),
        TargetAddr::Ip(SocketAddr::V4(_)) => Err(DialError::NoIpv6Route {
            target: target.to_string(),
        }),
        TargetAddr::Domain(host, port) => {
            let mut addrs = lookup_host((host.as_str(), *port))
                .await
                .map_err(|error| DialError::Resolve {
                    target: target.to_string(),
                    error,
                })?;
            addrs
                .find(SocketAddr::is_ipv6)
                .ok_or_else(|| DialError::NoIpv6Route {
                    target: target.to_string(),
                })
        }
    }
}

#[cfg(target_os = "linux")]
fn set_freebind(socket: &TcpSocket) -> io::Result<()> {
    socket2::SockRef::from(socket).set_freebind_ipv6(true)
}

#[cfg(not(target_os = "linux"))]
fn set_freebind(_socket: &TcpSocket) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "IPV6_FREEBIND is only available on Linux",
    ))
}
